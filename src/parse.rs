//! Helpers for the `host[:port]` destination strings handed to dialers.

use std::net::{IpAddr, Ipv4Addr};

/// Port assumed for destinations of plain HTTP requests that don't name one.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Appends [`DEFAULT_HTTP_PORT`] to `host` if it does not carry a port.
///
/// Any colon is taken as a port separator, so `localhost:1234` and
/// `www.google.com:443` are returned unchanged. A bracketed IPv6 literal
/// without a port (`[::1]`) is completed as well.
pub fn full_host(host: &str) -> String {
    if !host.contains(':') || host.ends_with(']') {
        format!("{host}:{DEFAULT_HTTP_PORT}")
    } else {
        host.to_string()
    }
}

/// Splits a trailing `:port` off `addr`.
///
/// Everything after the final colon is taken as the port if it parses as one.
/// Otherwise the whole input is returned as the host.
pub fn split_host_port(addr: &str) -> (&str, Option<u16>) {
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (addr, None),
        },
        None => (addr, None),
    }
}

/// Strips the brackets around an IPv6 literal host.
pub(crate) fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// Parses `host` as an IP address the way the system resolver would.
///
/// Besides regular IPv4 and IPv6 literals this accepts an IPv6 zone suffix
/// (`fe80::1%eth0`), a trailing dot, and the numeric IPv4 shorthands of
/// `inet_aton` such as `127.1`, `0x7f.0.0.1` or `2130706433`.
pub fn parse_ip(host: &str) -> Option<IpAddr> {
    let host = unbracket(host).trim_end_matches('.');
    let literal = host.split('%').next().unwrap_or(host);
    literal
        .parse()
        .ok()
        .or_else(|| parse_ipv4_numeric(host).map(IpAddr::V4))
}

/// Parses the numeric IPv4 forms of `inet_aton`: one to four parts, each decimal,
/// `0x` hex or `0` octal, with the last part filling the remaining bytes.
pub fn parse_ipv4_numeric(host: &str) -> Option<Ipv4Addr> {
    let parts = host
        .split('.')
        .map(parse_ipv4_part)
        .collect::<Option<Vec<u32>>>()?;
    let (&last, init) = parts.split_last()?;
    if init.len() > 3 || init.iter().any(|&part| part > 0xff) {
        return None;
    }
    let last_bits = 32 - 8 * init.len() as u32;
    if last_bits < 32 && last >> last_bits != 0 {
        return None;
    }
    let addr = init
        .iter()
        .enumerate()
        .fold(last, |addr, (i, &part)| addr | part << (24 - 8 * i));
    Some(Ipv4Addr::from(addr))
}

fn parse_ipv4_part(part: &str) -> Option<u32> {
    let hex = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X"));
    let (digits, radix) = match hex {
        Some("") => return Some(0),
        Some(hex) => (hex, 16),
        None if part.len() > 1 && part.starts_with('0') => (&part[1..], 8),
        None => (part, 10),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return None;
    }
    u32::from_str_radix(digits, radix).ok()
}
