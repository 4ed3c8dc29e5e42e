//! Removal of hop-by-hop headers when relaying messages between connections.
//!
//! A header is hop-by-hop if it is one of the fixed [`HOP_BY_HOP_HEADERS`] or
//! if the message's own `Connection` header lists it. Neither kind is ever
//! copied to the counterpart connection.

use std::collections::HashSet;

use http::{
    HeaderMap, HeaderName,
    header::{CONNECTION, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE},
};
use tracing::debug;

/// Headers that are dedicated to a single connection and never forwarded.
pub static HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    PROXY_AUTHORIZATION,
    HeaderName::from_static("proxy-authentication"),
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Returns true if `name` is one of the fixed [`HOP_BY_HOP_HEADERS`].
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(name)
}

/// Returns true if `s` matches the HTTP token grammar (RFC 9110, section 5.6.2).
pub fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_tchar)
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Directives listed in the `Connection` header of a single message.
#[derive(Debug, Default, Clone)]
pub struct ConnectionDirectives {
    tokens: Vec<String>,
    rejected: Vec<String>,
    drop: HashSet<HeaderName>,
}

impl ConnectionDirectives {
    /// Parses one `Connection` header value.
    pub fn parse(value: &str) -> Self {
        let mut directives = Self::default();
        directives.extend(value);
        directives
    }

    /// Collects the directives of all `Connection` values in `headers`.
    ///
    /// Values that are not valid UTF-8 are ignored.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        for value in headers.get_all(CONNECTION) {
            if let Ok(value) = value.to_str() {
                directives.extend(value);
            }
        }
        directives
    }

    fn extend(&mut self, value: &str) {
        for part in value.split(',') {
            let token = part.trim();
            match HeaderName::from_bytes(token.as_bytes()) {
                Ok(name) if is_token(token) => {
                    self.drop.insert(name);
                    self.tokens.push(token.to_string());
                }
                _ => self.rejected.push(token.to_string()),
            }
        }
    }

    /// Valid tokens, in the order they were listed.
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Directives that failed the token grammar.
    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    /// Returns true if the header `name` was listed as a directive.
    pub fn contains(&self, name: &HeaderName) -> bool {
        self.drop.contains(name)
    }
}

/// Copies all end-to-end headers of `src` into a new map.
///
/// Every value of a kept header is copied, in the original order.
pub fn sanitize(src: &HeaderMap) -> HeaderMap {
    let directives = ConnectionDirectives::from_headers(src);
    if !directives.rejected().is_empty() {
        debug!(rejected=?directives.rejected(), "ignoring malformed Connection directives");
    }
    let mut dst = HeaderMap::with_capacity(src.len());
    for (name, value) in src.iter() {
        // Connection itself is hop-by-hop and goes with the fixed set.
        if is_hop_by_hop(name) || directives.contains(name) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
    dst
}
