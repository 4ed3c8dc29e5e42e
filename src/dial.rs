//! Outbound dialers.
//!
//! A [`Dialer`] opens a byte stream to a `host:port` destination or refuses to.
//! Dialers compose: the innermost one reaches the network ([`DirectDialer`] or
//! [`Socks5Dialer`]), and policy wrappers ([`BlocklistDialer`], [`PerHostDialer`])
//! sit in front of it and reject destinations before anything is dialed.

use std::{future::Future, io, net::IpAddr, time::Duration};

use dynosaur::dynosaur;
use ipnet::IpNet;
use n0_error::{e, stack_error};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::{
    blocklist::SharedBlockList,
    parse::{parse_ip, split_host_port, unbracket},
};

/// Byte stream returned by a [`Dialer`].
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An established outbound connection.
pub type Conn = Box<dyn AsyncStream>;

/// Errors returned from [`Dialer::dial`].
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DialError {
    /// The host is on the block list.
    #[error("host {host} is blocked")]
    BlockedHost { host: String },
    /// The destination is in a restricted network or was otherwise refused.
    #[error("target {addr} is blocked")]
    BlockedTarget { addr: String },
    /// The address is not of the form `host:port`.
    #[error("invalid address {addr}")]
    InvalidAddress { addr: String },
    /// Connecting to the address failed.
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[error(source, std_err)]
        source: io::Error,
    },
    /// Connecting did not finish within the configured timeout.
    #[error("timed out connecting to {addr}")]
    Timeout { addr: String },
    /// The SOCKS5 relay did not establish the connection.
    #[error("socks5 relay {proxy} failed to connect to {addr}")]
    Socks {
        proxy: String,
        addr: String,
        #[error(source, std_err)]
        source: tokio_socks::Error,
    },
}

impl DialError {
    /// Returns true if the destination was refused by policy rather than unreachable.
    pub fn is_policy_block(&self) -> bool {
        matches!(
            self,
            DialError::BlockedHost { .. } | DialError::BlockedTarget { .. }
        )
    }
}

#[dynosaur(pub DynDialer = dyn(box) Dialer)]
/// Opens outbound connections.
///
/// Implementations either return a connection to `addr` or fail without side effects
/// on the network when they refuse the destination.
pub trait Dialer: Send + Sync {
    /// Connects to `addr`, given as `host:port`.
    fn dial<'a>(&'a self, addr: &'a str)
    -> impl Future<Output = Result<Conn, DialError>> + Send + 'a;
}

/// Dials TCP connections directly.
#[derive(Debug, Clone, Default)]
pub struct DirectDialer {
    connect_timeout: Option<Duration>,
}

impl DirectDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum time to wait for a connection to be established.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, DialError> {
        let connect = TcpStream::connect(addr);
        let res = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| e!(DialError::Timeout { addr: addr.to_string() }))?,
            None => connect.await,
        };
        res.map_err(|source| {
            e!(DialError::Connect {
                addr: addr.to_string(),
                source
            })
        })
    }
}

impl Dialer for DirectDialer {
    async fn dial<'a>(&'a self, addr: &'a str) -> Result<Conn, DialError> {
        let stream = self.connect(addr).await?;
        debug!(%addr, "connected");
        Ok(Box::new(stream))
    }
}

/// Username and password for SOCKS5 authentication (RFC 1929).
#[derive(derive_more::Debug, Clone)]
pub struct Socks5Auth {
    pub username: String,
    #[debug("***")]
    pub password: String,
}

impl Socks5Auth {
    /// Returns credentials only if both parts are non-empty.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Option<Self> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            None
        } else {
            Some(Self { username, password })
        }
    }
}

/// Dials connections through an upstream SOCKS5 relay.
///
/// The relay itself is reached with a [`DirectDialer`]. The returned connection
/// behaves like a direct stream to the destination.
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: String,
    auth: Option<Socks5Auth>,
    forward: DirectDialer,
}

impl Socks5Dialer {
    /// Creates a dialer for the SOCKS5 relay at `proxy` (`host:port`).
    pub fn new(proxy: impl Into<String>, auth: Option<Socks5Auth>, forward: DirectDialer) -> Self {
        Self {
            proxy: proxy.into(),
            auth,
            forward,
        }
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }
}

impl Dialer for Socks5Dialer {
    async fn dial<'a>(&'a self, addr: &'a str) -> Result<Conn, DialError> {
        let socket = self.forward.connect(&self.proxy).await?;
        let res = match &self.auth {
            Some(auth) => {
                Socks5Stream::connect_with_password_and_socket(
                    socket,
                    addr,
                    &auth.username,
                    &auth.password,
                )
                .await
            }
            None => Socks5Stream::connect_with_socket(socket, addr).await,
        };
        let stream = res.map_err(|source| {
            e!(DialError::Socks {
                proxy: self.proxy.clone(),
                addr: addr.to_string(),
                source
            })
        })?;
        debug!(%addr, proxy=%self.proxy, "connected via socks5 relay");
        Ok(Box::new(stream))
    }
}

/// Dialer that refuses every destination with [`DialError::BlockedTarget`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NopDialer;

impl Dialer for NopDialer {
    async fn dial<'a>(&'a self, addr: &'a str) -> Result<Conn, DialError> {
        Err(e!(DialError::BlockedTarget {
            addr: addr.to_string()
        }))
    }
}

/// Refuses hosts on a block list before dialing with the inner dialer.
#[derive(derive_more::Debug)]
pub struct BlocklistDialer {
    list: SharedBlockList,
    #[debug("DynDialer")]
    inner: Box<DynDialer<'static>>,
}

impl BlocklistDialer {
    pub fn new(list: impl Into<SharedBlockList>, inner: impl Dialer + 'static) -> Self {
        Self {
            list: list.into(),
            inner: DynDialer::new_box(inner),
        }
    }

    /// The block list consulted on each dial.
    pub fn list(&self) -> &SharedBlockList {
        &self.list
    }
}

impl Dialer for BlocklistDialer {
    async fn dial<'a>(&'a self, addr: &'a str) -> Result<Conn, DialError> {
        let (host, _port) = split_host_port(addr);
        if self.list.contains(host) {
            debug!(%host, "refusing blocked host");
            return Err(e!(DialError::BlockedHost {
                host: host.to_string()
            }));
        }
        self.inner.dial(addr).await
    }
}

/// Networks reserved for local use: loopback, private and link-local ranges.
pub const LOCAL_NETWORKS: [&str; 10] = [
    "0.0.0.0/8",
    "10.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::/128",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

/// Routes destinations to one of two dialers depending on the host.
///
/// Hosts that match a configured network, IP, zone or host name go to the `bypass`
/// dialer, all others to the `default` dialer. With [`NopDialer`] as bypass this
/// refuses the matching destinations. Host names are matched as given and are not
/// resolved.
#[derive(derive_more::Debug)]
pub struct PerHostDialer {
    #[debug("DynDialer")]
    default: Box<DynDialer<'static>>,
    #[debug("DynDialer")]
    bypass: Box<DynDialer<'static>>,
    networks: Vec<IpNet>,
    ips: Vec<IpAddr>,
    zones: Vec<String>,
    hosts: Vec<String>,
}

impl PerHostDialer {
    pub fn new(default: impl Dialer + 'static, bypass: impl Dialer + 'static) -> Self {
        Self {
            default: DynDialer::new_box(default),
            bypass: DynDialer::new_box(bypass),
            networks: Vec::new(),
            ips: Vec::new(),
            zones: Vec::new(),
            hosts: Vec::new(),
        }
    }

    /// Bypasses all IP destinations within `net`.
    pub fn add_network(&mut self, net: IpNet) {
        self.networks.push(net);
    }

    pub fn add_ip(&mut self, ip: IpAddr) {
        self.ips.push(ip.to_canonical());
    }

    /// Bypasses `zone` and all of its subdomains.
    ///
    /// A leading `.` or `*.` is ignored, `example.com` matches both `example.com` and
    /// `www.example.com`.
    pub fn add_zone(&mut self, zone: &str) {
        let zone = zone.trim_start_matches('*').trim_start_matches('.');
        let zone = zone.trim_end_matches('.').to_ascii_lowercase();
        self.zones.push(format!(".{zone}"));
    }

    pub fn add_host(&mut self, host: &str) {
        self.hosts.push(host.trim_end_matches('.').to_ascii_lowercase());
    }

    /// Adds a comma-separated list of CIDR networks, IP addresses, zones and hosts.
    ///
    /// Entries containing `/` are networks, entries starting with `*.` are zones.
    /// Invalid networks are skipped with a warning.
    pub fn add_from_str(&mut self, list: &str) {
        for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            if entry.contains('/') {
                match entry.parse::<IpNet>() {
                    Ok(net) => self.add_network(net),
                    Err(err) => warn!(%entry, "skipping invalid network: {err}"),
                }
            } else if let Ok(ip) = unbracket(entry).parse::<IpAddr>() {
                self.add_ip(ip);
            } else if entry.starts_with("*.") {
                self.add_zone(entry);
            } else {
                self.add_host(entry);
            }
        }
    }

    /// Bypasses the [`LOCAL_NETWORKS`] and the `localhost` names.
    pub fn add_local_networks(&mut self) {
        for net in LOCAL_NETWORKS {
            if let Ok(net) = net.parse() {
                self.add_network(net);
            }
        }
        self.add_zone("localhost");
    }

    /// Returns true if `host` (without port) is routed to the bypass dialer.
    ///
    /// IP hosts are read the way the resolver reads them, so numeric shorthands
    /// like `127.1` and IPv4-mapped IPv6 addresses match their IPv4 entries.
    pub fn matches(&self, host: &str) -> bool {
        if let Some(ip) = parse_ip(host) {
            return self.matches_ip(ip);
        }
        let host = unbracket(host).trim_end_matches('.').to_ascii_lowercase();
        self.zones
            .iter()
            .any(|zone| host.ends_with(zone.as_str()) || host == zone[1..])
            || self.hosts.contains(&host)
    }

    fn matches_ip(&self, ip: IpAddr) -> bool {
        let canonical = ip.to_canonical();
        self.networks
            .iter()
            .any(|net| net.contains(&ip) || net.contains(&canonical))
            || self.ips.contains(&canonical)
    }
}

impl Dialer for PerHostDialer {
    async fn dial<'a>(&'a self, addr: &'a str) -> Result<Conn, DialError> {
        let (host, port) = split_host_port(addr);
        if port.is_none() {
            return Err(e!(DialError::InvalidAddress {
                addr: addr.to_string()
            }));
        }
        if self.matches(host) {
            debug!(%host, "routing to bypass dialer");
            self.bypass.dial(addr).await
        } else {
            self.default.dial(addr).await
        }
    }
}

/// Wraps `dialer` so that local networks (if `local`) and the `custom` destinations
/// are refused with [`DialError::BlockedTarget`].
pub fn wrap_local_blocking(
    dialer: impl Dialer + 'static,
    local: bool,
    custom: &str,
) -> PerHostDialer {
    let mut per_host = PerHostDialer::new(dialer, NopDialer);
    if local {
        per_host.add_local_networks();
    }
    per_host.add_from_str(custom);
    per_host
}

/// The complete outbound chain used by the proxy.
///
/// From the outside in: local and custom network blocking, the optional block list,
/// then the relay dialer that reaches the network.
#[derive(Debug)]
pub struct DialerChain {
    outer: PerHostDialer,
    blocklist: Option<SharedBlockList>,
}

impl DialerChain {
    pub fn new(
        relay: impl Dialer + 'static,
        blocklist: Option<SharedBlockList>,
        block_local: bool,
        block_custom: &str,
    ) -> Self {
        let outer = match &blocklist {
            Some(list) => wrap_local_blocking(
                BlocklistDialer::new(list.clone(), relay),
                block_local,
                block_custom,
            ),
            None => wrap_local_blocking(relay, block_local, block_custom),
        };
        Self { outer, blocklist }
    }

    /// The block list of this chain, for publishing reloaded lists.
    pub fn blocklist(&self) -> Option<&SharedBlockList> {
        self.blocklist.as_ref()
    }
}

impl Dialer for DialerChain {
    async fn dial<'a>(&'a self, addr: &'a str) -> Result<Conn, DialError> {
        self.outer.dial(addr).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use n0_error::Result;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::blocklist::BlockList;

    /// Records dialed addresses and hands out in-memory streams.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingDialer {
        pub(crate) dialed: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingDialer {
        pub(crate) fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    impl Dialer for RecordingDialer {
        async fn dial<'a>(&'a self, addr: &'a str) -> Result<Conn, DialError> {
            self.dialed.lock().unwrap().push(addr.to_string());
            let (stream, _peer) = tokio::io::duplex(64);
            Ok(Box::new(stream))
        }
    }

    fn hello_world_list() -> BlockList {
        BlockList::from_iter(["hello.world", "hello.world.too"])
    }

    #[tokio::test]
    async fn blocklist_refuses_listed_host() {
        let inner = RecordingDialer::default();
        let dialer = BlocklistDialer::new(hello_world_list(), inner.clone());
        let err = dialer.dial("hello.world:80").await.err().unwrap();
        assert!(matches!(err, DialError::BlockedHost { ref host, .. } if host == "hello.world"));
        assert!(err.is_policy_block());
        for addr in ["hello.world.:80", "HELLO.WORLD.:443", "Hello.World:8080"] {
            let err = dialer.dial(addr).await.err().unwrap();
            assert!(err.is_policy_block(), "{addr} should be blocked");
        }
        assert!(inner.dialed().is_empty());
    }

    #[tokio::test]
    async fn blocklist_delegates_full_address() -> Result {
        let inner = RecordingDialer::default();
        let dialer = BlocklistDialer::new(hello_world_list(), inner.clone());
        dialer.dial("hello.world.past:80").await?;
        dialer.dial("HELLO.world.too:443").await.err().unwrap();
        assert_eq!(inner.dialed(), ["hello.world.past:80"]);
        Ok(())
    }

    #[tokio::test]
    async fn blocklist_sees_published_list() -> Result {
        let inner = RecordingDialer::default();
        let dialer = BlocklistDialer::new(BlockList::default(), inner.clone());
        dialer.dial("late.example:80").await?;
        dialer
            .list()
            .publish(BlockList::from_iter(["late.example"]));
        assert!(dialer.dial("late.example:80").await.is_err());
        assert_eq!(inner.dialed().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn nop_dialer_always_fails() {
        let err = NopDialer.dial("example.com:80").await.err().unwrap();
        assert!(matches!(err, DialError::BlockedTarget { .. }));
    }

    #[tokio::test]
    async fn local_blocking_refuses_local_destinations() {
        let inner = RecordingDialer::default();
        let dialer = wrap_local_blocking(inner.clone(), true, "");
        for addr in [
            "127.0.0.1:80",
            "10.1.2.3:443",
            "192.168.1.1:8080",
            "[::1]:80",
            "[::]:80",
            "[::ffff:127.0.0.1]:80",
            "[::ffff:10.0.0.1]:80",
            "[::ffff:192.168.1.1]:80",
            "[fe80::1%25eth0]:80",
            "127.1:80",
            "2130706433:80",
            "0x7f.0.0.1:80",
            "0177.0.0.1:80",
            "127.0.0.1.:80",
            "localhost:80",
            "LOCALHOST.:80",
            "foo.localhost:80",
        ] {
            let err = dialer.dial(addr).await.err().unwrap();
            assert!(err.is_policy_block(), "{addr} should be blocked");
        }
        assert!(inner.dialed().is_empty());
    }

    #[tokio::test]
    async fn local_blocking_allows_public_destinations() -> Result {
        let inner = RecordingDialer::default();
        let dialer = wrap_local_blocking(inner.clone(), true, "");
        dialer.dial("93.184.216.34:80").await?;
        dialer.dial("example.com:443").await?;
        assert_eq!(inner.dialed(), ["93.184.216.34:80", "example.com:443"]);
        Ok(())
    }

    #[tokio::test]
    async fn custom_blocking() -> Result {
        let inner = RecordingDialer::default();
        let dialer = wrap_local_blocking(
            inner.clone(),
            false,
            "blocked.example, *.zone.example,203.0.113.0/24, 198.51.100.7",
        );
        for addr in [
            "blocked.example:80",
            "zone.example:80",
            "deep.sub.zone.example:443",
            "203.0.113.99:80",
            "[::ffff:203.0.113.99]:80",
            "198.51.100.7:22",
            "[::ffff:198.51.100.7]:22",
            "198.51.25607:22",
        ] {
            let err = dialer.dial(addr).await.err().unwrap();
            assert!(err.is_policy_block(), "{addr} should be blocked");
        }
        dialer.dial("127.0.0.1:80").await?;
        dialer.dial("sub.blocked.example:80").await?;
        dialer.dial("notzone.example:80").await?;
        assert_eq!(inner.dialed().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn per_host_requires_port() {
        let dialer = wrap_local_blocking(RecordingDialer::default(), true, "");
        let err = dialer.dial("example.com").await.err().unwrap();
        assert!(matches!(err, DialError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn direct_dialer_connects() -> Result {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            stream.write_all(b"hi").await?;
            std::io::Result::Ok(())
        });
        let mut conn = DirectDialer::new()
            .connect_timeout(Duration::from_secs(5))
            .dial(&addr)
            .await?;
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"hi");
        accept.await.unwrap()?;
        Ok(())
    }

    #[tokio::test]
    async fn direct_dialer_refused() -> Result {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        drop(listener);
        let err = DirectDialer::new().dial(&addr).await.err().unwrap();
        assert!(matches!(err, DialError::Connect { .. }));
        assert!(!err.is_policy_block());
        Ok(())
    }

    #[tokio::test]
    async fn chain_checks_every_layer() -> Result {
        let relay = RecordingDialer::default();
        let list = SharedBlockList::new(hello_world_list());
        let chain = DialerChain::new(relay.clone(), Some(list), true, "*.corp.example");
        for addr in [
            "hello.world:80",
            "hello.world.:80",
            "127.0.0.1:8080",
            "[::ffff:127.0.0.1]:8080",
            "intranet.corp.example:443",
        ] {
            let err = chain.dial(addr).await.err().unwrap();
            assert!(err.is_policy_block(), "{addr} should be blocked");
        }
        chain.dial("hello.world.past:80").await?;
        assert_eq!(relay.dialed(), ["hello.world.past:80"]);

        chain
            .blocklist()
            .unwrap()
            .publish(BlockList::from_iter(["hello.world.past"]));
        assert!(chain.dial("hello.world.past:80").await.is_err());
        assert_eq!(relay.dialed().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn chain_without_restrictions() -> Result {
        let relay = RecordingDialer::default();
        let chain = DialerChain::new(relay.clone(), None, false, "");
        assert!(chain.blocklist().is_none());
        chain.dial("127.0.0.1:8080").await?;
        chain.dial("hello.world:80").await?;
        assert_eq!(relay.dialed().len(), 2);
        Ok(())
    }

    #[test]
    fn socks5_auth_requires_both_parts() {
        assert!(Socks5Auth::new("user", "").is_none());
        assert!(Socks5Auth::new("", "pass").is_none());
        assert!(Socks5Auth::new("user", "pass").is_some());
    }
}
