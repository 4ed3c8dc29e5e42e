//! Forward HTTP proxy relay.
//!
//! Accepts HTTP/1.x proxy requests, including `CONNECT`, and relays them to their
//! destinations through a [`Dialer`] chain. The chain connects directly or via an
//! upstream SOCKS5 relay and refuses destinations on a block list or in
//! restricted networks.

pub mod blocklist;
pub mod dial;
pub mod headers;
mod handler;
mod opts;
pub mod parse;
mod server;
mod tunnel;

pub use {
    blocklist::{BlockList, SharedBlockList},
    dial::{
        Conn, DialError, Dialer, DialerChain, DirectDialer, DynDialer, NopDialer, PerHostDialer,
        Socks5Auth, Socks5Dialer, wrap_local_blocking,
    },
    handler::{ProxyHandler, RelayBody, RelayError, error_response},
    opts::{ChainOpts, DEFAULT_CONNECT_TIMEOUT, HandlerOpts, Socks5Opts},
    server::{ProxyServer, spawn},
    tunnel::{TunnelStats, tunnel},
};
