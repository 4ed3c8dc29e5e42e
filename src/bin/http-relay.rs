use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser};
use http_relay::{ChainOpts, HandlerOpts, ProxyHandler, SharedBlockList, Socks5Auth, Socks5Opts};
use n0_error::{Result, StdResultExt, anyerr};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Args, Clone, Debug)]
struct CommonOpts {
    /// Address to listen on. A bare `:port` listens on all interfaces.
    #[clap(long, default_value = ":8080")]
    listen: String,
    /// Comma-separated networks, IPs, `*.zones` and hosts to refuse.
    #[clap(long, default_value = "")]
    block: String,
    /// Refuse loopback, private and link-local destinations.
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    block_local: bool,
    /// Block list file in hosts format. Reloaded on SIGHUP.
    #[clap(long)]
    blocklist: Option<PathBuf>,
    /// Additional User-Agent header sent with forwarded requests.
    #[clap(long)]
    user_agent: Option<String>,
    /// Seconds to wait for outbound connections.
    #[clap(long, default_value_t = 10)]
    connect_timeout: u64,
}

#[derive(Parser, Debug)]
#[clap(version, about)]
enum Cli {
    /// Relay requests with direct outbound connections.
    Proxy {
        #[clap(flatten)]
        opts: CommonOpts,
    },
    /// Relay requests through an upstream SOCKS5 relay.
    Relay {
        #[clap(flatten)]
        opts: CommonOpts,
        /// Address of the SOCKS5 relay.
        #[clap(long, default_value = "localhost:8000")]
        socks: String,
        /// SOCKS5 username, used together with --socks-pass.
        #[clap(long, default_value = "")]
        socks_user: String,
        /// SOCKS5 password, used together with --socks-user.
        #[clap(long, default_value = "")]
        socks_pass: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    match Cli::parse() {
        Cli::Proxy { opts } => run(opts, None).await,
        Cli::Relay {
            opts,
            socks,
            socks_user,
            socks_pass,
        } => {
            let socks5 = Socks5Opts {
                addr: socks,
                auth: Socks5Auth::new(socks_user, socks_pass),
            };
            run(opts, Some(socks5)).await
        }
    }
}

async fn run(opts: CommonOpts, socks5: Option<Socks5Opts>) -> Result<()> {
    let chain_opts = ChainOpts {
        socks5,
        connect_timeout: Some(Duration::from_secs(opts.connect_timeout)),
        block_local: opts.block_local,
        block: opts.block.clone(),
        blocklist: opts.blocklist.clone(),
    };
    let chain = chain_opts.build().await?;
    if let (Some(path), Some(list)) = (opts.blocklist.clone(), chain.blocklist().cloned()) {
        spawn_reload_on_hangup(path, list)?;
    }
    let handler_opts = HandlerOpts {
        user_agent: opts.user_agent.clone(),
    };
    let handler = ProxyHandler::new(chain, handler_opts);
    let addr = resolve_listen_addr(&opts.listen).await?;
    let (server, addr) = http_relay::spawn(handler, addr).await?;
    info!(%addr, "http relay started");
    tokio::signal::ctrl_c()
        .await
        .std_context("failed to wait for ctrl-c")?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}

async fn resolve_listen_addr(listen: &str) -> Result<SocketAddr> {
    let listen = match listen.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => listen.to_string(),
    };
    tokio::net::lookup_host(&listen)
        .await
        .std_context(format!("invalid listen address {listen}"))?
        .next()
        .ok_or_else(|| anyerr!("listen address {listen} did not resolve"))
}

#[cfg(unix)]
fn spawn_reload_on_hangup(path: PathBuf, list: SharedBlockList) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup()).std_context("failed to listen for SIGHUP")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!(path=%path.display(), "reloading blocklist");
            if let Err(err) = list.reload(&path).await {
                warn!("failed to reload blocklist, keeping the current one: {err:#}");
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_path: PathBuf, _list: SharedBlockList) -> Result<()> {
    Ok(())
}
