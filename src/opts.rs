use std::{path::PathBuf, time::Duration};

use n0_error::Result;

use crate::{
    blocklist::{BlockList, SharedBlockList},
    dial::{DialerChain, DirectDialer, Socks5Auth, Socks5Dialer},
};

/// Default time to wait for outbound connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`crate::ProxyHandler`].
#[derive(Debug, Clone, Default)]
pub struct HandlerOpts {
    /// Value appended as an additional `User-Agent` header to forwarded requests.
    pub user_agent: Option<String>,
}

impl HandlerOpts {
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Upstream SOCKS5 relay settings.
#[derive(Debug, Clone)]
pub struct Socks5Opts {
    /// Relay address as `host:port`.
    pub addr: String,
    pub auth: Option<Socks5Auth>,
}

/// Configuration for assembling a [`DialerChain`].
#[derive(Debug, Clone)]
pub struct ChainOpts {
    /// Dial through this SOCKS5 relay instead of connecting directly.
    pub socks5: Option<Socks5Opts>,
    /// Timeout for connecting to destinations, or to the SOCKS5 relay.
    pub connect_timeout: Option<Duration>,
    /// Refuse loopback, private and link-local destinations.
    pub block_local: bool,
    /// Comma-separated networks, IPs, zones and hosts to refuse.
    pub block: String,
    /// Block list file in `hosts` format.
    pub blocklist: Option<PathBuf>,
}

impl Default for ChainOpts {
    fn default() -> Self {
        Self {
            socks5: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            block_local: true,
            block: String::new(),
            blocklist: None,
        }
    }
}

impl ChainOpts {
    /// Loads the block list, if configured, and builds the chain.
    pub async fn build(&self) -> Result<DialerChain> {
        let blocklist = match &self.blocklist {
            Some(path) => Some(SharedBlockList::new(BlockList::from_file(path).await?)),
            None => None,
        };
        Ok(self.build_with(blocklist))
    }

    /// Builds the chain around an already loaded block list.
    pub fn build_with(&self, blocklist: Option<SharedBlockList>) -> DialerChain {
        let mut direct = DirectDialer::new();
        if let Some(timeout) = self.connect_timeout {
            direct = direct.connect_timeout(timeout);
        }
        match &self.socks5 {
            Some(socks5) => {
                let relay = Socks5Dialer::new(&socks5.addr, socks5.auth.clone(), direct);
                DialerChain::new(relay, blocklist, self.block_local, &self.block)
            }
            None => DialerChain::new(direct, blocklist, self.block_local, &self.block),
        }
    }
}

#[cfg(test)]
mod tests {
    use n0_error::Result;

    use super::*;
    use crate::dial::{DialError, Dialer};

    #[tokio::test]
    async fn default_chain_blocks_local() {
        let chain = ChainOpts::default().build().await.unwrap();
        let err = chain.dial("localhost:80").await.err().unwrap();
        assert!(matches!(err, DialError::BlockedTarget { .. }));
    }

    #[tokio::test]
    async fn build_fails_on_missing_blocklist() {
        let opts = ChainOpts {
            blocklist: Some("/nonexistent/blocklist.hosts".into()),
            ..Default::default()
        };
        assert!(opts.build().await.is_err());
    }

    #[tokio::test]
    async fn build_with_blocklist() -> Result {
        let chain = ChainOpts::default()
            .build_with(Some(BlockList::from_iter(["blocked.example"]).into()));
        let err = chain.dial("blocked.example:443").await.err().unwrap();
        assert!(matches!(err, DialError::BlockedHost { .. }));
        Ok(())
    }
}
