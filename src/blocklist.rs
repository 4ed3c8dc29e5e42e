//! Host block lists in `hosts` file format.

use std::{collections::HashSet, path::Path, sync::Arc};

use n0_error::{Result, StdResultExt};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::watch,
};
use tracing::info;

use crate::parse::unbracket;

/// Address that marks a `hosts` entry as blocked.
pub const BLOCK_ADDRESS: &str = "0.0.0.0";

/// Set of blocked host names, without ports.
#[derive(Debug, Default, Clone)]
pub struct BlockList {
    hosts: HashSet<String>,
    skipped_lines: usize,
}

impl BlockList {
    /// Reads a block list from `hosts`-formatted content.
    ///
    /// Blank lines and lines starting with `#` are ignored. Only lines whose address
    /// is [`BLOCK_ADDRESS`] contribute, all host names following it are blocked. Any
    /// other line is counted in [`Self::skipped_lines`].
    pub async fn load(reader: impl AsyncBufRead + Unpin) -> io::Result<Self> {
        let mut list = Self::default();
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            if fields.next() != Some(BLOCK_ADDRESS) {
                list.skipped_lines += 1;
                continue;
            }
            list.hosts.extend(fields.map(normalize_host));
        }
        if list.skipped_lines > 0 {
            info!(
                "Skipped {} lines for not using destination address '{BLOCK_ADDRESS}'",
                list.skipped_lines
            );
        }
        info!(entries = list.len(), "loaded blocklist");
        Ok(list)
    }

    /// Opens `path` and loads it with [`Self::load`].
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .std_context(format!("failed to open blocklist {}", path.display()))?;
        Self::load(BufReader::new(file))
            .await
            .std_context(format!("failed to read blocklist {}", path.display()))
    }

    /// Returns true if `host` is blocked.
    ///
    /// Matching ignores ASCII case, IPv6 brackets and a trailing root dot.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_host(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Number of data lines ignored for not using [`BLOCK_ADDRESS`].
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }
}

impl<S: AsRef<str>> FromIterator<S> for BlockList {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self {
            hosts: iter
                .into_iter()
                .map(|host| normalize_host(host.as_ref()))
                .collect(),
            skipped_lines: 0,
        }
    }
}

fn normalize_host(host: &str) -> String {
    unbracket(host).trim_end_matches('.').to_ascii_lowercase()
}

/// A [`BlockList`] shared between in-flight requests.
///
/// Readers always see a complete list. [`Self::publish`] swaps in a new snapshot,
/// lookups that already started keep the list they began with.
#[derive(Debug, Clone)]
pub struct SharedBlockList {
    current: Arc<watch::Sender<Arc<BlockList>>>,
}

impl SharedBlockList {
    pub fn new(list: BlockList) -> Self {
        let (current, _) = watch::channel(Arc::new(list));
        Self {
            current: Arc::new(current),
        }
    }

    /// Returns the current snapshot.
    pub fn snapshot(&self) -> Arc<BlockList> {
        self.current.borrow().clone()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.current.borrow().contains(host)
    }

    /// Replaces the current list.
    pub fn publish(&self, list: BlockList) {
        self.current.send_replace(Arc::new(list));
    }

    /// Loads `path` and publishes it once it has been read completely.
    ///
    /// On error the current list stays in place.
    pub async fn reload(&self, path: impl AsRef<Path>) -> Result<()> {
        let list = BlockList::from_file(path).await?;
        self.publish(list);
        Ok(())
    }
}

impl From<BlockList> for SharedBlockList {
    fn from(list: BlockList) -> Self {
        Self::new(list)
    }
}
