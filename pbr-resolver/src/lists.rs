//! Seam to the domain-list storage. Downloading and checksum-gating list
//! files is the updater's business; the matcher only reads entries.

use anyhow::{Result, bail};

use crate::config::ListConfig;

pub trait ListStore: Send + Sync {
    /// Raw entries of the list, one per line. Filtering (comments, plain
    /// IPs, CIDRs) happens in the matcher.
    fn domains(&self, list: &ListConfig) -> Result<Vec<String>>;
}

/// Serves inline `hosts` entries only. The default for tests and for
/// configurations that never reference list files.
pub struct InlineListStore;

impl ListStore for InlineListStore {
    fn domains(&self, list: &ListConfig) -> Result<Vec<String>> {
        if list.file.is_some() || list.url.is_some() {
            bail!("list '{}' needs a file-backed store", list.name);
        }

        Ok(list.hosts.clone())
    }
}
