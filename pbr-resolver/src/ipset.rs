//! Seam to the kernel IP sets. The core only derives entries; installing
//! them is the manager's business.

use std::net::IpAddr;

use async_trait::async_trait;

/// One prefix to add to a named IP set, with a per-entry timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetEntry {
    pub set: String,
    pub ip: IpAddr,
    pub ttl: u32,
}

impl IpSetEntry {
    /// Host prefix: `/32` for IPv4, `/128` for IPv6.
    pub fn prefix(&self) -> String {
        match self.ip {
            IpAddr::V4(ip) => format!("{ip}/32"),
            IpAddr::V6(ip) => format!("{ip}/128"),
        }
    }
}

#[async_trait]
pub trait IpSetManager: Send + Sync {
    /// Adds each entry to its set. Atomicity across entries is not required.
    async fn batch_add(&self, entries: &[IpSetEntry]) -> anyhow::Result<()>;
}
