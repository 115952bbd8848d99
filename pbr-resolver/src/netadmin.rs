//! Seam to firewall and routing-table administration. The daemon invokes
//! this around service start and stop; the core never touches it.

use async_trait::async_trait;

use crate::matcher::IpSetSpec;

#[async_trait]
pub trait NetAdmin: Send + Sync {
    /// Ensures the redirect/firewall plumbing for the given IP sets exists.
    async fn apply(&self, ipsets: &[IpSetSpec]) -> anyhow::Result<()>;

    /// Removes whatever `apply` installed.
    async fn revert(&self) -> anyhow::Result<()>;
}
