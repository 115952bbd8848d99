//! Placeholder network administration: logs what would be installed.
//!
//! Real iptables/ip-rule installation lives with the router packaging; the
//! daemon only needs the seam so deployments can swap in a real
//! implementation.

use async_trait::async_trait;
use pbr_resolver::matcher::IpSetSpec;
use pbr_resolver::netadmin::NetAdmin;

pub struct LogNetAdmin;

#[async_trait]
impl NetAdmin for LogNetAdmin {
    async fn apply(&self, ipsets: &[IpSetSpec]) -> anyhow::Result<()> {
        for ipset in ipsets {
            tracing::info!(
                ipset = %ipset.name,
                family = ?ipset.family,
                "Firewall plumbing is managed externally; expecting REDIRECT and ip-rule for this set"
            );
        }

        Ok(())
    }

    async fn revert(&self) -> anyhow::Result<()> {
        tracing::info!("Leaving externally-managed firewall plumbing in place");

        Ok(())
    }
}
