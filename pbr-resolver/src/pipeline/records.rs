//! Record handlers: turn A/AAAA and CNAME answers into cache updates and
//! IP-set entries.
//!
//! The ordering hazard: within one response a CNAME may arrive before or
//! after the address records of its target. The A/AAAA handler back-fills
//! addresses for every alias of the owner, so whichever order the first
//! lookup arrives in, the second lookup is a no-op.

use std::net::IpAddr;
use std::time::Duration;

use crate::ipset::IpSetEntry;

use super::QueryPipeline;

impl QueryPipeline {
    /// Handles one A or AAAA answer record.
    pub(crate) fn handle_address(
        &self,
        owner: &str,
        ip: IpAddr,
        original_ttl: u32,
    ) -> Vec<IpSetEntry> {
        let cache_ttl = self.records_cache_ttl(owner, original_ttl);

        // A live, already-cached pair has fed the IP set before.
        if !self.cache.add_address(owner, ip, cache_ttl) {
            return Vec::new();
        }

        // Cheap pre-check before materializing the alias list.
        if self.matcher.match_name(owner).is_empty() {
            return Vec::new();
        }

        let aliases = self.cache.get_aliases(owner);

        let mut entries = Vec::new();
        for alias in &aliases {
            if alias != owner {
                let alias_ttl = self.records_cache_ttl(alias, original_ttl);
                self.cache.add_address(alias, ip, alias_ttl);
            }

            self.emit_entries(alias, ip, original_ttl, &mut entries);
        }

        entries
    }

    /// Handles one CNAME answer record.
    pub(crate) fn handle_cname(
        &self,
        owner: &str,
        target: &str,
        original_ttl: u32,
    ) -> Vec<IpSetEntry> {
        if owner == target {
            return Vec::new();
        }

        let owner_ttl = self.records_cache_ttl(owner, original_ttl);
        self.cache.add_alias(owner, target, owner_ttl);

        // The target's addresses may not have arrived yet; the A/AAAA
        // handler picks this chain up when they do.
        let addresses = self.cache.get_addresses(target);
        if addresses.is_empty() {
            return Vec::new();
        }

        let aliases = self.cache.get_aliases(owner);

        let mut entries = Vec::new();
        for alias in &aliases {
            if self.matcher.match_name(alias).is_empty() {
                continue;
            }

            for record in &addresses {
                if !self.cache.add_address(owner, record.ip, owner_ttl) {
                    continue;
                }

                self.emit_entries(alias, record.ip, original_ttl, &mut entries);
            }
        }

        entries
    }

    fn emit_entries(&self, alias: &str, ip: IpAddr, original_ttl: u32, entries: &mut Vec<IpSetEntry>) {
        for set_name in self.matcher.match_name(alias) {
            let Some(spec) = self.matcher.ipset(&set_name) else {
                continue;
            };
            if !spec.family.matches(ip) {
                continue;
            }

            entries.push(IpSetEntry {
                set: set_name,
                ip,
                ttl: original_ttl.saturating_add(spec.additional_ttl),
            });
        }
    }

    /// Listed domains get the short configured cache TTL so clients
    /// re-resolve often and name-to-address churn is re-observed.
    pub(crate) fn records_cache_ttl(&self, domain: &str, original_ttl: u32) -> Duration {
        match self.listed_cache_ttl {
            Some(listed) if !self.matcher.match_name(domain).is_empty() => listed,
            _ => Duration::from_secs(original_ttl.into()),
        }
    }
}
