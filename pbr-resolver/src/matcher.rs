//! Compiles the configured domain lists into suffix patterns and maps query
//! names to the IP sets they should feed.

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{Context as _, Result};
use parking_lot::RwLock;

use crate::config::{Config, IpFamily};
use crate::lists::ListStore;

/// Resolved view of one configured IP set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSetSpec {
    pub name: String,
    pub family: IpFamily,
    /// Added on top of the answer TTL when deriving IP-set entries. Zero
    /// keeps the original TTL.
    pub additional_ttl: u32,
}

#[derive(Debug)]
struct PatternEntry {
    /// Normalized suffix: matches itself and any dot-bounded subdomain.
    suffix: String,
    /// Label count; higher is more specific.
    labels: usize,
    ipsets: Vec<String>,
}

#[derive(Default)]
struct Inner {
    patterns: Vec<PatternEntry>,
    ipsets: HashMap<String, IpSetSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatcherStats {
    pub pattern_count: usize,
    pub ipset_count: usize,
}

/// Suffix matcher over all configured lists.
///
/// Lookups run under a shared lock; `rebuild` compiles a fresh structure and
/// swaps it in under the exclusive lock, so a concurrent query sees either
/// the old snapshot fully or the new one fully.
#[derive(Default)]
pub struct DomainMatcher {
    inner: RwLock<Inner>,
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompiles all patterns from the lists referenced by the configured
    /// IP sets. Plain IPs, CIDRs, comments and blank lines are skipped; a
    /// leading `*.` is equivalent to the bare suffix.
    pub fn rebuild(&self, config: &Config, store: &dyn ListStore) -> Result<()> {
        let mut inner = Inner::default();
        let mut index: HashMap<String, usize> = HashMap::new();

        for ipset in &config.ipsets {
            inner.ipsets.insert(
                ipset.name.clone(),
                IpSetSpec {
                    name: ipset.name.clone(),
                    family: ipset.family,
                    additional_ttl: config.ipset_additional_ttl_sec,
                },
            );

            for list_name in &ipset.lists {
                let Some(list) = config.lists.iter().find(|list| &list.name == list_name) else {
                    // Validated at config load; a vanished list is not fatal here.
                    tracing::warn!(ipset = %ipset.name, list = %list_name, "Unknown list, skipping");
                    continue;
                };

                let entries = store
                    .domains(list)
                    .with_context(|| format!("Failed to load list '{list_name}'"))?;

                for raw in entries {
                    let Some(suffix) = normalize_pattern(&raw) else {
                        continue;
                    };

                    match index.get(&suffix) {
                        Some(&i) => {
                            let entry = &mut inner.patterns[i];
                            if !entry.ipsets.contains(&ipset.name) {
                                entry.ipsets.push(ipset.name.clone());
                            }
                        }
                        None => {
                            index.insert(suffix.clone(), inner.patterns.len());
                            inner.patterns.push(PatternEntry {
                                labels: suffix.split('.').count(),
                                suffix,
                                ipsets: vec![ipset.name.clone()],
                            });
                        }
                    }
                }
            }
        }

        let stats = MatcherStats {
            pattern_count: inner.patterns.len(),
            ipset_count: inner.ipsets.len(),
        };
        *self.inner.write() = inner;

        tracing::debug!(patterns = stats.pattern_count, ipsets = stats.ipset_count, "Compiled domain matcher");

        Ok(())
    }

    /// IP-set names attached to the most specific matching pattern(s).
    ///
    /// `name` must be normalized. Several patterns sharing the maximum label
    /// count all contribute; no match returns an empty, non-allocating `Vec`.
    pub fn match_name(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read();

        let mut best_labels = 0;
        let mut result = Vec::new();

        for pattern in &inner.patterns {
            if !suffix_matches(name, &pattern.suffix) {
                continue;
            }

            if pattern.labels > best_labels {
                best_labels = pattern.labels;
                result.clear();
            }
            if pattern.labels == best_labels {
                for ipset in &pattern.ipsets {
                    if !result.contains(ipset) {
                        result.push(ipset.clone());
                    }
                }
            }
        }

        result
    }

    /// Every IP set with *any* matching pattern, regardless of specificity.
    /// Used to pick per-IP-set upstream overrides.
    pub fn match_any(&self, name: &str) -> Vec<String> {
        let inner = self.inner.read();

        let mut result = Vec::new();
        for pattern in &inner.patterns {
            if !suffix_matches(name, &pattern.suffix) {
                continue;
            }

            for ipset in &pattern.ipsets {
                if !result.contains(ipset) {
                    result.push(ipset.clone());
                }
            }
        }

        result
    }

    pub fn ipset(&self, name: &str) -> Option<IpSetSpec> {
        self.inner.read().ipsets.get(name).cloned()
    }

    pub fn stats(&self) -> MatcherStats {
        let inner = self.inner.read();

        MatcherStats {
            pattern_count: inner.patterns.len(),
            ipset_count: inner.ipsets.len(),
        }
    }
}

fn suffix_matches(name: &str, suffix: &str) -> bool {
    if name == suffix {
        return true;
    }

    name.len() > suffix.len()
        && name.ends_with(suffix)
        && name.as_bytes()[name.len() - suffix.len() - 1] == b'.'
}

fn normalize_pattern(raw: &str) -> Option<String> {
    let entry = raw.trim();

    if entry.is_empty() || entry.starts_with('#') {
        return None;
    }
    // List files mix domains with raw addresses; only domains are ours.
    if entry.parse::<IpAddr>().is_ok() || entry.parse::<ip_network::IpNetwork>().is_ok() {
        return None;
    }

    let entry = entry.strip_prefix("*.").unwrap_or(entry);
    let normalized = dns_types::normalize(entry);

    if normalized.is_empty() {
        return None;
    }

    Some(normalized)
}
