//! The set of upstreams a query can be dispatched to.

use std::sync::Arc;

use dns_types::{Query, Response};
use parking_lot::RwLock;
use rand::seq::SliceRandom as _;

use super::{Provider, Upstream, UpstreamError, restriction_matches};

struct Cached {
    /// Static upstreams followed by all provider expansions.
    all: Arc<Vec<Arc<dyn Upstream>>>,
    /// Current expansion per provider, kept so a failed refresh can fall
    /// back to the previous list.
    provided: Vec<Vec<Arc<dyn Upstream>>>,
}

/// Union of static upstreams and provider expansions.
///
/// Queries go to the restriction-matching group first, then to the
/// unrestricted group; within a group one upstream is picked uniformly at
/// random. Random selection spreads load and rides out intermittent upstream
/// trouble without per-host health tracking.
pub struct UpstreamSet {
    statics: Vec<Arc<dyn Upstream>>,
    providers: Vec<Arc<dyn Provider>>,
    cached: RwLock<Cached>,
}

impl UpstreamSet {
    pub fn new(statics: Vec<Arc<dyn Upstream>>, providers: Vec<Arc<dyn Provider>>) -> Self {
        let provided = vec![Vec::new(); providers.len()];

        Self {
            cached: RwLock::new(Cached {
                all: Arc::new(statics.clone()),
                provided,
            }),
            statics,
            providers,
        }
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Re-expands all providers and swaps the cached list. A provider that
    /// fails keeps its previous expansion. Replaced upstreams are closed
    /// after the swap so in-flight queries finish on the old instances.
    pub async fn refresh(&self) {
        let mut expansions = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            match provider.expand().await {
                Ok(upstreams) => expansions.push(Some(upstreams)),
                Err(e) => {
                    tracing::warn!(
                        provider = %provider.describe(),
                        "Upstream discovery failed, keeping previous list: {e:#}"
                    );
                    expansions.push(None);
                }
            }
        }

        let mut replaced = Vec::new();
        {
            let mut cached = self.cached.write();

            for (slot, expansion) in cached.provided.iter_mut().zip(expansions) {
                if let Some(upstreams) = expansion {
                    replaced.extend(std::mem::replace(slot, upstreams));
                }
            }

            let mut all = self.statics.clone();
            for upstreams in &cached.provided {
                all.extend(upstreams.iter().cloned());
            }
            cached.all = Arc::new(all);
        }

        for upstream in replaced {
            upstream.close();
        }
    }

    /// Dispatches one query: restricted group first, then unrestricted, one
    /// random pick per group.
    pub async fn query(&self, query: &Query) -> Result<Response, UpstreamError> {
        let all = Arc::clone(&self.cached.read().all);
        let name = query
            .domain()
            .map(|domain| dns_types::normalize(&domain.to_string()));

        let mut restricted = Vec::new();
        let mut unrestricted = Vec::new();
        for upstream in all.iter() {
            match upstream.restriction() {
                Some(restriction) => {
                    let matches = name
                        .as_deref()
                        .is_some_and(|name| restriction_matches(restriction, name));
                    if matches {
                        restricted.push(Arc::clone(upstream));
                    }
                }
                None => unrestricted.push(Arc::clone(upstream)),
            }
        }

        for group in [restricted, unrestricted] {
            let Some(pick) = choose(&group) else {
                continue;
            };

            match pick.query(query).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(upstream = ?pick.describe(), "Upstream query failed: {e}");
                }
            }
        }

        Err(UpstreamError::AllFailed)
    }

    pub fn close_all(&self) {
        for upstream in self.cached.read().all.iter() {
            upstream.close();
        }
    }

    pub fn describe(&self) -> Vec<String> {
        self.cached
            .read()
            .all
            .iter()
            .flat_map(|upstream| upstream.describe())
            .collect()
    }
}

fn choose(group: &[Arc<dyn Upstream>]) -> Option<Arc<dyn Upstream>> {
    group.choose(&mut rand::thread_rng()).cloned()
}
