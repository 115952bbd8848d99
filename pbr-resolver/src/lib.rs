//! Transparent DNS interception engine for policy-based routing.
//!
//! Clients resolve through this server; answers for listed domains feed the
//! kernel IP sets that the router's firewall and routing rules steer on.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod bufpool;
pub mod cache;
pub mod config;
pub mod ipset;
pub mod lists;
pub mod matcher;
pub mod netadmin;
pub mod pipeline;
pub mod router;
pub mod service;
pub mod subscribers;
pub mod upstream;

pub use cache::RecordsCache;
pub use config::{Config, ConfigError};
pub use ipset::{IpSetEntry, IpSetManager};
pub use lists::{InlineListStore, ListStore};
pub use matcher::DomainMatcher;
pub use pipeline::{CHECK_DOMAIN, QueryPipeline};
pub use router::{RouterClient, UpstreamDescriptor, UpstreamKind};
pub use service::Service;
