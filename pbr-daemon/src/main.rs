//! Daemon entry point: configuration, logging, signals, and the concrete
//! collaborators around the interception engine.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod ipset_exec;
mod list_store;
mod netadmin;
mod rci;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use pbr_resolver::matcher::IpSetSpec;
use pbr_resolver::netadmin::NetAdmin as _;
use pbr_resolver::{Config, RouterClient, Service};
use tokio::signal::unix::{SignalKind, signal};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::ipset_exec::IpsetExec;
use crate::list_store::FsListStore;
use crate::netadmin::LogNetAdmin;
use crate::rci::RciClient;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "PBR_CONFIG", default_value = "/opt/etc/pbr-dns.toml")]
    config: PathBuf,

    /// Directory holding downloaded list files (one `<name>.lst` per
    /// url-sourced list).
    #[arg(long, env = "PBR_LISTS_DIR", default_value = "/opt/var/pbr-dns/lists")]
    lists_dir: PathBuf,

    /// Base URL of the router's RCI endpoint, e.g. `http://192.168.1.1/rci/`.
    /// Required when any upstream is `keenetic://`.
    #[arg(long, env = "PBR_ROUTER_URL")]
    router_url: Option<Url>,

    /// Path to the `ipset` binary.
    #[arg(long, env = "PBR_IPSET_BIN", default_value = "ipset")]
    ipset_bin: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read config file {}", cli.config.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", cli.config.display()))?;
    config.validate().context("Invalid configuration")?;

    let router: Option<Arc<dyn RouterClient>> = match (&cli.router_url, config.needs_router()) {
        (Some(url), _) => Some(Arc::new(RciClient::new(url.clone())?)),
        (None, true) => anyhow::bail!("keenetic:// upstream configured but --router-url is unset"),
        (None, false) => None,
    };

    let netadmin = LogNetAdmin;
    let ipset_specs: Vec<IpSetSpec> = config
        .ipsets
        .iter()
        .map(|ipset| IpSetSpec {
            name: ipset.name.clone(),
            family: ipset.family,
            additional_ttl: config.ipset_additional_ttl_sec,
        })
        .collect();

    let service = Service::new(
        config,
        Arc::new(FsListStore::new(cli.lists_dir)),
        Arc::new(IpsetExec::new(cli.ipset_bin)),
        router,
    );

    service.start().await?;
    netadmin.apply(&ipset_specs).await?;

    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = sigterm.recv() => break,
            _ = sighup.recv() => {
                if let Err(e) = service.reload_lists() {
                    tracing::error!("List reload failed: {e:#}");
                }
            }
        }
    }

    tracing::info!("Shutting down");
    service.stop().await;
    netadmin.revert().await?;

    Ok(())
}
