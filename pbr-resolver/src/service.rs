//! Lifecycle of the interception engine: start, stop, live list reload.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::bufpool::BufferPool;
use crate::cache::RecordsCache;
use crate::config::{Config, UpstreamUrl};
use crate::ipset::IpSetManager;
use crate::lists::ListStore;
use crate::matcher::DomainMatcher;
use crate::pipeline::{self, QueryPipeline};
use crate::router::RouterClient;
use crate::subscribers::{SubscriberId, Subscribers};
use crate::upstream::{DohUpstream, Provider, RouterUpstreamProvider, UdpUpstream, Upstream, UpstreamSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Running,
    Stopping,
    Stopped,
}

struct Running {
    tasks: Vec<JoinHandle<()>>,
    upstream_sets: Vec<Arc<UpstreamSet>>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
}

/// The assembled interception engine.
///
/// Owns the listeners, the cleanup and provider-refresh tickers and the
/// subscriber registry. External collaborators come in as trait objects.
pub struct Service {
    config: Config,
    cache: Arc<RecordsCache>,
    matcher: Arc<DomainMatcher>,
    lists: Arc<dyn ListStore>,
    ipsets: Arc<dyn IpSetManager>,
    router: Option<Arc<dyn RouterClient>>,
    subscribers: Arc<Subscribers>,
    cancel: CancellationToken,
    state: Mutex<State>,
    running: Mutex<Option<Running>>,
}

impl Service {
    /// Builds the service around a validated [`Config`].
    pub fn new(
        config: Config,
        lists: Arc<dyn ListStore>,
        ipsets: Arc<dyn IpSetManager>,
        router: Option<Arc<dyn RouterClient>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let cache = Arc::new(RecordsCache::new(config.max_cache_domains));
        let subscribers = Arc::new(Subscribers::new(cancel.clone()));

        Self {
            config,
            cache,
            matcher: Arc::new(DomainMatcher::new()),
            lists,
            ipsets,
            router,
            subscribers,
            cancel,
            state: Mutex::new(State::New),
            running: Mutex::new(None),
        }
    }

    /// Opens the listeners and spawns the serve, cleanup and refresh tasks.
    ///
    /// A bind failure aborts the start; whatever was opened before it is
    /// closed on drop.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            anyhow::ensure!(*state == State::New, "service was already started");
            *state = State::Running;
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                *self.state.lock() = State::New;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<()> {
        // One pooled HTTPS client shared by every DoH upstream.
        let http = build_http_client()?;

        let default_upstreams = Arc::new(self.build_upstream_set(&self.config.upstreams, &http)?);
        let mut overrides = Vec::new();
        for ipset in &self.config.ipsets {
            if let Some(dns) = &ipset.dns {
                let set = Arc::new(self.build_upstream_set(&dns.upstreams, &http)?);
                overrides.push((ipset.name.clone(), set));
            }
        }

        let mut upstream_sets = vec![Arc::clone(&default_upstreams)];
        upstream_sets.extend(overrides.iter().map(|(_, set)| Arc::clone(set)));

        // First provider expansion happens before we serve.
        for set in &upstream_sets {
            if set.has_providers() {
                set.refresh().await;
            }
        }

        self.matcher
            .rebuild(&self.config, self.lists.as_ref())
            .context("Failed to compile domain lists")?;

        let listen = self.config.listen();
        let udp = UdpSocket::bind(listen)
            .await
            .with_context(|| format!("Failed to bind UDP listener on {listen}"))?;
        let udp_addr = udp.local_addr().context("Failed to read UDP listener address")?;
        let tcp = TcpListener::bind(udp_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {udp_addr}"))?;
        let tcp_addr = tcp.local_addr().context("Failed to read TCP listener address")?;

        let pipeline = Arc::new(QueryPipeline::new(
            Arc::clone(&self.cache),
            Arc::clone(&self.matcher),
            Arc::clone(&self.ipsets),
            Arc::clone(&default_upstreams),
            overrides,
            Arc::clone(&self.subscribers),
            self.config.drop_aaaa,
            self.config.listed_domain_cache_ttl_sec,
            self.config.timeouts.upstream_query(),
        ));

        let pool = BufferPool::new(self.config.timeouts.max_message_size);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(pipeline::udp::serve(
            Arc::new(udp),
            Arc::clone(&pipeline),
            pool,
            self.cancel.child_token(),
        )));
        tasks.push(tokio::spawn(pipeline::tcp::serve(
            tcp,
            Arc::clone(&pipeline),
            self.cancel.child_token(),
            self.config.timeouts.tcp_connection(),
            self.config.timeouts.max_message_size,
        )));
        tasks.push(tokio::spawn(cleanup_loop(
            Arc::clone(&self.cache),
            self.config.timeouts.cleanup_interval(),
            self.cancel.child_token(),
        )));

        let provider_sets: Vec<_> = upstream_sets
            .iter()
            .filter(|set| set.has_providers())
            .cloned()
            .collect();
        if !provider_sets.is_empty() {
            tasks.push(tokio::spawn(refresh_loop(
                provider_sets,
                self.config.timeouts.provider_refresh(),
                self.cancel.child_token(),
            )));
        }

        tracing::info!(%udp_addr, %tcp_addr, "Listening for DNS queries");

        *self.running.lock() = Some(Running {
            tasks,
            upstream_sets,
            udp_addr,
            tcp_addr,
        });

        Ok(())
    }

    /// Stops serving: cancels every task, closes subscribers first so
    /// observers unblock, then waits for tasks and closes upstreams.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != State::Running {
                return;
            }
            *state = State::Stopping;
        }

        self.cancel.cancel();
        self.subscribers.close_all();

        let running = self.running.lock().take();
        if let Some(running) = running {
            for task in running.tasks {
                if let Err(e) = task.await {
                    tracing::warn!("Serve task failed during shutdown: {e}");
                }
            }

            for set in &running.upstream_sets {
                set.close_all();
            }
        }

        *self.state.lock() = State::Stopped;

        tracing::info!("Service stopped");
    }

    /// Applies updated domain lists while serving: rebuilds the matcher,
    /// then clears the cache. Takes the locks in the same order as the
    /// query path and never holds one while acquiring the other.
    pub fn reload_lists(&self) -> Result<()> {
        anyhow::ensure!(
            *self.state.lock() == State::Running,
            "list reload requires a running service"
        );

        self.matcher
            .rebuild(&self.config, self.lists.as_ref())
            .context("Failed to recompile domain lists")?;
        self.cache.clear();

        let stats = self.matcher.stats();
        tracing::info!(patterns = stats.pattern_count, "Reloaded domain lists");

        Ok(())
    }

    pub fn subscribe(&self) -> (SubscriberId, tokio::sync::mpsc::Receiver<String>) {
        self.subscribers.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.subscribers.unsubscribe(id);
    }

    pub fn close_all_subscribers(&self) {
        self.subscribers.close_all();
    }

    pub fn cache(&self) -> &RecordsCache {
        &self.cache
    }

    /// Actual bound UDP address; differs from the config when port 0 was
    /// requested.
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.udp_addr)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|running| running.tcp_addr)
    }

    fn build_upstream_set(&self, urls: &[UpstreamUrl], http: &reqwest::Client) -> Result<UpstreamSet> {
        let mut statics: Vec<Arc<dyn Upstream>> = Vec::new();
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

        for url in urls {
            match url {
                UpstreamUrl::Udp { server } => {
                    statics.push(Arc::new(UdpUpstream::new(*server)));
                }
                UpstreamUrl::Doh { url } => {
                    statics.push(Arc::new(DohUpstream::new(http, url.clone())));
                }
                UpstreamUrl::Router => {
                    let client = self
                        .router
                        .clone()
                        .context("keenetic:// upstream configured but no router client available")?;
                    providers.push(Arc::new(RouterUpstreamProvider::new(client)));
                }
            }
        }

        Ok(UpstreamSet::new(statics, providers))
    }
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .min_tls_version(reqwest::tls::Version::TLS_1_2)
        // Bounds idle-connection memory on small embedded targets.
        .pool_max_idle_per_host(2)
        .build()
        .context("Failed to build shared HTTPS client")
}

async fn cleanup_loop(cache: Arc<RecordsCache>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                cache.evict_expired();

                let stats = cache.stats();
                tracing::debug!(
                    addresses = stats.address_count,
                    aliases = stats.alias_count,
                    "Evicted expired cache entries"
                );
            }
        }
    }
}

async fn refresh_loop(sets: Vec<Arc<UpstreamSet>>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The immediate first tick duplicates the expansion done during start.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                for set in &sets {
                    set.refresh().await;
                }
            }
        }
    }
}
