//! Periodic multi-source configuration pull.
//!
//! Every cycle the fetcher pulls `/api/config/message-router` from every
//! configured control-plane URL in parallel and merges the responses
//! deterministically: queues union by URI and pools by code with the first
//! source winning on conflict (a warning records the disagreement),
//! identical duplicates collapse silently, and `connections` takes the
//! maximum. If every source fails the current snapshot stays in force.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fc_core::{PoolConfig, QueueConfig, RouterConfig, WarningCategory, WarningSeverity};

use crate::credentials::OAuthClientCredentials;
use crate::error::RouterError;
use crate::router::RouterHandle;
use crate::supervisor::ConsumerSupervisor;
use crate::warning::WarningService;

const CONFIG_PATH: &str = "/api/config/message-router";

#[derive(Debug, Clone)]
pub struct ConfigFetcherSettings {
    pub urls: Vec<String>,
    pub refresh_interval: Duration,
    pub request_timeout: Duration,
    /// Initial-sync retry budget; the router cannot start unconfigured.
    pub initial_attempts: u32,
    pub initial_retry_delay: Duration,
}

impl Default for ConfigFetcherSettings {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            refresh_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            initial_attempts: 12,
            initial_retry_delay: Duration::from_secs(5),
        }
    }
}

pub struct ConfigFetcher {
    settings: ConfigFetcherSettings,
    client: reqwest::Client,
    token_provider: Option<Arc<OAuthClientCredentials>>,
    warnings: Arc<WarningService>,
    last_hash: Mutex<Option<u64>>,
}

impl ConfigFetcher {
    pub fn new(
        settings: ConfigFetcherSettings,
        token_provider: Option<Arc<OAuthClientCredentials>>,
        warnings: Arc<WarningService>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .expect("reqwest client");

        Self {
            settings,
            client,
            token_provider,
            warnings,
            last_hash: Mutex::new(None),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        self.settings.refresh_interval
    }

    fn endpoint(base: &str) -> String {
        let trimmed = base.trim_end_matches('/');
        if trimmed.ends_with("/api/config/message-router") {
            trimmed.to_string()
        } else {
            format!("{trimmed}{CONFIG_PATH}")
        }
    }

    async fn fetch_one(&self, base: &str) -> Result<RouterConfig, RouterError> {
        let url = Self::endpoint(base);
        let mut request = self.client.get(&url);

        if let Some(provider) = self.token_provider.as_ref() {
            let token = provider
                .bearer()
                .await
                .map_err(|e| RouterError::Credentials(e.to_string()))?;
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(RouterError::Config(format!(
                "config source returned {}",
                response.status()
            )));
        }

        Ok(response.json::<RouterConfig>().await?)
    }

    /// Pull all sources in parallel. Returns `None` when every source
    /// failed, in which case the caller keeps the current snapshot.
    pub async fn fetch_merged(&self) -> Option<RouterConfig> {
        if self.settings.urls.is_empty() {
            return None;
        }

        let fetches = self.settings.urls.iter().map(|url| async move {
            (url.clone(), self.fetch_one(url).await)
        });
        let results = futures::future::join_all(fetches).await;

        let mut sources = Vec::with_capacity(results.len());
        for (url, result) in results {
            match result {
                Ok(config) => sources.push((url, config)),
                Err(e) => {
                    warn!(source = %url, error = %e, "config source failed");
                }
            }
        }

        if sources.is_empty() {
            error!("all configuration sources failed, retaining current config");
            self.warnings.add_warning(
                WarningCategory::Configuration,
                WarningSeverity::Error,
                "All configuration sources failed; keeping previous snapshot".to_string(),
                "ConfigFetcher".to_string(),
            );
            return None;
        }

        let (merged, conflicts) = merge_sources(sources);
        for conflict in conflicts {
            warn!(conflict = %conflict, "configuration conflict, first source wins");
            self.warnings.add_warning(
                WarningCategory::Configuration,
                WarningSeverity::Warn,
                conflict,
                "ConfigFetcher".to_string(),
            );
        }

        Some(merged)
    }

    /// Fetch, diff against the last applied snapshot, and apply on change.
    pub async fn sync(&self, router: &RouterHandle, supervisor: &ConsumerSupervisor) -> bool {
        let Some(config) = self.fetch_merged().await else {
            return false;
        };

        let hash = config_hash(&config);
        {
            let last = self.last_hash.lock();
            if *last == Some(hash) {
                debug!("configuration unchanged");
                return true;
            }
        }

        self.apply(&config, router, supervisor).await;
        *self.last_hash.lock() = Some(hash);
        true
    }

    async fn apply(
        &self,
        config: &RouterConfig,
        router: &RouterHandle,
        supervisor: &ConsumerSupervisor,
    ) {
        let summary = router.reconfigure(config.processing_pools.clone()).await;
        let (queues_added, queues_removed) =
            supervisor.apply_queues(config.queues.clone()).await;

        info!(
            pools_created = summary.pools_created,
            pools_updated = summary.pools_updated,
            pools_removed = summary.pools_removed,
            queues_added,
            queues_removed,
            "configuration applied"
        );
    }

    /// Blocking initial sync; the router does not start without a config.
    pub async fn initial_sync(
        &self,
        router: &RouterHandle,
        supervisor: &ConsumerSupervisor,
    ) -> Result<RouterConfig, RouterError> {
        for attempt in 1..=self.settings.initial_attempts {
            if let Some(config) = self.fetch_merged().await {
                self.apply(&config, router, supervisor).await;
                *self.last_hash.lock() = Some(config_hash(&config));
                info!(
                    attempt,
                    pools = config.processing_pools.len(),
                    queues = config.queues.len(),
                    "initial configuration sync complete"
                );
                return Ok(config);
            }

            warn!(
                attempt,
                max_attempts = self.settings.initial_attempts,
                "initial config sync failed, retrying"
            );
            tokio::time::sleep(self.settings.initial_retry_delay).await;
        }

        Err(RouterError::Config(
            "initial configuration sync exhausted retries".to_string(),
        ))
    }
}

/// Deterministic merge. Sources are visited in input order; the first
/// definition of a queue URI or pool code wins. Returns the merged config
/// and human-readable conflict descriptions.
pub fn merge_sources(sources: Vec<(String, RouterConfig)>) -> (RouterConfig, Vec<String>) {
    let mut queues: IndexMap<String, (QueueConfig, String)> = IndexMap::new();
    let mut pools: IndexMap<String, (PoolConfig, String)> = IndexMap::new();
    let mut connections = 1u32;
    let mut conflicts = Vec::new();

    for (source, config) in sources {
        connections = connections.max(config.connections);

        for queue in config.queues {
            match queues.get(&queue.queue_uri) {
                None => {
                    queues.insert(queue.queue_uri.clone(), (queue, source.clone()));
                }
                Some((existing, first_source)) if *existing != queue => {
                    conflicts.push(format!(
                        "Queue [{}] defined differently by [{}] and [{}]; keeping [{}]",
                        queue.queue_uri, first_source, source, first_source
                    ));
                }
                Some(_) => {} // identical duplicate, collapse silently
            }
        }

        for pool in config.processing_pools {
            match pools.get(&pool.code) {
                None => {
                    pools.insert(pool.code.clone(), (pool, source.clone()));
                }
                Some((existing, first_source)) if *existing != pool => {
                    conflicts.push(format!(
                        "Pool [{}] defined differently by [{}] and [{}]; keeping [{}]",
                        pool.code, first_source, source, first_source
                    ));
                }
                Some(_) => {}
            }
        }
    }

    let merged = RouterConfig {
        queues: queues.into_values().map(|(q, _)| q).collect(),
        processing_pools: pools.into_values().map(|(p, _)| p).collect(),
        connections,
    };
    (merged, conflicts)
}

fn config_hash(config: &RouterConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    for pool in &config.processing_pools {
        pool.hash(&mut hasher);
    }
    for queue in &config.queues {
        queue.hash(&mut hasher);
    }
    config.connections.hash(&mut hasher);
    hasher.finish()
}

/// Background sync task driving the fetcher on its interval.
pub fn spawn_config_sync_task(
    fetcher: Arc<ConfigFetcher>,
    router: RouterHandle,
    supervisor: Arc<ConsumerSupervisor>,
    shutdown_tx: broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(fetcher.refresh_interval());
        // Skip the immediate tick; the initial sync already ran.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("running scheduled configuration sync");
                    if !fetcher.sync(&router, &supervisor).await {
                        warn!("scheduled config sync failed, continuing with current config");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("config sync task stopping");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(uri: &str, connections: u32) -> QueueConfig {
        QueueConfig {
            queue_name: uri.to_string(),
            queue_uri: uri.to_string(),
            connections,
        }
    }

    fn pool(code: &str, concurrency: u32) -> PoolConfig {
        PoolConfig {
            concurrency,
            ..PoolConfig::named(code)
        }
    }

    fn config(queues: Vec<QueueConfig>, pools: Vec<PoolConfig>, connections: u32) -> RouterConfig {
        RouterConfig {
            queues,
            processing_pools: pools,
            connections,
        }
    }

    #[test]
    fn disjoint_sources_union_symmetrically() {
        let a = config(vec![queue("q1", 1)], vec![pool("P1", 4)], 1);
        let b = config(vec![queue("q2", 2)], vec![pool("P2", 8)], 2);

        let (ab, conflicts_ab) = merge_sources(vec![
            ("a".to_string(), a.clone()),
            ("b".to_string(), b.clone()),
        ]);
        let (ba, conflicts_ba) =
            merge_sources(vec![("b".to_string(), b), ("a".to_string(), a)]);

        assert!(conflicts_ab.is_empty());
        assert!(conflicts_ba.is_empty());

        let mut ab_queues: Vec<String> = ab.queues.iter().map(|q| q.queue_uri.clone()).collect();
        let mut ba_queues: Vec<String> = ba.queues.iter().map(|q| q.queue_uri.clone()).collect();
        ab_queues.sort();
        ba_queues.sort();
        assert_eq!(ab_queues, ba_queues);
        assert_eq!(ab.connections, 2);
        assert_eq!(ba.connections, 2);
    }

    #[test]
    fn first_source_wins_on_conflict_with_warning() {
        let a = config(vec![], vec![pool("P1", 4)], 1);
        let b = config(vec![], vec![pool("P1", 16)], 1);

        let (merged, conflicts) = merge_sources(vec![
            ("http://cp-a".to_string(), a),
            ("http://cp-b".to_string(), b),
        ]);

        assert_eq!(merged.processing_pools.len(), 1);
        assert_eq!(merged.processing_pools[0].concurrency, 4);
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].contains("P1"));
        assert!(conflicts[0].contains("http://cp-a"));
    }

    #[test]
    fn identical_duplicates_collapse_silently() {
        let a = config(vec![queue("q1", 1)], vec![pool("P1", 4)], 1);
        let b = config(vec![queue("q1", 1)], vec![pool("P1", 4)], 1);

        let (merged, conflicts) =
            merge_sources(vec![("a".to_string(), a), ("b".to_string(), b)]);

        assert!(conflicts.is_empty());
        assert_eq!(merged.queues.len(), 1);
        assert_eq!(merged.processing_pools.len(), 1);
    }

    #[test]
    fn connections_take_the_maximum() {
        let a = config(vec![], vec![], 3);
        let b = config(vec![], vec![], 7);
        let (merged, _) = merge_sources(vec![("a".to_string(), a), ("b".to_string(), b)]);
        assert_eq!(merged.connections, 7);
    }

    #[test]
    fn endpoint_appends_path_once() {
        assert_eq!(
            ConfigFetcher::endpoint("http://cp:8080"),
            "http://cp:8080/api/config/message-router"
        );
        assert_eq!(
            ConfigFetcher::endpoint("http://cp:8080/api/config/message-router"),
            "http://cp:8080/api/config/message-router"
        );
    }

    #[test]
    fn hash_is_stable_and_change_sensitive() {
        let a = config(vec![queue("q1", 1)], vec![pool("P1", 4)], 1);
        let same = config(vec![queue("q1", 1)], vec![pool("P1", 4)], 1);
        let different = config(vec![queue("q1", 1)], vec![pool("P1", 5)], 1);

        assert_eq!(config_hash(&a), config_hash(&same));
        assert_ne!(config_hash(&a), config_hash(&different));
    }
}
