//! FlowCatalyst Message Router binary.
//!
//! Wires the queue backend chosen by `QUEUE_TYPE`, the standby coordinator,
//! the config fetcher, and the admin HTTP API around the router core.
//! See `RouterSettings` for the environment surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use fc_broker::{AdapterFactory, BackendFactory, QueueKind, QueuePublisher};
use fc_core::{PoolConfig, QueueConfig, RouterConfig, WarningCategory, WarningSeverity};
use fc_router::{
    api::{build_router, AppState},
    ConfigFetcher, ConfigFetcherSettings, ConsumerSupervisor, CredentialsCache, HealthService,
    HttpMediator, LifecycleConfig, LifecycleManager, OAuthClientCredentials, Router,
    RouterOptions, RouterSettings, SigningConfig, SupervisorSettings, WarningService,
    WarningServiceConfig,
};
use fc_standby::{
    ElbStrategy, NoopStrategy, RedisLeaseStore, StandbyConfig, StandbyService, TrafficCoordinator,
    TrafficStrategy,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    fc_core::logging::init_logging("fc-router");

    let settings = RouterSettings::from_env()?;
    info!(
        queue_type = %settings.queue_type,
        standby = settings.standby_enabled,
        dev_mode = settings.dev_mode,
        "starting FlowCatalyst message router"
    );

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install prometheus recorder")?;

    let warnings = Arc::new(WarningService::new(WarningServiceConfig::default()));
    let health = Arc::new(HealthService::new());

    // Control-plane auth + webhook signing credentials.
    let http_client = reqwest_client();
    let token_provider = settings.oidc().map(|(issuer, client_id, secret)| {
        Arc::new(OAuthClientCredentials::new(
            http_client.clone(),
            issuer,
            client_id,
            secret,
        ))
    });
    let credentials = Arc::new(CredentialsCache::new(
        http_client.clone(),
        settings.config_urls.clone(),
        settings.credentials_ttl,
        token_provider.clone(),
    ));
    let signing = settings
        .signing_service_account_id
        .clone()
        .map(|service_account_id| SigningConfig {
            credentials: Arc::clone(&credentials),
            service_account_id,
        });

    let mediator = Arc::new(HttpMediator::new(signing));

    let router = Router::spawn(
        mediator,
        Arc::clone(&warnings),
        RouterOptions {
            drain_timeout: settings.drain_timeout,
            ..Default::default()
        },
    );

    // Traffic coordination and standby role.
    let traffic = Arc::new(TrafficCoordinator::new(
        build_traffic_strategy(&settings).await,
    ));
    let (fatal_tx, mut fatal_rx) = tokio::sync::mpsc::channel::<String>(1);
    let standby = if settings.standby_enabled {
        let store = RedisLeaseStore::connect(&settings.redis_url)
            .await
            .context("failed to connect to coordination store")?;
        Arc::new(StandbyService::new(
            StandbyConfig {
                enabled: true,
                lock_key: settings.standby_lock_key.clone(),
                lock_ttl: settings.standby_lock_ttl,
                refresh_interval: Duration::from_secs(10),
                instance_id: settings.instance_id.clone(),
            },
            Arc::new(store),
            Arc::clone(&traffic),
        ))
    } else {
        Arc::new(StandbyService::single_node(
            Arc::clone(&traffic),
            settings.instance_id.clone(),
        ))
    };
    standby
        .start(fatal_tx)
        .await
        .map_err(|e| anyhow::anyhow!("standby start failed: {e}"))?;
    spawn_standby_health_bridge(Arc::clone(&standby), Arc::clone(&health), Arc::clone(&warnings));

    // Queue backend and consumers.
    let queue_kind: QueueKind = settings.queue_type.parse().map_err(anyhow::Error::msg)?;
    let factory = Arc::new(build_backend_factory(queue_kind, &settings).await?);
    let supervisor = Arc::new(ConsumerSupervisor::new(
        router.clone(),
        Arc::clone(&factory) as Arc<dyn AdapterFactory>,
        SupervisorSettings {
            in_flight_cap: settings.in_flight_cap,
            ..Default::default()
        },
        standby.subscribe(),
        Arc::clone(&warnings),
        Arc::clone(&health),
    ));

    // Configuration: fetched from the control plane, or built in for dev.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let initial_config = if settings.config_urls.is_empty() {
        let config = dev_config();
        info!(
            pools = config.processing_pools.len(),
            queues = config.queues.len(),
            "dev mode: applying built-in configuration"
        );
        router.reconfigure(config.processing_pools.clone()).await;
        supervisor.apply_queues(config.queues.clone()).await;
        config
    } else {
        let fetcher = Arc::new(ConfigFetcher::new(
            ConfigFetcherSettings {
                urls: settings.config_urls.clone(),
                refresh_interval: settings.config_refresh_interval,
                ..Default::default()
            },
            token_provider,
            Arc::clone(&warnings),
        ));

        let config = fetcher
            .initial_sync(&router, &supervisor)
            .await
            .map_err(|e| anyhow::anyhow!("initial config sync failed: {e}"))?;

        fc_router::spawn_config_sync_task(
            fetcher,
            router.clone(),
            Arc::clone(&supervisor),
            shutdown_tx.clone(),
        );
        config
    };

    if initial_config.queues.is_empty() {
        anyhow::bail!("no queues configured, refusing to start");
    }

    let lifecycle = LifecycleManager::start(
        router.clone(),
        Arc::clone(&warnings),
        LifecycleConfig::default(),
    );

    // Dev seeding publishes into the first configured queue.
    let publisher = build_publisher(queue_kind, &settings, &initial_config).await;

    // Admin API.
    let state = AppState {
        router: router.clone(),
        supervisor: Arc::clone(&supervisor),
        warnings: Arc::clone(&warnings),
        health: Arc::clone(&health),
        standby: Arc::clone(&standby),
        publisher,
        prometheus,
        dev_mode: settings.dev_mode,
    };
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", settings.http_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(port = settings.http_port, "admin api listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "admin api server failed");
        }
    });

    info!(
        instance_id = %settings.instance_id,
        role = standby.role().as_str(),
        "router started"
    );

    // Run until a shutdown signal arrives or the standby pair forces a
    // termination (lost lease while primary).
    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
        fatal = fatal_rx.recv() => {
            let reason = fatal.unwrap_or_else(|| "standby channel closed".to_string());
            error!(reason = %reason, "CRITICAL: terminating so the peer takes over");
            warnings.add_warning(
                WarningCategory::Coordination,
                WarningSeverity::Critical,
                format!("Instance terminating: {reason}"),
                "main".to_string(),
            );
            // Intentional crash: the orchestrator restarts this instance
            // cold, and it rejoins as standby.
            std::process::exit(1);
        }
    }

    // Graceful shutdown: stop admitting first, hand over the lease, then
    // drain the pools within the configured window.
    let _ = shutdown_tx.send(());
    lifecycle.shutdown();
    supervisor.stop_all().await;
    standby.shutdown().await;
    router.shutdown().await;
    server.abort();

    info!("router shutdown complete");
    Ok(())
}

fn reqwest_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("reqwest client")
}

async fn build_traffic_strategy(settings: &RouterSettings) -> Arc<dyn TrafficStrategy> {
    match settings.elb_target_group_arn.clone() {
        Some(target_group_arn) => {
            let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_elasticloadbalancingv2::Client::new(&config);
            info!(target_group = %target_group_arn, "traffic strategy: aws-elbv2");
            Arc::new(ElbStrategy::new(
                client,
                target_group_arn,
                settings.instance_id.clone(),
            ))
        }
        None => Arc::new(NoopStrategy),
    }
}

async fn build_backend_factory(
    kind: QueueKind,
    settings: &RouterSettings,
) -> anyhow::Result<BackendFactory> {
    match kind {
        QueueKind::Sqs => {
            let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Ok(BackendFactory::Sqs {
                client: aws_sdk_sqs::Client::new(&config),
                visibility_timeout_seconds: settings.visibility_timeout_seconds,
            })
        }
        QueueKind::Embedded => {
            if let Some(parent) = std::path::Path::new(&settings.sqlite_path).parent() {
                std::fs::create_dir_all(parent).ok();
            }
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(8)
                .connect(&format!("sqlite://{}?mode=rwc", settings.sqlite_path))
                .await
                .context("failed to open embedded queue database")?;
            Ok(BackendFactory::Embedded {
                pool,
                visibility_timeout_seconds: settings.visibility_timeout_seconds,
            })
        }
        QueueKind::ActiveMq => Ok(BackendFactory::ActiveMq {
            uri: settings.amqp_url.clone(),
        }),
        QueueKind::Nats => {
            let client = async_nats::connect(&settings.nats_url)
                .await
                .context("failed to connect to NATS")?;
            Ok(BackendFactory::Nats {
                context: async_nats::jetstream::new(client),
                ack_wait_seconds: settings.visibility_timeout_seconds,
            })
        }
    }
}

async fn build_publisher(
    kind: QueueKind,
    settings: &RouterSettings,
    config: &RouterConfig,
) -> Option<Arc<dyn QueuePublisher>> {
    let first_queue = config.queues.first()?;

    match kind {
        QueueKind::Embedded => {
            let pool = sqlx::sqlite::SqlitePoolOptions::new()
                .max_connections(2)
                .connect(&format!("sqlite://{}?mode=rwc", settings.sqlite_path))
                .await
                .ok()?;
            let broker = fc_broker::sqlite::SqliteBroker::new(
                pool,
                first_queue.identifier().to_string(),
                settings.visibility_timeout_seconds,
            );
            broker.init_schema().await.ok()?;
            Some(Arc::new(broker))
        }
        QueueKind::Sqs => {
            let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Some(Arc::new(fc_broker::sqs::SqsProducer::new(
                aws_sdk_sqs::Client::new(&aws),
                first_queue.queue_uri.clone(),
            )))
        }
        QueueKind::Nats => {
            let client = async_nats::connect(&settings.nats_url).await.ok()?;
            let adapter = fc_broker::nats::JetStreamAdapter::bind(
                async_nats::jetstream::new(client),
                first_queue.identifier(),
                Duration::from_secs(settings.visibility_timeout_seconds as u64),
            )
            .await
            .ok()?;
            Some(Arc::new(adapter))
        }
        QueueKind::ActiveMq => {
            warn!("seeding is not supported for the ActiveMQ backend");
            None
        }
    }
}

/// Built-in configuration for dev mode (no control plane).
fn dev_config() -> RouterConfig {
    RouterConfig {
        processing_pools: vec![
            PoolConfig::named("DEFAULT-POOL"),
            PoolConfig {
                concurrency: 20,
                ..PoolConfig::named("HIGH")
            },
            PoolConfig {
                concurrency: 5,
                rate_limit_per_minute: Some(60),
                ..PoolConfig::named("LOW")
            },
        ],
        queues: vec![QueueConfig {
            queue_name: "fc-default.fifo".to_string(),
            queue_uri: "fc-default.fifo".to_string(),
            connections: 2,
        }],
        connections: 2,
    }
}

fn spawn_standby_health_bridge(
    standby: Arc<StandbyService>,
    health: Arc<HealthService>,
    warnings: Arc<WarningService>,
) {
    tokio::spawn(async move {
        let mut was_healthy = true;
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            ticker.tick().await;
            let healthy = standby.store_healthy();
            health.set_hard_component(
                "coordination-store",
                healthy,
                (!healthy).then(|| "unreachable for more than one refresh cycle".to_string()),
            );
            if was_healthy && !healthy {
                warnings.add_warning(
                    WarningCategory::Coordination,
                    WarningSeverity::Critical,
                    "Coordination store unreachable; health reporting FAILED".to_string(),
                    "StandbyService".to_string(),
                );
            }
            was_healthy = healthy;
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
