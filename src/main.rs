use anyhow::{Context, Result};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_gateway::{
    admission::AdmissionController,
    broker::{EventPublisher, InMemoryBroker, RetryPolicy, RetryingPublisher},
    event::EventNormalizer,
    http::{router, AppState},
    metrics::Metrics,
    policy::{spawn_reload_task, PolicyStore},
    redis::{RedisBroker, RedisConfig},
    service::GatewayService,
    settings::{BrokerBackend, Settings},
    utils::TimeSource,
};

const BROKER_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env().context("failed to load settings")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("event_gateway={}", settings.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting event ingestion gateway");

    // Serving with an undefined policy is not an option
    let policy = Arc::new(
        PolicyStore::from_file(&settings.policy_path)
            .with_context(|| format!("failed to load policy from {}", settings.policy_path.display()))?,
    );

    let metrics = Arc::new(Metrics::new()?);
    let time_source = TimeSource::system();
    let admission = AdmissionController::new(policy.clone(), metrics.clone(), time_source.clone());
    let normalizer = EventNormalizer::new(
        settings.default_event_source.clone(),
        settings.max_batch_size,
        time_source.clone(),
    );
    let service = Arc::new(GatewayService::new(
        admission,
        normalizer,
        settings.destination(),
        metrics.clone(),
        settings.request_timeout(),
        time_source,
    ));

    attach_broker(&settings, service.clone(), metrics.clone()).await;

    if let Some(interval) = settings.policy_reload_interval() {
        spawn_reload_task(policy.clone(), settings.policy_path.clone(), interval, metrics.clone());
        info!(interval_secs = interval.as_secs(), "Policy hot reload enabled");
    }

    let state = AppState {
        service,
        metrics,
        trust_forwarded_for: settings.trust_forwarded_for,
    };
    let app = router(state, &settings.cors_origins()?);

    let addr = settings.listen_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Service stopped");
    Ok(())
}

/// Attach the configured broker. An unreachable Redis leaves the gateway
/// degraded and keeps retrying in the background.
async fn attach_broker(settings: &Settings, service: Arc<GatewayService>, metrics: Arc<Metrics>) {
    let retry_policy = settings.retry_policy();

    match settings.broker_backend {
        BrokerBackend::Memory => {
            warn!("Using in-memory broker; events are not durable");
            let broker: Arc<dyn EventPublisher> = Arc::new(InMemoryBroker::new());
            service
                .set_publisher(with_retries(broker, retry_policy, metrics))
                .await;
        }
        BrokerBackend::Redis => {
            let config = settings.redis_config();
            match RedisBroker::connect(config.clone()).await {
                Ok(broker) => {
                    service
                        .set_publisher(with_retries(Arc::new(broker), retry_policy, metrics))
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, "Broker unavailable at startup, running degraded");
                    tokio::spawn(reconnect_broker(service, config, retry_policy, metrics));
                }
            }
        }
    }
}

async fn reconnect_broker(
    service: Arc<GatewayService>,
    config: RedisConfig,
    retry_policy: RetryPolicy,
    metrics: Arc<Metrics>,
) {
    let mut ticker = tokio::time::interval(BROKER_RECONNECT_INTERVAL);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match RedisBroker::connect(config.clone()).await {
            Ok(broker) => {
                service
                    .set_publisher(with_retries(Arc::new(broker), retry_policy, metrics))
                    .await;
                info!("Broker connection established");
                return;
            }
            Err(e) => warn!(error = %e, "Broker still unavailable"),
        }
    }
}

fn with_retries(
    broker: Arc<dyn EventPublisher>,
    retry_policy: RetryPolicy,
    metrics: Arc<Metrics>,
) -> Arc<dyn EventPublisher> {
    Arc::new(RetryingPublisher::new(broker, retry_policy, metrics))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl+C, shutting down");
}
