use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mindgateway::config::{Config, LogFormat};
use mindgateway::gateway::{
    DispatchSettings, Dispatcher, DispatcherPool, HealthChecker, HttpProbe, HttpWorkerClient,
    LeastLoadedRouter, RequestQueue, RoutingEngine, WorkerClient, WorkerRegistry,
};
use mindgateway::{build_app, AppState, HttpAuthClient, Metrics};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| config.logging.level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Received shutdown signal");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize tracing
    init_tracing(&config);

    tracing::info!("Starting MindGateway");

    let metrics = Metrics::new()?;

    // Worker registry, seeded with statically configured workers
    let registry = Arc::new(WorkerRegistry::new(config.health, metrics.clone()));
    for worker in &config.registry.static_workers {
        registry.register_worker(worker.clone()).await?;
    }
    tracing::info!("Registered {} static workers", config.registry.static_workers.len());

    // Queue and dispatcher pool
    let queue = Arc::new(RequestQueue::new(config.queue.max_size, metrics.clone()));
    let router: Arc<dyn RoutingEngine> = Arc::new(LeastLoadedRouter::new(registry.clone()));
    let client: Arc<dyn WorkerClient> = Arc::new(HttpWorkerClient::new(&config.worker)?);
    let dispatcher = Arc::new(Dispatcher::new(
        queue.clone(),
        router,
        client,
        registry.clone(),
        DispatchSettings::from(&config.dispatch),
        metrics.clone(),
    ));
    let pool = DispatcherPool::spawn(dispatcher, config.queue.dispatchers);
    tracing::info!("Started {} dispatchers", pool.len());

    // Background maintenance
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let purger = queue
        .clone()
        .spawn_purger(config.queue.processing_period(), shutdown_rx.clone());
    let probe = Arc::new(HttpProbe::new(config.worker.connect_timeout())?);
    let health_checker = HealthChecker::new(registry.clone(), probe, config.worker.health_check_period())
        .spawn(shutdown_rx.clone());

    let auth_service = Arc::new(HttpAuthClient::new(&config.auth)?);
    let state = Arc::new(AppState::new(
        config.clone(),
        metrics,
        registry,
        queue.clone(),
        auth_service,
    ));
    let limiter_pruner = state
        .admission
        .spawn_limiter_pruner(config.queue.processing_period(), shutdown_rx);

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = build_app(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop admitting, fail what is still queued, then stop background tasks.
    queue.shutdown().await;
    let _ = shutdown_tx.send(true);

    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let background = async {
        pool.join().await;
        if let Err(e) = purger.await {
            tracing::warn!("Queue purger task failed: {}", e);
        }
        if let Err(e) = health_checker.await {
            tracing::warn!("Health checker task failed: {}", e);
        }
        if let Some(pruner) = limiter_pruner {
            if let Err(e) = pruner.await {
                tracing::warn!("Rate limiter pruner task failed: {}", e);
            }
        }
    };
    if tokio::time::timeout(timeout, background).await.is_err() {
        tracing::warn!("Background tasks did not stop within {:?}", timeout);
    }

    tracing::info!("MindGateway shutdown complete");
    Ok(())
}
