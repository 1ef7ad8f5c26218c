mod api;
mod bus;
mod collector;
mod config;
mod db;
mod error;
mod fanout;
mod lifecycle;
mod metadata;
mod queue;
mod store;
mod upload;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use bus::Bus;
use collector::AbandonedUploadCollector;
use config::Config;
use fanout::FanoutService;
use lifecycle::LifecycleController;
use metadata::MetadataStore;
use queue::JobQueue;
use store::{MemoryStore, ObjectStore, S3Config, S3Store};
use upload::UploadSessionManager;

/// Request bodies are JSON control messages; the video bytes go straight to
/// the object store via presigned URLs.
const MAX_JSON_BODY: usize = 16 * 1024 * 1024;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vodgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());

    // Initialize database
    let database = match &config.database_url {
        Some(url) => db::connect(url).await,
        None => db::init_database(&config.data_dir.join("vodgate.db")).await,
    }
    .expect("Failed to initialize database");

    // Object store: S3-compatible in production, in-memory fallback for dev
    let object_store: Arc<dyn ObjectStore> = if config.bucket.is_empty() {
        tracing::warn!("VODGATE_BUCKET not set; using the in-memory object store (dev only)");
        Arc::new(MemoryStore::new())
    } else {
        let s3_config = S3Config {
            bucket: config.bucket.clone(),
            region: config.s3_region.clone(),
            endpoint: config.s3_endpoint.clone(),
            force_path_style: config.s3_force_path_style,
        };
        Arc::new(S3Store::new(s3_config).await)
    };

    let meta = MetadataStore::new(database);
    let queue = JobQueue::new(
        meta.conn().clone(),
        config.queue_attempts,
        config.queue_backoff_base,
    );
    let bus = Arc::new(Bus::new(config.subscriber_queue_depth));
    let fanout = Arc::new(FanoutService::new(config.subscriber_queue_depth));
    let sessions = UploadSessionManager::new(
        object_store.clone(),
        meta.clone(),
        queue.clone(),
        config.clone(),
    );
    let lifecycle = Arc::new(LifecycleController::new(
        meta.clone(),
        object_store.clone(),
        queue.clone(),
    ));

    // Background tasks: event routing and the abandoned-upload sweep
    let dispatcher = fanout.spawn_dispatcher(bus.clone());
    let consumer = lifecycle.spawn_event_consumer(bus.clone());
    let sweeper = Arc::new(AbandonedUploadCollector::new(
        object_store.clone(),
        meta.clone(),
        queue.clone(),
        lifecycle.clone(),
        config.clone(),
    ))
    .spawn();

    tracing::info!(
        "limits: max_file_size={} multipart_threshold={} chunk={} max_parts={} presign_ttl={}s",
        config.max_file_size,
        config.multipart_threshold,
        config.multipart_chunk_bytes,
        config.max_multipart_parts,
        config.presign_ttl.as_secs()
    );

    let state = Arc::new(AppState {
        meta,
        store: object_store,
        fanout,
        sessions,
        lifecycle,
    });

    let app = api::router()
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST:PORT combination");
    tracing::info!("vodgate listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    dispatcher.abort();
    consumer.abort();
    sweeper.abort();
    tracing::info!("shutdown complete");
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    tracing::info!("shutdown signal received");
}
