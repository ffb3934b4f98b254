//! Boot sequencing: load config, wire the DAG store, broker, cluster
//! client and worker pool, then run the HTTP server alongside the three
//! background loops (outbox claimer, broker dispatcher, observer) until a
//! shutdown signal arrives.

mod config;
mod error;
mod http;
mod submission;

use std::sync::Arc;

use anyhow::{Context, Result};
use dwop_cluster::{KubeJobExecutor, Observer, ObserverConfig};
use dwop_queue::{BrokerPublisher, Dispatcher, OutboxClaimer, PublisherPool, DEFAULT_CHANNEL_COUNT, QUEUE_NAME};
use dwop_storage::{BlobStore, SupabaseBlobStore};
use dwop_store::{PostgresStore, WorkflowStore};
use dwop_worker::{WorkerPool, WorkerPoolConfig};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dwop=debug,info")),
        )
        .init();

    tracing::info!("dwop-orchestrator starting");

    let config = Config::from_env().context("failed to load configuration")?;

    let pg_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = Arc::new(PostgresStore::new(pg_pool));
    store
        .migrate()
        .await
        .context("failed to run database migrations")?;
    tracing::info!("connected to database and ran migrations");

    let storage: Arc<dyn BlobStore> = Arc::new(SupabaseBlobStore::new(
        config.supabase_project_url.clone(),
        config.supabase_service_key.clone(),
    ));

    let kube_client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client (check KUBECONFIG)")?;

    let job_executor = Arc::new(KubeJobExecutor::new(
        kube_client.clone(),
        config.namespace.clone(),
        config.image.clone(),
        Arc::clone(&storage),
    ));

    let observer = Arc::new(Observer::new(
        kube_client,
        ObserverConfig {
            namespace: config.namespace.clone(),
            ..ObserverConfig::default()
        },
        Arc::clone(&store),
    ));

    let publisher_pool = PublisherPool::connect(&config.rabbitmq_url, QUEUE_NAME, DEFAULT_CHANNEL_COUNT)
        .await
        .context("failed to connect to RabbitMQ for publishing")?;
    let broker_publisher = Arc::new(BrokerPublisher::new(
        publisher_pool,
        Arc::clone(&store),
        Some(Arc::clone(&observer) as Arc<dyn dwop_queue::WorkflowCanceler>),
    ));

    let worker_pool = WorkerPool::start(WorkerPoolConfig::default());

    let shutdown = CancellationToken::new();

    let outbox_claimer = Arc::new(OutboxClaimer::new(
        Arc::clone(&store),
        Arc::clone(&broker_publisher),
        Arc::clone(&worker_pool),
        "outbox-claimer-0",
    ));
    let outbox_task = {
        let outbox_claimer = Arc::clone(&outbox_claimer);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { outbox_claimer.run(shutdown).await })
    };

    let observer_task = {
        let observer = Arc::clone(&observer);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { observer.run(shutdown).await })
    };

    let consumer_connection = lapin::Connection::connect(
        &config.rabbitmq_url,
        lapin::ConnectionProperties::default(),
    )
    .await
    .context("failed to connect to RabbitMQ for consuming")?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        job_executor as Arc<dyn dwop_queue::JobSubmitter>,
    ));
    let mut consumer_tasks = Vec::with_capacity(DEFAULT_CHANNEL_COUNT);
    for i in 0..DEFAULT_CHANNEL_COUNT {
        let channel = consumer_connection
            .create_channel()
            .await
            .context("failed to open consumer channel")?;
        let dispatcher = Arc::clone(&dispatcher);
        let consumer_tag = format!("dwop-dispatcher-{i}");
        consumer_tasks.push(tokio::spawn(async move {
            if let Err(e) = dispatcher.run(channel, QUEUE_NAME, &consumer_tag).await {
                tracing::error!(error = %e, consumer_tag, "dispatcher consumer exited");
            }
        }));
    }

    let app_state = http::AppState {
        store: Arc::clone(&store) as Arc<dyn WorkflowStore>,
        storage: Arc::clone(&storage),
        canceler: Arc::clone(&observer) as Arc<dyn dwop_queue::WorkflowCanceler>,
    };
    let app = http::router(app_state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "HTTP server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
        })
        .await
        .context("HTTP server error")?;

    tracing::info!("shutdown signal received; stopping background loops");
    shutdown.cancel();

    let _ = outbox_task.await;
    let _ = observer_task.await;
    for task in consumer_tasks {
        task.abort();
    }
    worker_pool.shutdown().await;

    tracing::info!("dwop-orchestrator stopped");
    Ok(())
}
