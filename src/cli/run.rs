use crate::broker::{Broker, DuckDbBroker, EntryStatus};
use crate::config::load_or_default;
use crate::config::types::{Config, PipelineMode};
use crate::listener::UdpListener;
use crate::normalize::Normalizer;
use crate::notify::BroadcastNotifier;
use crate::pipeline::{
    run_forwarder, run_retention, stop_worker, BatchConsumer, DeadLetterWriter, FailedEntryHandler, FlushEngine,
    ForwarderSettings, GroupRunner, RetryHandler,
};
use crate::service::LogService;
use crate::storage::{DuckDbStorage, Storage};
use crate::web::run_server;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const NOTIFY_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("broker error: {0}")]
    Broker(#[from] crate::broker::BrokerError),

    #[error("listener error: {0}")]
    Listener(#[from] crate::listener::ListenerError),

    #[error("pattern error: {0}")]
    Pattern(#[from] crate::normalize::pattern::PatternError),
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    match &config_path {
        Some(path) => info!(config_path = %path.display(), "Loading configuration"),
        None => info!("No config file found, using built-in defaults"),
    }
    let config = load_or_default(config_path.as_deref())?;

    run_with_shutdown(config, async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Shutdown signal received");
    })
    .await
    .map_err(|e| e.into())
}

/// Start every worker for `config` and run until `shutdown` completes.
pub async fn run_with_shutdown<F>(config: Config, shutdown: F) -> Result<(), RunError>
where
    F: Future<Output = ()> + Send,
{
    let normalizer = Arc::new(Normalizer::from_config(&config.normalizer)?);

    info!(path = %config.storage.path.display(), "Initializing storage");
    let storage = Arc::new(DuckDbStorage::new(&config.storage.path)?);
    storage.init_schema().await?;

    let root = CancellationToken::new();
    let mut workers: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    let notifier = Arc::new(BroadcastNotifier::new(NOTIFY_CAPACITY));
    let service = Arc::new(LogService::new(storage.clone(), notifier));
    {
        let web_config = config.web.clone();
        let cancel = root.child_token();
        workers.push((
            "web",
            tokio::spawn(async move {
                if let Err(e) = run_server(service, web_config, cancel).await {
                    error!(error = %e, "Web server error");
                }
            }),
        ));
    }

    let listener = UdpListener::start(&config.listener, root.child_token()).await?;
    let dead_letter = DeadLetterWriter::new(&config.pipeline.dead_letter_dir);

    match config.pipeline.mode {
        PipelineMode::Brokered => {
            info!(path = %config.broker.path.display(), "Initializing broker");
            let broker = Arc::new(DuckDbBroker::new(&config.broker.path)?);
            broker.init_schema().await?;
            let broker: Arc<dyn Broker> = broker;

            let settings = ForwarderSettings {
                retry_delay: config.listener.retry_delay,
                trim_every: config.broker.trim_every,
                max_stream_length: config.broker.max_stream_length,
            };
            let forwarder = tokio::spawn(run_forwarder(
                listener.receiver(),
                broker.clone(),
                settings,
                root.child_token(),
            ));
            workers.push((
                "forwarder",
                tokio::spawn(async move {
                    if let Err(e) = forwarder.await {
                        error!(error = %e, "Forwarder task failed");
                    }
                }),
            ));

            let groups = &config.broker.groups;
            let raw = Arc::new(BatchConsumer::new(
                broker.clone(),
                storage.clone(),
                normalizer.clone(),
                groups.raw.clone(),
                &config.pipeline,
            ));
            workers.push(("raw-consumer", tokio::spawn(raw.run(root.child_token()))));

            let retry_handler = RetryHandler::new(
                broker.clone(),
                storage.clone(),
                normalizer.clone(),
                groups.retry.max_retries,
                config.pipeline.retry_backoff,
                config.pipeline.retry_backoff_max,
            );
            let retry = GroupRunner::new(
                broker.clone(),
                groups.retry.clone(),
                Arc::new(retry_handler),
                config.pipeline.read_error_delay,
            );
            workers.push((
                "retry-consumer",
                tokio::spawn(retry.run(vec![EntryStatus::Retry], root.child_token())),
            ));

            let failed = GroupRunner::new(
                broker.clone(),
                groups.failed.clone(),
                Arc::new(FailedEntryHandler::new(dead_letter)),
                config.pipeline.read_error_delay,
            );
            workers.push((
                "failed-consumer",
                tokio::spawn(failed.run(vec![EntryStatus::Failed], root.child_token())),
            ));
        }
        PipelineMode::Direct => {
            let engine = Arc::new(FlushEngine::new(storage.clone(), dead_letter, &config.pipeline));
            workers.push((
                "flush-engine",
                tokio::spawn(engine.run(listener.receiver(), normalizer.clone(), root.child_token())),
            ));
        }
    }

    if let Some(retention) = config.storage.retention {
        let storage: Arc<dyn Storage> = storage.clone();
        workers.push((
            "retention",
            tokio::spawn(run_retention(
                storage,
                retention,
                config.storage.retention_check_interval,
                root.child_token(),
            )),
        ));
    }

    info!(
        mode = ?config.pipeline.mode,
        udp = %listener.local_addr(),
        web = %config.web.listen,
        "Pipeline started, press Ctrl+C to shutdown"
    );

    shutdown.await;

    root.cancel();
    listener.stop().await;

    // A consumer may be mid-read when cancelled, so allow one block period on top
    let groups = &config.broker.groups;
    let longest_block = groups
        .raw
        .block_time
        .max(groups.retry.block_time)
        .max(groups.failed.block_time);
    let grace = config.pipeline.shutdown_grace + longest_block;

    info!("Waiting for pipeline tasks to complete");
    for (name, handle) in workers {
        stop_worker(name, handle, grace).await;
    }

    info!("Pipeline shutdown complete");
    Ok(())
}
