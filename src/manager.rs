use std::sync::Arc;

use kube::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::buffer::RingBuffer;
use crate::config::{Config, ConfigError};
use crate::exporter::{ExportError, Exporter};
use crate::processor::Processor;
use crate::watcher::{WatchError, Watcher, WatcherConfig, DEFAULT_SYNC_TIMEOUT};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline manager was not set up")]
    NotSetUp,
    #[error("watcher failed: {0}")]
    Watch(#[from] WatchError),
    #[error("exporter failed: {0}")]
    Export(#[from] ExportError),
}

struct Stages {
    watcher: Watcher,
    processor: Processor,
    exporter: Exporter,
}

/// Owns the three pipeline stages and the buffers between them.
///
/// `setup` wires everything; `run` drives the stages until the outer token
/// is cancelled or the first stage fails, then cancels the rest, waits for
/// every stage to terminate, and reports the failure (if any).
pub struct Manager {
    config: Config,
    client: Client,
    stages: Option<Stages>,
}

impl Manager {
    pub fn new(config: Config, client: Client) -> Self {
        Manager {
            config,
            client,
            stages: None,
        }
    }

    pub fn setup(&mut self) -> Result<(), SetupError> {
        let events = Arc::new(RingBuffer::new(self.config.buffer_size));
        let messages = Arc::new(RingBuffer::new(self.config.buffer_size));

        let watcher = Watcher::new(
            self.client.clone(),
            WatcherConfig {
                cluster_name: self.config.cluster_name.clone(),
                namespace: self.config.target_namespace(),
                max_event_age: self.config.max_event_age,
                sync_timeout: DEFAULT_SYNC_TIMEOUT,
            },
            events.clone(),
        );
        let processor = Processor::new(
            events,
            messages.clone(),
            self.config.compiled_filters()?,
            self.config.projector()?,
        );
        let exporter = Exporter::new(self.config.kafka.exporter_config(), messages)?;

        self.stages = Some(Stages {
            watcher,
            processor,
            exporter,
        });
        Ok(())
    }

    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let stages = self.stages.take().ok_or(PipelineError::NotSetUp)?;
        info!("starting pipeline");

        let inner = cancel.child_token();
        // One buffered slot is enough: only the first error decides the
        // outcome, and try_send keeps reporting non-blocking for the rest.
        let (err_tx, mut err_rx) = mpsc::channel::<PipelineError>(1);

        let mut tasks = JoinSet::new();
        {
            let token = inner.clone();
            let tx = err_tx.clone();
            tasks.spawn(async move {
                if let Err(err) = stages.watcher.run(token).await {
                    let _ = tx.try_send(err.into());
                }
            });
        }
        {
            let token = inner.clone();
            tasks.spawn(stages.processor.run(token));
        }
        {
            let token = inner.clone();
            let tx = err_tx.clone();
            tasks.spawn(async move {
                if let Err(err) = stages.exporter.run(token).await {
                    let _ = tx.try_send(err.into());
                }
            });
        }
        drop(err_tx);

        let mut failure = None;
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("shutdown requested, stopping pipeline");
            }
            Some(err) = err_rx.recv() => {
                error!(error = %err, "pipeline stage failed, stopping remaining stages");
                failure = Some(err);
            }
        }

        inner.cancel();
        while tasks.join_next().await.is_some() {}

        // A stage may have failed concurrently with the shutdown request;
        // surface that instead of pretending the stop was clean.
        if failure.is_none() {
            failure = err_rx.try_recv().ok();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
