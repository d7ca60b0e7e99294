//! Matcher service lifecycle
//!
//! Owns the shared [`ReferenceBuffer`], the [`IngestionLedger`] and the
//! collaborators, and runs one [`IngestionLoop`] task at a time. Buffer and
//! ledger outlive the task, so a stop/start pair keeps already-loaded
//! references and never re-matches a query that was handled or superseded.

use crate::buffer::ReferenceBuffer;
use crate::config::MatcherConfig;
use crate::ingest::{IngestionLedger, IngestionLoop};
use crate::storage::{ResultSink, WorkQueue};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background fingerprint matching service
pub struct MatcherService {
    config: MatcherConfig,
    queue: Arc<dyn WorkQueue>,
    sink: Arc<dyn ResultSink>,
    buffer: Arc<ReferenceBuffer>,
    ledger: Arc<Mutex<IngestionLedger>>,
    task: Mutex<Option<RunningTask>>,
}

impl MatcherService {
    pub fn new(config: MatcherConfig, queue: Arc<dyn WorkQueue>, sink: Arc<dyn ResultSink>) -> Self {
        let buffer = Arc::new(ReferenceBuffer::new(config.buffer_window()));
        Self::with_buffer(config, queue, sink, buffer)
    }

    /// Use an existing buffer (e.g. one driven by a manual clock in tests)
    pub fn with_buffer(
        config: MatcherConfig,
        queue: Arc<dyn WorkQueue>,
        sink: Arc<dyn ResultSink>,
        buffer: Arc<ReferenceBuffer>,
    ) -> Self {
        Self {
            config,
            queue,
            sink,
            buffer,
            ledger: IngestionLedger::shared(),
            task: Mutex::new(None),
        }
    }

    pub fn buffer(&self) -> &Arc<ReferenceBuffer> {
        &self.buffer
    }

    pub fn ledger(&self) -> &Arc<Mutex<IngestionLedger>> {
        &self.ledger
    }

    /// Spawn the ingestion loop; returns false if it is already running
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                warn!("Matcher service already running");
                return false;
            }
        }

        let token = CancellationToken::new();
        let ingestion = IngestionLoop::with_ledger(
            self.config.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.sink),
            Arc::clone(&self.buffer),
            Arc::clone(&self.ledger),
        );
        let handle = tokio::spawn(ingestion.run(token.clone()));
        *task = Some(RunningTask { token, handle });

        info!("Started fingerprint matcher");
        true
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Cancel the loop and wait for it, at most `shutdown_timeout_secs`.
    ///
    /// Returns false if nothing was running.
    pub async fn stop(&self) -> bool {
        let running = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(RunningTask { token, mut handle }) = running else {
            return false;
        };

        token.cancel();
        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("Stopped fingerprint matcher"),
            Ok(Err(e)) => warn!("Matcher task ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Matcher task did not stop within {}s, aborting",
                    timeout.as_secs()
                );
                handle.abort();
            }
        }
        true
    }
}
