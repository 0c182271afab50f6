//! Background scan worker.
//! Scans run on tokio's blocking pool so the engine wait never stalls the caller.
//! The request queue holds one pending scan: submitting while one is already
//! pending coalesces into it instead of piling up.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::ImageSource;
use crate::pipeline::{Pipeline, StatusSink};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submitted {
    /// A new scan will run
    Queued,
    /// A scan was already pending; this request folds into it
    Coalesced,
    /// The worker has stopped
    Closed,
}

pub struct AnalysisWorker {
    requests: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl AnalysisWorker {
    /// Starts the worker loop on the current tokio runtime.
    pub fn spawn(
        pipeline: Arc<Pipeline>,
        source: Arc<dyn ImageSource>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        let (requests, mut rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(async move {
            let mut completed = 0u64;
            while rx.recv().await.is_some() {
                let pipeline = Arc::clone(&pipeline);
                let source = Arc::clone(&source);
                let sink = Arc::clone(&sink);
                let outcome =
                    tokio::task::spawn_blocking(move || pipeline.scan(source.as_ref(), sink.as_ref()))
                        .await;
                match outcome {
                    Ok(Ok(report)) => {
                        completed += 1;
                        debug!(completed, best_move = ?report.analysis.best_move_text(), "Scan finished");
                    }
                    Ok(Err(e)) if e.is_recoverable() => debug!(error = %e, "Scan gave no result"),
                    Ok(Err(e)) => warn!(error = %e, "Scan failed"),
                    Err(e) => warn!(error = %e, "Scan task panicked"),
                }
            }
            info!(completed, "Analysis worker stopped");
        });
        Self { requests, handle }
    }

    /// Requests a scan without waiting for it.
    pub fn submit(&self) -> Submitted {
        match self.requests.try_send(()) {
            Ok(()) => Submitted::Queued,
            Err(TrySendError::Full(())) => Submitted::Coalesced,
            Err(TrySendError::Closed(())) => Submitted::Closed,
        }
    }

    /// Stops accepting scans and waits for the pending one (if any) to finish.
    pub async fn shutdown(self) {
        drop(self.requests);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Analysis worker ended abnormally");
        }
    }
}
