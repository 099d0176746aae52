//! Usage: Per-request attempt outcomes and their buffered hand-off to the logging collaborator.

use crate::format::canonical::Usage;
use crate::format::WireFormat;
use crate::router::CandidateFailure;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub const DEFAULT_OUTCOME_BUFFER_CAPACITY: usize = 512;

/// One record per routed request, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptOutcome {
    pub trace_id: String,
    pub requested_model: String,
    pub inbound_format: WireFormat,
    pub provider: Option<String>,
    pub backend_model: Option<String>,
    pub success: bool,
    pub status: u16,
    pub error_code: Option<&'static str>,
    pub latency_ms: u64,
    /// Time to first byte relayed to the caller; streams only.
    pub ttfb_ms: Option<u64>,
    pub usage: Option<Usage>,
    pub failures: Vec<CandidateFailure>,
    pub created_at_ms: u64,
}

/// Write-only destination for outcomes; called concurrently from request tasks.
pub trait OutcomeSink: Send + Sync + 'static {
    fn record(&self, outcome: AttemptOutcome);
}

/// Default sink: one structured `tracing` event per outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingOutcomeSink;

impl OutcomeSink for TracingOutcomeSink {
    fn record(&self, outcome: AttemptOutcome) {
        let usage = outcome.usage.unwrap_or_default();
        if outcome.success {
            tracing::info!(
                trace_id = %outcome.trace_id,
                model = %outcome.requested_model,
                inbound = outcome.inbound_format.as_str(),
                provider = outcome.provider.as_deref().unwrap_or(""),
                backend_model = outcome.backend_model.as_deref().unwrap_or(""),
                status = outcome.status,
                latency_ms = outcome.latency_ms,
                ttfb_ms = outcome.ttfb_ms,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                failed_candidates = outcome.failures.len(),
                "request completed"
            );
        } else {
            tracing::warn!(
                trace_id = %outcome.trace_id,
                model = %outcome.requested_model,
                inbound = outcome.inbound_format.as_str(),
                provider = outcome.provider.as_deref().unwrap_or(""),
                status = outcome.status,
                error_code = outcome.error_code.unwrap_or(""),
                latency_ms = outcome.latency_ms,
                failed_candidates = outcome.failures.len(),
                "request failed"
            );
        }
    }
}

/// Producer side of the buffered writer; cheap to clone into every request.
#[derive(Debug, Clone)]
pub struct OutcomeSender {
    tx: mpsc::Sender<AttemptOutcome>,
}

impl OutcomeSender {
    /// Never waits: a full buffer hands the send to a background task.
    pub fn enqueue(&self, outcome: AttemptOutcome) {
        match self.tx.try_send(outcome) {
            Ok(()) => {}
            Err(TrySendError::Full(outcome)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = tx.send(outcome).await {
                        tracing::warn!(
                            trace_id = %err.0.trace_id,
                            "outcome writer stopped; outcome dropped"
                        );
                    }
                });
            }
            Err(TrySendError::Closed(outcome)) => {
                tracing::warn!(
                    trace_id = %outcome.trace_id,
                    "outcome writer stopped; outcome dropped"
                );
            }
        }
    }
}

/// Spawns the writer task; it drains until every sender is dropped.
pub fn start_buffered_writer(
    sink: Arc<dyn OutcomeSink>,
    capacity: usize,
) -> (OutcomeSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<AttemptOutcome>(capacity.max(1));
    let task = tokio::spawn(async move {
        while let Some(outcome) = rx.recv().await {
            sink.record(outcome);
        }
        tracing::debug!("outcome writer drained");
    });
    (OutcomeSender { tx }, task)
}
