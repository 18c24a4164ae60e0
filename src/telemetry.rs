//! Telemetry hooks for generation performance and state transitions.
//!
//! There is no process-global logger in this crate: observability is an
//! explicit capability handed to the session. Provides:
//! - [`InferenceMetrics`] — TTFT, tokens/sec, and generation summary
//! - [`TelemetryHook`] trait — callback interface for real-time reporting
//! - [`NoopTelemetry`] / [`LogTelemetry`] — built-in hook implementations

use std::sync::{Arc, Mutex};

/// Aggregate metrics from one generation episode.
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Time to first token in milliseconds (prompt ingestion latency).
    pub ttft_ms: f64,
    /// Tokens generated per second (decode throughput, excludes prefill).
    pub tokens_per_sec: f64,
    /// Number of prompt tokens processed during prefill.
    pub prompt_tokens: usize,
    /// Number of tokens generated during decode.
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds (prefill + decode).
    pub total_time_ms: f64,
}

/// Callback trait for real-time generation telemetry.
///
/// Implementations receive events at key points of an episode. All methods
/// have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after the prompt is ingested and the first token is ready.
    fn on_prefill_complete(&self, _ttft_ms: f64) {}

    /// Called after each decode step produces a token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when the prompt is middle-truncated to fit the context window.
    fn on_prompt_truncated(&self, _old_len: usize, _new_len: usize) {}

    /// Called after a mid-generation sliding-window shift.
    fn on_window_shift(&self, _n_discard: usize, _new_n_past: usize) {}

    /// Called when generation finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &InferenceMetrics) {}
}

/// No-op telemetry hook for when metrics aren't needed.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Collecting telemetry hook: retains the last completed episode's metrics
/// and counts window shifts, for retrieval by the embedding application.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<InferenceMetrics>>>,
    shift_count: Arc<Mutex<usize>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the last completed episode's metrics.
    pub fn last_metrics(&self) -> Option<InferenceMetrics> {
        self.last_report.lock().unwrap().clone()
    }

    /// Number of window shifts observed since creation.
    pub fn window_shifts(&self) -> usize {
        *self.shift_count.lock().unwrap()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_window_shift(&self, _n_discard: usize, _new_n_past: usize) {
        *self.shift_count.lock().unwrap() += 1;
    }

    fn on_generation_complete(&self, metrics: &InferenceMetrics) {
        *self.last_report.lock().unwrap() = Some(metrics.clone());
    }
}
