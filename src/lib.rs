//! Saguaro: an autoregressive generation controller for on-device LLM
//! inference.
//!
//! This crate owns the glue between a decode-capable inference backend and
//! an application that wants text out: context-window bookkeeping (middle
//! truncation, sliding-window shifts), the per-token generation loop (guide
//! tokens, stop strings, partial-codepoint handling), and multimodal prompt
//! alignment for KV-cache reuse across turns.
//!
//! The backend itself is abstract: anything implementing the capability
//! traits in [`backend`] can be driven. A typical embedding looks like:
//!
//! ```ignore
//! let mut session = Session::new(backend, vocab, n_ctx);
//! session.set_sampler(Box::new(SoftmaxSampler::new(SamplerConfig::default())));
//! let result = session.complete("Hello", &[], CompletionParams::default(), |text| {
//!     print!("{text}");
//!     true
//! })?;
//! ```

pub mod backend;
pub mod context;
pub mod engine;
pub mod error;
pub mod multimodal;
pub mod session;
pub mod stop;
pub mod telemetry;

pub use backend::{
    InferenceBackend, MediaEncoder, MediaEncoding, TokenId, Vocabulary, MEDIA_PLACEHOLDER,
};
pub use context::ContextWindow;
pub use engine::actor::{ActorCommand, ActorEvent, ActorHandle};
pub use engine::{CompletionParams, CompletionResult, StepOutcome, StopReason, TokenOutput};
pub use error::{CoreError, Result};
pub use multimodal::{TokenizedPrompt, DEFAULT_MEDIA_MARKER};
pub use session::Session;
pub use telemetry::{InferenceMetrics, LogTelemetry, NoopTelemetry, TelemetryHook};

pub use saguaro_sampling::{
    SampledToken, Sampler, SamplerConfig, SamplingError, SamplingResult, SoftmaxSampler, TokenProb,
};

/// Crate version, for embedding applications that report it.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
