//! Session state for the generation controller.
//!
//! A [`Session`] is the unit of ownership: one caller drives it at a time,
//! and all mutable generation state lives here. The session owns its
//! collaborator capabilities (backend, vocabulary, sampler, optional media
//! encoder) exclusively, so releasing the session releases everything it
//! holds; there is no manual free step.
//!
//! The only cross-thread communication admitted is the interruption flag,
//! which other threads may set at any time and which the generation loop
//! polls between steps.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use saguaro_sampling::Sampler;
use uuid::Uuid;

use crate::backend::{InferenceBackend, MediaEncoder, TokenId, Vocabulary};
use crate::context::ContextWindow;
use crate::engine::CompletionParams;
use crate::error::{CoreError, Result};
use crate::multimodal::{tokenize_with_media, AlignmentState, TokenizedPrompt};
use crate::telemetry::{NoopTelemetry, TelemetryHook};

/// One generation session: token history, episode flags, and exclusively
/// owned collaborator capabilities.
///
/// Not thread-safe for concurrent mutation; the embedding application must
/// enforce single-owner access (e.g. one session per worker thread).
pub struct Session {
    /// Unique session id for tracking and logging.
    pub id: Uuid,

    pub(crate) backend: Box<dyn InferenceBackend>,
    pub(crate) vocab: Box<dyn Vocabulary>,
    pub(crate) sampler: Option<Box<dyn Sampler>>,
    pub(crate) media_encoder: Option<Box<dyn MediaEncoder>>,
    pub(crate) telemetry: Arc<dyn TelemetryHook>,

    pub(crate) window: ContextWindow,
    pub(crate) params: CompletionParams,
    pub(crate) alignment: AlignmentState,

    /// Raw generated bytes for the current episode. Kept as bytes because a
    /// token piece may end mid-codepoint; [`Session::generated_text`]
    /// renders it.
    pub(crate) generated: Vec<u8>,
    pub(crate) stopping_word: String,
    pub(crate) stop_pos: Option<usize>,

    pub(crate) guide_tokens: VecDeque<TokenId>,
    pub(crate) next_token_uses_guide: bool,

    pub(crate) n_remain: i32,
    pub(crate) num_prompt_tokens: usize,
    pub(crate) num_tokens_predicted: usize,

    pub(crate) has_next_token: bool,
    pub(crate) is_predicting: bool,
    pub(crate) truncated: bool,
    pub(crate) context_full: bool,
    pub(crate) stopped_eos: bool,
    pub(crate) stopped_word: bool,
    pub(crate) stopped_limit: bool,
    pub(crate) incomplete: bool,

    interrupt: Arc<AtomicBool>,
}

impl Session {
    /// Create a session over a loaded model's capabilities.
    ///
    /// `n_ctx` is the fixed KV-cache capacity the backend allocated for this
    /// session.
    pub fn new(
        backend: Box<dyn InferenceBackend>,
        vocab: Box<dyn Vocabulary>,
        n_ctx: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend,
            vocab,
            sampler: None,
            media_encoder: None,
            telemetry: Arc::new(NoopTelemetry),
            window: ContextWindow::new(n_ctx),
            params: CompletionParams::default(),
            alignment: AlignmentState::default(),
            generated: Vec::new(),
            stopping_word: String::new(),
            stop_pos: None,
            guide_tokens: VecDeque::new(),
            next_token_uses_guide: true,
            n_remain: 0,
            num_prompt_tokens: 0,
            num_tokens_predicted: 0,
            has_next_token: false,
            is_predicting: false,
            truncated: false,
            context_full: false,
            stopped_eos: false,
            stopped_word: false,
            stopped_limit: false,
            incomplete: false,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install (or replace) the sampler capability.
    pub fn set_sampler(&mut self, sampler: Box<dyn Sampler>) {
        self.sampler = Some(sampler);
    }

    /// Install the media encoder, enabling multimodal prompts.
    pub fn set_media_encoder(&mut self, encoder: Box<dyn MediaEncoder>) {
        self.media_encoder = Some(encoder);
    }

    /// Release the media encoder; subsequent media prompts fail.
    pub fn release_media_encoder(&mut self) {
        self.media_encoder = None;
    }

    /// Install a telemetry hook.
    pub fn set_telemetry(&mut self, hook: Arc<dyn TelemetryHook>) {
        self.telemetry = hook;
    }

    pub fn multimodal_enabled(&self) -> bool {
        self.media_encoder.is_some()
    }

    pub fn supports_vision(&self) -> bool {
        self.media_encoder.as_ref().is_some_and(|e| e.supports_vision())
    }

    pub fn supports_audio(&self) -> bool {
        self.media_encoder.as_ref().is_some_and(|e| e.supports_audio())
    }

    /// Clone of the interruption flag for another thread to control.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    /// Request that the in-flight generation stop at the next step boundary.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Acquire)
    }

    /// Whether a generation episode is currently in flight.
    pub fn is_predicting(&self) -> bool {
        self.is_predicting
    }

    /// Queue tokens to be forcibly injected in place of sampler output,
    /// consumed front-to-back.
    pub fn set_guide_tokens(&mut self, tokens: Vec<TokenId>) {
        self.guide_tokens = tokens.into();
    }

    /// Reset all episode-scoped state back to a fresh-episode state without
    /// reloading the model. Token history and cache bookkeeping are cleared;
    /// the next prompt starts from position zero.
    pub fn rewind(&mut self) {
        self.interrupt.store(false, Ordering::Release);
        self.is_predicting = false;
        self.params = CompletionParams::default();
        self.num_prompt_tokens = 0;
        self.num_tokens_predicted = 0;
        self.generated.clear();
        self.stopping_word.clear();
        self.stop_pos = None;
        self.truncated = false;
        self.context_full = false;
        self.stopped_eos = false;
        self.stopped_word = false;
        self.stopped_limit = false;
        self.incomplete = false;
        self.has_next_token = false;
        self.n_remain = 0;
        self.window.reset();
        // The next episode decodes from position 0; cache entries from the
        // previous conversation must not shadow it.
        self.backend.remove_range(0, None);
        self.next_token_uses_guide = true;
        self.guide_tokens.clear();
        self.alignment.clear();
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.reset();
        }
    }

    /// Inspect how a (text, media) prompt would tokenize, without touching
    /// session state.
    pub fn tokenize(&mut self, text: &str, media: &[String]) -> Result<TokenizedPrompt> {
        if media.is_empty() {
            return Ok(TokenizedPrompt {
                tokens: self.vocab.tokenize(text, false),
                ..Default::default()
            });
        }
        let encoder = self.media_encoder.as_mut().ok_or_else(|| {
            CoreError::UnsupportedMedia("media supplied but multimodal is not enabled".into())
        })?;
        tokenize_with_media(self.vocab.as_ref(), encoder.as_mut(), text, media)
    }

    /// Decoded text accumulated in the current episode. Any trailing
    /// incomplete codepoint (possible only after an abnormal end) is
    /// replacement-rendered.
    pub fn generated_text(&self) -> String {
        String::from_utf8_lossy(&self.generated).into_owned()
    }

    pub fn window(&self) -> &ContextWindow {
        &self.window
    }

    pub fn tokens(&self) -> &[TokenId] {
        self.window.tokens()
    }

    pub fn n_past(&self) -> usize {
        self.window.n_past()
    }

    pub fn has_next_token(&self) -> bool {
        self.has_next_token
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn context_full(&self) -> bool {
        self.context_full
    }

    pub fn stopped_eos(&self) -> bool {
        self.stopped_eos
    }

    pub fn stopped_word(&self) -> bool {
        self.stopped_word
    }

    pub fn stopped_limit(&self) -> bool {
        self.stopped_limit
    }

    pub fn stopping_word(&self) -> &str {
        &self.stopping_word
    }

    pub fn incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn num_tokens_predicted(&self) -> usize {
        self.num_tokens_predicted
    }
}
