//! The generation engine: prompt ingestion and the per-token decode loop.
//!
//! Everything here is written against the capability traits in
//! [`crate::backend`]; no inference library types leak through. The flow for
//! one episode is:
//!
//! 1. [`Session::begin_completion`] — arm the episode (params, counters)
//! 2. [`Session::load_prompt`] — tokenize, align/truncate, mark pending
//! 3. [`Session::step`] in a loop, or [`Session::run`] to drive the loop
//!    with a streaming callback
//!
//! Prompt evaluation is lazy: `load_prompt` leaves unevaluated tokens in the
//! window and the first `step` decodes them in batch-limited chunks before
//! sampling. Interruptions are honored between decode batches, so a long
//! prefill can be abandoned promptly.

pub mod actor;

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backend::{TokenId, MEDIA_PLACEHOLDER};
use crate::error::{CoreError, Result};
use crate::multimodal::{align, tokenize_with_media, Chunk};
use crate::session::Session;
use crate::stop::{find_stopping_strings, StopMode};
use crate::telemetry::InferenceMetrics;
use saguaro_sampling::TokenProb;

/// Per-episode generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionParams {
    /// Maximum number of tokens to generate; `-1` means unbounded.
    pub n_predict: i32,
    /// Protected prompt prefix length; `-1` means the whole prompt.
    pub n_keep: i32,
    /// Stop strings checked against the generated text after every token.
    pub antiprompt: Vec<String>,
    /// When set, guide-token injection pauses after each injected token and
    /// re-arms only when this token is injected (e.g. a newline separator in
    /// line-structured output). `None` keeps injection armed continuously.
    pub guide_rearm_token: Option<TokenId>,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            n_predict: -1,
            n_keep: 0,
            antiprompt: Vec::new(),
            guide_rearm_token: None,
        }
    }
}

/// Why a generation episode ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The model emitted its end-of-sequence token.
    Eos,
    /// A configured stop string appeared in the output.
    StopWord(String),
    /// The `n_predict` budget ran out.
    Limit,
    /// The interruption flag was raised.
    Interrupted,
}

/// One token produced by a generation step.
#[derive(Debug, Clone)]
pub struct TokenOutput {
    pub id: TokenId,
    /// Raw piece bytes; may end mid-codepoint.
    pub piece: Vec<u8>,
    /// Top-probability alternatives, when the sampler reports them.
    pub probs: Vec<TokenProb>,
}

/// Outcome of a single [`Session::step`].
#[derive(Debug)]
pub enum StepOutcome {
    /// A token was produced and the episode continues.
    Token(TokenOutput),
    /// A token was produced and it ended the episode.
    Final(TokenOutput, StopReason),
    /// The episode ended without producing a token.
    Done(StopReason),
}

/// Summary of a completed (or aborted) generation episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Full generated text, including any matched stop string.
    pub text: String,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub truncated: bool,
    pub context_full: bool,
    pub stopped_eos: bool,
    pub stopped_word: bool,
    pub stopped_limit: bool,
    /// The matched stop string, empty when none matched.
    pub stopping_word: String,
    pub stop_reason: StopReason,
    pub generation_time_ms: f64,
}

impl Session {
    /// Arm a new generation episode.
    ///
    /// Fails with [`CoreError::SamplerUnavailable`] when no sampler is
    /// installed. Does not touch the token history; call after
    /// [`Session::rewind`] for a fresh context, or directly to continue a
    /// conversation over the existing cache.
    pub fn begin_completion(&mut self, params: CompletionParams) -> Result<()> {
        let sampler = self
            .sampler
            .as_mut()
            .ok_or(CoreError::SamplerUnavailable)?;
        sampler.reset();

        self.params = params;
        self.n_remain = self.params.n_predict;
        self.is_predicting = true;
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
        self.next_token_uses_guide = true;
        Ok(())
    }

    /// Tokenize the prompt and merge it into the context window.
    ///
    /// With media items present, routes through multimodal alignment; the
    /// session is left unchanged when that path fails before cache commit.
    pub fn load_prompt(&mut self, prompt: &str, media: &[String]) -> Result<()> {
        if !self.is_predicting {
            return Err(CoreError::InvalidSession(
                "no active episode; call begin_completion first".into(),
            ));
        }
        if media.is_empty() {
            self.load_text_prompt(prompt)
        } else {
            self.load_media_prompt(prompt, media)
        }
    }

    fn load_text_prompt(&mut self, prompt: &str) -> Result<()> {
        // A non-empty window means this prompt continues an earlier turn:
        // keep the evaluated prefix and skip the BOS-style special tokens.
        let continuation = !self.window.is_empty();
        let new_tokens = self.vocab.tokenize(prompt, !continuation);
        self.window.append_prompt(&new_tokens, continuation);
        self.num_prompt_tokens = self.window.len();
        self.window
            .resolve_n_keep(self.params.n_keep, self.num_prompt_tokens);

        if self.window.is_full() {
            let old_len = self.window.len();
            match self.window.truncate_middle() {
                Ok(()) => {
                    self.truncated = true;
                    // Cache entries past the surviving prefix are stale.
                    self.backend.remove_range(self.window.n_past(), None);
                    self.num_prompt_tokens = self.window.len();
                    self.telemetry.on_prompt_truncated(old_len, self.window.len());
                }
                Err(CoreError::ContextFull) => {
                    self.context_full = true;
                    return Err(CoreError::ContextFull);
                }
                Err(e) => return Err(e),
            }
        }

        let sampler = self
            .sampler
            .as_mut()
            .ok_or(CoreError::SamplerUnavailable)?;
        if continuation {
            for &t in &new_tokens {
                sampler.accept(t, false);
            }
        } else {
            for &t in self.window.tokens() {
                sampler.accept(t, false);
            }
        }

        self.has_next_token = true;
        Ok(())
    }

    fn load_media_prompt(&mut self, prompt: &str, media: &[String]) -> Result<()> {
        let encoder = self.media_encoder.as_mut().ok_or_else(|| {
            CoreError::UnsupportedMedia("media supplied but multimodal is not enabled".into())
        })?;

        let tokenized = tokenize_with_media(self.vocab.as_ref(), encoder.as_mut(), prompt, media)?;
        if tokenized.tokens.len() >= self.window.n_ctx() {
            // Multimodal prompts cannot be middle-truncated: token deletion
            // would desynchronize the media position tables.
            self.context_full = true;
            return Err(CoreError::ContextFull);
        }

        let mut n_past = align(
            self.window.tokens(),
            &tokenized,
            &self.alignment.past_bitmap_hashes,
        );
        let aligned = n_past;
        self.backend.remove_range(aligned, None);

        let batch_limit = self.backend.batch_limit().max(1);
        for chunk in &tokenized.chunks {
            if chunk.offset() < aligned {
                continue;
            }
            match chunk {
                Chunk::Text { offset, tokens } => {
                    let mut pos = *offset;
                    for piece in tokens.chunks(batch_limit) {
                        self.backend.decode(piece, pos)?;
                        pos += piece.len();
                    }
                    n_past = pos;
                }
                Chunk::Media(mc) => {
                    n_past = encoder.eval_chunk(mc, n_past)?;
                }
            }
        }

        // When the whole prompt was reused or evaluated exactly, step one
        // position back so the next decode re-evaluates the last real token
        // and produces fresh logits. Media positions cannot be re-decoded.
        if n_past == tokenized.tokens.len()
            && n_past > 0
            && tokenized.tokens[n_past - 1] != MEDIA_PLACEHOLDER
        {
            n_past -= 1;
        }

        let sampler = self
            .sampler
            .as_mut()
            .ok_or(CoreError::SamplerUnavailable)?;
        for &t in &tokenized.tokens {
            if t != MEDIA_PLACEHOLDER {
                sampler.accept(t, false);
            }
        }

        self.num_prompt_tokens = tokenized.tokens.len();
        self.window.replace(tokenized.tokens.clone(), n_past);
        self.window
            .resolve_n_keep(self.params.n_keep, self.num_prompt_tokens);
        self.alignment.commit(&tokenized);
        self.has_next_token = true;
        Ok(())
    }

    /// Evaluate pending tokens and sample the next one.
    ///
    /// Returns `Ok(None)` when an interruption landed mid-prefill (the
    /// unevaluated tail is dropped so the window stays consistent).
    fn next_token(&mut self) -> Result<Option<TokenOutput>> {
        if self.window.is_full() {
            match self.window.shift(self.backend.as_mut()) {
                Ok(n_discard) => {
                    self.truncated = true;
                    self.telemetry.on_window_shift(n_discard, self.window.n_past());
                }
                Err(CoreError::ContextFull) => {
                    self.context_full = true;
                    self.has_next_token = false;
                    return Err(CoreError::ContextFull);
                }
                Err(e) => return Err(e),
            }
        }

        // Decode whatever is pending. During steady-state generation that is
        // exactly one token; after a prompt load it is the whole prefill.
        let batch_limit = self.backend.batch_limit().max(1);
        let mut single_token_step = true;
        while self.window.n_past() < self.window.len() {
            let pending = self.window.pending();
            let n_eval = pending.len().min(batch_limit);
            single_token_step = pending.len() == 1;
            if let Err(e) = self.backend.decode(&pending[..n_eval], self.window.n_past()) {
                self.has_next_token = false;
                return Err(e);
            }
            self.window.advance_n_past(n_eval);

            if self.is_interrupted() {
                self.window.truncate_to_n_past();
                self.has_next_token = false;
                return Ok(None);
            }
        }

        // Prefill-only episode: report EOS without consuming budget.
        if self.params.n_predict == 0 {
            self.has_next_token = false;
            return Ok(Some(TokenOutput {
                id: self.vocab.eos(),
                piece: Vec::new(),
                probs: Vec::new(),
            }));
        }

        let logits = self.backend.last_logits();
        let sampler = self
            .sampler
            .as_mut()
            .ok_or(CoreError::SamplerUnavailable)?;
        let sampled = sampler.sample(logits)?;
        let mut token_id = sampled.id;

        // Guide tokens override the sampler unless the model is trying to
        // end or structure the sequence itself.
        if self.next_token_uses_guide
            && !self.vocab.is_control(token_id)
            && !self.vocab.is_end_of_generation(token_id)
        {
            if let Some(guide) = self.guide_tokens.pop_front() {
                token_id = guide;
            }
        }
        self.next_token_uses_guide = match self.params.guide_rearm_token {
            Some(rearm) => token_id == rearm,
            None => true,
        };

        if let Some(sampler) = self.sampler.as_mut() {
            sampler.accept(token_id, true);
        }
        if single_token_step {
            self.num_tokens_predicted += 1;
        }
        self.window.push(token_id);
        if self.n_remain > 0 {
            self.n_remain -= 1;
        }

        let piece = self.vocab.token_to_piece(token_id);
        let output = TokenOutput {
            id: token_id,
            piece,
            probs: sampled.probs,
        };

        if token_id == self.vocab.eos() || self.vocab.is_end_of_generation(token_id) {
            self.stopped_eos = true;
            self.has_next_token = false;
            return Ok(Some(output));
        }

        self.has_next_token = self.params.n_predict == -1 || self.n_remain > 0;
        Ok(Some(output))
    }

    /// Advance generation by one token, applying stop conditions and the
    /// partial-codepoint extension rule.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.is_interrupted() {
            self.has_next_token = false;
            return Ok(StepOutcome::Done(StopReason::Interrupted));
        }

        let output = match self.next_token() {
            Ok(Some(output)) => output,
            Ok(None) => return Ok(StepOutcome::Done(StopReason::Interrupted)),
            Err(e) => return Err(e),
        };

        self.generated.extend_from_slice(&output.piece);
        self.incomplete = ends_mid_codepoint(&self.generated);

        if !self.generated.is_empty() && !self.params.antiprompt.is_empty() {
            let matched = find_stopping_strings(
                &self.generated,
                output.piece.len(),
                &self.params.antiprompt,
                StopMode::Full,
            );
            if let Some(m) = matched {
                self.stopped_word = true;
                self.stopping_word = self.params.antiprompt[m.word].clone();
                self.stop_pos = Some(m.pos);
                self.has_next_token = false;
            }
        }

        // Never end an episode on a dangling partial codepoint: extend by
        // one token (refunding budget when bounded) until it completes.
        if self.incomplete && !self.has_next_token {
            self.has_next_token = true;
            if self.params.n_predict != -1 {
                self.n_remain += 1;
            }
        }

        if !self.has_next_token
            && self.n_remain == 0
            && self.params.n_predict != -1
            && !self.stopped_eos
            && !self.stopped_word
        {
            self.stopped_limit = true;
        }

        if self.has_next_token {
            Ok(StepOutcome::Token(output))
        } else {
            Ok(StepOutcome::Final(output, self.stop_reason()))
        }
    }

    fn stop_reason(&self) -> StopReason {
        if self.stopped_word {
            StopReason::StopWord(self.stopping_word.clone())
        } else if self.stopped_eos {
            StopReason::Eos
        } else if self.is_interrupted() {
            StopReason::Interrupted
        } else {
            StopReason::Limit
        }
    }

    /// Drive the step loop to completion, streaming text to `on_token`.
    ///
    /// The callback receives complete-UTF-8 text fragments with stop strings
    /// (full or still-ambiguous partial suffixes) withheld; returning `false`
    /// interrupts generation. The returned result's `text` is the full
    /// episode text, including any matched stop string.
    pub fn run<F>(&mut self, mut on_token: F) -> Result<CompletionResult>
    where
        F: FnMut(&str) -> bool,
    {
        if !self.is_predicting {
            return Err(CoreError::InvalidSession(
                "no active episode; call begin_completion first".into(),
            ));
        }
        let started = Instant::now();
        let mut first_token_at: Option<Instant> = None;
        let mut sent = 0usize;
        let mut reason: Option<StopReason> = None;

        while self.has_next_token && !self.is_interrupted() {
            let outcome = match self.step() {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.is_predicting = false;
                    return Err(e);
                }
            };

            let (produced, done) = match outcome {
                StepOutcome::Token(t) => (Some(t), None),
                StepOutcome::Final(t, r) => (Some(t), Some(r)),
                StepOutcome::Done(r) => (None, Some(r)),
            };

            if produced.is_some() {
                let now = Instant::now();
                if first_token_at.is_none() {
                    first_token_at = Some(now);
                    self.telemetry
                        .on_prefill_complete(ms_between(started, now));
                }
                self.telemetry
                    .on_token_generated(self.num_tokens_predicted, ms_between(started, now));
            }

            let target = self.stream_target(sent);
            if target > sent {
                if let Ok(text) = std::str::from_utf8(&self.generated[sent..target]) {
                    sent = target;
                    if !text.is_empty() && !on_token(text) {
                        self.interrupt();
                    }
                }
            }

            if let Some(r) = done {
                reason = Some(r);
                break;
            }
        }

        if self.is_interrupted() {
            self.has_next_token = false;
        }
        let reason = reason.unwrap_or_else(|| self.stop_reason());

        // Final flush: everything up to the stop string (or the last complete
        // codepoint) that the partial-stop holdback kept back.
        let end = match self.stop_pos {
            Some(pos) => pos,
            None => complete_prefix_len(&self.generated, self.generated.len()),
        };
        if end > sent {
            if let Ok(text) = std::str::from_utf8(&self.generated[sent..end]) {
                if !text.is_empty() {
                    on_token(text);
                }
            }
        }

        self.is_predicting = false;

        let total_ms = ms_between(started, Instant::now());
        let ttft_ms = first_token_at.map_or(total_ms, |t| ms_between(started, t));
        let decode_secs = ((total_ms - ttft_ms) / 1000.0).max(0.0);
        let tokens_per_sec = if decode_secs > 0.0 {
            self.num_tokens_predicted as f64 / decode_secs
        } else {
            0.0
        };
        self.telemetry.on_generation_complete(&InferenceMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.num_prompt_tokens,
            generated_tokens: self.num_tokens_predicted,
            total_time_ms: total_ms,
        });

        Ok(CompletionResult {
            text: self.generated_text(),
            tokens_predicted: self.num_tokens_predicted,
            tokens_evaluated: self.num_prompt_tokens,
            truncated: self.truncated,
            context_full: self.context_full,
            stopped_eos: self.stopped_eos,
            stopped_word: self.stopped_word,
            stopped_limit: self.stopped_limit,
            stopping_word: self.stopping_word.clone(),
            stop_reason: reason,
            generation_time_ms: total_ms,
        })
    }

    /// One-call episode: arm, load, and run with a streaming callback.
    pub fn complete<F>(
        &mut self,
        prompt: &str,
        media: &[String],
        params: CompletionParams,
        on_token: F,
    ) -> Result<CompletionResult>
    where
        F: FnMut(&str) -> bool,
    {
        self.begin_completion(params)?;
        if let Err(e) = self.load_prompt(prompt, media) {
            self.is_predicting = false;
            return Err(e);
        }
        self.run(on_token)
    }

    /// How far the generated buffer can be streamed right now: holds back a
    /// matched stop string, a trailing ambiguous stop prefix, and any
    /// incomplete trailing codepoint.
    fn stream_target(&self, sent: usize) -> usize {
        let mut end = self.generated.len();
        if let Some(pos) = self.stop_pos {
            end = end.min(pos);
        } else if !self.params.antiprompt.is_empty() {
            let partial = find_stopping_strings(
                &self.generated,
                0,
                &self.params.antiprompt,
                StopMode::Partial,
            );
            if let Some(m) = partial {
                end = end.min(m.pos);
            }
        }
        complete_prefix_len(&self.generated, end).max(sent)
    }
}

/// Whether the buffer ends inside a multi-byte UTF-8 sequence.
///
/// Looks back at most three bytes for the lead byte of a trailing
/// continuation run, or classifies a trailing lead byte directly.
pub(crate) fn ends_mid_codepoint(bytes: &[u8]) -> bool {
    let Some(&last) = bytes.last() else {
        return false;
    };

    if last & 0xC0 == 0x80 {
        // Trailing continuation byte: find its lead.
        let mut lookback = 1;
        while lookback < 4 && lookback < bytes.len() {
            let prev = bytes[bytes.len() - 1 - lookback];
            if prev & 0xC0 == 0xC0 {
                let expected = match prev {
                    b if b & 0xE0 == 0xC0 => 1,
                    b if b & 0xF0 == 0xE0 => 2,
                    b if b & 0xF8 == 0xF0 => 3,
                    _ => 0,
                };
                return lookback < expected;
            }
            if prev & 0x80 == 0 {
                return false;
            }
            lookback += 1;
        }
        false
    } else {
        last & 0xE0 == 0xC0 || last & 0xF0 == 0xE0 || last & 0xF8 == 0xF0
    }
}

/// Largest `b <= end` such that `bytes[..b]` does not split a codepoint.
fn complete_prefix_len(bytes: &[u8], mut end: usize) -> usize {
    end = end.min(bytes.len());
    // Don't cut in front of a continuation byte.
    while end > 0 && end < bytes.len() && bytes[end] & 0xC0 == 0x80 {
        end -= 1;
    }
    // Drop a trailing incomplete sequence.
    let mut i = end;
    while i > 0 && bytes[i - 1] & 0xC0 == 0x80 {
        i -= 1;
    }
    if i > 0 {
        let lead = bytes[i - 1];
        let need = match lead {
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 0,
        };
        if need > 0 && end - (i - 1) < need {
            return i - 1;
        }
    }
    end
}

fn ms_between(start: Instant, end: Instant) -> f64 {
    end.duration_since(start).as_secs_f64() * 1000.0
}
