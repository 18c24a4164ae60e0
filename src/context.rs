//! Context-window management: the token history buffer and its relationship
//! to the backend KV cache.
//!
//! [`ContextWindow`] owns the ordered token history (`tokens`), the count of
//! leading tokens whose cache entries are valid (`n_past`), the protected
//! prefix length (`n_keep`), and the fixed cache capacity (`n_ctx`).
//!
//! # Invariants
//! - `n_past <= tokens.len()` at all times
//! - `tokens.len() < n_ctx` is restored before decoding, via middle
//!   truncation before the first decode or a sliding-window shift
//!   mid-generation
//! - tokens below `n_keep` are never evicted

use crate::backend::{InferenceBackend, TokenId};
use crate::error::{CoreError, Result};

/// Token buffer plus valid-cache-length bookkeeping for one session.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    tokens: Vec<TokenId>,
    n_past: usize,
    n_keep: usize,
    n_ctx: usize,
}

impl ContextWindow {
    pub fn new(n_ctx: usize) -> Self {
        Self {
            tokens: Vec::new(),
            n_past: 0,
            n_keep: 0,
            n_ctx,
        }
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn n_keep(&self) -> usize {
        self.n_keep
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Whether growth has reached capacity and decoding must not proceed
    /// before truncation or a shift.
    pub fn is_full(&self) -> bool {
        self.tokens.len() >= self.n_ctx
    }

    /// Tokens not yet evaluated by the backend.
    pub fn pending(&self) -> &[TokenId] {
        &self.tokens[self.n_past..]
    }

    /// Reset to a fresh-episode state. Capacity and `n_keep` policy inputs
    /// are caller-scoped and re-resolved on the next prompt load.
    pub fn reset(&mut self) {
        self.tokens.clear();
        self.n_past = 0;
        self.n_keep = 0;
    }

    pub fn push(&mut self, token: TokenId) {
        self.tokens.push(token);
    }

    pub fn set_n_past(&mut self, n_past: usize) {
        debug_assert!(n_past <= self.tokens.len());
        self.n_past = n_past;
    }

    pub fn advance_n_past(&mut self, n: usize) {
        self.n_past += n;
        debug_assert!(self.n_past <= self.tokens.len());
    }

    /// Drop tokens beyond the evaluated point (used when an interruption
    /// lands mid-prefill and the tail was never decoded).
    pub fn truncate_to_n_past(&mut self) {
        self.tokens.truncate(self.n_past);
    }

    /// Replace the whole history with an already-aligned token stream.
    pub fn replace(&mut self, tokens: Vec<TokenId>, n_past: usize) {
        debug_assert!(n_past <= tokens.len());
        self.tokens = tokens;
        self.n_past = n_past;
    }

    /// Merge a new prompt into the history. A fresh episode replaces the
    /// buffer and resets `n_past`; a continuation appends without touching
    /// already-valid cache entries.
    pub fn append_prompt(&mut self, new_tokens: &[TokenId], continuation: bool) {
        if continuation {
            self.tokens.extend_from_slice(new_tokens);
        } else {
            self.tokens = new_tokens.to_vec();
            self.n_past = 0;
        }
    }

    /// Resolve the protected prefix length for this episode.
    ///
    /// A negative request means "keep the whole prompt". The result is
    /// clamped to `n_ctx - 4` (0 for tiny contexts) so a shift always has
    /// room to discard something.
    pub fn resolve_n_keep(&mut self, requested: i32, prompt_len: usize) {
        let requested = if requested < 0 {
            prompt_len
        } else {
            requested as usize
        };
        let cap = if self.n_ctx > 4 { self.n_ctx - 4 } else { 0 };
        self.n_keep = requested.min(cap);
    }

    /// Middle-truncate an oversized prompt before the first decode.
    ///
    /// Keeps the first `n_keep` tokens and the suffix, erasing whole blocks
    /// of size `(n_ctx - n_keep) / 2` from the interior. Long-range
    /// instructions (prefix) and immediate context (suffix) survive at the
    /// cost of older middle content.
    ///
    /// # Errors
    /// [`CoreError::ContextFull`] when the block size is zero or the result
    /// still does not fit.
    pub fn truncate_middle(&mut self) -> Result<()> {
        let n_left = self.n_ctx as i64 - self.n_keep as i64;
        let block = if n_left > 0 { (n_left / 2) as usize } else { 0 };
        if block == 0 {
            return Err(CoreError::ContextFull);
        }

        let len = self.tokens.len();
        let keep_count = self.n_keep.min(len);
        let erased_blocks =
            ((len as i64 - keep_count as i64 - block as i64) / block as i64).max(0) as usize;

        let mut new_tokens: Vec<TokenId> = self.tokens[..keep_count].to_vec();
        let suffix_start = keep_count + erased_blocks * block;
        if suffix_start < len {
            new_tokens.extend_from_slice(&self.tokens[suffix_start..]);
        }

        if new_tokens.len() >= self.n_ctx {
            return Err(CoreError::ContextFull);
        }

        self.tokens = new_tokens;
        // The interior of the cache no longer matches the buffer; everything
        // past the protected prefix must be recomputed.
        self.n_past = self.n_past.min(keep_count);
        Ok(())
    }

    /// Sliding-window shift once the buffer reaches capacity mid-generation.
    ///
    /// Discards `(n_past - n_keep - 1) / 2` tokens starting right after the
    /// protected prefix, shifting later tokens back both locally and in the
    /// backend cache so position indices realign.
    ///
    /// # Errors
    /// [`CoreError::ContextFull`] when the discard count would be
    /// non-positive (nothing can be evicted at this `n_ctx`/`n_keep`).
    pub fn shift(&mut self, backend: &mut dyn InferenceBackend) -> Result<usize> {
        let n_discard = (self.n_past as i64 - self.n_keep as i64 - 1) / 2;
        if n_discard <= 0 {
            return Err(CoreError::ContextFull);
        }
        let n_discard = n_discard as usize;
        let start = self.n_keep + 1;

        backend.remove_range(start, Some(start + n_discard));
        backend.shift_range(start + n_discard, self.n_past, -(n_discard as i64));

        let len = self.tokens.len();
        self.tokens.copy_within(start + n_discard..len, start);
        self.tokens.truncate(len - n_discard);

        self.n_past -= n_discard;
        Ok(n_discard)
    }
}
