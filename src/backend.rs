//! External-collaborator contracts consumed by the generation controller.
//!
//! The controller never performs numeric work itself. It drives three
//! capabilities through narrow traits:
//! - [`InferenceBackend`] — the forward pass and its KV cache
//! - [`Vocabulary`] — token/text mapping and token classification
//! - [`MediaEncoder`] — image/audio chunk encoding and evaluation
//!
//! Implementations can wrap an FFI inference library or a pure-Rust model;
//! the controller only depends on this behavior, not on the implementation.

use crate::error::Result;
use crate::multimodal::MediaChunk;

pub use saguaro_sampling::TokenId;

/// Reserved sentinel occupying media placeholder slots in the token buffer.
/// Never a real vocabulary id.
pub const MEDIA_PLACEHOLDER: TokenId = -1;

/// The inference backend: decode entry point plus KV-cache position surgery.
///
/// Positions are absolute indices into the session's token history. The
/// backend is expected to keep cache entries addressed by position, which is
/// what makes [`remove_range`](InferenceBackend::remove_range) and
/// [`shift_range`](InferenceBackend::shift_range) meaningful.
pub trait InferenceBackend: Send {
    /// Run the forward pass over `tokens`, whose first token sits at absolute
    /// position `n_past`. Callers never pass more than
    /// [`batch_limit`](InferenceBackend::batch_limit) tokens per call.
    fn decode(&mut self, tokens: &[TokenId], n_past: usize) -> Result<()>;

    /// Logits for the last decoded position, length = vocabulary size.
    fn last_logits(&self) -> &[f32];

    /// Maximum tokens accepted by a single `decode` call.
    fn batch_limit(&self) -> usize;

    /// Drop cache entries for positions in `[start, end)`; `None` means to
    /// the end of the cache (the `invalidateFrom` contract).
    fn remove_range(&mut self, start: usize, end: Option<usize>);

    /// Shift cache entries in `[start, end)` by `delta` positions. Used by
    /// the sliding-window context shift to realign position indices after
    /// interior tokens are discarded.
    fn shift_range(&mut self, start: usize, end: usize, delta: i64);
}

/// Token/text mapping owned by the loaded model.
pub trait Vocabulary: Send {
    /// Tokenize text. `add_special` controls BOS-style prefixing and is only
    /// set for the first segment of a fresh episode.
    fn tokenize(&self, text: &str, add_special: bool) -> Vec<TokenId>;

    /// Raw bytes for one token. May be a partial UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;

    /// End-of-sequence token id.
    fn eos(&self) -> TokenId;

    /// Whether `token` is a control token (BOS/EOS/special markers).
    fn is_control(&self, token: TokenId) -> bool;

    /// Whether `token` ends generation (EOS, EOT and friends).
    fn is_end_of_generation(&self, token: TokenId) -> bool;
}

/// What the media encoder reports for one media item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaEncoding {
    /// Embedding tokens the encoder will produce for this item.
    pub n_tokens: usize,
    /// Position slots the item occupies in the token stream. This many
    /// [`MEDIA_PLACEHOLDER`] sentinels are reserved for it.
    pub n_pos: usize,
}

/// Encoder for image/audio items (the mtmd-style projector).
pub trait MediaEncoder: Send {
    /// Inspect raw media bytes and report how many tokens/positions the
    /// encoded item will occupy. Must be deterministic for identical bytes.
    fn encode(&mut self, bytes: &[u8]) -> Result<MediaEncoding>;

    /// Evaluate one media chunk into the backend's cache starting at
    /// absolute position `n_past`. Returns the new `n_past` (normally
    /// `chunk.offset + chunk.n_pos`).
    fn eval_chunk(&mut self, chunk: &MediaChunk, n_past: usize) -> Result<usize>;

    fn supports_vision(&self) -> bool {
        true
    }

    fn supports_audio(&self) -> bool {
        false
    }
}
