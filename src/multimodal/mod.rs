//! Multimodal prompt alignment: merging text and media into one token
//! stream, and maximizing KV-cache reuse across turns.
//!
//! Media items arrive as file paths or `data:` base64 URIs. Each item is
//! content-hashed (FNV-1a over raw bytes; change detection, not security)
//! and occupies a run of [`MEDIA_PLACEHOLDER`] sentinels sized by the media
//! encoder's reported position count. Chunk boundaries (text runs and media
//! runs) are tracked so that cache reuse never splits a chunk: the backend
//! can only invalidate and recompute whole chunks.

use crate::backend::{MediaEncoder, TokenId, Vocabulary, MEDIA_PLACEHOLDER};
use crate::error::{CoreError, Result};

/// Marker substituted by media content inside a prompt.
pub const DEFAULT_MEDIA_MARKER: &str = "<__media__>";

/// FNV-1a over raw bytes. Stable across runs for identical content.
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325; // offset basis
    for &b in data {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3); // FNV prime
    }
    hash
}

fn base64_value(b: u8) -> Option<u8> {
    match b {
        b'A'..=b'Z' => Some(b - b'A'),
        b'a'..=b'z' => Some(b - b'a' + 26),
        b'0'..=b'9' => Some(b - b'0' + 52),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decode a base64 payload. Whitespace is skipped, decoding stops at the
/// first padding byte, and any other non-alphabet byte is an error.
pub fn decode_base64(input: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() / 4 * 3);
    let mut quad = [0u8; 4];
    let mut n = 0;

    for &b in input.as_bytes() {
        if b.is_ascii_whitespace() {
            continue;
        }
        if b == b'=' {
            break;
        }
        let v = base64_value(b).ok_or_else(|| {
            CoreError::UnsupportedMedia(format!("invalid base64 byte 0x{b:02x}"))
        })?;
        quad[n] = v;
        n += 1;
        if n == 4 {
            out.push((quad[0] << 2) | (quad[1] >> 4));
            out.push(((quad[1] & 0x0f) << 4) | (quad[2] >> 2));
            out.push(((quad[2] & 0x03) << 6) | quad[3]);
            n = 0;
        }
    }

    match n {
        0 => {}
        1 => {
            return Err(CoreError::UnsupportedMedia(
                "truncated base64 payload".into(),
            ))
        }
        2 => out.push((quad[0] << 2) | (quad[1] >> 4)),
        _ => {
            out.push((quad[0] << 2) | (quad[1] >> 4));
            out.push(((quad[1] & 0x0f) << 4) | (quad[2] >> 2));
        }
    }

    Ok(out)
}

/// Load one media item's raw bytes from a path or data URI.
///
/// Accepted forms: `data:image/...;base64,...`, `data:audio/...;base64,...`,
/// or a filesystem path. `http(s)://` URLs are rejected. Failures happen
/// before any session state is touched, so retries are safe.
pub fn load_media_payload(source: &str) -> Result<Vec<u8>> {
    if source.starts_with("data:image/") || source.starts_with("data:audio/") {
        let comma = source.find(',').ok_or_else(|| {
            CoreError::UnsupportedMedia("base64 media missing comma separator".into())
        })?;
        let (header, payload) = source.split_at(comma);
        if !header.contains("base64") {
            return Err(CoreError::UnsupportedMedia(
                "media data URI must be base64 encoded".into(),
            ));
        }
        decode_base64(&payload[1..])
    } else if source.starts_with("http://") || source.starts_with("https://") {
        Err(CoreError::UnsupportedMedia(
            "http(s) media URLs are not supported".into(),
        ))
    } else {
        std::fs::read(source)
            .map_err(|e| CoreError::UnsupportedMedia(format!("cannot read media file: {e}")))
    }
}

/// One media run in the token stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaChunk {
    /// Index of the media item within the current turn.
    pub media_index: usize,
    /// Content hash of the item's raw bytes.
    pub hash: u64,
    /// Token offset where this chunk begins.
    pub offset: usize,
    /// Position slots the chunk occupies (placeholder run length).
    pub n_pos: usize,
    /// Embedding tokens the encoder produces for the chunk.
    pub n_tokens: usize,
}

/// One contiguous run of the input stream: a text span or a media item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Text { offset: usize, tokens: Vec<TokenId> },
    Media(MediaChunk),
}

impl Chunk {
    pub fn offset(&self) -> usize {
        match self {
            Chunk::Text { offset, .. } => *offset,
            Chunk::Media(m) => m.offset,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Chunk::Text { tokens, .. } => tokens.len(),
            Chunk::Media(m) => m.n_pos,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of tokenizing a (text, media) prompt. Media runs are represented
/// by [`MEDIA_PLACEHOLDER`] sentinels in `tokens`.
#[derive(Debug, Clone, Default)]
pub struct TokenizedPrompt {
    pub tokens: Vec<TokenId>,
    pub has_media: bool,
    /// Content hash per media item, in turn order.
    pub bitmap_hashes: Vec<u64>,
    /// Token offset where each chunk begins.
    pub chunk_pos: Vec<usize>,
    /// Token offsets restricted to media chunks.
    pub chunk_pos_media: Vec<usize>,
    pub chunks: Vec<Chunk>,
}

/// Per-session alignment record carried across turns.
#[derive(Debug, Clone, Default)]
pub struct AlignmentState {
    pub bitmap_hashes: Vec<u64>,
    pub chunk_pos: Vec<usize>,
    pub chunk_pos_media: Vec<usize>,
    /// Hash sequence from the previous turn, retained to detect reusable
    /// media.
    pub past_bitmap_hashes: Vec<u64>,
}

impl AlignmentState {
    pub fn clear(&mut self) {
        self.bitmap_hashes.clear();
        self.chunk_pos.clear();
        self.chunk_pos_media.clear();
        self.past_bitmap_hashes.clear();
    }

    /// Commit the current turn's layout and roll its hashes into the
    /// previous-turn slot for the next alignment.
    pub fn commit(&mut self, prompt: &TokenizedPrompt) {
        self.bitmap_hashes = prompt.bitmap_hashes.clone();
        self.chunk_pos = prompt.chunk_pos.clone();
        self.chunk_pos_media = prompt.chunk_pos_media.clone();
        self.past_bitmap_hashes = prompt.bitmap_hashes.clone();
    }
}

/// Tokenize a prompt with media items into a single aligned token stream.
///
/// The prompt may carry one [`DEFAULT_MEDIA_MARKER`] per media item to
/// control placement; a prompt without markers has all media appended at the
/// end. A marker count that disagrees with the media count is an error, and
/// every failure leaves no state behind.
pub fn tokenize_with_media(
    vocab: &dyn Vocabulary,
    encoder: &mut dyn MediaEncoder,
    prompt: &str,
    media: &[String],
) -> Result<TokenizedPrompt> {
    let mut payloads = Vec::with_capacity(media.len());
    for source in media {
        let bytes = load_media_payload(source)?;
        let hash = fnv1a_hash(&bytes);
        payloads.push((bytes, hash));
    }

    let mut full_prompt = prompt.to_string();
    let marker_count = full_prompt.matches(DEFAULT_MEDIA_MARKER).count();
    if marker_count == 0 {
        for _ in media {
            full_prompt.push(' ');
            full_prompt.push_str(DEFAULT_MEDIA_MARKER);
        }
    } else if marker_count != media.len() {
        return Err(CoreError::UnsupportedMedia(format!(
            "prompt contains {marker_count} media markers for {} media items",
            media.len()
        )));
    }

    let mut result = TokenizedPrompt {
        has_media: !media.is_empty(),
        ..Default::default()
    };

    for (i, segment) in full_prompt.split(DEFAULT_MEDIA_MARKER).enumerate() {
        if !segment.is_empty() {
            let text_tokens = vocab.tokenize(segment, i == 0);
            if !text_tokens.is_empty() {
                let offset = result.tokens.len();
                result.chunk_pos.push(offset);
                result.tokens.extend_from_slice(&text_tokens);
                result.chunks.push(Chunk::Text {
                    offset,
                    tokens: text_tokens,
                });
            }
        }

        if i < payloads.len() {
            let (bytes, hash) = &payloads[i];
            let encoding = encoder.encode(bytes)?;
            let offset = result.tokens.len();
            result.chunk_pos.push(offset);
            result.chunk_pos_media.push(offset);
            result.bitmap_hashes.push(*hash);
            result
                .tokens
                .extend(std::iter::repeat(MEDIA_PLACEHOLDER).take(encoding.n_pos));
            result.chunks.push(Chunk::Media(MediaChunk {
                media_index: i,
                hash: *hash,
                offset,
                n_pos: encoding.n_pos,
                n_tokens: encoding.n_tokens,
            }));
        }
    }

    Ok(result)
}

/// Length of the longest matching leading token run between two sequences.
pub fn common_prefix_len(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Compute how many leading positions of `fresh` can reuse the cache built
/// for `previous`.
///
/// Starts from the common prefix length, rounds down to a chunk start
/// whenever the candidate falls strictly inside a chunk (partial chunk reuse
/// is disallowed), then clamps to the first media chunk whose content hash
/// disagrees with the previous turn: a changed image invalidates its own
/// cache entry and everything after it, but not unrelated earlier chunks.
pub fn align(previous: &[TokenId], fresh: &TokenizedPrompt, past_hashes: &[u64]) -> usize {
    let mut n_past = common_prefix_len(previous, &fresh.tokens);

    if n_past < fresh.tokens.len() {
        let mut chunk_start = 0;
        for &pos in &fresh.chunk_pos {
            if pos <= n_past {
                chunk_start = pos;
            } else {
                break;
            }
        }
        if chunk_start < n_past {
            n_past = chunk_start;
        }
    }

    for (i, &pos) in fresh.chunk_pos_media.iter().enumerate() {
        if n_past < pos {
            break;
        }
        if i >= past_hashes.len() || i >= fresh.bitmap_hashes.len() {
            break;
        }
        if fresh.bitmap_hashes[i] != past_hashes[i] {
            n_past = pos;
            break;
        }
    }

    n_past
}
