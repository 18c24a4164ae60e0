//! Shared test doubles for the integration suite.
//!
//! The vocabulary maps every byte `b` to token id `256 + b`, so test prompts
//! and expected output are easy to spell. The backend records every cache
//! operation into a shared log, and the sampler replays a scripted token
//! sequence (falling back to EOS when the script runs out).

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use saguaro::{
    InferenceBackend, MediaEncoder, MediaEncoding, Result, SampledToken, Sampler, Session,
    TokenId, Vocabulary,
};

pub const BOS: TokenId = 1;
pub const EOS: TokenId = 2;

/// Token id for a single byte of text.
pub fn tok(b: u8) -> TokenId {
    256 + TokenId::from(b)
}

pub fn toks(text: &str) -> Vec<TokenId> {
    text.bytes().map(tok).collect()
}

/// Byte-per-token vocabulary with optional extra multi-byte pieces.
#[derive(Default)]
pub struct TestVocab {
    /// Extra token -> piece mappings, consulted before the byte mapping.
    pub pieces: Vec<(TokenId, Vec<u8>)>,
}

impl Vocabulary for TestVocab {
    fn tokenize(&self, text: &str, add_special: bool) -> Vec<TokenId> {
        let mut out = Vec::new();
        if add_special {
            out.push(BOS);
        }
        out.extend(text.bytes().map(tok));
        out
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        if let Some((_, piece)) = self.pieces.iter().find(|(id, _)| *id == token) {
            return piece.clone();
        }
        if token >= 256 {
            vec![(token - 256) as u8]
        } else {
            Vec::new()
        }
    }

    fn eos(&self) -> TokenId {
        EOS
    }

    fn is_control(&self, token: TokenId) -> bool {
        token == BOS || token == EOS
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOS
    }
}

#[derive(Default)]
pub struct BackendLog {
    pub decoded: Vec<(Vec<TokenId>, usize)>,
    pub removed: Vec<(usize, Option<usize>)>,
    pub shifted: Vec<(usize, usize, i64)>,
}

/// Records every backend call; logits are inert (the scripted sampler
/// ignores them).
pub struct TestBackend {
    batch: usize,
    /// Fail the decode call with this zero-based index.
    pub fail_on_call: Option<usize>,
    /// Raise the session's interruption flag from inside this decode call,
    /// once the flag has been planted in `flag`.
    pub raise_flag_on_call: Option<usize>,
    pub flag: Arc<Mutex<Option<Arc<AtomicBool>>>>,
    /// Block this decode call until the paired sender fires.
    pub block_on_call: Option<(usize, mpsc::Receiver<()>)>,
    log: Arc<Mutex<BackendLog>>,
    logits: Vec<f32>,
}

impl TestBackend {
    pub fn new(batch: usize) -> (Self, Arc<Mutex<BackendLog>>) {
        let log = Arc::new(Mutex::new(BackendLog::default()));
        (
            Self {
                batch,
                fail_on_call: None,
                raise_flag_on_call: None,
                flag: Arc::new(Mutex::new(None)),
                block_on_call: None,
                log: log.clone(),
                logits: vec![0.0; 4],
            },
            log,
        )
    }
}

impl InferenceBackend for TestBackend {
    fn decode(&mut self, tokens: &[TokenId], n_past: usize) -> Result<()> {
        let call = self.log.lock().unwrap().decoded.len();
        if let Some((idx, gate)) = &self.block_on_call {
            if *idx == call {
                let _ = gate.recv();
            }
        }
        if self.fail_on_call == Some(call) {
            return Err(saguaro::CoreError::BackendDecodeFailed(
                "scripted failure".into(),
            ));
        }
        self.log.lock().unwrap().decoded.push((tokens.to_vec(), n_past));
        if self.raise_flag_on_call == Some(call) {
            if let Some(flag) = self.flag.lock().unwrap().as_ref() {
                flag.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    fn last_logits(&self) -> &[f32] {
        &self.logits
    }

    fn batch_limit(&self) -> usize {
        self.batch
    }

    fn remove_range(&mut self, start: usize, end: Option<usize>) {
        self.log.lock().unwrap().removed.push((start, end));
    }

    fn shift_range(&mut self, start: usize, end: usize, delta: i64) {
        self.log.lock().unwrap().shifted.push((start, end, delta));
    }
}

/// Replays a fixed token sequence regardless of logits; EOS when exhausted.
pub struct ScriptedSampler {
    script: VecDeque<TokenId>,
    accepted: Arc<Mutex<Vec<(TokenId, bool)>>>,
}

impl ScriptedSampler {
    pub fn new(script: Vec<TokenId>) -> (Self, Arc<Mutex<Vec<(TokenId, bool)>>>) {
        let accepted = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script: script.into(),
                accepted: accepted.clone(),
            },
            accepted,
        )
    }
}

impl Sampler for ScriptedSampler {
    fn sample(&mut self, _logits: &[f32]) -> saguaro::SamplingResult<SampledToken> {
        let id = self.script.pop_front().unwrap_or(EOS);
        Ok(SampledToken {
            id,
            probs: Vec::new(),
        })
    }

    fn accept(&mut self, token: TokenId, generated: bool) {
        self.accepted.lock().unwrap().push((token, generated));
    }

    fn reset(&mut self) {}
}

/// Media encoder double: every item occupies `n_pos` positions; evaluated
/// chunks are logged as `(offset, n_past)` pairs.
pub struct TestEncoder {
    pub n_pos: usize,
    pub evals: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl TestEncoder {
    pub fn new(n_pos: usize) -> (Self, Arc<Mutex<Vec<(usize, usize)>>>) {
        let evals = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                n_pos,
                evals: evals.clone(),
            },
            evals,
        )
    }
}

impl MediaEncoder for TestEncoder {
    fn encode(&mut self, _bytes: &[u8]) -> Result<MediaEncoding> {
        Ok(MediaEncoding {
            n_tokens: self.n_pos,
            n_pos: self.n_pos,
        })
    }

    fn eval_chunk(&mut self, chunk: &saguaro::multimodal::MediaChunk, n_past: usize) -> Result<usize> {
        self.evals.lock().unwrap().push((chunk.offset, n_past));
        Ok(chunk.offset + chunk.n_pos)
    }
}

/// Session wired with the standard doubles and a scripted token sequence.
pub fn scripted_session(
    n_ctx: usize,
    script: Vec<TokenId>,
) -> (Session, Arc<Mutex<BackendLog>>) {
    let (backend, log) = TestBackend::new(8);
    let mut session = Session::new(Box::new(backend), Box::<TestVocab>::default(), n_ctx);
    let (sampler, _) = ScriptedSampler::new(script);
    session.set_sampler(Box::new(sampler));
    (session, log)
}
