//! Multimodal prompt loading and cross-turn cache alignment.

mod common;

use std::io::Write;
use std::sync::{Arc, Mutex};

use common::{ScriptedSampler, TestBackend, TestEncoder, TestVocab, BOS, EOS};
use saguaro::{
    CompletionParams, CoreError, Session, TokenId, DEFAULT_MEDIA_MARKER, MEDIA_PLACEHOLDER,
};

type SharedBackendLog = Arc<Mutex<common::BackendLog>>;
type EvalLog = Arc<Mutex<Vec<(usize, usize)>>>;

fn media_session(
    n_ctx: usize,
    script: Vec<TokenId>,
    n_pos: usize,
) -> (Session, SharedBackendLog, EvalLog) {
    let (backend, log) = TestBackend::new(8);
    let mut session = Session::new(Box::new(backend), Box::<TestVocab>::default(), n_ctx);
    let (sampler, _) = ScriptedSampler::new(script);
    session.set_sampler(Box::new(sampler));
    let (encoder, evals) = TestEncoder::new(n_pos);
    session.set_media_encoder(Box::new(encoder));
    (session, log, evals)
}

fn run(session: &mut Session, prompt: &str, media: &[String]) -> saguaro::CompletionResult {
    session
        .complete(prompt, media, CompletionParams::default(), |_| true)
        .unwrap()
}

const MEDIA_A: &str = "data:image/png;base64,aGVsbG8="; // "hello"
const MEDIA_B: &str = "data:image/png;base64,d29ybGQ="; // "world"

#[test]
fn media_file_prompt_evaluates_media_chunk() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"raw image bytes").unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let (mut session, _log, evals) = media_session(32, vec![EOS], 4);
    let result = run(&mut session, "hi", &[path]);

    // "hi " + appended marker: BOS + 3 text tokens, then 4 media positions.
    assert_eq!(result.tokens_evaluated, 8);
    let evals = evals.lock().unwrap();
    assert_eq!(evals.as_slice(), &[(4, 4)]);
    assert!(session.tokens().contains(&MEDIA_PLACEHOLDER));
}

#[test]
fn repeated_prompt_skips_media_reencoding_eval() {
    let prompt = format!("a{DEFAULT_MEDIA_MARKER}b");
    let media = vec![MEDIA_A.to_string()];

    let (mut session, _log, evals) = media_session(32, vec![EOS, EOS], 4);
    run(&mut session, &prompt, &media);
    assert_eq!(evals.lock().unwrap().len(), 1);

    // Same prompt, same media content: the media chunk's cache is reused and
    // only the trailing text token is re-decoded.
    run(&mut session, &prompt, &media);
    assert_eq!(evals.lock().unwrap().len(), 1);
}

#[test]
fn changed_media_invalidates_its_chunk_and_suffix() {
    let prompt = format!("a{DEFAULT_MEDIA_MARKER}b");

    let (mut session, log, evals) = media_session(32, vec![EOS, EOS], 4);
    run(&mut session, &prompt, &[MEDIA_A.to_string()]);
    assert_eq!(evals.lock().unwrap().len(), 1);

    run(&mut session, &prompt, &[MEDIA_B.to_string()]);

    // The media chunk starts after BOS + "a"; everything from there was
    // recomputed.
    assert_eq!(evals.lock().unwrap().len(), 2);
    assert!(log.lock().unwrap().removed.contains(&(2, None)));
}

#[test]
fn media_without_encoder_is_rejected() {
    let (backend, _log) = TestBackend::new(8);
    let mut session = Session::new(Box::new(backend), Box::<TestVocab>::default(), 32);
    let (sampler, _) = ScriptedSampler::new(vec![EOS]);
    session.set_sampler(Box::new(sampler));

    let err = session
        .complete(
            "hi",
            &[MEDIA_A.to_string()],
            CompletionParams::default(),
            |_| true,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::UnsupportedMedia(_)));
    assert!(session.tokens().is_empty());
}

#[test]
fn oversized_media_prompt_is_context_full_before_any_mutation() {
    let (mut session, _log, _evals) = media_session(6, vec![EOS], 8);
    let err = session
        .complete(
            "hi",
            &[MEDIA_A.to_string()],
            CompletionParams::default(),
            |_| true,
        )
        .unwrap_err();

    assert!(matches!(err, CoreError::ContextFull));
    assert!(session.context_full());
    assert!(session.tokens().is_empty());
}

#[test]
fn unreadable_media_leaves_session_unchanged() {
    let (mut session, _log, evals) = media_session(32, vec![EOS], 4);
    let err = session
        .complete(
            "hi",
            &["/no/such/file.png".to_string()],
            CompletionParams::default(),
            |_| true,
        )
        .unwrap_err();

    assert!(matches!(err, CoreError::UnsupportedMedia(_)));
    assert!(session.tokens().is_empty());
    assert!(evals.lock().unwrap().is_empty());
}

#[test]
fn tokenize_inspection_does_not_mutate_session() {
    let (mut session, log, evals) = media_session(32, vec![EOS], 4);
    let prompt = format!("x{DEFAULT_MEDIA_MARKER}");
    let tp = session.tokenize(&prompt, &[MEDIA_A.to_string()]).unwrap();

    assert!(tp.has_media);
    assert_eq!(tp.tokens.len(), 6); // BOS + 'x' + 4 media positions
    assert_eq!(tp.tokens[0], BOS);

    assert!(session.tokens().is_empty());
    assert!(evals.lock().unwrap().is_empty());
    assert!(log.lock().unwrap().decoded.is_empty());
}

#[test]
fn plain_tokenize_inspection_has_no_specials() {
    let (mut session, _log, _evals) = media_session(32, vec![EOS], 4);
    let tp = session.tokenize("ab", &[]).unwrap();
    assert_eq!(tp.tokens.len(), 2);
    assert!(!tp.has_media);
}
