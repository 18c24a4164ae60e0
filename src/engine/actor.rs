//! Actor wrapper: runs a [`Session`] on a dedicated worker thread and
//! exposes a channel-based command/event interface.
//!
//! A session is single-owner by construction; the actor makes that ownership
//! explicit by moving the session into its worker thread. Callers interact
//! through [`ActorHandle`]: commands go in, text chunks and results come
//! out. Interruption bypasses the command channel entirely (the worker is
//! busy inside an episode when it matters) and uses the session's shared
//! interruption flag instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::engine::{CompletionParams, CompletionResult};
use crate::session::Session;

/// Pieces buffered before a chunk is flushed to the event channel.
const PIECE_BATCH_SIZE: usize = 10;
/// Maximum time a buffered chunk waits before being flushed.
const FLUSH_INTERVAL: Duration = Duration::from_millis(50);

const COMMAND_QUEUE_DEPTH: usize = 16;
const EVENT_QUEUE_DEPTH: usize = 256;

/// Commands accepted by the worker thread.
#[derive(Debug)]
pub enum ActorCommand {
    Complete {
        prompt: String,
        media: Vec<String>,
        params: CompletionParams,
    },
    Rewind,
    Shutdown,
}

/// Events emitted by the worker thread.
#[derive(Debug)]
pub enum ActorEvent {
    /// A batch of streamed text.
    Chunk(String),
    /// Episode finished (normally or via interruption).
    Done(CompletionResult),
    /// Episode failed; the session remains usable after a `Rewind`.
    Error(String),
}

/// Owning handle to a session worker thread.
///
/// Dropping the handle shuts the worker down and joins it.
pub struct ActorHandle {
    commands: Sender<ActorCommand>,
    events: Receiver<ActorEvent>,
    interrupt: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ActorHandle {
    /// Move `session` onto a new worker thread.
    pub fn spawn(session: Session) -> Self {
        let (command_tx, command_rx) = bounded::<ActorCommand>(COMMAND_QUEUE_DEPTH);
        let (event_tx, event_rx) = bounded::<ActorEvent>(EVENT_QUEUE_DEPTH);
        let interrupt = session.interrupt_flag();

        let worker = std::thread::spawn(move || worker_loop(session, command_rx, event_tx));

        Self {
            commands: command_tx,
            events: event_rx,
            interrupt,
            worker: Some(worker),
        }
    }

    /// Queue a completion episode. Returns `false` when the worker is gone.
    pub fn complete(&self, prompt: String, media: Vec<String>, params: CompletionParams) -> bool {
        // A leftover interruption from an earlier episode must not cancel
        // this one, while an interrupt issued after this call must stick
        // even if the episode is still queued. So the flag is cleared here,
        // at send time, never by the worker.
        self.interrupt.store(false, Ordering::Release);
        self.commands
            .send(ActorCommand::Complete {
                prompt,
                media,
                params,
            })
            .is_ok()
    }

    /// Queue a session rewind. Returns `false` when the worker is gone.
    pub fn rewind(&self) -> bool {
        self.commands.send(ActorCommand::Rewind).is_ok()
    }

    /// Stop the in-flight episode at its next step boundary.
    pub fn interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    /// Event stream from the worker.
    pub fn events(&self) -> &Receiver<ActorEvent> {
        &self.events
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        // Unblock the episode first so Shutdown is seen promptly.
        self.interrupt.store(true, Ordering::Release);
        let _ = self.commands.send(ActorCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    mut session: Session,
    commands: Receiver<ActorCommand>,
    events: Sender<ActorEvent>,
) {
    while let Ok(command) = commands.recv() {
        match command {
            ActorCommand::Complete {
                prompt,
                media,
                params,
            } => run_episode(&mut session, &events, &prompt, &media, params),
            ActorCommand::Rewind => session.rewind(),
            ActorCommand::Shutdown => break,
        }
    }
}

fn run_episode(
    session: &mut Session,
    events: &Sender<ActorEvent>,
    prompt: &str,
    media: &[String],
    params: CompletionParams,
) {
    let mut batch = String::new();
    let mut pieces = 0usize;
    let mut last_flush = Instant::now();

    let result = session.complete(prompt, media, params, |text| {
        batch.push_str(text);
        pieces += 1;
        if pieces >= PIECE_BATCH_SIZE || last_flush.elapsed() >= FLUSH_INTERVAL {
            let chunk = std::mem::take(&mut batch);
            pieces = 0;
            last_flush = Instant::now();
            // A closed event channel means the consumer is gone; stop
            // generating for it.
            events.send(ActorEvent::Chunk(chunk)).is_ok()
        } else {
            true
        }
    });

    if !batch.is_empty() {
        let _ = events.send(ActorEvent::Chunk(batch));
    }

    match result {
        Ok(result) => {
            let _ = events.send(ActorEvent::Done(result));
        }
        Err(e) => {
            let _ = events.send(ActorEvent::Error(e.to_string()));
        }
    }
}
