//! Completion queue: the shared event channel between a substrate and the
//! engine.
//!
//! The substrate pushes one [`Completion`] per finished operation through a
//! [`CompletionSender`]; the engine pulls them with
//! [`CompletionQueue::next`], which is the only place the engine ever waits.
//!
//! # Design
//!
//! - `Mutex<VecDeque>` guarded state, never held across an await
//! - `tokio::sync::Notify` to park consumers; each push wakes one consumer
//! - Several workers may pull from clones of the same queue; each pull is
//!   atomic and yields at most one event
//! - After [`shutdown`](CompletionQueue::shutdown) producers are refused and
//!   consumers drain what is left before seeing [`EngineError::QueueShutdown`]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::{CallError, EngineError};
use crate::tag::CallTag;

/// One event on a completion queue.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion<T> {
    tag: CallTag,
    result: Result<T, CallError>,
}

impl<T> Completion<T> {
    /// Build a completion event.
    pub fn new(tag: CallTag, result: Result<T, CallError>) -> Self {
        Self { tag, result }
    }

    /// Tag of the operation this event completes.
    pub fn tag(&self) -> CallTag {
        self.tag
    }

    /// Whether the operation succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Borrow the outcome.
    pub fn result(&self) -> &Result<T, CallError> {
        &self.result
    }

    /// Split into tag and outcome.
    pub fn into_parts(self) -> (CallTag, Result<T, CallError>) {
        (self.tag, self.result)
    }
}

struct QueueState<T> {
    events: VecDeque<Completion<T>>,
    shutdown: bool,
    events_pushed: u64,
    events_consumed: u64,
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

struct Shared<T> {
    id: u64,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop one event; `Err` once the queue is shut down and empty.
    fn pop(&self) -> Result<Option<Completion<T>>, EngineError> {
        let mut state = self.lock();
        match state.events.pop_front() {
            Some(event) => {
                state.events_consumed += 1;
                Ok(Some(event))
            }
            None if state.shutdown => Err(EngineError::QueueShutdown),
            None => Ok(None),
        }
    }
}

/// Consumer side of a completion queue.
///
/// Cloning yields another handle on the same queue, which is how several
/// workers drain one queue concurrently.
pub struct CompletionQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CompletionQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(QueueState {
                    events: VecDeque::new(),
                    shutdown: false,
                    events_pushed: 0,
                    events_consumed: 0,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Producer handle for substrates.
    pub fn sender(&self) -> CompletionSender<T> {
        CompletionSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Process-unique identity of the queue, shared by every handle on it.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Pop an event without waiting.
    ///
    /// Returns `Ok(None)` when nothing is queued and `Err` once the queue is
    /// shut down and drained.
    pub fn try_next(&self) -> Result<Option<Completion<T>>, EngineError> {
        self.shared.pop()
    }

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// [`EngineError::QueueShutdown`] once the queue is shut down and every
    /// queued event has been consumed.
    pub async fn next(&self) -> Result<Completion<T>, EngineError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the
            // await is not lost.
            notified.as_mut().enable();

            if let Some(event) = self.shared.pop()? {
                return Ok(event);
            }
            notified.await;
        }
    }

    /// Wait for the next event for at most `timeout`.
    ///
    /// Returns `Ok(None)` if the timeout elapsed first.
    pub async fn next_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Completion<T>>, EngineError> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Stop accepting events and wake every waiting consumer.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.notify.notify_waiters();
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }

    /// Number of events waiting to be consumed.
    pub fn len(&self) -> usize {
        self.shared.lock().events.len()
    }

    /// Whether no event is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events accepted from producers.
    pub fn events_pushed(&self) -> u64 {
        self.shared.lock().events_pushed
    }

    /// Total events handed to consumers.
    pub fn events_consumed(&self) -> u64 {
        self.shared.lock().events_consumed
    }
}

/// Producer side of a completion queue, held by the substrate.
pub struct CompletionSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CompletionSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> CompletionSender<T> {
    /// Report the completion of the operation tagged `tag`.
    ///
    /// # Errors
    ///
    /// [`EngineError::QueueShutdown`] if the queue no longer accepts events;
    /// the event is dropped.
    pub fn complete(&self, tag: CallTag, result: Result<T, CallError>) -> Result<(), EngineError> {
        {
            let mut state = self.shared.lock();
            if state.shutdown {
                return Err(EngineError::QueueShutdown);
            }
            state.events.push_back(Completion::new(tag, result));
            state.events_pushed += 1;
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Report a successful completion.
    pub fn succeed(&self, tag: CallTag, value: T) -> Result<(), EngineError> {
        self.complete(tag, Ok(value))
    }

    /// Report a failed completion.
    pub fn fail(&self, tag: CallTag, error: CallError) -> Result<(), EngineError> {
        self.complete(tag, Err(error))
    }

    /// Identity of the queue this sender pushes to.
    ///
    /// Tags are only unique per queue; a substrate serving several queues
    /// keys its bookkeeping by `(queue_id, tag)`.
    pub fn queue_id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the queue still accepts events.
    pub fn is_open(&self) -> bool {
        !self.shared.lock().shutdown
    }
}
