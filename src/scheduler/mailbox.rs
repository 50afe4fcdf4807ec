use super::pool::{PoolError, WorkerPool};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    Empty,
    Enqueued,
    Running,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The mailbox was idle and a drain routine was submitted.
    Submitted,
    /// A drain routine is already scheduled or running and will pick the event up.
    Queued,
}

/// Events handed back when the pool refused the drain routine.
#[derive(Debug)]
pub struct Rejected<E> {
    pub error: PoolError,
    pub events: Vec<E>,
}

struct Inner<E> {
    state: MailboxState,
    queue: VecDeque<E>,
}

/// Per-session FIFO drained by at most one pool worker at a time.
pub struct Mailbox<E> {
    inner: Mutex<Inner<E>>,
    processed: AtomicU64,
}

impl<E> Default for Mailbox<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: MailboxState::Empty,
                queue: VecDeque::new(),
            }),
            processed: AtomicU64::new(0),
        }
    }
}

impl<E: Send + 'static> Mailbox<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `event`. Only the EMPTY to ENQUEUED transition submits a drain
    /// routine running `handler`; otherwise the in-flight routine takes it.
    pub fn enqueue<F>(
        self: &Arc<Self>,
        pool: &WorkerPool,
        event: E,
        handler: F,
    ) -> Result<Delivery, Rejected<E>>
    where
        F: FnMut(E) + Send + 'static,
    {
        let submit = {
            let mut inner = self.inner.lock();
            inner.queue.push_back(event);
            if inner.state == MailboxState::Empty {
                inner.state = MailboxState::Enqueued;
                true
            } else {
                false
            }
        };
        if !submit {
            return Ok(Delivery::Queued);
        }

        let mailbox = self.clone();
        match pool.submit(move || mailbox.drain(handler)) {
            Ok(()) => Ok(Delivery::Submitted),
            Err(error) => {
                let mut inner = self.inner.lock();
                inner.state = MailboxState::Empty;
                Err(Rejected {
                    error,
                    events: inner.queue.drain(..).collect(),
                })
            }
        }
    }

    fn drain<F>(&self, mut handler: F)
    where
        F: FnMut(E),
    {
        loop {
            let event = {
                let mut inner = self.inner.lock();
                match inner.queue.pop_front() {
                    Some(event) => {
                        inner.state = MailboxState::Running;
                        event
                    }
                    None => {
                        inner.state = MailboxState::Empty;
                        return;
                    }
                }
            };
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!("mailbox handler panicked, event dropped");
            }
            self.processed.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl<E> Mailbox<E> {
    pub fn state(&self) -> MailboxState {
        self.inner.lock().state
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of events the drain routine has finished.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }
}
