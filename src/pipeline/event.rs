//! Event-wait primitives: how a stage sleeps until something happens.
//!
//! Each stage owns one unbounded event channel. Its command inbox and every
//! input queue it registered with push wake-up events into that channel, so a
//! single blocking receive multiplexes "command arrived" and "data arrived".

use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Identifies a queue in `DataArrived` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

/// Identifies the stage a listener delivers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

impl QueueId {
    pub(crate) fn next() -> Self {
        QueueId(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Why a stage woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    CommandArrived,
    DataArrived(QueueId),
}

/// The sending half of a stage's event channel.
#[derive(Debug, Clone)]
pub struct Listener {
    id: ListenerId,
    tx: Sender<StageEvent>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Delivers an event. A stage that already exited simply misses it.
    pub fn signal(&self, event: StageEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("listener {:?}: receiver gone, dropping {:?}", self.id, event);
        }
    }
}

/// The receiving half of a stage's event channel.
pub struct EventWaiter {
    rx: Receiver<StageEvent>,
}

impl EventWaiter {
    /// Blocks until the next event. `None` once every listener is gone.
    pub fn wait(&self) -> Option<StageEvent> {
        self.rx.recv().ok()
    }

    /// Returns a pending event without blocking.
    pub fn try_next(&self) -> Option<StageEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Discards all pending events and returns how many there were.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }
}

/// Creates a connected listener/waiter pair with a fresh listener id.
pub fn event_channel() -> (Listener, EventWaiter) {
    let (tx, rx) = unbounded();
    let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
    (Listener { id, tx }, EventWaiter { rx })
}

/// Lifecycle flags shared between a stage thread and its handle.
#[derive(Debug, Default)]
pub struct StageFlags {
    started: AtomicBool,
    suspended: AtomicBool,
    terminated: AtomicBool,
}

impl StageFlags {
    /// Marks the stage started. Returns false if it already was.
    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Sets the suspended flag. Returns true if this changed it.
    pub fn set_suspended(&self, suspended: bool) -> bool {
        self.suspended.swap(suspended, Ordering::SeqCst) != suspended
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
