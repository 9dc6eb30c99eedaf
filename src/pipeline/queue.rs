//! FIFO packet queue connecting two stages.
//!
//! A queue is a cheap cloneable handle: the producer keeps one clone, the
//! consumer another. It is unbounded unless created with [`PacketQueue::bounded`].

use crate::pipeline::event::{Listener, QueueId, StageEvent};
use crate::pipeline::packet::{Packet, PacketKind};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

/// Synchronous per-arrival callback.
pub type Observer = Arc<dyn Fn(&Packet) + Send + Sync>;

/// When a registered listener is signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyPolicy {
    /// Once per empty → non-empty transition.
    #[default]
    OnTransition,
    /// On every accepted packet.
    EveryPut,
}

struct QueueState {
    packets: VecDeque<Packet>,
    listener: Option<(Listener, NotifyPolicy)>,
    observers: Vec<Observer>,
}

struct Shared {
    id: QueueId,
    filter: OnceLock<PacketKind>,
    capacity: Option<usize>,
    /// Command inboxes wake their stage with `CommandArrived`.
    inbox: bool,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    not_full: Condvar,
}

/// An ordered packet channel with blocking and non-blocking access.
#[derive(Clone)]
pub struct PacketQueue {
    shared: Arc<Shared>,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    /// Creates an unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Creates a queue whose `put` blocks while `capacity` packets are waiting.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    /// Creates a queue with an optional bound.
    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self::build(capacity, false)
    }

    /// Creates a stage's command inbox: unbounded, Command packets only.
    pub(crate) fn command_inbox() -> Self {
        let queue = Self::build(None, true);
        queue.set_filter(PacketKind::Command);
        queue
    }

    fn build(capacity: Option<usize>, inbox: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: QueueId::next(),
                filter: OnceLock::new(),
                capacity,
                inbox,
                state: Mutex::new(QueueState {
                    packets: VecDeque::new(),
                    listener: None,
                    observers: Vec::new(),
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    /// Restricts the queue to one packet kind. Can only be set once.
    ///
    /// Returns false if a filter was already set; the first one stays.
    pub fn set_filter(&self, kind: PacketKind) -> bool {
        self.shared.filter.set(kind).is_ok()
    }

    pub fn filter(&self) -> Option<PacketKind> {
        self.shared.filter.get().copied()
    }

    /// The event a registered listener receives when this queue fills.
    fn arrival_event(&self) -> StageEvent {
        if self.shared.inbox {
            StageEvent::CommandArrived
        } else {
            StageEvent::DataArrived(self.id())
        }
    }

    fn accepts(&self, packet: &Packet) -> bool {
        self.filter().is_none_or(|kind| kind == packet.kind())
    }

    /// Adds a callback invoked synchronously for every accepted packet.
    pub fn add_observer<F>(&self, observer: F)
    where
        F: Fn(&Packet) + Send + Sync + 'static,
    {
        self.lock().observers.push(Arc::new(observer));
    }

    /// Registers the listener woken on the empty → non-empty transition.
    pub fn request_notify(&self, listener: Listener) {
        self.request_notify_with(listener, NotifyPolicy::OnTransition);
    }

    /// Registers a listener with an explicit policy, replacing any previous one.
    ///
    /// If packets are already waiting the listener is signalled right away,
    /// since no transition will happen for them.
    pub fn request_notify_with(&self, listener: Listener, policy: NotifyPolicy) {
        let pending = {
            let mut state = self.lock();
            state.listener = Some((listener.clone(), policy));
            !state.packets.is_empty()
        };
        if pending {
            listener.signal(self.arrival_event());
        }
    }

    /// Appends a packet, blocking while a bounded queue is full.
    ///
    /// Returns false, without enqueueing, if the filter rejects the packet.
    pub fn put(&self, packet: Packet) -> bool {
        if !self.accepts(&packet) {
            return false;
        }
        let mut state = self.lock();
        if let Some(capacity) = self.shared.capacity {
            while state.packets.len() >= capacity {
                state = self
                    .shared
                    .not_full
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        self.enqueue(state, packet);
        true
    }

    /// Like `put`, but hands the packet back instead of blocking when full.
    pub fn try_put(&self, packet: Packet) -> Result<bool, Packet> {
        if !self.accepts(&packet) {
            return Ok(false);
        }
        let state = self.lock();
        if let Some(capacity) = self.shared.capacity
            && state.packets.len() >= capacity
        {
            return Err(packet);
        }
        self.enqueue(state, packet);
        Ok(true)
    }

    /// Like `put`, but gives the packet back if a bounded queue stays full
    /// for `timeout`.
    pub fn put_timeout(&self, packet: Packet, timeout: Duration) -> Result<bool, Packet> {
        if !self.accepts(&packet) {
            return Ok(false);
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        if let Some(capacity) = self.shared.capacity {
            while state.packets.len() >= capacity {
                let now = Instant::now();
                if now >= deadline {
                    return Err(packet);
                }
                state = self
                    .shared
                    .not_full
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
        self.enqueue(state, packet);
        Ok(true)
    }

    fn enqueue(&self, mut state: MutexGuard<'_, QueueState>, packet: Packet) {
        let was_empty = state.packets.is_empty();
        state.packets.push_back(packet.clone());
        let notify = match &state.listener {
            Some((listener, policy)) if was_empty || *policy == NotifyPolicy::EveryPut => {
                Some(listener.clone())
            }
            _ => None,
        };
        let observers = state.observers.clone();
        drop(state);

        self.shared.not_empty.notify_one();
        for observer in &observers {
            observer(&packet);
        }
        if let Some(listener) = notify {
            listener.signal(self.arrival_event());
        }
    }

    fn dequeue(&self, mut state: MutexGuard<'_, QueueState>) -> Option<Packet> {
        let packet = state.packets.pop_front();
        drop(state);
        if packet.is_some() {
            self.shared.not_full.notify_one();
        }
        packet
    }

    /// Blocks until a packet is available and removes it.
    pub fn get(&self) -> Packet {
        let mut state = self.lock();
        loop {
            if let Some(packet) = state.packets.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return packet;
            }
            state = self
                .shared
                .not_empty
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like `get`, but gives up after `timeout`.
    pub fn get_timeout(&self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.packets.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .not_empty
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.dequeue(state)
    }

    /// Returns the head packet without removing it.
    pub fn peek(&self) -> Option<Packet> {
        self.lock().packets.front().cloned()
    }

    /// Removes the head packet if there is one.
    pub fn pop(&self) -> Option<Packet> {
        let state = self.lock();
        self.dequeue(state)
    }

    pub fn count(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().packets.is_empty()
    }
}

impl fmt::Debug for PacketQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketQueue")
            .field("id", &self.id())
            .field("filter", &self.filter())
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish()
    }
}
