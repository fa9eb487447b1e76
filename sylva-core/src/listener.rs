//! Synchronous publish/subscribe queues.
//!
//! An [`EventBus`] keeps one queue per subscriber. Publishing clones the
//! event into every live queue; subscribers drain their own queue by id.
//! The bus never holds a reference to a subscriber, so publisher and
//! subscriber can be owned independently without reference cycles.
//!
//! Queues follow the store/restore protocol of their owner: a restore puts
//! every queue back to its contents at the matching store, so events
//! published before the store and drained afterwards are delivered again.

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubscriptionId(usize);

impl SubscriptionId {
    /// The raw slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Queue<E> {
    pending: Vec<E>,
    stored: Vec<E>,
}

impl<E> Queue<E> {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            stored: Vec::new(),
        }
    }
}

/// Per-subscriber event queues.
#[derive(Debug, Clone)]
pub struct EventBus<E> {
    queues: Vec<Option<Queue<E>>>,
}

impl<E: Clone> EventBus<E> {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self { queues: Vec::new() }
    }

    /// Register a new subscriber.
    pub fn subscribe(&mut self) -> SubscriptionId {
        if let Some(slot) = self.queues.iter().position(Option::is_none) {
            self.queues[slot] = Some(Queue::new());
            return SubscriptionId(slot);
        }
        self.queues.push(Some(Queue::new()));
        SubscriptionId(self.queues.len() - 1)
    }

    /// Drop a subscriber and its pending events. Unknown ids are ignored.
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        if let Some(slot) = self.queues.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Enqueue `event` for every live subscriber.
    pub fn publish(&mut self, event: E) {
        for queue in self.queues.iter_mut().flatten() {
            queue.pending.push(event.clone());
        }
    }

    /// Take all pending events for `id` (empty for unknown ids).
    pub fn drain(&mut self, id: SubscriptionId) -> Vec<E> {
        match self.queues.get_mut(id.0) {
            Some(Some(queue)) => std::mem::take(&mut queue.pending),
            _ => Vec::new(),
        }
    }

    /// Number of events waiting for `id`.
    pub fn pending(&self, id: SubscriptionId) -> usize {
        match self.queues.get(id.0) {
            Some(Some(queue)) => queue.pending.len(),
            _ => 0,
        }
    }

    /// Discard pending and stored events for every subscriber.
    pub fn clear(&mut self) {
        for queue in self.queues.iter_mut().flatten() {
            queue.pending.clear();
            queue.stored.clear();
        }
    }

    /// Snapshot every queue.
    pub fn store(&mut self) {
        for queue in self.queues.iter_mut().flatten() {
            queue.stored.clone_from(&queue.pending);
        }
    }

    /// Put every queue back to its last snapshot.
    pub fn restore(&mut self) {
        for queue in self.queues.iter_mut().flatten() {
            queue.pending.clone_from(&queue.stored);
        }
    }

    /// Make the current queues the snapshot.
    pub fn accept(&mut self) {
        self.store();
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.queues.iter().filter(|q| q.is_some()).count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
