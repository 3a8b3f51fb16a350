use std::collections::{vec_deque, VecDeque};

/// What a bounded [`MessageQueue`] gives up when it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued message to make room for the incoming one.
    DropOldest,
    /// Reject the incoming message and keep the queue as is.
    #[default]
    DropNewest,
}

/// Capacity bound for a [`MessageQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimit {
    /// Maximum number of messages held at once.
    pub capacity: usize,
    /// Which message to give up on overflow.
    pub policy: OverflowPolicy,
}

impl QueueLimit {
    pub const fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self { capacity, policy }
    }
}

/// An ordered FIFO of messages.
///
/// Messages are never reordered or coalesced. Both ends are O(1), and so is
/// [`MessageQueue::is_empty`], which the driver calls on every pass to decide
/// whether a channel needs to be polled for writing.
///
/// The queue is unbounded unless constructed with a [`QueueLimit`]. A bounded queue hands
/// the message it gave up back to the caller, so the caller can still resolve it.
#[derive(Debug, Clone)]
pub struct MessageQueue<T> {
    inner: VecDeque<T>,
    limit: Option<QueueLimit>,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    /// Creates an unbounded queue.
    pub fn new() -> Self {
        Self { inner: VecDeque::new(), limit: None }
    }

    /// Creates a queue bounded by `limit`.
    pub fn bounded(limit: QueueLimit) -> Self {
        Self::with_limit(Some(limit))
    }

    /// Creates a queue with an optional bound.
    pub fn with_limit(limit: Option<QueueLimit>) -> Self {
        let inner = match limit {
            // Don't preallocate huge limits up front.
            Some(limit) => VecDeque::with_capacity(limit.capacity.min(128)),
            None => VecDeque::new(),
        };

        Self { inner, limit }
    }

    /// Appends `msg` to the back of the queue.
    ///
    /// Returns the message that was given up if the queue is bounded and full: the oldest
    /// queued message under [`OverflowPolicy::DropOldest`], `msg` itself under
    /// [`OverflowPolicy::DropNewest`].
    #[must_use = "an evicted message must be resolved by the caller"]
    pub fn enqueue(&mut self, msg: T) -> Option<T> {
        let Some(limit) = self.limit else {
            self.inner.push_back(msg);
            return None;
        };

        if self.inner.len() < limit.capacity {
            self.inner.push_back(msg);
            return None;
        }

        match limit.policy {
            OverflowPolicy::DropNewest => Some(msg),
            OverflowPolicy::DropOldest => match self.inner.pop_front() {
                Some(oldest) => {
                    self.inner.push_back(msg);
                    Some(oldest)
                }
                // Zero capacity, nothing to evict.
                None => Some(msg),
            },
        }
    }

    /// Removes and returns the oldest message.
    #[inline]
    pub fn dequeue(&mut self) -> Option<T> {
        self.inner.pop_front()
    }

    /// Returns a reference to the oldest message without removing it.
    #[inline]
    pub fn front(&self) -> Option<&T> {
        self.inner.front()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns the bound of this queue, if any.
    pub fn limit(&self) -> Option<QueueLimit> {
        self.limit
    }

    /// Removes all messages, oldest first.
    pub fn drain(&mut self) -> vec_deque::Drain<'_, T> {
        self.inner.drain(..)
    }

    /// Iterates over the queued messages, oldest first.
    pub fn iter(&self) -> vec_deque::Iter<'_, T> {
        self.inner.iter()
    }
}
