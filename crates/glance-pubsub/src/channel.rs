// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Replaying broadcast channel.
//!
//! ```text
//! publish(v) ──► buffer ──────────────┐ (snapshot at subscribe time)
//!     │                               ▼
//!     ├──► [queue 1] ──► Subscription 1 (history, then live)
//!     ├──► [queue 2] ──► Subscription 2
//!     └──► [queue N] ──► Subscription N
//! ```
//!
//! ## Rules
//! - **Non-blocking publish**: every subscriber owns an unbounded queue, so a
//!   slow consumer grows its own queue instead of stalling the publisher.
//! - **Gapless replay**: the history snapshot and the attachment of the new
//!   queue happen inside one critical section.
//! - **Short critical sections**: the mutex guards the buffer and the
//!   subscriber set only; it is never held across delivery I/O.
//! - **Per-subscriber FIFO**: each subscriber sees values in publish order.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::debug;

struct Inner<T> {
    buffer: VecDeque<T>,
    subscribers: Vec<(u64, mpsc::UnboundedSender<T>)>,
    next_id: u64,
}

impl<T> Inner<T> {
    fn detach(&mut self, id: u64) {
        self.subscribers.retain(|(sub_id, _)| *sub_id != id);
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    // Every mutation is a single push or remove; poisoning is ignored.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Broadcast channel that buffers every published value and replays the
/// buffer to late subscribers.
///
/// Cloning is cheap and yields a handle to the same channel.
pub struct BufferedChannel<T> {
    inner: Arc<Mutex<Inner<T>>>,
    capacity: Option<usize>,
}

impl<T> Clone for BufferedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

impl<T> Default for BufferedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for BufferedChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("BufferedChannel")
            .field("buffered", &inner.buffer.len())
            .field("subscribers", &inner.subscribers.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<T> BufferedChannel<T> {
    /// Create a channel with unbounded history.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::new(),
                subscribers: Vec::new(),
                next_id: 0,
            })),
            capacity: None,
        }
    }

    /// Create a channel whose history keeps at most `capacity` values; the
    /// oldest value is evicted first. A capacity of zero is clamped to one.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut channel = Self::new();
        channel.capacity = Some(capacity.max(1));
        channel
    }

    /// History cap, if any.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of values currently buffered.
    pub fn len(&self) -> usize {
        lock(&self.inner).buffer.len()
    }

    /// Returns `true` if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).buffer.is_empty()
    }

    /// Number of attached live subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Returns `true` if both handles refer to the same channel.
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Keep only the buffered values for which `keep` returns `true`.
    ///
    /// Returns the number of values removed.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut inner = lock(&self.inner);
        let before = inner.buffer.len();
        inner.buffer.retain(|v| keep(v));
        before - inner.buffer.len()
    }
}

impl<T: Clone> BufferedChannel<T> {
    /// Append `value` to the history and forward it to every live subscriber.
    ///
    /// Subscribers whose receiving side is gone are detached on the way.
    pub fn publish(&self, value: T) {
        let mut inner = lock(&self.inner);
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(value.clone()).is_ok());
        inner.buffer.push_back(value);
        if let Some(cap) = self.capacity {
            while inner.buffer.len() > cap {
                inner.buffer.pop_front();
                debug!(cap, "buffered channel full, evicted oldest value");
            }
        }
    }

    /// Snapshot of the buffered history, oldest first.
    pub fn buffer(&self) -> Vec<T> {
        lock(&self.inner).buffer.iter().cloned().collect()
    }

    /// Subscribe to the channel.
    ///
    /// - `include_buffered`: replay the history snapshot first.
    /// - `include_future`: keep delivering live values afterwards; when
    ///   `false` the subscription ends once the history is exhausted.
    pub fn subscribe(&self, include_buffered: bool, include_future: bool) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock(&self.inner);
        if include_buffered {
            for value in &inner.buffer {
                // The receiver is alive: it is owned by this stack frame.
                let _ = tx.send(value.clone());
            }
        }
        if !include_future {
            return Subscription {
                id: 0,
                rx,
                channel: None,
            };
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, tx));
        Subscription {
            id,
            rx,
            channel: Some(Arc::downgrade(&self.inner)),
        }
    }
}

impl<T: PartialEq> BufferedChannel<T> {
    /// Remove the first buffered value equal to `value`.
    ///
    /// Returns `true` if a value was removed. Live subscribers that already
    /// received it are unaffected.
    pub fn delete(&self, value: &T) -> bool {
        let mut inner = lock(&self.inner);
        match inner.buffer.iter().position(|v| v == value) {
            Some(idx) => {
                inner.buffer.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Live view over a [`BufferedChannel`].
///
/// Yields the buffered history (if requested) and then live values. Dropping
/// the subscription detaches it from the channel.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    channel: Option<Weak<Mutex<Inner<T>>>>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("attached", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}

impl<T> Subscription<T> {
    /// Receive the next value.
    ///
    /// Returns `None` once the subscription is finished: history exhausted for
    /// a history-only subscription, or after [`unsubscribe`](Self::unsubscribe)
    /// once already-queued values are drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Receive a value if one is queued right now.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Detach from the channel. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(channel) = self.channel.take().and_then(|w| w.upgrade()) {
            lock(&channel).detach(self.id);
        }
        self.rx.close();
    }

    /// Returns `true` while the subscription still receives live values.
    pub fn is_attached(&self) -> bool {
        self.channel.is_some()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next<T>(sub: &mut Subscription<T>) -> Option<T> {
        timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("recv timed out")
    }

    #[tokio::test]
    async fn late_subscriber_sees_history_then_live_values() {
        let ch = BufferedChannel::new();
        for i in 0..3 {
            ch.publish(i);
        }
        let mut sub = ch.subscribe(true, true);
        ch.publish(3);
        for expected in 0..4 {
            assert_eq!(next(&mut sub).await, Some(expected));
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn history_only_subscription_terminates() {
        let ch = BufferedChannel::new();
        ch.publish("a");
        ch.publish("b");
        let mut sub = ch.subscribe(true, false);
        ch.publish("c");
        assert_eq!(next(&mut sub).await, Some("a"));
        assert_eq!(next(&mut sub).await, Some("b"));
        assert_eq!(next(&mut sub).await, None);
        assert_eq!(ch.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn live_only_subscription_skips_history() {
        let ch = BufferedChannel::new();
        ch.publish(1);
        let mut sub = ch.subscribe(false, true);
        ch.publish(2);
        assert_eq!(next(&mut sub).await, Some(2));
    }

    #[test]
    fn capped_history_evicts_oldest_first() {
        let ch = BufferedChannel::with_capacity(2);
        for i in 0..5 {
            ch.publish(i);
        }
        assert_eq!(ch.buffer(), vec![3, 4]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let ch = BufferedChannel::with_capacity(0);
        ch.publish(1);
        assert_eq!(ch.capacity(), Some(1));
        assert_eq!(ch.len(), 1);
    }

    #[test]
    fn delete_removes_a_single_entry() {
        let ch = BufferedChannel::new();
        ch.publish(1);
        ch.publish(2);
        ch.publish(1);
        assert!(ch.delete(&1));
        assert_eq!(ch.buffer(), vec![2, 1]);
        assert!(!ch.delete(&7));
    }

    #[test]
    fn clones_share_identity() {
        let a = BufferedChannel::<u8>::new();
        let b = a.clone();
        assert!(a.same_channel(&b));
        assert!(!a.same_channel(&BufferedChannel::new()));
    }

    #[test]
    fn retain_reports_removed_count() {
        let ch = BufferedChannel::new();
        for i in 0..6 {
            ch.publish(i);
        }
        assert_eq!(ch.retain(|v| v % 2 == 0), 3);
        assert_eq!(ch.buffer(), vec![0, 2, 4]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_drop_detaches() {
        let ch = BufferedChannel::<u8>::new();
        let mut a = ch.subscribe(true, true);
        let b = ch.subscribe(true, true);
        assert_eq!(ch.subscriber_count(), 2);
        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_attached());
        assert_eq!(ch.subscriber_count(), 1);
        drop(b);
        assert_eq!(ch.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publisher() {
        let ch = BufferedChannel::new();
        let mut sub = ch.subscribe(false, true);
        for i in 0..10_000 {
            ch.publish(i);
        }
        assert_eq!(next(&mut sub).await, Some(0));
    }

    #[tokio::test]
    async fn concurrent_publishers_deliver_everything() {
        let ch = BufferedChannel::new();
        let mut sub = ch.subscribe(true, true);
        let mut handles = Vec::new();
        for t in 0..4u32 {
            let ch = ch.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100u32 {
                    ch.publish(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let mut seen = Vec::new();
        while let Some(v) = sub.try_recv() {
            seen.push(v);
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(seen, ch.buffer());
    }
}
