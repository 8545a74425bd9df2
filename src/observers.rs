//! In-process pub/sub for subsystem events.
//!
//! Each topic owns its subscriber list; publishing fans out sequentially
//! under the topic lock so observers see events in the order the originating
//! mutations committed. A subscription is an owned handle; dropping it
//! unsubscribes.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::Hash;

/// Events published by the blockchain engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockAdded {
    /// A block extended the main chain.
    MainChain { hash: Hash, height: u64 },
    /// The chain switched to an alternative branch; hashes run from the
    /// common root (exclusive) to the new tip.
    ChainSwitch { from_height: u64, new_chain: Vec<Hash> },
    /// A block was stored as an alternative candidate.
    Alternative { hash: Hash, height: u64 },
}

/// Events published by the transaction pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolChanged {
    Added(Hash),
    Removed(Hash),
}

/// Events published by the transfers synchronizer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransfersUpdated {
    TransactionUpdated { account: usize, tx_hash: Hash },
    TransactionDeleted { account: usize, tx_hash: Hash },
    TransfersLocked { account: usize, count: usize },
    TransfersUnlocked { account: usize, count: usize },
}

struct TopicInner<T> {
    subscribers: Vec<(u64, Arc<Queue<T>>)>,
    next_id: u64,
}

struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    signal: Condvar,
}

/// A typed broadcast topic.
pub struct Topic<T: Clone> {
    inner: Mutex<TopicInner<T>>,
}

/// An owned subscription to a topic. Dropping it unsubscribes.
pub struct Subscription<T: Clone> {
    id: u64,
    queue: Arc<Queue<T>>,
    topic: Arc<Topic<T>>,
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Topic {
            inner: Mutex::new(TopicInner {
                subscribers: Vec::new(),
                next_id: 0,
            }),
        }
    }
}

impl<T: Clone> Topic<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber and hand back its event queue.
    pub fn subscribe(self: &Arc<Self>) -> Subscription<T> {
        let queue = Arc::new(Queue {
            items: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        });
        let mut inner = self.inner.lock().expect("topic lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push((id, queue.clone()));
        Subscription {
            id,
            queue,
            topic: self.clone(),
        }
    }

    /// Deliver an event to every live subscriber, in subscription order.
    pub fn publish(&self, event: T) {
        let inner = self.inner.lock().expect("topic lock poisoned");
        for (_, queue) in &inner.subscribers {
            let mut items = queue.items.lock().expect("queue lock poisoned");
            items.push_back(event.clone());
            queue.signal.notify_one();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("topic lock poisoned").subscribers.len()
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("topic lock poisoned");
        inner.subscribers.retain(|(sid, _)| *sid != id);
    }
}

impl<T: Clone> Subscription<T> {
    /// Pop the next pending event without blocking.
    pub fn try_recv(&self) -> Option<T> {
        self.queue
            .items
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
    }

    /// Block until an event arrives or the timeout elapses.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut items = self.queue.items.lock().expect("queue lock poisoned");
        loop {
            if let Some(event) = items.pop_front() {
                return Some(event);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .queue
                .signal
                .wait_timeout(items, deadline - now)
                .expect("queue lock poisoned");
            items = guard;
            if result.timed_out() && items.is_empty() {
                return None;
            }
        }
    }

    /// Drain every pending event.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.queue.items.lock().expect("queue lock poisoned");
        items.drain(..).collect()
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.topic.unsubscribe(self.id);
    }
}

/// The node's event topics, created once at startup and threaded through as
/// an explicit context.
pub struct EventBus {
    pub block_added: Arc<Topic<BlockAdded>>,
    pub pool_changed: Arc<Topic<PoolChanged>>,
    pub transfers_updated: Arc<Topic<TransfersUpdated>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(EventBus {
            block_added: Topic::new(),
            pool_changed: Topic::new(),
            transfers_updated: Topic::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_all_subscribers_in_order() {
        let topic: Arc<Topic<u32>> = Topic::new();
        let a = topic.subscribe();
        let b = topic.subscribe();
        topic.publish(1);
        topic.publish(2);
        assert_eq!(a.drain(), vec![1, 2]);
        assert_eq!(b.drain(), vec![1, 2]);
    }

    #[test]
    fn drop_unsubscribes() {
        let topic: Arc<Topic<u32>> = Topic::new();
        let a = topic.subscribe();
        assert_eq!(topic.subscriber_count(), 1);
        drop(a);
        assert_eq!(topic.subscriber_count(), 0);
        // Publishing with no subscribers is a no-op.
        topic.publish(7);
    }

    #[test]
    fn try_recv_empty_is_none() {
        let topic: Arc<Topic<u32>> = Topic::new();
        let sub = topic.subscribe();
        assert_eq!(sub.try_recv(), None);
        topic.publish(3);
        assert_eq!(sub.try_recv(), Some(3));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn recv_timeout_wakes_on_publish() {
        let topic: Arc<Topic<u32>> = Topic::new();
        let sub = topic.subscribe();
        let t = topic.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            t.publish(42);
        });
        let got = sub.recv_timeout(std::time::Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got, Some(42));
    }

    #[test]
    fn recv_timeout_expires() {
        let topic: Arc<Topic<u32>> = Topic::new();
        let sub = topic.subscribe();
        let got = sub.recv_timeout(std::time::Duration::from_millis(10));
        assert_eq!(got, None);
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let topic: Arc<Topic<u32>> = Topic::new();
        topic.publish(1);
        let sub = topic.subscribe();
        topic.publish(2);
        assert_eq!(sub.drain(), vec![2]);
    }
}
