//! Status fan-out: routes bus events to websocket subscribers by topic key.
//!
//! Topic keys look like `video:<id>`. Every subscriber owns a bounded FIFO
//! queue; a subscriber that stops draining loses its oldest messages rather
//! than blocking the dispatch path, and each drop bumps the `slow_consumer`
//! counter. Ordering within one subscriber is preserved across all the topics
//! it is attached to.

#![allow(dead_code)] // Metrics accessors are read by tests and dashboards

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::bus::{Bus, StatusEvent, TOPIC_VIDEO_STATUS};

/// Topic key for one video's status stream.
pub fn video_topic_key(video_id: &str) -> String {
    format!("video:{}", video_id)
}

/// One connected consumer. Cheap to clone behind an `Arc`.
pub struct Subscriber {
    id: String,
    queue: Mutex<VecDeque<StatusEvent>>,
    notify: Notify,
    closed: AtomicBool,
    depth: usize,
}

impl Subscriber {
    fn new(depth: usize) -> Self {
        Self {
            id: crate::metadata::new_object_id(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            depth,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Enqueue an event, dropping the oldest when the queue is full.
    /// Returns true when something was dropped.
    fn push(&self, event: StatusEvent) -> bool {
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = if queue.len() >= self.depth {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Await the next event. Returns `None` once the subscriber is closed and
    /// drained.
    pub async fn recv(&self) -> Option<StatusEvent> {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

pub struct FanoutService {
    subscribers: DashMap<String, Vec<Arc<Subscriber>>>,
    depth: usize,
    slow_consumer_drops: AtomicU64,
}

impl FanoutService {
    pub fn new(depth: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            depth: depth.max(1),
            slow_consumer_drops: AtomicU64::new(0),
        }
    }

    /// Create an unattached subscriber (one per websocket connection).
    pub fn subscriber(&self) -> Arc<Subscriber> {
        Arc::new(Subscriber::new(self.depth))
    }

    /// Attach a subscriber to a topic key. Attaching twice is a no-op.
    pub fn attach(&self, topic_key: &str, subscriber: &Arc<Subscriber>) {
        let mut entry = self.subscribers.entry(topic_key.to_string()).or_default();
        if !entry.iter().any(|s| s.id == subscriber.id) {
            entry.push(subscriber.clone());
        }
    }

    pub fn detach(&self, topic_key: &str, subscriber: &Arc<Subscriber>) {
        if let Some(mut entry) = self.subscribers.get_mut(topic_key) {
            entry.retain(|s| s.id != subscriber.id);
        }
        self.subscribers
            .remove_if(topic_key, |_, subs| subs.is_empty());
    }

    /// Detach from every topic and wake pending `recv` calls.
    pub fn disconnect(&self, subscriber: &Arc<Subscriber>) {
        subscriber.close();
        self.subscribers.retain(|_, subs| {
            subs.retain(|s| s.id != subscriber.id);
            !subs.is_empty()
        });
    }

    /// Route one event to every subscriber of its video topic.
    pub fn dispatch(&self, event: &StatusEvent) {
        let key = video_topic_key(&event.video_id);
        if let Some(subs) = self.subscribers.get(&key) {
            for sub in subs.iter() {
                if sub.push(event.clone()) {
                    self.slow_consumer_drops.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "slow_consumer: subscriber {} dropped oldest event on {}",
                        sub.id(),
                        key
                    );
                }
            }
        }
    }

    pub fn slow_consumer_drops(&self) -> u64 {
        self.slow_consumer_drops.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, topic_key: &str) -> usize {
        self.subscribers
            .get(topic_key)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Bridge the bus into this fan-out: consumes `video:status` and routes
    /// each event by topic key until the task is aborted.
    pub fn spawn_dispatcher(self: &Arc<Self>, bus: Arc<Bus>) -> tokio::task::JoinHandle<()> {
        let fanout = self.clone();
        tokio::spawn(async move {
            let mut rx = bus.subscribe(TOPIC_VIDEO_STATUS);
            loop {
                match rx.recv().await {
                    Ok(event) => fanout.dispatch(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("fan-out dispatcher lagged by {} events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
