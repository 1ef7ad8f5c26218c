//! Topic-keyed pub/sub channel between the transcoder workers and the API
//! replicas.
//!
//! Each replica holds one broker that multiplexes every topic over in-process
//! broadcast channels. Delivery is at-least-once while a subscriber is
//! connected; a subscriber that falls behind its channel capacity loses the
//! oldest messages (surfaced as `Lagged` on the receiver). Subscribers that
//! reconnect get a fresh cursor; cross-disconnect delivery is best-effort.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Topic carrying worker status events.
pub const TOPIC_VIDEO_STATUS: &str = "video:status";

/// Terminal and progress statuses a worker may publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Processing,
    Ready,
    Failed,
}

/// Media facts the worker derives while transcoding; rides on `ready` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub manifest_url: String,
    pub duration_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
}

/// Status event published on `video:status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub video_id: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaInfo>,
}

impl StatusEvent {
    pub fn processing(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            status: EventStatus::Processing,
            error: None,
            ts: Utc::now(),
            media: None,
        }
    }

    pub fn ready(video_id: impl Into<String>, media: MediaInfo) -> Self {
        Self {
            video_id: video_id.into(),
            status: EventStatus::Ready,
            error: None,
            ts: Utc::now(),
            media: Some(media),
        }
    }

    pub fn failed(video_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            status: EventStatus::Failed,
            error: Some(error.into()),
            ts: Utc::now(),
            media: None,
        }
    }
}

/// Per-replica broker multiplexing all topics.
pub struct Bus {
    topics: DashMap<String, broadcast::Sender<StatusEvent>>,
    capacity: usize,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<StatusEvent> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Publish an event; returns how many subscribers saw it.
    pub fn publish(&self, topic: &str, event: StatusEvent) -> usize {
        let sender = self.sender(topic);
        match sender.send(event) {
            Ok(n) => n,
            // No live subscribers; fine, delivery is best-effort here.
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<StatusEvent> {
        self.sender(topic).subscribe()
    }
}
