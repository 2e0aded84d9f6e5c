//! Change-feed types and subscription plumbing.
//!
//! The event store delivers, per category, either a full result-set
//! snapshot or an error callback. This module models that boundary as an
//! explicit channel with a cancel handle so teardown and error propagation
//! are structural, and normalizes the heterogeneous timestamp encodings
//! the raw documents carry (see [`normalize`]).

pub mod normalize;

pub use normalize::{normalize_timestamp, RawTimestamp};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Behavioral event categories, each backed by its own stored collection
/// and change feed. Across categories there is no ordering dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Infringement,
    OutOfClass,
    Affirmation,
}

impl EventCategory {
    /// Name of the stored collection backing this category.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Infringement => "infringements",
            Self::OutOfClass => "outofclass",
            Self::Affirmation => "affirmations",
        }
    }

    pub const ALL: [EventCategory; 3] = [
        EventCategory::Infringement,
        EventCategory::OutOfClass,
        EventCategory::Affirmation,
    ];
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.collection())
    }
}

/// One raw document as delivered by the change feed: a store-assigned id
/// plus loosely-typed fields. Field shapes vary by category and source
/// version; the aggregation layer owns turning this into a typed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawEvent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Attach a field (builder style, used by store adapters and tests).
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// A field as a non-empty string, if present.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The raw timestamp field under whichever encoding it arrived in.
    pub fn timestamp(&self) -> Option<RawTimestamp> {
        self.fields.get("timestamp").and_then(RawTimestamp::from_value)
    }
}

/// One delivery from a category's change feed.
#[derive(Debug, Clone)]
pub enum FeedMessage {
    /// The current full result set for the collection. Replaces, never
    /// merges with, the previous snapshot.
    Snapshot(Vec<RawEvent>),
    /// Delivery failure; the last-known-good view stays in place.
    Error(String),
}

/// Sending half handed to the host's store adapter.
#[derive(Clone)]
pub struct FeedSender {
    category: EventCategory,
    tx: mpsc::Sender<FeedMessage>,
}

impl FeedSender {
    /// Deliver a snapshot. Returns false once the subscriber is gone.
    pub async fn snapshot(&self, events: Vec<RawEvent>) -> bool {
        debug!(category = %self.category, docs = events.len(), "feed snapshot delivered");
        self.tx.send(FeedMessage::Snapshot(events)).await.is_ok()
    }

    /// Deliver a subscription error.
    pub async fn error(&self, reason: impl Into<String>) -> bool {
        self.tx.send(FeedMessage::Error(reason.into())).await.is_ok()
    }
}

/// Receiving half owned by the engine. Cancelling tears the feed down;
/// the sender observes closure on its next delivery.
pub struct FeedSubscription {
    category: EventCategory,
    rx: mpsc::Receiver<FeedMessage>,
    token: CancellationToken,
}

impl FeedSubscription {
    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Next delivery, or `None` once the feed is cancelled or the sender
    /// side is gone.
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        tokio::select! {
            _ = self.token.cancelled() => {
                self.rx.close();
                None
            }
            msg = self.rx.recv() => msg,
        }
    }

    /// Token the host can clone to tie other teardown to this feed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tear the subscription down.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Create a feed channel pair for one category.
pub fn feed_channel(category: EventCategory, capacity: usize) -> (FeedSender, FeedSubscription) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        FeedSender { category, tx },
        FeedSubscription {
            category,
            rx,
            token: CancellationToken::new(),
        },
    )
}
