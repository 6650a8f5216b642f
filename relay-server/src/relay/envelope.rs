//! Payload and envelope types flowing through the relay queue.
//!
//! The queue never interprets a payload. The only reader of its contents is
//! [`PayloadSummary`], which pulls a sender and a short preview out of
//! webhook-shaped payloads for logging.

use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

/// One inbound event, kept as an opaque JSON object.
pub type Payload = Map<String, Value>;

/// Maximum characters of message text included in log previews.
const PREVIEW_CHARS: usize = 30;

/// A payload plus the bookkeeping attached when it enters the queue.
///
/// Serializes flat: the payload's own keys followed by `queued_at`
/// (unix seconds) and `attempts`, which is exactly what the sink receives.
/// Payload keys with those two names are replaced by the envelope's values.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub payload: Payload,
    pub queued_at: DateTime<Utc>,
    pub attempts: u32,
}

impl Envelope {
    /// Wrap a payload at enqueue time with zero attempts.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            queued_at: Utc::now(),
            attempts: 0,
        }
    }

    /// Log identity of the wrapped payload.
    pub fn summary(&self) -> PayloadSummary {
        PayloadSummary::of(&self.payload)
    }
}

const QUEUED_AT: &str = "queued_at";
const ATTEMPTS: &str = "attempts";

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let own = self
            .payload
            .iter()
            .filter(|(key, _)| key.as_str() != QUEUED_AT && key.as_str() != ATTEMPTS);

        let mut map = serializer.serialize_map(None)?;
        for (key, value) in own {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry(QUEUED_AT, &(self.queued_at.timestamp_millis() as f64 / 1000.0))?;
        map.serialize_entry(ATTEMPTS, &self.attempts)?;
        map.end()
    }
}

/// Sender and short text preview of a payload, for log lines only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSummary {
    pub sender: String,
    pub preview: String,
}

impl PayloadSummary {
    /// Best-effort extraction; never fails.
    ///
    /// Webhook payloads carry the message under
    /// `entry[].changes[] (field == "messages") .value.messages[0]`. Anything
    /// else falls back to top-level `from`/`type`/`text` keys.
    pub fn of(payload: &Payload) -> Self {
        let message = first_webhook_message(payload);
        let source = message.unwrap_or(payload);

        let sender = source
            .get("from")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        Self {
            sender,
            preview: preview_of(source),
        }
    }
}

/// Sender phone number of a webhook payload, if it has one.
pub fn webhook_sender(payload: &Payload) -> Option<&str> {
    first_webhook_message(payload)?.get("from")?.as_str()
}

fn first_webhook_message(payload: &Payload) -> Option<&Payload> {
    payload
        .get("entry")?
        .as_array()?
        .iter()
        .filter_map(|entry| entry.get("changes")?.as_array())
        .flatten()
        .filter(|change| change.get("field").and_then(Value::as_str) == Some("messages"))
        .find_map(|change| {
            change
                .get("value")?
                .get("messages")?
                .as_array()?
                .first()?
                .as_object()
        })
}

fn preview_of(message: &Payload) -> String {
    let kind = message.get("type").and_then(Value::as_str);

    match (kind, message.get("text")) {
        (Some("text") | None, Some(text)) => {
            // Webhooks nest the body under text.body; synthetic payloads use a plain string.
            let body = text
                .get("body")
                .and_then(Value::as_str)
                .or_else(|| text.as_str())
                .unwrap_or("N/A");
            body.chars().take(PREVIEW_CHARS).collect()
        }
        (Some(kind), _) => format!("[{}]", kind),
        (None, None) => "N/A".to_string(),
    }
}
