//! Parsing of streaming notifications out of SSE message payloads.
//!
//! Message data arrives wrapped in a broker envelope whose `data` field is a
//! JSON-encoded string carrying the actual notification. Occupancy metadata
//! travels on the control channels under the `[meta]occupancy` name.
use base64::Engine;
use serde::Deserialize;

use crate::splits::{ChangeNumber, Split};

pub const OCCUPANCY_NAME: &str = "[meta]occupancy";

/// Feed-changing notifications handed to the sync manager.
#[derive(Debug, Clone)]
pub enum Notification {
    SplitUpdate {
        change_number: ChangeNumber,
        previous_change_number: Option<ChangeNumber>,
        /// Inline definition, present when the notification carries the
        /// whole changed flag.
        definition: Option<Split>,
    },
    SplitKill {
        change_number: ChangeNumber,
        split_name: String,
        default_treatment: String,
    },
    SegmentUpdate {
        change_number: ChangeNumber,
        segment_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlType {
    StreamingEnabled,
    StreamingPaused,
    StreamingResumed,
    StreamingDisabled,
}

/// Everything a `message` SSE event can carry.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Notification(Notification),
    Control(ControlType),
    Occupancy { channel: String, publishers: i64 },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    channel: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Payload {
    #[serde(rename = "SPLIT_UPDATE", rename_all = "camelCase")]
    SplitUpdate {
        change_number: ChangeNumber,
        #[serde(default)]
        pcn: Option<ChangeNumber>,
        #[serde(default)]
        d: Option<String>,
        #[serde(default)]
        c: Option<u8>,
    },
    #[serde(rename = "SPLIT_KILL", rename_all = "camelCase")]
    SplitKill {
        change_number: ChangeNumber,
        split_name: String,
        default_treatment: String,
    },
    #[serde(rename = "SEGMENT_UPDATE", rename_all = "camelCase")]
    SegmentUpdate {
        change_number: ChangeNumber,
        segment_name: String,
    },
    #[serde(rename = "CONTROL", rename_all = "camelCase")]
    Control { control_type: ControlType },
}

#[derive(Debug, Deserialize)]
struct OccupancyPayload {
    metrics: OccupancyMetrics,
}

#[derive(Debug, Deserialize)]
struct OccupancyMetrics {
    publishers: i64,
}

/// Parse the `data` of a `message` SSE event.
pub fn parse_message(data: &str) -> Result<IncomingMessage, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(data)?;

    if envelope.name.as_deref() == Some(OCCUPANCY_NAME) {
        let payload: OccupancyPayload = serde_json::from_str(&envelope.data)?;
        return Ok(IncomingMessage::Occupancy {
            channel: envelope.channel,
            publishers: payload.metrics.publishers,
        });
    }

    let payload: Payload = serde_json::from_str(&envelope.data)?;
    Ok(match payload {
        Payload::SplitUpdate {
            change_number,
            pcn,
            d,
            c,
        } => IncomingMessage::Notification(Notification::SplitUpdate {
            change_number,
            previous_change_number: pcn.filter(|pcn| *pcn > 0),
            definition: decode_definition(d.as_deref(), c),
        }),
        Payload::SplitKill {
            change_number,
            split_name,
            default_treatment,
        } => IncomingMessage::Notification(Notification::SplitKill {
            change_number,
            split_name,
            default_treatment,
        }),
        Payload::SegmentUpdate {
            change_number,
            segment_name,
        } => IncomingMessage::Notification(Notification::SegmentUpdate {
            change_number,
            segment_name,
        }),
        Payload::Control { control_type } => IncomingMessage::Control(control_type),
    })
}

/// Decode an inline flag definition. Only the uncompressed encoding is
/// handled; compressed payloads fall back to a catch-up fetch by returning
/// `None`.
fn decode_definition(encoded: Option<&str>, compression: Option<u8>) -> Option<Split> {
    let encoded = encoded?;
    if compression.unwrap_or(0) != 0 {
        log::debug!(target: "splitio", "compressed inline definition; deferring to catch-up fetch");
        return None;
    }
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    match serde_json::from_slice(&raw) {
        Ok(split) => Some(split),
        Err(err) => {
            log::warn!(target: "splitio", "unable to parse inline flag definition: {err}");
            None
        }
    }
}

/// The `error` SSE event payload pushed by the streaming broker.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub status_code: i64,
    #[serde(default)]
    pub message: String,
}

impl StreamingError {
    pub fn parse(data: &str) -> Result<StreamingError, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Token-expiry error codes ask for a reauth + reconnect; other 40xxx
    /// codes are client errors that won't go away by retrying.
    pub fn is_retryable(&self) -> bool {
        (40140..=40149).contains(&self.code) || !(40000..50000).contains(&self.code)
    }
}
