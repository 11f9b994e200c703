//! Application-emitted tracking events and their bounded queue.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::telemetry::TelemetryRuntime;

pub const DEFAULT_QUEUE_SIZE: usize = 10_000;

/// One `track` call, as POSTed to the events endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub key: String,
    pub traffic_type_name: String,
    pub event_type_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Creation timestamp, epoch milliseconds.
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<HashMap<String, serde_json::Value>>,
}

/// Bounded drop-oldest event queue feeding the periodic flusher.
pub struct EventsQueue {
    queue: Mutex<VecDeque<Event>>,
    queue_size: usize,
    telemetry: Arc<TelemetryRuntime>,
}

impl EventsQueue {
    pub fn new(queue_size: usize, telemetry: Arc<TelemetryRuntime>) -> EventsQueue {
        EventsQueue {
            queue: Mutex::new(VecDeque::new()),
            queue_size: queue_size.max(1),
            telemetry,
        }
    }

    pub fn push(&self, event: Event) {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding events lock should not panic");
        if queue.len() >= self.queue_size {
            queue.pop_front();
            self.telemetry.record_events_dropped(1);
        }
        queue.push_back(event);
        self.telemetry.record_events_queued(1);
    }

    pub fn pop_batch(&self, max: usize) -> Vec<Event> {
        let mut queue = self
            .queue
            .lock()
            .expect("thread holding events lock should not panic");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.queue
            .lock()
            .expect("thread holding events lock should not panic")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> Event {
        Event {
            key: "alice".to_owned(),
            traffic_type_name: "user".to_owned(),
            event_type_id: event_type.to_owned(),
            value: None,
            timestamp: 1675443537882,
            properties: None,
        }
    }

    #[test]
    fn queue_preserves_order_and_bounds() {
        let queue = EventsQueue::new(2, Arc::new(TelemetryRuntime::new()));
        queue.push(event("a"));
        queue.push(event("b"));
        queue.push(event("c"));

        let batch = queue.pop_batch(10);
        let types: Vec<&str> = batch.iter().map(|e| e.event_type_id.as_str()).collect();
        assert_eq!(types, vec!["b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn serializes_with_camel_case_and_optional_fields() {
        let json = serde_json::to_value(event("page.view")).unwrap();
        assert_eq!(json["trafficTypeName"], "user");
        assert_eq!(json["eventTypeId"], "page.view");
        assert!(json.get("value").is_none());
        assert!(json.get("properties").is_none());
    }
}
