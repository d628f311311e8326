// src/bus.rs

//! In-process messaging between the pipeline stages.
//!
//! Scanner workers publish raw result events onto a bounded mpsc channel
//! owned by the result processor, which preserves the consume-once contract:
//! each event is classified by exactly one processor invocation. Every
//! classified result is then republished on its `.processed` topic for
//! downstream consumers, and manual scans additionally fan out through
//! per-user broadcast channels so interactive callers can watch their own
//! scans complete.

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

use crate::core::models::{ProcessedEvent, ProtocolFamily, ScanResultEvent};

const NOTIFICATION_BACKLOG: usize = 32;
const PROCESSED_BACKLOG: usize = 64;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("result channel closed, processor is gone")]
    Closed,
}

/// Publisher half of the scanner → processor channel.
#[derive(Clone)]
pub struct ResultBus {
    tx: mpsc::Sender<ScanResultEvent>,
}

pub fn result_bus(capacity: usize) -> (ResultBus, mpsc::Receiver<ScanResultEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ResultBus { tx }, rx)
}

impl ResultBus {
    /// Backpressure is intentional: a full channel makes the publisher wait
    /// rather than dropping the event.
    pub async fn publish(&self, event: ScanResultEvent) -> Result<(), BusError> {
        debug!(topic = %event.topic(), "publishing scan result event");
        self.tx.send(event).await.map_err(|_| BusError::Closed)
    }
}

/// Fan-out of classified results, one event per processed scan tagged with
/// its `{domain_key}.{protocol}.processed` topic. Subscribers filter by
/// topic; nobody listening is not an error.
#[derive(Clone)]
pub struct ProcessedBus {
    tx: broadcast::Sender<(String, ProcessedEvent)>,
}

impl ProcessedBus {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(PROCESSED_BACKLOG).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, ProcessedEvent)> {
        self.tx.subscribe()
    }

    pub fn publish(&self, protocol: ProtocolFamily, event: ProcessedEvent) {
        let topic = event.topic(protocol);
        debug!(%topic, "republishing processed result");
        let _ = self.tx.send((topic, event));
    }
}

impl Default for ProcessedBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-user fan-out for processed manual scans. Scheduled scans carry no
/// user key and never reach this hub.
#[derive(Default)]
pub struct NotificationHub {
    channels: Mutex<HashMap<String, broadcast::Sender<ProcessedEvent>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, user_key: &str) -> broadcast::Receiver<ProcessedEvent> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(user_key.to_string())
            .or_insert_with(|| broadcast::channel(NOTIFICATION_BACKLOG).0)
            .subscribe()
    }

    /// Delivers to every live subscriber of `user_key`. Nobody listening is
    /// not an error; the channel is dropped once its last receiver is gone.
    pub async fn notify(&self, user_key: &str, event: ProcessedEvent) {
        let mut channels = self.channels.lock().await;
        let Some(sender) = channels.get(user_key) else {
            return;
        };
        if sender.send(event).is_err() {
            channels.remove(user_key);
            debug!(user_key, "dropped notification channel with no receivers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::{ClassifiedResult, RawScanResult, ScanStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn processed(domain_key: &str) -> ProcessedEvent {
        ProcessedEvent {
            shared_id: None,
            domain_key: domain_key.to_string(),
            status: ScanStatus::Pass,
            results: ClassifiedResult {
                scan_id: Uuid::new_v4(),
                domain_key: domain_key.to_string(),
                shared_id: None,
                status: ScanStatus::Pass,
                categories: BTreeMap::new(),
                raw_result: RawScanResult::Unreachable,
                ruleset_version: "1.0.0".into(),
                timestamp: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn each_subscriber_sees_the_event() {
        let hub = NotificationHub::new();
        let mut first = hub.subscribe("user-1").await;
        let mut second = hub.subscribe("user-1").await;

        hub.notify("user-1", processed("dom-1")).await;

        assert_eq!(first.recv().await.unwrap().domain_key, "dom-1");
        assert_eq!(second.recv().await.unwrap().domain_key, "dom-1");
    }

    #[tokio::test]
    async fn other_users_hear_nothing() {
        let hub = NotificationHub::new();
        let mut theirs = hub.subscribe("user-2").await;

        hub.subscribe("user-1").await;
        hub.notify("user-1", processed("dom-1")).await;

        assert!(matches!(
            theirs.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn processed_events_carry_their_topic() {
        use crate::core::models::ProtocolFamily;

        let bus = ProcessedBus::new();
        let mut feed = bus.subscribe();

        bus.publish(ProtocolFamily::Https, processed("dom-1"));

        let (topic, event) = feed.recv().await.unwrap();
        assert_eq!(topic, "dom-1.https.processed");
        assert_eq!(event.domain_key, "dom-1");

        // Publishing with every receiver gone must not error out.
        drop(feed);
        bus.publish(ProtocolFamily::Tls, processed("dom-2"));
    }

    #[tokio::test]
    async fn notify_without_subscribers_is_a_no_op() {
        let hub = NotificationHub::new();
        hub.notify("nobody", processed("dom-1")).await;
    }

    #[tokio::test]
    async fn publish_fails_once_the_consumer_is_gone() {
        let (bus, rx) = result_bus(4);
        drop(rx);
        let event = ScanResultEvent {
            scan_id: Uuid::new_v4(),
            domain: "example.org".into(),
            domain_key: "dom-1".into(),
            user_key: None,
            shared_id: None,
            protocol: crate::core::models::ProtocolFamily::Tls,
            results: RawScanResult::Unreachable,
        };
        assert!(matches!(bus.publish(event).await, Err(BusError::Closed)));
    }
}
