// src/processor.rs

//! The result processor: the single consumer of raw scan events.
//!
//! Each event is classified against the active ruleset, appended to history,
//! and only then folded into the domain's status map, so a reader that sees
//! a status already sees the record behind it. Every stored result is
//! republished on its `.processed` topic. Manual scans are routed to the
//! requesting user through the notification hub instead of the status map:
//! a one-off interactive scan must not disturb the aggregate that scheduled
//! sweeps maintain.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use crate::bus::{NotificationHub, ProcessedBus};
use crate::core::guidance::ruleset::GuidanceRuleSet;
use crate::core::guidance::{classify, overall_status};
use crate::core::models::{ClassifiedResult, ProcessedEvent, ScanResultEvent};
use crate::store::{ResultRepository, StoreError};

pub struct ResultProcessor {
    repository: Arc<dyn ResultRepository>,
    notifications: Arc<NotificationHub>,
    processed: ProcessedBus,
    ruleset: &'static GuidanceRuleSet,
}

impl ResultProcessor {
    pub fn new(
        repository: Arc<dyn ResultRepository>,
        notifications: Arc<NotificationHub>,
        processed: ProcessedBus,
        ruleset: &'static GuidanceRuleSet,
    ) -> Self {
        Self {
            repository,
            notifications,
            processed,
            ruleset,
        }
    }

    /// Classifies and persists one event, returning the stored record.
    #[instrument(skip(self, event), fields(scan_id = %event.scan_id, topic = %event.topic()))]
    pub async fn process(&self, event: ScanResultEvent) -> Result<ClassifiedResult, StoreError> {
        let categories = classify(event.protocol, &event.results, self.ruleset);
        let status = overall_status(&categories);

        let result = ClassifiedResult {
            scan_id: event.scan_id,
            domain_key: event.domain_key.clone(),
            shared_id: event.shared_id.clone(),
            status,
            categories,
            raw_result: event.results.clone(),
            ruleset_version: self.ruleset.version.to_string(),
            timestamp: Utc::now(),
        };

        // History before status: the map must never point at a record that
        // is not stored yet.
        self.repository.insert_result(result.clone()).await?;

        let processed = ProcessedEvent {
            shared_id: result.shared_id.clone(),
            domain_key: result.domain_key.clone(),
            status,
            results: result.clone(),
        };
        self.processed.publish(event.protocol, processed.clone());

        match &event.user_key {
            // Interactive scans answer their user and leave the aggregate
            // alone.
            Some(user_key) => {
                self.notifications.notify(user_key, processed).await;
            }
            None => {
                for (&category, guidance) in &result.categories {
                    self.repository
                        .update_status(&event.domain_key, category, guidance.status)
                        .await?;
                }
            }
        }

        info!(status = ?status, categories = result.categories.len(), "scan result processed");

        Ok(result)
    }

    /// Consumes events until the channel closes or shutdown is requested.
    /// A failed event is logged and dropped; the loop itself never dies.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ScanResultEvent>,
        shutdown: CancellationToken,
    ) {
        info!("result processor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("result processor stopping");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        info!("result channel closed, processor stopping");
                        break;
                    };
                    if let Err(e) = self.process(event).await {
                        error!(error = %e, "failed to persist classified result");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guidance::ruleset::{self, RULESET_V1};
    use crate::core::models::{
        MailResult, ProtocolFamily, RawScanResult, RecordProbe, ScanCategory, ScanStatus,
        SpfQualifier, SpfRecord,
    };
    use crate::store::MemoryRepository;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn event(user_key: Option<&str>, results: RawScanResult) -> ScanResultEvent {
        ScanResultEvent {
            scan_id: Uuid::new_v4(),
            domain: "example.org".into(),
            domain_key: "dom-1".into(),
            user_key: user_key.map(str::to_string),
            shared_id: Some("shared-1".into()),
            protocol: ProtocolFamily::MailDns,
            results,
        }
    }

    fn processor() -> (
        ResultProcessor,
        Arc<MemoryRepository>,
        Arc<NotificationHub>,
        ProcessedBus,
    ) {
        let repository = Arc::new(MemoryRepository::new());
        let notifications = Arc::new(NotificationHub::new());
        let processed = ProcessedBus::new();
        let processor = ResultProcessor::new(
            repository.clone(),
            notifications.clone(),
            processed.clone(),
            &RULESET_V1,
        );
        (processor, repository, notifications, processed)
    }

    fn spf_only_mail() -> RawScanResult {
        RawScanResult::Mail(MailResult {
            dmarc: RecordProbe::Missing,
            spf: RecordProbe::Found(SpfRecord {
                record: "v=spf1 -all".into(),
                all_qualifier: Some(SpfQualifier::Fail),
                lookup_count: 0,
            }),
            dkim: BTreeMap::new(),
        })
    }

    #[tokio::test]
    async fn processing_writes_history_then_status() {
        let (processor, repository, _, _) = processor();
        let result = processor.process(event(None, spf_only_mail())).await.unwrap();

        assert_eq!(result.status, ScanStatus::Fail);
        assert_eq!(result.ruleset_version, RULESET_V1.version);
        assert!(result.categories[&ScanCategory::Dmarc]
            .negative_tags
            .contains(ruleset::DMARC_MISSING));

        let history = repository.results_for_domain("dom-1").await.unwrap();
        assert_eq!(history.len(), 1);

        let map = repository.status_map("dom-1").await.unwrap();
        assert_eq!(map.dmarc, ScanStatus::Fail);
        assert_eq!(map.spf, ScanStatus::Pass);
        // The mail scan said nothing about the web categories.
        assert_eq!(map.https, ScanStatus::Unknown);
    }

    #[tokio::test]
    async fn manual_scans_notify_their_user_and_skip_the_aggregate() {
        let (processor, repository, notifications, _) = processor();
        let mut inbox = notifications.subscribe("user-1").await;

        processor
            .process(event(Some("user-1"), spf_only_mail()))
            .await
            .unwrap();

        let processed = inbox.recv().await.unwrap();
        assert_eq!(processed.domain_key, "dom-1");
        assert_eq!(processed.shared_id.as_deref(), Some("shared-1"));
        assert_eq!(processed.status, ScanStatus::Fail);

        // The one-off scan is on record but never touched the status map.
        assert_eq!(repository.results_for_domain("dom-1").await.unwrap().len(), 1);
        assert_eq!(
            repository.status_map("dom-1").await.unwrap(),
            crate::core::models::DomainStatusMap::default()
        );
    }

    #[tokio::test]
    async fn scheduled_scans_notify_nobody() {
        let (processor, _, notifications, _) = processor();
        let mut inbox = notifications.subscribe("user-1").await;

        processor.process(event(None, spf_only_mail())).await.unwrap();

        assert!(matches!(
            inbox.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn every_result_lands_on_its_processed_topic() {
        let (processor, _, _, processed) = processor();
        let mut feed = processed.subscribe();

        // A scheduled scan, so nothing flows through the user hub.
        processor.process(event(None, spf_only_mail())).await.unwrap();

        let (topic, republished) = feed.recv().await.unwrap();
        assert_eq!(topic, "dom-1.mail_dns.processed");
        assert_eq!(republished.domain_key, "dom-1");
        assert_eq!(republished.shared_id.as_deref(), Some("shared-1"));
        assert_eq!(republished.status, ScanStatus::Fail);

        // Manual scans are republished too, on top of the user delivery.
        processor
            .process(event(Some("user-1"), spf_only_mail()))
            .await
            .unwrap();
        let (topic, _) = feed.recv().await.unwrap();
        assert_eq!(topic, "dom-1.mail_dns.processed");
    }

    #[tokio::test]
    async fn unreachable_target_leaves_info_statuses() {
        let (processor, repository, _, _) = processor();
        processor
            .process(event(None, RawScanResult::Unreachable))
            .await
            .unwrap();

        let map = repository.status_map("dom-1").await.unwrap();
        assert_eq!(map.dmarc, ScanStatus::Info);
        assert_eq!(map.spf, ScanStatus::Info);
        // No selectors were probed, so DKIM stays untouched.
        assert_eq!(map.dkim, ScanStatus::Unknown);
    }
}
