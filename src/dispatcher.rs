// src/dispatcher.rs

//! The dispatcher: turns one scan request into signed orders for the
//! protocol scanners that cover it.
//!
//! Target resolution happens exactly once per request, from a fixed table
//! keyed by scan type and mode: web requests cover TLS and HTTPS, mail
//! requests cover the DNS battery. Manual scans go to the first configured
//! scanner for low latency; scheduled sweeps spread across the fleet by
//! domain hash. A signing failure aborts the whole dispatch, but a target
//! that cannot be reached only costs that target.
//!
//! Dispatch is fire-and-forget: the caller gets its answer as soon as the
//! fan-out is launched, and delivery (with bounded retry) continues in
//! detached tasks. Only `test_flag` requests block for their targets'
//! responses.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::core::models::{ProtocolFamily, ScanMode, ScanRequest, ScanType};
use crate::core::scanner::ScanTask;
use crate::envelope::{EnvelopeError, ScanPayload, SignedEnvelope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub protocol: ProtocolFamily,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("http client construction failed: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Fire-and-forget fan-out; delivery continues in detached tasks and
    /// results arrive through the bus later.
    Dispatched { targets: usize },
    /// Test mode: every target was awaited and its response body joined.
    Synchronous(String),
}

/// Headroom on top of the scanner's own probe deadline. A probe that
/// finishes at the wire must not be counted as a failed delivery.
const DELIVERY_MARGIN: Duration = Duration::from_secs(10);

pub struct Dispatcher {
    client: Client,
    signing_key: Vec<u8>,
    base_urls: Vec<String>,
    delivery_attempts: u32,
}

impl Dispatcher {
    pub fn new(config: &Config) -> Result<Self, DispatchError> {
        Ok(Self {
            client: Client::builder()
                .timeout(config.scan_timeout + DELIVERY_MARGIN)
                .build()?,
            signing_key: config.signing_key.clone().into_bytes(),
            base_urls: config.scanner_base_urls.clone(),
            delivery_attempts: config.scan_attempts.max(1),
        })
    }

    /// The (type, mode) → targets table.
    pub fn resolve_targets(&self, request: &ScanRequest) -> Vec<ScanTarget> {
        let protocols: &[ProtocolFamily] = match request.scan_type {
            ScanType::Web => &[ProtocolFamily::Tls, ProtocolFamily::Https],
            ScanType::Mail => &[ProtocolFamily::MailDns],
        };
        let base = match request.mode() {
            ScanMode::Manual => self.base_urls.first(),
            ScanMode::Scheduled => {
                let mut hasher = DefaultHasher::new();
                request.domain.hash(&mut hasher);
                let index = (hasher.finish() as usize) % self.base_urls.len().max(1);
                self.base_urls.get(index)
            }
        };
        let Some(base) = base else {
            return Vec::new();
        };
        protocols
            .iter()
            .map(|&protocol| ScanTarget {
                protocol,
                url: format!("{base}/scan/{}", endpoint_path(protocol)),
            })
            .collect()
    }

    /// Signs the request once and launches one delivery per resolved target.
    /// Returns as soon as the fan-out is airborne; each delivery retries with
    /// backoff in its own detached task, so a slow or dead scanner never
    /// stalls the caller. `test_flag` requests instead block until every
    /// target answered and return the joined response bodies.
    pub async fn dispatch(&self, request: ScanRequest) -> Result<DispatchOutcome, DispatchError> {
        let targets = self.resolve_targets(&request);
        let payload = ScanPayload {
            task: ScanTask {
                scan_id: request.scan_id,
                domain: request.domain.clone(),
                selectors: request.selectors.clone(),
                ip_address: request.ip_address.clone(),
            },
            domain_key: request.domain_key.clone(),
            user_key: request.user_key.clone(),
            shared_id: request.shared_id.clone(),
        };
        let envelope = SignedEnvelope::seal(payload, &self.signing_key)?;

        if request.test_flag {
            let bodies = self.deliver_synchronously(&request, targets, envelope).await;
            return Ok(DispatchOutcome::Synchronous(bodies));
        }

        let launched = targets.len();
        for target in targets {
            tokio::spawn(deliver_with_retry(
                self.client.clone(),
                target,
                envelope.clone(),
                self.delivery_attempts,
                request.scan_id,
            ));
        }

        info!(
            scan_id = %request.scan_id,
            domain = %request.domain,
            targets = launched,
            "scan request dispatched"
        );
        Ok(DispatchOutcome::Dispatched { targets: launched })
    }

    async fn deliver_synchronously(
        &self,
        request: &ScanRequest,
        targets: Vec<ScanTarget>,
        envelope: SignedEnvelope,
    ) -> String {
        let mut deliveries = JoinSet::new();
        for target in targets {
            let client = self.client.clone();
            let envelope = envelope.clone();
            deliveries.spawn(async move {
                let outcome = deliver(&client, &target, &envelope).await;
                (target, outcome)
            });
        }

        let mut bodies = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            let Ok((target, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(body) => bodies.push(body),
                Err(e) => warn!(
                    scan_id = %request.scan_id,
                    url = %target.url,
                    error = %e,
                    "scan order was not delivered"
                ),
            }
        }
        bodies.join("\n")
    }
}

/// One background delivery with bounded backoff. Runs detached from the
/// dispatch call, so retry waits cost nobody but this target.
async fn deliver_with_retry(
    client: Client,
    target: ScanTarget,
    envelope: SignedEnvelope,
    attempts: u32,
    scan_id: uuid::Uuid,
) {
    for attempt in 1..=attempts {
        match deliver(&client, &target, &envelope).await {
            Ok(_) => {
                debug!(%scan_id, url = %target.url, attempt, "scan order delivered");
                return;
            }
            Err(e) => warn!(
                %scan_id,
                url = %target.url,
                attempt,
                error = %e,
                "scan order was not delivered"
            ),
        }
        if attempt < attempts {
            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
        }
    }
    error!(%scan_id, url = %target.url, attempts, "scan order dropped after exhausting retries");
}

fn endpoint_path(protocol: ProtocolFamily) -> &'static str {
    match protocol {
        ProtocolFamily::MailDns => "mail",
        ProtocolFamily::Tls => "tls",
        ProtocolFamily::Https => "https",
    }
}

async fn deliver(
    client: &Client,
    target: &ScanTarget,
    envelope: &SignedEnvelope,
) -> Result<String, reqwest::Error> {
    client
        .post(&target.url)
        .json(envelope)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn dispatcher(bases: &[&str]) -> Dispatcher {
        Dispatcher {
            client: Client::new(),
            signing_key: b"secret".to_vec(),
            base_urls: bases.iter().map(|b| b.to_string()).collect(),
            delivery_attempts: 1,
        }
    }

    fn request(scan_type: ScanType, user_key: Option<&str>) -> ScanRequest {
        ScanRequest {
            scan_id: Uuid::new_v4(),
            domain: "example.org".into(),
            domain_key: "dom-1".into(),
            user_key: user_key.map(str::to_string),
            shared_id: None,
            scan_type,
            selectors: vec![],
            ip_address: None,
            test_flag: false,
        }
    }

    #[test]
    fn web_requests_cover_both_transport_protocols() {
        let targets = dispatcher(&["http://a"]).resolve_targets(&request(ScanType::Web, None));
        assert_eq!(
            targets,
            vec![
                ScanTarget {
                    protocol: ProtocolFamily::Tls,
                    url: "http://a/scan/tls".into()
                },
                ScanTarget {
                    protocol: ProtocolFamily::Https,
                    url: "http://a/scan/https".into()
                },
            ]
        );
    }

    #[test]
    fn mail_requests_resolve_to_the_dns_battery() {
        let targets = dispatcher(&["http://a"]).resolve_targets(&request(ScanType::Mail, None));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].protocol, ProtocolFamily::MailDns);
        assert_eq!(targets[0].url, "http://a/scan/mail");
    }

    #[test]
    fn manual_scans_pin_the_first_scanner() {
        let dispatcher = dispatcher(&["http://a", "http://b", "http://c"]);
        let targets = dispatcher.resolve_targets(&request(ScanType::Mail, Some("user-1")));
        assert!(targets[0].url.starts_with("http://a/"));
    }

    #[test]
    fn scheduled_scans_are_stable_per_domain() {
        let dispatcher = dispatcher(&["http://a", "http://b", "http://c"]);
        let first = dispatcher.resolve_targets(&request(ScanType::Web, None));
        let second = dispatcher.resolve_targets(&request(ScanType::Web, None));
        assert_eq!(first, second);
    }

    #[test]
    fn no_configured_scanners_means_no_targets() {
        let targets = dispatcher(&[]).resolve_targets(&request(ScanType::Web, None));
        assert!(targets.is_empty());
    }
}
