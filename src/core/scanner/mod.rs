// src/core/scanner/mod.rs

// Public interface for the scanner module: one sub-module per protocol
// family, plus the contract they share.
pub mod dns_scanner;
pub mod https_scanner;
pub mod tls_scanner;
pub mod tls_wire;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::core::models::{ProtocolFamily, RawScanResult};

/// The probe-level view of a scan request: just what a scanner needs to hit
/// the network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanTask {
    pub scan_id: Uuid,
    pub domain: String,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Common contract for the three protocol scanners. Implementations must
/// never let a transport error escape: every outcome is a `RawScanResult`
/// variant, with internal failures mapped to `Unreachable`/`Missing` at the
/// outermost probe entry point.
#[async_trait]
pub trait ProtocolScanner: Send + Sync {
    fn protocol(&self) -> ProtocolFamily;

    async fn probe(&self, task: &ScanTask) -> RawScanResult;
}

/// Runs one bounded scan attempt. A probe that outlives the deadline is
/// abandoned and reported as a typed timeout; retry is the queue layer's
/// responsibility, not the scanner's.
pub async fn run_scan(
    scanner: &dyn ProtocolScanner,
    task: &ScanTask,
    timeout: Duration,
) -> RawScanResult {
    match tokio::time::timeout(timeout, scanner.probe(task)).await {
        Ok(raw) => raw,
        Err(_) => {
            warn!(
                scan_id = %task.scan_id,
                target = %task.domain,
                protocol = %scanner.protocol(),
                timeout_secs = timeout.as_secs(),
                "scan attempt exceeded its deadline"
            );
            RawScanResult::Timeout
        }
    }
}
