// src/core/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

// --- Reusable Probe Outcome ---
// A record-level probe either finds a parsed record, finds nothing, or fails
// in transit. Absence is data, not an error: it flows through classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum RecordProbe<T> {
    Found(T),
    Missing,
    Error(String),
}

impl<T> RecordProbe<T> {
    pub fn found(&self) -> Option<&T> {
        match self {
            RecordProbe::Found(v) => Some(v),
            _ => None,
        }
    }
}

// --- Scan Request Model ---

/// Which family of scanners a request targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanType {
    Web,
    Mail,
}

/// Whether a scan was user-triggered or came from the scheduled sweep.
/// Manual and scheduled scans fan out to distinct target addresses so their
/// load and priority can be tuned independently.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanMode {
    Scheduled,
    Manual,
}

/// A single scan request. Created by an external caller, consumed exactly
/// once by the dispatcher, never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub scan_id: Uuid,
    pub domain: String,
    pub domain_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_id: Option<String>,
    pub scan_type: ScanType,
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub test_flag: bool,
}

impl ScanRequest {
    pub fn mode(&self) -> ScanMode {
        // Interactive scans carry the requesting user's key; scheduled sweeps
        // never do.
        if self.user_key.is_some() {
            ScanMode::Manual
        } else {
            ScanMode::Scheduled
        }
    }
}

// --- Protocol Families and Status Categories ---

/// One per protocol scanner variant.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProtocolFamily {
    MailDns,
    Tls,
    Https,
}

/// Categories tracked in a domain's aggregate status map. A mail scan feeds
/// three of them; each web scanner feeds one.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanCategory {
    Dmarc,
    Spf,
    Dkim,
    Https,
    Ssl,
}

// --- Mail-DNS Raw Results ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DmarcPolicy {
    None,
    Quarantine,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DmarcRecord {
    pub record: String,
    pub policy: Option<DmarcPolicy>,
    pub subdomain_policy: Option<DmarcPolicy>,
    /// Parsed `pct` tag. `None` when the tag is absent (which defaults to 100).
    pub pct: Option<i64>,
    /// Set when a `pct` tag was present but not a valid integer in 0..=100.
    pub pct_invalid: bool,
    /// Aggregate report (`rua`) mailto addresses.
    pub rua: Vec<String>,
    /// Forensic report (`ruf`) mailto addresses.
    pub ruf: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SpfQualifier {
    /// `-all`
    Fail,
    /// `~all`
    SoftFail,
    /// `?all`
    Neutral,
    /// `+all` or bare `all`
    Pass,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpfRecord {
    pub record: String,
    /// Qualifier on the terminal `all` mechanism, if one is present.
    pub all_qualifier: Option<SpfQualifier>,
    /// Count of mechanisms that trigger DNS lookups (RFC 7208 caps this at 10).
    pub lookup_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DkimRecord {
    pub record: String,
    /// `k` tag, defaulting to rsa when absent.
    pub key_type: String,
    /// Public key modulus size in bits, derived from the parsed `p` material.
    pub key_size: Option<u32>,
    /// True when the `p` tag is present but empty (a revoked key).
    pub key_revoked: bool,
    /// True when `t=y` marks the selector as test-mode.
    pub test_mode: bool,
}

/// Raw findings from one Mail-DNS scanner invocation. DKIM results are keyed
/// by selector; one selector failing never discards the others.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailResult {
    pub dmarc: RecordProbe<DmarcRecord>,
    pub spf: RecordProbe<SpfRecord>,
    pub dkim: BTreeMap<String, RecordProbe<DkimRecord>>,
}

// --- TLS/SSL Raw Results ---

#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
)]
pub enum TlsVersion {
    #[serde(rename = "ssl3.0")]
    #[strum(serialize = "SSL 3.0")]
    Ssl30,
    #[serde(rename = "tls1.0")]
    #[strum(serialize = "TLS 1.0")]
    Tls10,
    #[serde(rename = "tls1.1")]
    #[strum(serialize = "TLS 1.1")]
    Tls11,
    #[serde(rename = "tls1.2")]
    #[strum(serialize = "TLS 1.2")]
    Tls12,
}

/// Raw findings from one TLS/SSL scanner invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TlsResult {
    /// Accepted cipher suites, grouped by the protocol version that accepted
    /// them.
    pub accepted_ciphers: BTreeMap<TlsVersion, Vec<String>>,
    /// Supported elliptic curves, normalized to SECG names.
    pub supported_curves: Vec<String>,
    /// Signature algorithm of the leaf certificate.
    pub signature_algorithm: Option<String>,
    pub heartbleed: bool,
    pub ccs_injection: bool,
}

// --- HTTPS Raw Results ---

/// How the domain implements HTTPS, classified ahead of enforcement because
/// enforcement is only meaningful once implementation is non-downgrading.
/// Precedence when probes disagree: downgrades > valid > bad-chain/hostname.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HttpsImplementation {
    NoHttps,
    Downgrades,
    BadHostname,
    BadChain,
    Valid,
}

/// How strictly plain-HTTP traffic is moved onto HTTPS. Tiers are mutually
/// exclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HttpsEnforcement {
    Strict,
    Moderate,
    Weak,
    NotEnforced,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HstsPolicy {
    pub max_age: u64,
    pub include_subdomains: bool,
    pub preload: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RevocationStatus {
    Good,
    Revoked,
    Unknown,
}

/// Raw findings from one HTTPS scanner invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpsResult {
    pub implementation: HttpsImplementation,
    pub enforcement: HttpsEnforcement,
    pub hsts: Option<HstsPolicy>,
    pub cert_expired: bool,
    pub cert_self_signed: bool,
    pub cert_revocation: RevocationStatus,
}

// --- Raw Result Union ---

/// The complete output of one protocol scanner invocation: either a
/// well-formed protocol-specific result or a typed failure. Scanners never
/// let a transport exception escape past this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RawScanResult {
    Mail(MailResult),
    Tls(TlsResult),
    Https(HttpsResult),
    Missing,
    Unreachable,
    Timeout,
}

// --- Guidance Models ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Polarity {
    Negative,
    Neutral,
    Positive,
}

/// Verdict for one status-map category.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanStatus {
    Pass,
    Fail,
    Info,
    Unknown,
}

/// The classified outcome for a single category: tag ids bucketed by
/// polarity, plus the pass/fail/info verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Guidance {
    pub negative_tags: BTreeSet<String>,
    pub neutral_tags: BTreeSet<String>,
    pub positive_tags: BTreeSet<String>,
    pub status: ScanStatus,
}

impl Guidance {
    pub fn info() -> Self {
        Self {
            negative_tags: BTreeSet::new(),
            neutral_tags: BTreeSet::new(),
            positive_tags: BTreeSet::new(),
            status: ScanStatus::Info,
        }
    }
}

// --- Classified Result ---

/// One append-only record per scan execution. The owning domain's status map
/// is the only mutable state derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedResult {
    pub scan_id: Uuid,
    pub domain_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_id: Option<String>,
    /// Worst verdict across the categories below.
    pub status: ScanStatus,
    pub categories: BTreeMap<ScanCategory, Guidance>,
    pub raw_result: RawScanResult,
    pub ruleset_version: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-category verdicts for one domain, overwritten last-write-wins as new
/// classified results arrive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DomainStatusMap {
    pub https: ScanStatus,
    pub ssl: ScanStatus,
    pub dmarc: ScanStatus,
    pub dkim: ScanStatus,
    pub spf: ScanStatus,
}

impl Default for DomainStatusMap {
    fn default() -> Self {
        Self {
            https: ScanStatus::Unknown,
            ssl: ScanStatus::Unknown,
            dmarc: ScanStatus::Unknown,
            dkim: ScanStatus::Unknown,
            spf: ScanStatus::Unknown,
        }
    }
}

impl DomainStatusMap {
    pub fn set(&mut self, category: ScanCategory, status: ScanStatus) {
        match category {
            ScanCategory::Https => self.https = status,
            ScanCategory::Ssl => self.ssl = status,
            ScanCategory::Dmarc => self.dmarc = status,
            ScanCategory::Dkim => self.dkim = status,
            ScanCategory::Spf => self.spf = status,
        }
    }

    pub fn get(&self, category: ScanCategory) -> ScanStatus {
        match category {
            ScanCategory::Https => self.https,
            ScanCategory::Ssl => self.ssl,
            ScanCategory::Dmarc => self.dmarc,
            ScanCategory::Dkim => self.dkim,
            ScanCategory::Spf => self.spf,
        }
    }
}

// --- Scanner → Processor Event ---

/// Published by a scanner on the `{domain_key}.{protocol}` topic and consumed
/// by exactly one result-processor invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResultEvent {
    pub scan_id: Uuid,
    pub domain: String,
    pub domain_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_id: Option<String>,
    pub protocol: ProtocolFamily,
    pub results: RawScanResult,
}

impl ScanResultEvent {
    pub fn topic(&self) -> String {
        format!("{}.{}", self.domain_key, self.protocol)
    }
}

/// Re-published after classification for downstream report/API consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    #[serde(rename = "sharedId")]
    pub shared_id: Option<String>,
    #[serde(rename = "domainKey")]
    pub domain_key: String,
    pub status: ScanStatus,
    pub results: ClassifiedResult,
}

impl ProcessedEvent {
    pub fn topic(&self, protocol: ProtocolFamily) -> String {
        format!("{}.{}.processed", self.domain_key, protocol)
    }
}

// --- Lease Coordination Models ---

/// Counter tracking in-flight probes against one target IP, shared across
/// scanner instances through the key-value store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpLeaseSlot {
    pub ip: String,
    pub count: u32,
    pub updated_at: DateTime<Utc>,
}

/// The single well-known leader key, re-claimable once its owner goes stale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderRecord {
    pub instance_id: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_request_mode_follows_user_key() {
        let mut req = ScanRequest {
            scan_id: Uuid::new_v4(),
            domain: "example.org".into(),
            domain_key: "domains/1".into(),
            user_key: None,
            shared_id: None,
            scan_type: ScanType::Mail,
            selectors: vec![],
            ip_address: None,
            test_flag: false,
        };
        assert_eq!(req.mode(), ScanMode::Scheduled);
        req.user_key = Some("users/9".into());
        assert_eq!(req.mode(), ScanMode::Manual);
    }

    #[test]
    fn raw_result_round_trips_through_json() {
        let raw = RawScanResult::Https(HttpsResult {
            implementation: HttpsImplementation::Valid,
            enforcement: HttpsEnforcement::Strict,
            hsts: Some(HstsPolicy {
                max_age: 31536000,
                include_subdomains: true,
                preload: false,
            }),
            cert_expired: false,
            cert_self_signed: false,
            cert_revocation: RevocationStatus::Good,
        });
        let json = serde_json::to_string(&raw).unwrap();
        let back: RawScanResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn status_map_initializes_unknown() {
        use strum::IntoEnumIterator;

        let mut map = DomainStatusMap::default();
        for category in ScanCategory::iter() {
            assert_eq!(map.get(category), ScanStatus::Unknown);
        }
        map.set(ScanCategory::Dmarc, ScanStatus::Fail);
        assert_eq!(map.get(ScanCategory::Dmarc), ScanStatus::Fail);
        assert_eq!(map.get(ScanCategory::Spf), ScanStatus::Unknown);
    }

    #[test]
    fn event_topic_is_scoped_by_domain_and_protocol() {
        let event = ScanResultEvent {
            scan_id: Uuid::new_v4(),
            domain: "example.org".into(),
            domain_key: "domains/42".into(),
            user_key: None,
            shared_id: None,
            protocol: ProtocolFamily::Https,
            results: RawScanResult::Missing,
        };
        assert_eq!(event.topic(), "domains/42.https");
    }
}
