// src/core/scanner/dns_scanner.rs

//! Mail-DNS scanner: DMARC and SPF TXT resolution with tag-value validation,
//! plus per-selector DKIM public key resolution. Record absence and
//! unparseable syntax are data (`Missing`), never errors; one selector's
//! failure never discards another's result.

use std::collections::BTreeMap;

use async_trait::async_trait;
use base64::Engine;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use super::{ProtocolScanner, ScanTask};
use crate::core::models::{
    DkimRecord, DmarcPolicy, DmarcRecord, MailResult, ProtocolFamily, RawScanResult, RecordProbe,
    SpfQualifier, SpfRecord,
};

pub struct MailDnsScanner {
    resolver: TokioAsyncResolver,
}

impl MailDnsScanner {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        }
    }
}

impl Default for MailDnsScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolScanner for MailDnsScanner {
    fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::MailDns
    }

    async fn probe(&self, task: &ScanTask) -> RawScanResult {
        // Query the root domain; mail records live there, not under www.
        let root = task.domain.strip_prefix("www.").unwrap_or(&task.domain);
        info!(scan_id = %task.scan_id, target = root, "starting mail-DNS scan");

        let (dmarc, spf) = tokio::join!(
            lookup_dmarc(&self.resolver, root),
            lookup_spf(&self.resolver, root)
        );

        // Per-selector lookups run concurrently and independently.
        let mut lookups = JoinSet::new();
        for selector in &task.selectors {
            let resolver = self.resolver.clone();
            let selector = selector.clone();
            let root = root.to_string();
            lookups.spawn(async move {
                let probe = lookup_dkim(&resolver, &selector, &root).await;
                (selector, probe)
            });
        }

        let mut dkim = BTreeMap::new();
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((selector, probe)) => {
                    dkim.insert(selector, probe);
                }
                Err(e) => warn!(scan_id = %task.scan_id, error = %e, "DKIM lookup task failed"),
            }
        }

        info!(
            scan_id = %task.scan_id,
            target = root,
            selectors = dkim.len(),
            "mail-DNS scan finished"
        );
        RawScanResult::Mail(MailResult { dmarc, spf, dkim })
    }
}

fn classify_resolve_error<T>(target: &str, e: &ResolveError) -> RecordProbe<T> {
    // NXDOMAIN and empty answers mean the record is structurally absent;
    // everything else is a transport failure.
    if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
        debug!(target, "no TXT records found");
        RecordProbe::Missing
    } else {
        warn!(target, error = %e, "TXT lookup failed");
        RecordProbe::Error(format!("DNS error: {e}"))
    }
}

async fn lookup_dmarc(resolver: &TokioAsyncResolver, domain: &str) -> RecordProbe<DmarcRecord> {
    let target = format!("_dmarc.{domain}");
    debug!(target = %target, "looking up DMARC record");
    match resolver.txt_lookup(&target).await {
        Ok(txt_records) => {
            for record in txt_records.iter() {
                let record_str = record.to_string();
                if record_str.starts_with("v=DMARC1") {
                    debug!(record = %record_str, "DMARC record found");
                    return match parse_dmarc(&record_str) {
                        Some(parsed) => RecordProbe::Found(parsed),
                        None => RecordProbe::Missing,
                    };
                }
            }
            RecordProbe::Missing
        }
        Err(e) => classify_resolve_error(&target, &e),
    }
}

async fn lookup_spf(resolver: &TokioAsyncResolver, domain: &str) -> RecordProbe<SpfRecord> {
    debug!(target = domain, "looking up SPF record");
    match resolver.txt_lookup(domain).await {
        Ok(txt_records) => {
            for record in txt_records.iter() {
                let record_str = record.to_string();
                if record_str.starts_with("v=spf1") {
                    debug!(record = %record_str, "SPF record found");
                    return RecordProbe::Found(parse_spf(&record_str));
                }
            }
            RecordProbe::Missing
        }
        Err(e) => classify_resolve_error(domain, &e),
    }
}

async fn lookup_dkim(
    resolver: &TokioAsyncResolver,
    selector: &str,
    domain: &str,
) -> RecordProbe<DkimRecord> {
    let target = format!("{selector}._domainkey.{domain}");
    debug!(target = %target, "looking up DKIM record");
    match resolver.txt_lookup(&target).await {
        Ok(txt_records) => {
            // DKIM TXT payloads are often split across strings; to_string
            // concatenates the character-string segments.
            for record in txt_records.iter() {
                let record_str = record.to_string();
                if record_str.contains("p=") {
                    return match parse_dkim(&record_str) {
                        Some(parsed) => RecordProbe::Found(parsed),
                        None => RecordProbe::Missing,
                    };
                }
            }
            RecordProbe::Missing
        }
        Err(e) => classify_resolve_error(&target, &e),
    }
}

// --- Tag-value parsing ---

/// Splits a `k=v; k=v` record into pairs. Returns `None` when a non-empty
/// segment has no `=`, which marks the record as unparseable.
fn tag_value_pairs(record: &str) -> Option<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for segment in record.split(';') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        let (key, value) = segment.split_once('=')?;
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }
    Some(pairs)
}

fn parse_policy(value: &str) -> Option<DmarcPolicy> {
    match value {
        "none" => Some(DmarcPolicy::None),
        "quarantine" => Some(DmarcPolicy::Quarantine),
        "reject" => Some(DmarcPolicy::Reject),
        _ => None,
    }
}

fn parse_mailto_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|a| a.trim().trim_start_matches("mailto:").to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

pub(crate) fn parse_dmarc(record: &str) -> Option<DmarcRecord> {
    let pairs = tag_value_pairs(record)?;

    let mut parsed = DmarcRecord {
        record: record.to_string(),
        policy: None,
        subdomain_policy: None,
        pct: None,
        pct_invalid: false,
        rua: vec![],
        ruf: vec![],
    };

    for (key, value) in &pairs {
        match key.as_str() {
            "p" => parsed.policy = parse_policy(value),
            "sp" => parsed.subdomain_policy = parse_policy(value),
            "pct" => match value.parse::<i64>() {
                Ok(pct) if (0..=100).contains(&pct) => parsed.pct = Some(pct),
                _ => parsed.pct_invalid = true,
            },
            "rua" => parsed.rua = parse_mailto_list(value),
            "ruf" => parsed.ruf = parse_mailto_list(value),
            _ => {}
        }
    }

    Some(parsed)
}

pub(crate) fn parse_spf(record: &str) -> SpfRecord {
    let mut all_qualifier = None;
    let mut lookup_count = 0u32;

    for term in record.split_whitespace().skip(1) {
        let (qualifier, mechanism) = match term.chars().next() {
            Some('+') => (SpfQualifier::Pass, &term[1..]),
            Some('-') => (SpfQualifier::Fail, &term[1..]),
            Some('~') => (SpfQualifier::SoftFail, &term[1..]),
            Some('?') => (SpfQualifier::Neutral, &term[1..]),
            _ => (SpfQualifier::Pass, term),
        };

        if mechanism == "all" {
            all_qualifier = Some(qualifier);
            continue;
        }

        // Mechanisms that cost a DNS query under the RFC 7208 limit.
        let name = mechanism.split([':', '/', '=']).next().unwrap_or("");
        if matches!(name, "include" | "a" | "mx" | "ptr" | "exists" | "redirect") {
            lookup_count += 1;
        }
    }

    SpfRecord {
        record: record.to_string(),
        all_qualifier,
        lookup_count,
    }
}

pub(crate) fn parse_dkim(record: &str) -> Option<DkimRecord> {
    let pairs = tag_value_pairs(record)?;

    let mut key_type = "rsa".to_string();
    let mut key_material: Option<String> = None;
    let mut test_mode = false;

    for (key, value) in &pairs {
        match key.as_str() {
            "k" => key_type = value.to_ascii_lowercase(),
            "p" => key_material = Some(value.split_whitespace().collect::<String>()),
            "t" => test_mode = value.split(':').any(|flag| flag.trim() == "y"),
            _ => {}
        }
    }

    let key_material = key_material?;
    if key_material.is_empty() {
        // An empty p= tag revokes the key.
        return Some(DkimRecord {
            record: record.to_string(),
            key_type,
            key_size: None,
            key_revoked: true,
            test_mode,
        });
    }

    Some(DkimRecord {
        record: record.to_string(),
        key_size: parse_key_bits(&key_material),
        key_type,
        key_revoked: false,
        test_mode,
    })
}

/// Derives the RSA modulus size from the base64 SubjectPublicKeyInfo in the
/// `p` tag. Non-RSA or undecodable material yields `None`.
fn parse_key_bits(material: &str) -> Option<u32> {
    let der = base64::engine::general_purpose::STANDARD
        .decode(material)
        .ok()?;
    let (_, spki) = SubjectPublicKeyInfo::from_der(&der).ok()?;
    match spki.parsed() {
        Ok(x509_parser::public_key::PublicKey::RSA(rsa)) => Some(rsa.key_size() as u32),
        _ => None,
    }
}
