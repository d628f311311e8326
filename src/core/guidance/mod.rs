// src/core/guidance/mod.rs

//! Turns raw protocol output into a deterministic, versioned set of guidance
//! tags plus a pass/fail/info verdict. Classification is a pure function of
//! the raw result and the rule-set version: no clock, no I/O, no randomness.

pub mod mail;
pub mod ruleset;
pub mod web;

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::core::models::{
    Guidance, Polarity, ProtocolFamily, RawScanResult, ScanCategory, ScanStatus,
};
use ruleset::GuidanceRuleSet;

/// Accumulates fired tags for one category, bucketing by polarity as defined
/// in the rule set.
pub(crate) struct TagCollector<'a> {
    ruleset: &'a GuidanceRuleSet,
    negative: BTreeSet<String>,
    neutral: BTreeSet<String>,
    positive: BTreeSet<String>,
}

impl<'a> TagCollector<'a> {
    pub fn new(ruleset: &'a GuidanceRuleSet) -> Self {
        Self {
            ruleset,
            negative: BTreeSet::new(),
            neutral: BTreeSet::new(),
            positive: BTreeSet::new(),
        }
    }

    pub fn fire(&mut self, id: &str) {
        match self.ruleset.polarity(id) {
            Some(Polarity::Negative) => {
                self.negative.insert(id.to_string());
            }
            Some(Polarity::Neutral) => {
                self.neutral.insert(id.to_string());
            }
            Some(Polarity::Positive) => {
                self.positive.insert(id.to_string());
            }
            None => {
                // A rule referenced a tag the table does not define. Dropping
                // it keeps classification total; the log line makes the table
                // gap visible.
                warn!(tag = id, version = self.ruleset.version, "undefined guidance tag fired");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.negative.is_empty() && self.neutral.is_empty() && self.positive.is_empty()
    }

    /// Close out the battery. An empty negative set with the record present
    /// is the only pass condition; any negative tag forces fail.
    pub fn finish(self) -> Guidance {
        let status = if self.negative.is_empty() {
            ScanStatus::Pass
        } else {
            ScanStatus::Fail
        };
        Guidance {
            negative_tags: self.negative,
            neutral_tags: self.neutral,
            positive_tags: self.positive,
            status,
        }
    }
}

/// Builds the guidance for a structurally absent record: the protocol's
/// dedicated missing tag, status fail, and no positive tags.
pub(crate) fn missing_guidance(ruleset: &GuidanceRuleSet, missing_tag: &str) -> Guidance {
    let mut tags = TagCollector::new(ruleset);
    tags.fire(missing_tag);
    tags.finish()
}

/// Classifies one raw scanner result into per-category guidance.
///
/// `Unreachable` and `Timeout` yield `info` verdicts with empty negative and
/// positive sets for every category the protocol feeds: absence of data is
/// never conflated with absence of findings.
pub fn classify(
    protocol: ProtocolFamily,
    raw: &RawScanResult,
    ruleset: &GuidanceRuleSet,
) -> BTreeMap<ScanCategory, Guidance> {
    let mut out = BTreeMap::new();
    match (protocol, raw) {
        (ProtocolFamily::MailDns, RawScanResult::Mail(mail)) => {
            out.insert(ScanCategory::Dmarc, mail::classify_dmarc(&mail.dmarc, ruleset));
            out.insert(ScanCategory::Spf, mail::classify_spf(&mail.spf, ruleset));
            if !mail.dkim.is_empty() {
                out.insert(ScanCategory::Dkim, mail::classify_dkim(&mail.dkim, ruleset));
            }
        }
        (ProtocolFamily::Tls, RawScanResult::Tls(tls)) => {
            out.insert(ScanCategory::Ssl, web::classify_tls(tls, ruleset));
        }
        (ProtocolFamily::Https, RawScanResult::Https(https)) => {
            out.insert(ScanCategory::Https, web::classify_https(https, ruleset));
        }
        (ProtocolFamily::MailDns, RawScanResult::Missing) => {
            out.insert(ScanCategory::Dmarc, missing_guidance(ruleset, ruleset::DMARC_MISSING));
            out.insert(ScanCategory::Spf, missing_guidance(ruleset, ruleset::SPF_MISSING));
        }
        (ProtocolFamily::Tls, RawScanResult::Missing) => {
            out.insert(ScanCategory::Ssl, missing_guidance(ruleset, ruleset::SSL_MISSING));
        }
        (ProtocolFamily::Https, RawScanResult::Missing) => {
            out.insert(ScanCategory::Https, missing_guidance(ruleset, ruleset::HTTPS_MISSING));
        }
        (_, RawScanResult::Unreachable | RawScanResult::Timeout) => {
            for &category in categories_for(protocol) {
                out.insert(category, Guidance::info());
            }
        }
        (protocol, raw) => {
            // A scanner published a payload for the wrong protocol family.
            // There is nothing sound to classify.
            warn!(%protocol, raw = ?raw, "mismatched raw result; skipping classification");
        }
    }
    out
}

fn categories_for(protocol: ProtocolFamily) -> &'static [ScanCategory] {
    match protocol {
        ProtocolFamily::MailDns => &[ScanCategory::Dmarc, ScanCategory::Spf],
        ProtocolFamily::Tls => &[ScanCategory::Ssl],
        ProtocolFamily::Https => &[ScanCategory::Https],
    }
}

/// Worst-of aggregation across categories, used for the record-level verdict.
pub fn overall_status(categories: &BTreeMap<ScanCategory, Guidance>) -> ScanStatus {
    let mut status = ScanStatus::Unknown;
    for guidance in categories.values() {
        status = match (status, guidance.status) {
            (_, ScanStatus::Fail) | (ScanStatus::Fail, _) => ScanStatus::Fail,
            (_, ScanStatus::Info) | (ScanStatus::Info, _) => ScanStatus::Info,
            (_, ScanStatus::Pass) | (ScanStatus::Pass, _) => ScanStatus::Pass,
            _ => ScanStatus::Unknown,
        };
    }
    status
}
