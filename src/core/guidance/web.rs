// src/core/guidance/web.rs

//! Rule batteries for the transport-security protocols.
//!
//! Independent checks all fire; only the explicitly exclusive tiers (HTTPS
//! enforcement, HSTS completeness) short-circuit after the first match in
//! priority order.

use super::ruleset::{self, GuidanceRuleSet};
use super::TagCollector;
use crate::core::models::{
    Guidance, HttpsEnforcement, HttpsImplementation, HttpsResult, RevocationStatus, TlsResult,
    TlsVersion,
};

pub fn classify_tls(tls: &TlsResult, rs: &GuidanceRuleSet) -> Guidance {
    let mut tags = TagCollector::new(rs);

    // Substring checks are deliberately non-exclusive: a suite matching more
    // than one weakness fires every matching rule.
    let all_suites = || tls.accepted_ciphers.values().flatten();
    if all_suites().any(|s| s.contains("RC4")) {
        tags.fire(ruleset::SSL_RC4);
    }
    if all_suites().any(|s| s.contains("3DES")) {
        tags.fire(ruleset::SSL_3DES);
    }

    let legacy = [TlsVersion::Ssl30, TlsVersion::Tls10, TlsVersion::Tls11];
    if legacy
        .iter()
        .any(|v| tls.accepted_ciphers.get(v).is_some_and(|c| !c.is_empty()))
    {
        tags.fire(ruleset::SSL_LEGACY_PROTOCOL);
    }

    if tls.heartbleed {
        tags.fire(ruleset::SSL_HEARTBLEED);
    }
    if tls.ccs_injection {
        tags.fire(ruleset::SSL_CCS_INJECTION);
    }

    if tls.supported_curves.iter().any(|c| curve_is_weak(c)) {
        tags.fire(ruleset::SSL_WEAK_CURVE);
    }

    if tls
        .signature_algorithm
        .as_deref()
        .is_some_and(signature_is_weak)
    {
        tags.fire(ruleset::SSL_WEAK_SIGNATURE);
    }

    let mut guidance = tags.finish();
    if guidance.negative_tags.is_empty() {
        // No weaknesses found across the battery.
        let mut tags = TagCollector::new(rs);
        tags.fire(ruleset::SSL_STRONG_CONFIG);
        let strong = tags.finish();
        guidance.positive_tags.extend(strong.positive_tags);
    }
    guidance
}

/// A curve weaker than 224 bits offers less than 112-bit security.
fn curve_is_weak(name: &str) -> bool {
    let bits: u32 = name
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0);
    bits > 0 && bits < 224
}

fn signature_is_weak(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("sha1") || lower.contains("md5") || lower.contains("md2")
}

pub fn classify_https(https: &HttpsResult, rs: &GuidanceRuleSet) -> Guidance {
    let mut tags = TagCollector::new(rs);

    match https.implementation {
        HttpsImplementation::NoHttps => tags.fire(ruleset::HTTPS_MISSING),
        HttpsImplementation::Downgrades => tags.fire(ruleset::HTTPS_DOWNGRADES),
        HttpsImplementation::BadHostname => tags.fire(ruleset::HTTPS_BAD_HOSTNAME),
        HttpsImplementation::BadChain => tags.fire(ruleset::HTTPS_BAD_CHAIN),
        HttpsImplementation::Valid => tags.fire(ruleset::HTTPS_VALID),
    }

    // Enforcement is only meaningful once implementation is known to be
    // non-downgrading. Exactly one tier tag is ever selected.
    if !matches!(
        https.implementation,
        HttpsImplementation::NoHttps | HttpsImplementation::Downgrades
    ) {
        match https.enforcement {
            HttpsEnforcement::Strict => tags.fire(ruleset::HTTPS_ENFORCED_STRICT),
            HttpsEnforcement::Moderate => tags.fire(ruleset::HTTPS_ENFORCED_MODERATE),
            HttpsEnforcement::Weak => tags.fire(ruleset::HTTPS_ENFORCED_WEAK),
            HttpsEnforcement::NotEnforced => tags.fire(ruleset::HTTPS_NOT_ENFORCED),
        }
    }

    // HSTS completeness is an exclusive tier; max-age is only evaluated when
    // the header is present at all.
    match &https.hsts {
        None => tags.fire(ruleset::HTTPS_HSTS_MISSING),
        Some(policy) => {
            if policy.max_age < rs.hsts_min_age {
                tags.fire(ruleset::HTTPS_HSTS_SHORT_AGE);
            } else {
                tags.fire(ruleset::HTTPS_HSTS_IMPLEMENTED);
            }
            if policy.preload {
                tags.fire(ruleset::HTTPS_PRELOAD_READY);
            } else {
                tags.fire(ruleset::HTTPS_NOT_PRELOADED);
            }
        }
    }

    // Certificate health is independent of the implementation/enforcement
    // axis.
    if https.cert_expired {
        tags.fire(ruleset::HTTPS_CERT_EXPIRED);
    }
    if https.cert_self_signed {
        tags.fire(ruleset::HTTPS_CERT_SELF_SIGNED);
    }
    match https.cert_revocation {
        RevocationStatus::Good => {}
        RevocationStatus::Revoked => tags.fire(ruleset::HTTPS_CERT_REVOKED),
        RevocationStatus::Unknown => tags.fire(ruleset::HTTPS_CERT_REVOCATION_UNKNOWN),
    }

    tags.finish()
}
