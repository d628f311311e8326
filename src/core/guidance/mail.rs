// src/core/guidance/mail.rs

//! Rule batteries for the email-authentication protocols. Each check is
//! independent of the others' outcomes; every independently-true rule fires.

use std::collections::BTreeMap;

use super::ruleset::{self, GuidanceRuleSet};
use super::{missing_guidance, TagCollector};
use crate::core::models::{
    DkimRecord, DmarcPolicy, DmarcRecord, Guidance, RecordProbe, SpfQualifier, SpfRecord,
};

pub fn classify_dmarc(probe: &RecordProbe<DmarcRecord>, rs: &GuidanceRuleSet) -> Guidance {
    let dmarc = match probe {
        RecordProbe::Found(record) => record,
        RecordProbe::Missing => return missing_guidance(rs, ruleset::DMARC_MISSING),
        RecordProbe::Error(_) => return Guidance::info(),
    };

    let mut tags = TagCollector::new(rs);

    match dmarc.policy {
        None => tags.fire(ruleset::DMARC_P_MISSING),
        Some(DmarcPolicy::None) => tags.fire(ruleset::DMARC_P_NONE),
        Some(DmarcPolicy::Quarantine) => tags.fire(ruleset::DMARC_P_QUARANTINE),
        Some(DmarcPolicy::Reject) => tags.fire(ruleset::DMARC_P_REJECT),
    }

    if dmarc.pct_invalid {
        tags.fire(ruleset::DMARC_PCT_INVALID);
    } else {
        // An absent pct tag defaults to 100.
        match dmarc.pct {
            Some(pct) if pct < 100 => tags.fire(ruleset::DMARC_PCT_LT_100),
            _ => tags.fire(ruleset::DMARC_PCT_100),
        }
    }

    if dmarc.rua.is_empty() {
        tags.fire(ruleset::DMARC_RUA_MISSING);
    } else {
        // A mixed address list fires both: the checks are independent, not
        // mutually exclusive.
        if dmarc.rua.iter().any(|a| reports_to_central(a, rs)) {
            tags.fire(ruleset::DMARC_RUA_CENTRAL);
        }
        if dmarc.rua.iter().any(|a| !reports_to_central(a, rs)) {
            tags.fire(ruleset::DMARC_RUA_EXTERNAL);
        }
    }

    match dmarc.subdomain_policy {
        None => tags.fire(ruleset::DMARC_SP_MISSING),
        Some(DmarcPolicy::None) => tags.fire(ruleset::DMARC_SP_NONE),
        Some(DmarcPolicy::Quarantine) => tags.fire(ruleset::DMARC_SP_QUARANTINE),
        Some(DmarcPolicy::Reject) => tags.fire(ruleset::DMARC_SP_REJECT),
    }

    tags.finish()
}

fn reports_to_central(address: &str, rs: &GuidanceRuleSet) -> bool {
    address
        .rsplit('@')
        .next()
        .map(|domain| {
            domain == rs.central_report_domain
                || domain.ends_with(&format!(".{}", rs.central_report_domain))
        })
        .unwrap_or(false)
}

pub fn classify_spf(probe: &RecordProbe<SpfRecord>, rs: &GuidanceRuleSet) -> Guidance {
    let spf = match probe {
        RecordProbe::Found(record) => record,
        RecordProbe::Missing => return missing_guidance(rs, ruleset::SPF_MISSING),
        RecordProbe::Error(_) => return Guidance::info(),
    };

    let mut tags = TagCollector::new(rs);

    match spf.all_qualifier {
        None => tags.fire(ruleset::SPF_ALL_MISSING),
        Some(SpfQualifier::Pass) => tags.fire(ruleset::SPF_ALL_ALLOW),
        Some(SpfQualifier::Neutral) => tags.fire(ruleset::SPF_ALL_NEUTRAL),
        Some(SpfQualifier::SoftFail) => tags.fire(ruleset::SPF_ALL_SOFTFAIL),
        Some(SpfQualifier::Fail) => tags.fire(ruleset::SPF_ALL_HARDFAIL),
    }

    if spf.lookup_count > rs.spf_max_lookups {
        tags.fire(ruleset::SPF_LOOKUP_LIMIT);
    }

    tags.finish()
}

/// DKIM guidance aggregates across selectors: every selector's findings fire
/// into one tag set, and any selector without a usable key marks the category.
pub fn classify_dkim(
    selectors: &BTreeMap<String, RecordProbe<DkimRecord>>,
    rs: &GuidanceRuleSet,
) -> Guidance {
    let mut tags = TagCollector::new(rs);
    let mut any_found = false;

    for probe in selectors.values() {
        match probe {
            RecordProbe::Found(record) => {
                any_found = true;
                classify_dkim_record(record, rs, &mut tags);
            }
            RecordProbe::Missing => tags.fire(ruleset::DKIM_MISSING),
            // A transport failure for one selector does not poison the
            // others; it simply contributes no tags.
            RecordProbe::Error(_) => {}
        }
    }

    if !any_found && tags.is_empty() {
        // Every selector errored out: no data, no findings.
        return Guidance::info();
    }

    tags.finish()
}

fn classify_dkim_record(record: &DkimRecord, rs: &GuidanceRuleSet, tags: &mut TagCollector<'_>) {
    if record.key_revoked {
        tags.fire(ruleset::DKIM_KEY_REVOKED);
        return;
    }

    match record.key_type.as_str() {
        "rsa" => match record.key_size {
            Some(bits) if bits < rs.dkim_min_key_bits => tags.fire(ruleset::DKIM_KEY_WEAK),
            Some(bits) if bits >= 4096 => tags.fire(ruleset::DKIM_KEY_4096),
            Some(_) => tags.fire(ruleset::DKIM_KEY_2048),
            None => tags.fire(ruleset::DKIM_KEY_UNSUPPORTED),
        },
        "ed25519" => tags.fire(ruleset::DKIM_KEY_2048),
        _ => tags.fire(ruleset::DKIM_KEY_UNSUPPORTED),
    }

    if record.test_mode {
        tags.fire(ruleset::DKIM_TEST_MODE);
    }
}
