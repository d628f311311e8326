//! The static, versioned rule table that drives classification.
//!
//! Tags are never created at runtime, only selected. Each entry carries the
//! stable short code persisted with results, a human-readable name, the
//! category it belongs to, and its polarity. Classification is a pure
//! function of a raw result and one version of this table, so reprocessing
//! old raw results with the same version reproduces identical tag sets.

use crate::core::models::{Polarity, ScanCategory};

/// One selectable guidance tag.
pub struct TagDef {
    /// Stable short code, e.g. `dmarc10`.
    pub id: &'static str,
    /// Human-readable name shown alongside the code.
    pub name: &'static str,
    pub category: ScanCategory,
    pub polarity: Polarity,
}

/// An immutable, versioned table of classification rules per protocol.
pub struct GuidanceRuleSet {
    pub version: &'static str,
    /// Mailbox domain where aggregate DMARC reports are expected to land.
    pub central_report_domain: &'static str,
    /// Minimum acceptable HSTS max-age, one year in seconds.
    pub hsts_min_age: u64,
    /// RSA keys below this many bits are flagged as weak.
    pub dkim_min_key_bits: u32,
    /// DNS-querying SPF mechanisms above this count exceed the RFC 7208 limit.
    pub spf_max_lookups: u32,
    tags: &'static [TagDef],
}

impl GuidanceRuleSet {
    pub fn tag(&self, id: &str) -> Option<&'static TagDef> {
        self.tags.iter().find(|t| t.id == id)
    }

    pub fn polarity(&self, id: &str) -> Option<Polarity> {
        self.tag(id).map(|t| t.polarity)
    }

    pub fn tags(&self) -> &'static [TagDef] {
        self.tags
    }
}

// DMARC tags.
pub const DMARC_MISSING: &str = "dmarc2";
pub const DMARC_P_MISSING: &str = "dmarc3";
pub const DMARC_P_NONE: &str = "dmarc4";
pub const DMARC_P_QUARANTINE: &str = "dmarc5";
pub const DMARC_P_REJECT: &str = "dmarc6";
pub const DMARC_PCT_100: &str = "dmarc7";
pub const DMARC_PCT_LT_100: &str = "dmarc8";
pub const DMARC_PCT_INVALID: &str = "dmarc9";
pub const DMARC_RUA_CENTRAL: &str = "dmarc10";
pub const DMARC_RUA_EXTERNAL: &str = "dmarc11";
pub const DMARC_RUA_MISSING: &str = "dmarc12";
pub const DMARC_SP_MISSING: &str = "dmarc13";
pub const DMARC_SP_NONE: &str = "dmarc14";
pub const DMARC_SP_QUARANTINE: &str = "dmarc15";
pub const DMARC_SP_REJECT: &str = "dmarc16";

// SPF tags.
pub const SPF_MISSING: &str = "spf2";
pub const SPF_ALL_MISSING: &str = "spf3";
pub const SPF_ALL_ALLOW: &str = "spf4";
pub const SPF_ALL_NEUTRAL: &str = "spf5";
pub const SPF_ALL_SOFTFAIL: &str = "spf6";
pub const SPF_ALL_HARDFAIL: &str = "spf7";
pub const SPF_LOOKUP_LIMIT: &str = "spf8";

// DKIM tags.
pub const DKIM_MISSING: &str = "dkim2";
pub const DKIM_KEY_UNSUPPORTED: &str = "dkim3";
pub const DKIM_KEY_WEAK: &str = "dkim4";
pub const DKIM_KEY_2048: &str = "dkim5";
pub const DKIM_KEY_4096: &str = "dkim6";
pub const DKIM_TEST_MODE: &str = "dkim7";
pub const DKIM_KEY_REVOKED: &str = "dkim8";

// SSL/TLS tags.
pub const SSL_MISSING: &str = "ssl2";
pub const SSL_RC4: &str = "ssl3";
pub const SSL_3DES: &str = "ssl4";
pub const SSL_LEGACY_PROTOCOL: &str = "ssl5";
pub const SSL_HEARTBLEED: &str = "ssl6";
pub const SSL_CCS_INJECTION: &str = "ssl7";
pub const SSL_WEAK_CURVE: &str = "ssl8";
pub const SSL_WEAK_SIGNATURE: &str = "ssl9";
pub const SSL_STRONG_CONFIG: &str = "ssl10";

// HTTPS tags.
pub const HTTPS_MISSING: &str = "https2";
pub const HTTPS_DOWNGRADES: &str = "https3";
pub const HTTPS_BAD_HOSTNAME: &str = "https4";
pub const HTTPS_BAD_CHAIN: &str = "https5";
pub const HTTPS_VALID: &str = "https6";
pub const HTTPS_ENFORCED_STRICT: &str = "https7";
pub const HTTPS_ENFORCED_MODERATE: &str = "https8";
pub const HTTPS_ENFORCED_WEAK: &str = "https9";
pub const HTTPS_NOT_ENFORCED: &str = "https10";
pub const HTTPS_HSTS_IMPLEMENTED: &str = "https11";
pub const HTTPS_HSTS_SHORT_AGE: &str = "https12";
pub const HTTPS_HSTS_MISSING: &str = "https13";
pub const HTTPS_PRELOAD_READY: &str = "https14";
pub const HTTPS_NOT_PRELOADED: &str = "https15";
pub const HTTPS_CERT_EXPIRED: &str = "https16";
pub const HTTPS_CERT_SELF_SIGNED: &str = "https17";
pub const HTTPS_CERT_REVOKED: &str = "https18";
pub const HTTPS_CERT_REVOCATION_UNKNOWN: &str = "https19";

static TAGS_V1: &[TagDef] = &[
    // --- DMARC ---
    TagDef {
        id: DMARC_MISSING,
        name: "DMARC record missing",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DMARC_P_MISSING,
        name: "Policy tag missing",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DMARC_P_NONE,
        name: "Policy is none",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Neutral,
    },
    TagDef {
        id: DMARC_P_QUARANTINE,
        name: "Policy is quarantine",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: DMARC_P_REJECT,
        name: "Policy is reject",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: DMARC_PCT_100,
        name: "Percentage covers all mail",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: DMARC_PCT_LT_100,
        name: "Percentage below 100",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DMARC_PCT_INVALID,
        name: "Percentage tag invalid",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DMARC_RUA_CENTRAL,
        name: "Aggregate reports reach central mailbox",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: DMARC_RUA_EXTERNAL,
        name: "Aggregate reports sent elsewhere",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DMARC_RUA_MISSING,
        name: "No aggregate report address",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DMARC_SP_MISSING,
        name: "Subdomain policy missing",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Neutral,
    },
    TagDef {
        id: DMARC_SP_NONE,
        name: "Subdomain policy is none",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Neutral,
    },
    TagDef {
        id: DMARC_SP_QUARANTINE,
        name: "Subdomain policy is quarantine",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: DMARC_SP_REJECT,
        name: "Subdomain policy is reject",
        category: ScanCategory::Dmarc,
        polarity: Polarity::Positive,
    },
    // --- SPF ---
    TagDef {
        id: SPF_MISSING,
        name: "SPF record missing",
        category: ScanCategory::Spf,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SPF_ALL_MISSING,
        name: "No terminal all mechanism",
        category: ScanCategory::Spf,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SPF_ALL_ALLOW,
        name: "Terminal all permits everyone",
        category: ScanCategory::Spf,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SPF_ALL_NEUTRAL,
        name: "Terminal all is neutral",
        category: ScanCategory::Spf,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SPF_ALL_SOFTFAIL,
        name: "Terminal all is softfail",
        category: ScanCategory::Spf,
        polarity: Polarity::Neutral,
    },
    TagDef {
        id: SPF_ALL_HARDFAIL,
        name: "Terminal all is hardfail",
        category: ScanCategory::Spf,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: SPF_LOOKUP_LIMIT,
        name: "DNS lookup limit exceeded",
        category: ScanCategory::Spf,
        polarity: Polarity::Negative,
    },
    // --- DKIM ---
    TagDef {
        id: DKIM_MISSING,
        name: "DKIM record missing",
        category: ScanCategory::Dkim,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DKIM_KEY_UNSUPPORTED,
        name: "Unsupported key type",
        category: ScanCategory::Dkim,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DKIM_KEY_WEAK,
        name: "Key below minimum size",
        category: ScanCategory::Dkim,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: DKIM_KEY_2048,
        name: "2048-bit key",
        category: ScanCategory::Dkim,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: DKIM_KEY_4096,
        name: "4096-bit key",
        category: ScanCategory::Dkim,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: DKIM_TEST_MODE,
        name: "Selector in test mode",
        category: ScanCategory::Dkim,
        polarity: Polarity::Neutral,
    },
    TagDef {
        id: DKIM_KEY_REVOKED,
        name: "Key revoked",
        category: ScanCategory::Dkim,
        polarity: Polarity::Negative,
    },
    // --- SSL/TLS ---
    TagDef {
        id: SSL_MISSING,
        name: "No TLS service",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_RC4,
        name: "RC4 cipher accepted",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_3DES,
        name: "3DES cipher accepted",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_LEGACY_PROTOCOL,
        name: "Legacy protocol version accepted",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_HEARTBLEED,
        name: "Vulnerable to Heartbleed",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_CCS_INJECTION,
        name: "Vulnerable to CCS injection",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_WEAK_CURVE,
        name: "Weak elliptic curve supported",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_WEAK_SIGNATURE,
        name: "Weak certificate signature algorithm",
        category: ScanCategory::Ssl,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: SSL_STRONG_CONFIG,
        name: "Acceptable TLS configuration",
        category: ScanCategory::Ssl,
        polarity: Polarity::Positive,
    },
    // --- HTTPS ---
    TagDef {
        id: HTTPS_MISSING,
        name: "HTTPS not implemented",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_DOWNGRADES,
        name: "HTTPS downgrades to HTTP",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_BAD_HOSTNAME,
        name: "Certificate hostname mismatch",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_BAD_CHAIN,
        name: "Certificate chain invalid",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_VALID,
        name: "Valid HTTPS",
        category: ScanCategory::Https,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: HTTPS_ENFORCED_STRICT,
        name: "HTTPS strictly enforced",
        category: ScanCategory::Https,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: HTTPS_ENFORCED_MODERATE,
        name: "HTTPS moderately enforced",
        category: ScanCategory::Https,
        polarity: Polarity::Neutral,
    },
    TagDef {
        id: HTTPS_ENFORCED_WEAK,
        name: "HTTPS weakly enforced",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_NOT_ENFORCED,
        name: "HTTPS not enforced",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_HSTS_IMPLEMENTED,
        name: "HSTS fully implemented",
        category: ScanCategory::Https,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: HTTPS_HSTS_SHORT_AGE,
        name: "HSTS max-age too short",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_HSTS_MISSING,
        name: "HSTS missing",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_PRELOAD_READY,
        name: "HSTS preload directive present",
        category: ScanCategory::Https,
        polarity: Polarity::Positive,
    },
    TagDef {
        id: HTTPS_NOT_PRELOADED,
        name: "Not preloaded",
        category: ScanCategory::Https,
        polarity: Polarity::Neutral,
    },
    TagDef {
        id: HTTPS_CERT_EXPIRED,
        name: "Certificate expired",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_CERT_SELF_SIGNED,
        name: "Certificate self-signed",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_CERT_REVOKED,
        name: "Certificate revoked",
        category: ScanCategory::Https,
        polarity: Polarity::Negative,
    },
    TagDef {
        id: HTTPS_CERT_REVOCATION_UNKNOWN,
        name: "Revocation status unknown",
        category: ScanCategory::Https,
        polarity: Polarity::Neutral,
    },
];

/// The current rule set. Bump the version whenever a tag's polarity or a
/// threshold changes so reprocessed results stay attributable.
pub static RULESET_V1: GuidanceRuleSet = GuidanceRuleSet {
    version: "1.0.0",
    central_report_domain: "cyber.gc.ca",
    hsts_min_age: 31_536_000,
    dkim_min_key_bits: 2048,
    spf_max_lookups: 10,
    tags: TAGS_V1,
};
