// src/core/scanner/https_scanner.rs

//! HTTPS/HSTS scanner.
//!
//! Works with two HTTP clients: a strict one that enforces certificate
//! validation, and a permissive one that accepts any certificate so that the
//! rest of the probe (redirect behavior, HSTS header, certificate contents)
//! still runs against misconfigured hosts. Redirects are never followed
//! automatically; the chain is walked by hand so every hop's scheme is
//! observable.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use native_tls::TlsConnector;
use reqwest::{redirect, Client, Response};
use tokio::task::spawn_blocking;
use tracing::{debug, error, info, warn};
use url::Url;
use x509_parser::prelude::parse_x509_certificate;

use super::{ProtocolScanner, ScanTask};
use crate::core::models::{
    HstsPolicy, HttpsEnforcement, HttpsImplementation, HttpsResult, ProtocolFamily, RawScanResult,
    RevocationStatus,
};

const MAX_REDIRECT_HOPS: usize = 10;

pub struct HttpsScanner {
    strict: Client,
    insecure: Client,
    probe_timeout: Duration,
}

impl HttpsScanner {
    pub fn new(probe_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            strict: client_builder(probe_timeout).build()?,
            insecure: client_builder(probe_timeout)
                .danger_accept_invalid_certs(true)
                .build()?,
            probe_timeout,
        })
    }

    /// Returns the shared clients, or per-probe clients with the resolver
    /// pinned to the task's address.
    fn clients_for(&self, task: &ScanTask) -> Result<(Client, Client), reqwest::Error> {
        let Some(ip) = task.ip_address.as_deref() else {
            return Ok((self.strict.clone(), self.insecure.clone()));
        };
        let Ok(addr) = format!("{ip}:443").parse::<SocketAddr>() else {
            warn!(ip, "ignoring unparseable pinned address");
            return Ok((self.strict.clone(), self.insecure.clone()));
        };
        let strict = client_builder(self.probe_timeout)
            .resolve(&task.domain, addr)
            .build()?;
        let insecure = client_builder(self.probe_timeout)
            .resolve(&task.domain, addr)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok((strict, insecure))
    }
}

fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    Client::builder()
        .redirect(redirect::Policy::none())
        .timeout(timeout)
        .use_rustls_tls()
}

#[async_trait]
impl ProtocolScanner for HttpsScanner {
    fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::Https
    }

    async fn probe(&self, task: &ScanTask) -> RawScanResult {
        info!(scan_id = %task.scan_id, target = %task.domain, "starting HTTPS scan");
        let (strict, insecure) = match self.clients_for(task) {
            Ok(clients) => clients,
            Err(e) => {
                error!(scan_id = %task.scan_id, error = %e, "HTTP client construction failed");
                return RawScanResult::Unreachable;
            }
        };

        let https_url = format!("https://{}/", task.domain);
        let http_url = format!("http://{}/", task.domain);

        let (https_response, strict_result, http_response) = tokio::join!(
            insecure.get(&https_url).send(),
            strict.get(&https_url).send(),
            insecure.get(&http_url).send(),
        );

        let https_serving = https_response.is_ok();
        let http_serving = http_response.is_ok();
        if !https_serving && !http_serving {
            debug!(target = %task.domain, "neither port answered");
            return RawScanResult::Unreachable;
        }

        // Implementation axis. A chain that leaves HTTPS outranks everything
        // else; certificate validity only matters for a site that stays on
        // HTTPS.
        let implementation = if !https_serving {
            HttpsImplementation::NoHttps
        } else {
            let chain = match Url::parse(&https_url) {
                Ok(start) => walk_redirects(&insecure, start).await.0,
                Err(_) => vec![],
            };
            if chain_downgrades(&chain) {
                HttpsImplementation::Downgrades
            } else {
                match &strict_result {
                    Ok(_) => HttpsImplementation::Valid,
                    Err(e) => classify_validation_error(e),
                }
            }
        };

        // Enforcement axis: what happens to a plaintext visitor.
        let enforcement = if !http_serving {
            HttpsEnforcement::Strict
        } else {
            let chain = match Url::parse(&http_url) {
                Ok(start) => walk_redirects(&insecure, start).await.0,
                Err(_) => vec![],
            };
            classify_enforcement(&chain, https_serving)
        };

        let hsts = https_response.ok().and_then(extract_hsts);

        let (cert_expired, cert_self_signed) = if https_serving {
            inspect_certificate(task, self.probe_timeout).await
        } else {
            (false, false)
        };

        // Without OCSP/CRL checks the only trustworthy verdict is the strict
        // validator's acceptance; anything else stays unknown.
        let cert_revocation = if strict_result.is_ok() {
            RevocationStatus::Good
        } else {
            RevocationStatus::Unknown
        };

        info!(
            target = %task.domain,
            implementation = ?implementation,
            enforcement = ?enforcement,
            hsts = hsts.is_some(),
            "HTTPS scan finished"
        );

        RawScanResult::Https(HttpsResult {
            implementation,
            enforcement,
            hsts,
            cert_expired,
            cert_self_signed,
            cert_revocation,
        })
    }
}

/// Walks a redirect chain by hand, resolving relative `Location` values
/// against the current hop. Returns every URL visited plus the terminal
/// response.
async fn walk_redirects(client: &Client, start: Url) -> (Vec<Url>, Option<Response>) {
    let mut chain = vec![start.clone()];
    let mut current = start;

    for _ in 0..MAX_REDIRECT_HOPS {
        let response = match client.get(current.clone()).send().await {
            Ok(r) => r,
            Err(_) => return (chain, None),
        };
        if !response.status().is_redirection() {
            return (chain, Some(response));
        }
        let Some(next) = redirect_target(&current, &response) else {
            return (chain, Some(response));
        };
        chain.push(next.clone());
        current = next;
    }
    (chain, None)
}

fn redirect_target(current: &Url, response: &Response) -> Option<Url> {
    let location = response.headers().get(reqwest::header::LOCATION)?;
    let location = location.to_str().ok()?;
    current.join(location).ok()
}

/// Any hop on plain HTTP after the first makes the chain a downgrade.
fn chain_downgrades(chain: &[Url]) -> bool {
    chain.iter().skip(1).any(|u| u.scheme() == "http")
}

fn classify_enforcement(http_chain: &[Url], https_serving: bool) -> HttpsEnforcement {
    let first_hop_https = http_chain.get(1).is_some_and(|u| u.scheme() == "https");
    let reaches_https = http_chain.iter().any(|u| u.scheme() == "https");
    if first_hop_https {
        HttpsEnforcement::Strict
    } else if reaches_https {
        HttpsEnforcement::Moderate
    } else if https_serving {
        HttpsEnforcement::Weak
    } else {
        HttpsEnforcement::NotEnforced
    }
}

/// Splits certificate failures into hostname mismatches and chain problems
/// by inspecting the error's source chain.
fn classify_validation_error(error: &reqwest::Error) -> HttpsImplementation {
    let mut text = error.to_string().to_ascii_lowercase();
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        text.push(' ');
        text.push_str(&inner.to_string().to_ascii_lowercase());
        source = inner.source();
    }
    if text.contains("hostname") || text.contains("notvalidforname") || text.contains("san") {
        HttpsImplementation::BadHostname
    } else {
        HttpsImplementation::BadChain
    }
}

fn extract_hsts(response: Response) -> Option<HstsPolicy> {
    let header = response
        .headers()
        .get("strict-transport-security")?
        .to_str()
        .ok()?;
    parse_hsts(header)
}

/// Parses a `Strict-Transport-Security` value. A header without a readable
/// `max-age` is treated as absent, which is what RFC 6797 requires of
/// conforming agents.
fn parse_hsts(header: &str) -> Option<HstsPolicy> {
    let mut max_age = None;
    let mut include_subdomains = false;
    let mut preload = false;

    for directive in header.split(';') {
        let directive = directive.trim();
        if let Some((name, value)) = directive.split_once('=') {
            if name.trim().eq_ignore_ascii_case("max-age") {
                max_age = value.trim().trim_matches('"').parse::<u64>().ok();
            }
        } else if directive.eq_ignore_ascii_case("includesubdomains") {
            include_subdomains = true;
        } else if directive.eq_ignore_ascii_case("preload") {
            preload = true;
        }
    }

    Some(HstsPolicy {
        max_age: max_age?,
        include_subdomains,
        preload,
    })
}

/// Pulls the leaf certificate over a validation-free handshake and reports
/// (expired, self-signed). Blocking socket work, so it runs off-runtime.
async fn inspect_certificate(task: &ScanTask, timeout: Duration) -> (bool, bool) {
    let domain = task.domain.clone();
    let connect_host = task.ip_address.clone().unwrap_or_else(|| domain.clone());
    let scan_id = task.scan_id;

    spawn_blocking(move || read_leaf_certificate(&domain, &connect_host, timeout))
        .await
        .unwrap_or_else(|e| {
            error!(scan_id = %scan_id, panic = %e, "blocking certificate probe panicked");
            (false, false)
        })
}

fn read_leaf_certificate(domain: &str, connect_host: &str, timeout: Duration) -> (bool, bool) {
    let handshake = || -> Option<Vec<u8>> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .ok()?;
        let addr = format!("{connect_host}:443").to_socket_addrs().ok()?.next()?;
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout).ok()?;
        stream.set_read_timeout(Some(timeout)).ok()?;
        stream.set_write_timeout(Some(timeout)).ok()?;
        let tls = connector.connect(domain, stream).ok()?;
        tls.peer_certificate().ok()??.to_der().ok()
    };

    let Some(der) = handshake() else {
        return (false, false);
    };
    match parse_x509_certificate(&der) {
        Ok((_, x509)) => {
            let expired = !x509.validity().is_valid();
            let self_signed = x509.issuer().to_string() == x509.subject().to_string();
            (expired, self_signed)
        }
        Err(e) => {
            debug!(target = domain, error = %e, "leaf certificate did not parse");
            (false, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(raw: &[&str]) -> Vec<Url> {
        raw.iter().map(|u| Url::parse(u).unwrap()).collect()
    }

    #[test]
    fn hsts_directives_parse() {
        let policy = parse_hsts("max-age=31536000; includeSubDomains; preload").unwrap();
        assert_eq!(policy.max_age, 31_536_000);
        assert!(policy.include_subdomains);
        assert!(policy.preload);

        let bare = parse_hsts("max-age=300").unwrap();
        assert_eq!(bare.max_age, 300);
        assert!(!bare.include_subdomains);
        assert!(!bare.preload);
    }

    #[test]
    fn hsts_without_max_age_is_absent() {
        assert!(parse_hsts("includeSubDomains; preload").is_none());
        assert!(parse_hsts("max-age=soon").is_none());
    }

    #[test]
    fn first_hop_upgrade_is_strict() {
        let chain = urls(&["http://example.org/", "https://example.org/"]);
        assert_eq!(classify_enforcement(&chain, true), HttpsEnforcement::Strict);
    }

    #[test]
    fn late_upgrade_is_moderate() {
        let chain = urls(&[
            "http://example.org/",
            "http://www.example.org/",
            "https://www.example.org/",
        ]);
        assert_eq!(
            classify_enforcement(&chain, true),
            HttpsEnforcement::Moderate
        );
    }

    #[test]
    fn plaintext_site_with_https_available_is_weak() {
        let chain = urls(&["http://example.org/"]);
        assert_eq!(classify_enforcement(&chain, true), HttpsEnforcement::Weak);
        assert_eq!(
            classify_enforcement(&chain, false),
            HttpsEnforcement::NotEnforced
        );
    }

    #[test]
    fn chain_leaving_https_downgrades() {
        assert!(chain_downgrades(&urls(&[
            "https://example.org/",
            "http://example.org/legacy",
        ])));
        assert!(!chain_downgrades(&urls(&[
            "https://example.org/",
            "https://www.example.org/",
        ])));
        // The plain starting hop of an HTTP walk is not a downgrade.
        assert!(!chain_downgrades(&urls(&["http://example.org/"])));
    }
}
