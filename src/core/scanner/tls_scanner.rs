// src/core/scanner/tls_scanner.rs

//! TLS/SSL scanner. A connectivity probe runs first and short-circuits to
//! `Unreachable`; after that, cipher acceptance is enumerated per protocol
//! version, named-group support and the Heartbleed/CCS-injection behaviors
//! are probed on the wire, and the leaf certificate's signature algorithm is
//! read from a plain handshake. The whole probe is blocking socket work, so
//! it runs under `spawn_blocking` off the async runtime.

use std::collections::BTreeMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_trait::async_trait;
use native_tls::TlsConnector;
use tokio::task::spawn_blocking;
use tracing::{debug, error, info};
use x509_parser::prelude::parse_x509_certificate;

use super::tls_wire::{self, Record};
use super::{ProtocolScanner, ScanTask};
use crate::core::models::{ProtocolFamily, RawScanResult, TlsResult, TlsVersion};

pub struct TlsScanner {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TlsScanner {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl ProtocolScanner for TlsScanner {
    fn protocol(&self) -> ProtocolFamily {
        ProtocolFamily::Tls
    }

    async fn probe(&self, task: &ScanTask) -> RawScanResult {
        info!(scan_id = %task.scan_id, target = %task.domain, "starting TLS scan");
        let domain = task.domain.clone();
        // A pinned IP overrides name resolution; SNI still carries the domain.
        let connect_host = task.ip_address.clone().unwrap_or_else(|| domain.clone());
        let connect_timeout = self.connect_timeout;
        let io_timeout = self.io_timeout;

        let scan_id = task.scan_id;
        spawn_blocking(move || perform_tls_scan(&domain, &connect_host, connect_timeout, io_timeout))
            .await
            .unwrap_or_else(|e| {
                error!(scan_id = %scan_id, panic = %e, "blocking TLS scan task panicked");
                RawScanResult::Unreachable
            })
    }
}

struct Prober<'a> {
    domain: &'a str,
    connect_host: &'a str,
    connect_timeout: Duration,
    io_timeout: Duration,
}

fn perform_tls_scan(
    domain: &str,
    connect_host: &str,
    connect_timeout: Duration,
    io_timeout: Duration,
) -> RawScanResult {
    let prober = Prober {
        domain,
        connect_host,
        connect_timeout,
        io_timeout,
    };

    // Connectivity first; nothing else is attempted when the port is closed.
    if prober.connect().is_err() {
        debug!(target = domain, "TCP connectivity probe failed");
        return RawScanResult::Unreachable;
    }

    let mut accepted_ciphers = BTreeMap::new();
    for &version in tls_wire::PROBED_VERSIONS {
        let accepted = prober.enumerate_ciphers(version);
        if !accepted.is_empty() {
            accepted_ciphers.insert(version, accepted);
        }
    }

    let supported_curves = prober.enumerate_curves();
    let heartbleed = prober.probe_heartbleed();
    let ccs_injection = prober.probe_ccs_injection();
    let signature_algorithm = prober.leaf_signature_algorithm();

    info!(
        target = domain,
        versions = accepted_ciphers.len(),
        curves = supported_curves.len(),
        heartbleed,
        ccs_injection,
        "TLS scan finished"
    );

    RawScanResult::Tls(TlsResult {
        accepted_ciphers,
        supported_curves,
        signature_algorithm,
        heartbleed,
        ccs_injection,
    })
}

impl Prober<'_> {
    fn connect(&self) -> io::Result<TcpStream> {
        let addr = format!("{}:443", self.connect_host)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no resolved address"))?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)?;
        stream.set_read_timeout(Some(self.io_timeout))?;
        stream.set_write_timeout(Some(self.io_timeout))?;
        Ok(stream)
    }

    /// Offers the remaining suite battery repeatedly, removing each suite the
    /// server picks, until it stops accepting. Every accepted suite needs its
    /// own connection because a handshake commits to one choice.
    fn enumerate_ciphers(&self, version: TlsVersion) -> Vec<String> {
        let mut remaining: Vec<u16> = tls_wire::CIPHER_SUITES.iter().map(|s| s.id).collect();
        let mut accepted = Vec::new();

        while !remaining.is_empty() {
            let Some(cipher) = self.offer(version, &remaining, &[]) else {
                break;
            };
            if !remaining.contains(&cipher) {
                // The server chose a suite we did not offer; stop trusting it.
                break;
            }
            remaining.retain(|&id| id != cipher);
            if let Some(name) = tls_wire::suite_name(cipher) {
                accepted.push(name.to_string());
            }
        }

        accepted.sort();
        accepted
    }

    /// Offers one named group at a time with every ECDHE suite; a completed
    /// ServerHello means the group is supported.
    fn enumerate_curves(&self) -> Vec<String> {
        let ecdhe: Vec<u16> = tls_wire::CIPHER_SUITES
            .iter()
            .filter(|s| s.name.contains("ECDHE"))
            .map(|s| s.id)
            .collect();

        let mut curves = Vec::new();
        for &(group, name) in tls_wire::NAMED_GROUPS {
            if self.offer(TlsVersion::Tls12, &ecdhe, &[group]).is_some() {
                curves.push(tls_wire::normalize_curve_name(name));
            }
        }
        curves
    }

    /// Sends one ClientHello and reports the cipher from the server's
    /// ServerHello, or `None` when the server rejects the offer.
    fn offer(&self, version: TlsVersion, ciphers: &[u16], groups: &[u16]) -> Option<u16> {
        let mut stream = self.connect().ok()?;
        let hello = tls_wire::build_client_hello(version, self.domain, ciphers, groups, false);
        tls_wire::write_all(&mut stream, &hello).ok()?;
        let record = first_handshake_record(&mut stream)?;
        tls_wire::parse_server_hello_cipher(&record.payload)
    }

    fn probe_heartbleed(&self) -> bool {
        let version = TlsVersion::Tls12;
        let Ok(mut stream) = self.connect() else {
            return false;
        };
        let all: Vec<u16> = tls_wire::CIPHER_SUITES.iter().map(|s| s.id).collect();
        let hello = tls_wire::build_client_hello(version, self.domain, &all, &[23, 24, 25], true);
        if tls_wire::write_all(&mut stream, &hello).is_err() {
            return false;
        }
        if first_handshake_record(&mut stream).is_none() {
            return false;
        }

        let probe = tls_wire::build_heartbeat_probe(version);
        if tls_wire::write_all(&mut stream, &probe).is_err() {
            return false;
        }
        // A patched server drops the connection or alerts; only an actual
        // heartbeat response proves the leak.
        for _ in 0..4 {
            match tls_wire::read_record(&mut stream) {
                Ok(record) if record.content_type == tls_wire::CONTENT_HEARTBEAT => return true,
                Ok(record) if record.content_type == tls_wire::CONTENT_ALERT => return false,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
        false
    }

    fn probe_ccs_injection(&self) -> bool {
        let version = TlsVersion::Tls12;
        let Ok(mut stream) = self.connect() else {
            return false;
        };
        let all: Vec<u16> = tls_wire::CIPHER_SUITES.iter().map(|s| s.id).collect();
        let hello = tls_wire::build_client_hello(version, self.domain, &all, &[23, 24, 25], false);
        if tls_wire::write_all(&mut stream, &hello).is_err() {
            return false;
        }
        if first_handshake_record(&mut stream).is_none() {
            return false;
        }

        // ChangeCipherSpec before any key exchange. A correct peer answers
        // with an unexpected_message alert or hangs up.
        let ccs = tls_wire::build_early_ccs(version);
        if tls_wire::write_all(&mut stream, &ccs).is_err() {
            return false;
        }
        for _ in 0..4 {
            match tls_wire::read_record(&mut stream) {
                Ok(record) if record.content_type == tls_wire::CONTENT_ALERT => return false,
                Ok(record) if record.content_type == tls_wire::CONTENT_HANDSHAKE => continue,
                Ok(_) => return true,
                Err(_) => return false,
            }
        }
        false
    }

    /// Completes one ordinary handshake to read the leaf certificate, then
    /// maps its signature OID to a readable algorithm name. Verification is
    /// disabled on purpose: a bad certificate still has a signature algorithm
    /// worth classifying.
    fn leaf_signature_algorithm(&self) -> Option<String> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .ok()?;
        let stream = self.connect().ok()?;
        let tls = connector.connect(self.domain, stream).ok()?;
        let cert = tls.peer_certificate().ok()??;
        let der = cert.to_der().ok()?;
        let (_, x509) = parse_x509_certificate(&der).ok()?;
        Some(signature_algorithm_name(
            &x509.signature_algorithm.algorithm.to_id_string(),
        ))
    }
}

/// Reads records until the first handshake record arrives, skipping at most
/// a few non-handshake records.
fn first_handshake_record<S: io::Read>(stream: &mut S) -> Option<Record> {
    for _ in 0..4 {
        match tls_wire::read_record(stream) {
            Ok(record) if record.content_type == tls_wire::CONTENT_HANDSHAKE => {
                return Some(record)
            }
            Ok(record) if record.content_type == tls_wire::CONTENT_ALERT => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

fn signature_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.4" => "md5WithRSAEncryption",
        "1.2.840.113549.1.1.5" => "sha1WithRSAEncryption",
        "1.2.840.113549.1.1.11" => "sha256WithRSAEncryption",
        "1.2.840.113549.1.1.12" => "sha384WithRSAEncryption",
        "1.2.840.113549.1.1.13" => "sha512WithRSAEncryption",
        "1.2.840.10045.4.1" => "ecdsa-with-SHA1",
        "1.2.840.10045.4.3.2" => "ecdsa-with-SHA256",
        "1.2.840.10045.4.3.3" => "ecdsa-with-SHA384",
        "1.2.840.10045.4.3.4" => "ecdsa-with-SHA512",
        other => other,
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_oids_map_to_names() {
        assert_eq!(
            signature_algorithm_name("1.2.840.113549.1.1.11"),
            "sha256WithRSAEncryption"
        );
        assert_eq!(
            signature_algorithm_name("1.2.840.113549.1.1.5"),
            "sha1WithRSAEncryption"
        );
        // Unknown OIDs pass through for the record.
        assert_eq!(signature_algorithm_name("1.2.3.4"), "1.2.3.4");
    }

    #[tokio::test]
    async fn closed_port_reports_unreachable() {
        let scanner = TlsScanner::new(Duration::from_millis(200), Duration::from_millis(200));
        let task = ScanTask {
            scan_id: uuid::Uuid::new_v4(),
            domain: "127.0.0.1".into(),
            selectors: vec![],
            // TEST-NET-1, guaranteed unroutable.
            ip_address: Some("192.0.2.1".into()),
        };
        let raw = scanner.probe(&task).await;
        assert_eq!(raw, RawScanResult::Unreachable);
    }
}
