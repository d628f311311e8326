// src/core/scanner/tls_wire.rs

//! Minimal TLS record codec for capability probing.
//!
//! The platform TLS stack negotiates one configuration and hides the rest;
//! enumerating what a server *accepts* (cipher suites per protocol version,
//! named groups, heartbeat behavior) requires offering hand-built
//! ClientHellos and reading the server's first reaction off the wire. Only
//! the handful of fields the prober inspects are parsed.

use std::io::{self, Read, Write};

use rand::RngCore;

use crate::core::models::TlsVersion;

pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HEARTBEAT: u8 = 24;
pub const CONTENT_CCS: u8 = 20;

const HANDSHAKE_SERVER_HELLO: u8 = 2;

/// Record-layer version bytes for each probed protocol version.
pub fn wire_version(version: TlsVersion) -> (u8, u8) {
    match version {
        TlsVersion::Ssl30 => (3, 0),
        TlsVersion::Tls10 => (3, 1),
        TlsVersion::Tls11 => (3, 2),
        TlsVersion::Tls12 => (3, 3),
    }
}

pub const PROBED_VERSIONS: &[TlsVersion] = &[
    TlsVersion::Ssl30,
    TlsVersion::Tls10,
    TlsVersion::Tls11,
    TlsVersion::Tls12,
];

pub struct CipherSuite {
    pub id: u16,
    pub name: &'static str,
}

/// The suite battery offered during enumeration. Weak and legacy suites are
/// listed deliberately; accepting one is exactly the finding we probe for.
pub static CIPHER_SUITES: &[CipherSuite] = &[
    CipherSuite { id: 0x0004, name: "TLS_RSA_WITH_RC4_128_MD5" },
    CipherSuite { id: 0x0005, name: "TLS_RSA_WITH_RC4_128_SHA" },
    CipherSuite { id: 0x000a, name: "TLS_RSA_WITH_3DES_EDE_CBC_SHA" },
    CipherSuite { id: 0x002f, name: "TLS_RSA_WITH_AES_128_CBC_SHA" },
    CipherSuite { id: 0x0035, name: "TLS_RSA_WITH_AES_256_CBC_SHA" },
    CipherSuite { id: 0x003c, name: "TLS_RSA_WITH_AES_128_CBC_SHA256" },
    CipherSuite { id: 0x003d, name: "TLS_RSA_WITH_AES_256_CBC_SHA256" },
    CipherSuite { id: 0x009c, name: "TLS_RSA_WITH_AES_128_GCM_SHA256" },
    CipherSuite { id: 0x009d, name: "TLS_RSA_WITH_AES_256_GCM_SHA384" },
    CipherSuite { id: 0xc007, name: "TLS_ECDHE_ECDSA_WITH_RC4_128_SHA" },
    CipherSuite { id: 0xc008, name: "TLS_ECDHE_ECDSA_WITH_3DES_EDE_CBC_SHA" },
    CipherSuite { id: 0xc009, name: "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA" },
    CipherSuite { id: 0xc00a, name: "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA" },
    CipherSuite { id: 0xc011, name: "TLS_ECDHE_RSA_WITH_RC4_128_SHA" },
    CipherSuite { id: 0xc012, name: "TLS_ECDHE_RSA_WITH_3DES_EDE_CBC_SHA" },
    CipherSuite { id: 0xc013, name: "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA" },
    CipherSuite { id: 0xc014, name: "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA" },
    CipherSuite { id: 0xc023, name: "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA256" },
    CipherSuite { id: 0xc024, name: "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA384" },
    CipherSuite { id: 0xc027, name: "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA256" },
    CipherSuite { id: 0xc028, name: "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA384" },
    CipherSuite { id: 0xc02b, name: "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256" },
    CipherSuite { id: 0xc02c, name: "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384" },
    CipherSuite { id: 0xc02f, name: "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256" },
    CipherSuite { id: 0xc030, name: "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384" },
    CipherSuite { id: 0xcca8, name: "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256" },
    CipherSuite { id: 0xcca9, name: "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256" },
];

pub fn suite_name(id: u16) -> Option<&'static str> {
    CIPHER_SUITES.iter().find(|s| s.id == id).map(|s| s.name)
}

/// IANA named groups offered during curve enumeration, already under their
/// SECG names.
pub static NAMED_GROUPS: &[(u16, &'static str)] = &[
    (19, "secp192r1"),
    (21, "secp224r1"),
    (23, "secp256r1"),
    (24, "secp384r1"),
    (25, "secp521r1"),
    (29, "x25519"),
    (30, "x448"),
];

/// Maps the ANSI X9.62 aliases some toolkits emit onto the SECG names the
/// guidance rules match on. Names already in SECG form pass through.
pub fn normalize_curve_name(name: &str) -> String {
    match name {
        "prime192v1" => "secp192r1",
        "prime239v1" => "secp239r1",
        "prime256v1" => "secp256r1",
        "ansip224r1" => "secp224r1",
        "ansip384r1" => "secp384r1",
        "ansip521r1" => "secp521r1",
        other => other,
    }
    .to_string()
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn extension(buf: &mut Vec<u8>, ext_type: u16, body: &[u8]) {
    push_u16(buf, ext_type);
    push_u16(buf, body.len() as u16);
    buf.extend_from_slice(body);
}

/// Builds one complete ClientHello record offering exactly the given suites
/// and groups. `heartbeat` advertises peer-allowed heartbeat support so a
/// later heartbeat request is in-protocol.
pub fn build_client_hello(
    version: TlsVersion,
    hostname: &str,
    cipher_ids: &[u16],
    group_ids: &[u16],
    heartbeat: bool,
) -> Vec<u8> {
    let (major, minor) = wire_version(version);

    let mut body = Vec::with_capacity(256);
    body.push(major);
    body.push(minor);
    let mut random = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random);
    body.extend_from_slice(&random);
    body.push(0); // empty session id

    push_u16(&mut body, (cipher_ids.len() * 2) as u16);
    for id in cipher_ids {
        push_u16(&mut body, *id);
    }
    body.push(1); // compression methods
    body.push(0); // null only

    let mut extensions = Vec::new();

    // server_name
    let host = hostname.as_bytes();
    let mut sni = Vec::new();
    push_u16(&mut sni, (host.len() + 3) as u16);
    sni.push(0); // host_name type
    push_u16(&mut sni, host.len() as u16);
    sni.extend_from_slice(host);
    extension(&mut extensions, 0x0000, &sni);

    // supported_groups
    if !group_ids.is_empty() {
        let mut groups = Vec::new();
        push_u16(&mut groups, (group_ids.len() * 2) as u16);
        for id in group_ids {
            push_u16(&mut groups, *id);
        }
        extension(&mut extensions, 0x000a, &groups);

        // ec_point_formats: uncompressed
        extension(&mut extensions, 0x000b, &[1, 0]);
    }

    // signature_algorithms, TLS 1.2 only
    if version == TlsVersion::Tls12 {
        let algs: &[u8] = &[
            0x04, 0x01, 0x05, 0x01, 0x06, 0x01, // rsa sha256/384/512
            0x04, 0x03, 0x05, 0x03, 0x06, 0x03, // ecdsa sha256/384/512
            0x02, 0x01, 0x02, 0x03, // legacy sha1
        ];
        let mut sig = Vec::new();
        push_u16(&mut sig, algs.len() as u16);
        sig.extend_from_slice(algs);
        extension(&mut extensions, 0x000d, &sig);
    }

    if heartbeat {
        // peer_allowed_to_send
        extension(&mut extensions, 0x000f, &[1]);
    }

    push_u16(&mut body, extensions.len() as u16);
    body.extend_from_slice(&extensions);

    let mut handshake = Vec::with_capacity(body.len() + 4);
    handshake.push(1); // client_hello
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::with_capacity(handshake.len() + 5);
    record.push(CONTENT_HANDSHAKE);
    record.push(major);
    record.push(minor);
    push_u16(&mut record, handshake.len() as u16);
    record.extend_from_slice(&handshake);
    record
}

/// A malformed heartbeat request: declared payload far larger than carried.
/// A patched server ignores it or alerts; a vulnerable one echoes memory.
pub fn build_heartbeat_probe(version: TlsVersion) -> Vec<u8> {
    let (major, minor) = wire_version(version);
    vec![
        CONTENT_HEARTBEAT,
        major,
        minor,
        0x00,
        0x03, // record length
        0x01, // heartbeat_request
        0x40,
        0x00, // claimed payload length 16384, none carried
    ]
}

/// An early ChangeCipherSpec, sent before any key exchange. A correct
/// implementation answers with an unexpected_message alert.
pub fn build_early_ccs(version: TlsVersion) -> Vec<u8> {
    let (major, minor) = wire_version(version);
    vec![CONTENT_CCS, major, minor, 0x00, 0x01, 0x01]
}

/// One TLS record as read off the wire.
pub struct Record {
    pub content_type: u8,
    pub payload: Vec<u8>,
}

/// Reads exactly one record. Any framing violation surfaces as an I/O error;
/// the prober treats those the same as a rejection.
pub fn read_record<S: Read>(stream: &mut S) -> io::Result<Record> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Record {
        content_type: header[0],
        payload,
    })
}

pub fn write_all<S: Write>(stream: &mut S, bytes: &[u8]) -> io::Result<()> {
    stream.write_all(bytes)
}

/// Extracts the chosen cipher suite from a ServerHello handshake payload.
/// Returns `None` for anything that is not a well-formed ServerHello.
pub fn parse_server_hello_cipher(payload: &[u8]) -> Option<u16> {
    // handshake header: type(1) + length(3)
    if payload.len() < 4 || payload[0] != HANDSHAKE_SERVER_HELLO {
        return None;
    }
    // version(2) + random(32) + session_id
    let session_len = *payload.get(4 + 2 + 32)? as usize;
    let cipher_at = 4 + 2 + 32 + 1 + session_len;
    let hi = *payload.get(cipher_at)?;
    let lo = *payload.get(cipher_at + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_server_hello(cipher: u16, session_len: u8) -> Vec<u8> {
        let mut payload = vec![HANDSHAKE_SERVER_HELLO, 0, 0, 0];
        payload.extend_from_slice(&[3, 3]); // version
        payload.extend_from_slice(&[0u8; 32]); // random
        payload.push(session_len);
        payload.extend(std::iter::repeat(0xaa).take(session_len as usize));
        payload.extend_from_slice(&cipher.to_be_bytes());
        payload.push(0); // compression
        let body_len = (payload.len() - 4) as u32;
        payload[1..4].copy_from_slice(&body_len.to_be_bytes()[1..]);
        payload
    }

    #[test]
    fn client_hello_frames_are_internally_consistent() {
        let hello = build_client_hello(
            TlsVersion::Tls12,
            "example.org",
            &[0xc02f, 0xc030],
            &[23, 24],
            false,
        );
        assert_eq!(hello[0], CONTENT_HANDSHAKE);
        assert_eq!((hello[1], hello[2]), (3, 3));
        let record_len = u16::from_be_bytes([hello[3], hello[4]]) as usize;
        assert_eq!(record_len, hello.len() - 5);
        assert_eq!(hello[5], 1); // client_hello
        let hs_len = u32::from_be_bytes([0, hello[6], hello[7], hello[8]]) as usize;
        assert_eq!(hs_len, hello.len() - 9);
    }

    #[test]
    fn server_hello_cipher_is_extracted_past_the_session_id() {
        assert_eq!(parse_server_hello_cipher(&fake_server_hello(0xc02f, 0)), Some(0xc02f));
        assert_eq!(parse_server_hello_cipher(&fake_server_hello(0x009c, 32)), Some(0x009c));
    }

    #[test]
    fn non_server_hello_payloads_are_rejected() {
        assert_eq!(parse_server_hello_cipher(&[]), None);
        assert_eq!(parse_server_hello_cipher(&[11, 0, 0, 0]), None);
    }

    #[test]
    fn record_reader_round_trips() {
        let hello = build_client_hello(TlsVersion::Tls10, "example.org", &[0x002f], &[], true);
        let mut cursor = std::io::Cursor::new(hello.clone());
        let record = read_record(&mut cursor).unwrap();
        assert_eq!(record.content_type, CONTENT_HANDSHAKE);
        assert_eq!(record.payload.len(), hello.len() - 5);
    }

    #[test]
    fn ansi_names_normalize_to_secg() {
        assert_eq!(normalize_curve_name("prime256v1"), "secp256r1");
        assert_eq!(normalize_curve_name("secp384r1"), "secp384r1");
    }

    #[test]
    fn heartbeat_probe_claims_more_than_it_carries() {
        let probe = build_heartbeat_probe(TlsVersion::Tls12);
        assert_eq!(probe[0], CONTENT_HEARTBEAT);
        let declared = u16::from_be_bytes([probe[6], probe[7]]);
        let carried = probe.len() - 6;
        assert!((declared as usize) > carried);
    }
}
