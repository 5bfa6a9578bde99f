//! PROXY protocol header generation
//!
//! Builds the v1 (ASCII) and v2 (binary) headers written to a backend before
//! any application data. The v2 form carries TLVs describing the terminated
//! TLS session so the backend can vhost on the original SNI.
//!
//! Wire format (from the HAProxy PROXY protocol spec):
//! - v1: `PROXY TCP4|TCP6|UNKNOWN <src> <dst> <sport> <dport>\r\n`
//! - v2: 12 bytes signature, 1 byte version/command, 1 byte family/transport,
//!   2 bytes length, addresses, then TLVs

use std::net::{IpAddr, SocketAddr};

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Address family: AF_UNSPEC.
const AF_UNSPEC: u8 = 0x00;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// TLV type: negotiated ALPN protocol.
const PP2_TYPE_ALPN: u8 = 0x01;

/// TLV type: authority (the SNI host name).
const PP2_TYPE_AUTHORITY: u8 = 0x02;

/// TLV type: SSL record.
const PP2_TYPE_SSL: u8 = 0x20;

/// SSL record sub-TLV: protocol version string.
const PP2_SUBTYPE_SSL_VERSION: u8 = 0x21;

/// SSL record client flag: connection arrived over TLS.
const PP2_CLIENT_SSL: u8 = 0x01;

/// TLS protocol version negotiated with the downstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS session state forwarded to the backend via v2 TLVs.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    /// SNI host name, empty when the client sent none.
    pub server_name: String,
    /// Negotiated ALPN protocol, empty when none was negotiated.
    pub alpn: Vec<u8>,
    /// Negotiated protocol version.
    pub version: Option<TlsVersion>,
}

/// Encode a v1 header.
pub fn encode_v1(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let line = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            format!("PROXY TCP4 {} {} {} {}\r\n", s, d, src.port(), dst.port())
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            format!("PROXY TCP6 {} {} {} {}\r\n", s, d, src.port(), dst.port())
        }
        _ => "PROXY UNKNOWN\r\n".to_string(),
    };
    line.into_bytes()
}

/// Encode a v2 header with TLS TLVs.
///
/// The SSL TLV always reports verify=1: the proxy does not verify client
/// certificates, and the backend must not assume otherwise.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr, tls: &TlsInfo) -> Vec<u8> {
    let mut addrs = Vec::new();
    let family = match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            addrs.extend_from_slice(&s.octets());
            addrs.extend_from_slice(&d.octets());
            addrs.extend_from_slice(&src.port().to_be_bytes());
            addrs.extend_from_slice(&dst.port().to_be_bytes());
            AF_INET | TRANSPORT_STREAM
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            addrs.extend_from_slice(&s.octets());
            addrs.extend_from_slice(&d.octets());
            addrs.extend_from_slice(&src.port().to_be_bytes());
            addrs.extend_from_slice(&dst.port().to_be_bytes());
            AF_INET6 | TRANSPORT_STREAM
        }
        _ => AF_UNSPEC,
    };

    let mut tlvs = Vec::new();
    if !tls.server_name.is_empty() {
        push_tlv(&mut tlvs, PP2_TYPE_AUTHORITY, tls.server_name.as_bytes());
    }
    if !tls.alpn.is_empty() {
        push_tlv(&mut tlvs, PP2_TYPE_ALPN, &tls.alpn);
    }
    if let Some(version) = tls.version {
        let mut ssl = Vec::new();
        ssl.push(PP2_CLIENT_SSL);
        // verify: non-zero means the client certificate was not verified.
        ssl.extend_from_slice(&1u32.to_be_bytes());
        push_tlv(&mut ssl, PP2_SUBTYPE_SSL_VERSION, version.as_str().as_bytes());
        push_tlv(&mut tlvs, PP2_TYPE_SSL, &ssl);
    }

    let len = (addrs.len() + tlvs.len()) as u16;
    let mut buf = Vec::with_capacity(16 + len as usize);
    buf.extend_from_slice(&PROXY_V2_SIGNATURE);
    buf.push(VERSION_COMMAND_PROXY);
    buf.push(family);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&addrs);
    buf.extend_from_slice(&tlvs);
    buf
}

fn push_tlv(buf: &mut Vec<u8>, kind: u8, value: &[u8]) {
    buf.push(kind);
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
}
