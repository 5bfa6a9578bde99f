//! Backend specification and dialer
//!
//! A backend is parsed from a URI of the form `[scheme[+proxy]://]host[:port]`
//! or `unix://path`. The `tls` scheme wraps the upstream connection in a
//! client-side TLS session; `+proxy` requests a PROXY protocol header before
//! any application bytes.

use std::sync::Arc;

use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Error, Result};

/// Byte stream to an upstream service.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Established upstream connection, plain or TLS.
pub type BackendStream = Box<dyn Stream>;

/// Transport used to reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Unix,
}

/// PROXY protocol version requested for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyVersion {
    V1,
    #[default]
    V2,
}

/// Upstream TLS settings.
#[derive(Debug, Clone)]
pub struct BackendTls {
    /// SNI sent to the upstream, derived from the URI host.
    pub server_name: String,
    /// Pinned SHA-256 fingerprint replacing chain verification.
    pub pin: Option<[u8; 32]>,
}

/// A validated backend specification.
#[derive(Debug, Clone)]
pub struct Backend {
    pub network: Network,
    pub address: String,
    pub proxy: bool,
    pub proxy_version: ProxyVersion,
    pub tls: Option<BackendTls>,
}

impl Backend {
    /// Parse a backend URI.
    pub fn parse(uri: &str) -> Result<Self> {
        // A raw host:port is parsed as if prefixed with an empty scheme.
        let normalized;
        let uri = if uri.contains(":/") {
            uri
        } else {
            normalized = format!("//{uri}");
            &normalized
        };

        let (mut scheme, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => match uri.strip_prefix("//") {
                Some(rest) => ("", rest),
                None => {
                    return Err(Error::Config(format!("invalid backend URI {uri:?}")));
                }
            },
        };

        let mut proxy = false;
        if let Some(stripped) = scheme.strip_suffix("+proxy") {
            scheme = stripped;
            proxy = true;
        }

        let backend = match scheme {
            "" | "tcp" => Backend {
                network: Network::Tcp,
                address: rest.to_string(),
                proxy,
                proxy_version: ProxyVersion::default(),
                tls: None,
            },
            "tls" => {
                let (host, _port) = split_host_port(rest).ok_or_else(|| {
                    Error::Config(format!(
                        "backend {uri:?}: tls scheme requires a host:port address"
                    ))
                })?;
                Backend {
                    network: Network::Tcp,
                    address: rest.to_string(),
                    proxy,
                    proxy_version: ProxyVersion::default(),
                    tls: Some(BackendTls {
                        server_name: host.to_string(),
                        pin: None,
                    }),
                }
            }
            "unix" => Backend {
                network: Network::Unix,
                address: rest.to_string(),
                proxy,
                proxy_version: ProxyVersion::default(),
                tls: None,
            },
            _ => {
                return Err(Error::Config(format!(
                    "backend {uri:?}: unsupported URI scheme"
                )));
            }
        };

        if backend.address.is_empty() {
            return Err(Error::Config(format!("backend {uri:?}: missing address")));
        }

        Ok(backend)
    }

    /// Set the explicit PROXY protocol version (`1` or `2`).
    pub fn set_proxy_version(&mut self, version: &str) -> Result<()> {
        self.proxy_version = match version {
            "1" => ProxyVersion::V1,
            "2" => ProxyVersion::V2,
            v => {
                return Err(Error::Config(format!(
                    "directive proxy_version: unknown version {v:?}"
                )));
            }
        };
        Ok(())
    }

    /// Install a pinned certificate fingerprint.
    ///
    /// Only `sha-256` digests are accepted; colons in the hex form are
    /// stripped and the decoded digest must be exactly 32 bytes.
    pub fn set_fingerprint(&mut self, algo: &str, fingerprint: &str) -> Result<()> {
        let tls = self.tls.as_mut().ok_or_else(|| {
            Error::Config("tls_certfp requires a tls:// backend address".into())
        })?;

        if algo != "sha-256" {
            return Err(Error::Config(
                "directive tls_certfp: only sha-256 is supported".into(),
            ));
        }

        let cleaned = fingerprint.replace(':', "");
        let decoded = hex::decode(&cleaned)
            .map_err(|e| Error::Config(format!("directive tls_certfp: invalid fingerprint: {e}")))?;
        let pin: [u8; 32] = decoded.try_into().map_err(|_| {
            Error::Config("directive tls_certfp: invalid fingerprint length".into())
        })?;

        tls.pin = Some(pin);
        Ok(())
    }

    /// Open a connection to the backend, wrapping it in upstream TLS when
    /// the backend URI used the `tls` scheme.
    pub async fn dial(&self) -> Result<BackendStream> {
        let stream: BackendStream = match self.network {
            Network::Tcp => Box::new(
                TcpStream::connect(&self.address)
                    .await
                    .map_err(|e| Error::Backend(format!("failed to dial {}: {e}", self.address)))?,
            ),
            Network::Unix => Box::new(
                UnixStream::connect(&self.address)
                    .await
                    .map_err(|e| Error::Backend(format!("failed to dial {}: {e}", self.address)))?,
            ),
        };

        let Some(tls) = &self.tls else {
            return Ok(stream);
        };

        let config = match tls.pin {
            Some(pin) => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(FingerprintVerifier::new(pin)))
                .with_no_client_auth(),
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
        };

        let server_name = ServerName::try_from(tls.server_name.clone())
            .map_err(|e| Error::Backend(format!("invalid upstream server name: {e}")))?;

        debug!(address = %self.address, server_name = %tls.server_name, "upstream TLS handshake");
        let connector = TlsConnector::from(Arc::new(config));
        let upstream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Backend(format!("upstream TLS handshake failed: {e}")))?;
        Ok(Box::new(upstream))
    }
}

/// Split `host:port` or `[host]:port`, requiring a numeric port.
fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        addr.rsplit_once(':')?
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}

/// Certificate verifier that replaces chain verification with a pinned
/// SHA-256 fingerprint check over every presented certificate.
#[derive(Debug)]
struct FingerprintVerifier {
    pin: [u8; 32],
    provider: CryptoProvider,
}

impl FingerprintVerifier {
    fn new(pin: [u8; 32]) -> Self {
        Self {
            pin,
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        for cert in std::iter::once(end_entity).chain(intermediates.iter()) {
            let sum = Sha256::digest(cert.as_ref());
            if bool::from(sum.as_slice().ct_eq(&self.pin)) {
                return Ok(ServerCertVerified::assertion());
            }
        }

        let actual = hex::encode(Sha256::digest(end_entity.as_ref()));
        Err(rustls::Error::General(format!(
            "configured certificate fingerprint doesn't match the server's - {actual}"
        )))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
