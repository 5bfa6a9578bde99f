//! Frontend: a backend bound to an ordered list of ALPN protocols

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::backend::{Backend, ProxyVersion};
use crate::error::{Error, Result};
use crate::pipe::duplex_copy;
use crate::proxy_header::{self, TlsInfo};

/// An inbound logical endpoint: where decrypted traffic goes and which ALPN
/// protocols the listener advertises for it.
#[derive(Debug, Clone)]
pub struct Frontend {
    pub backend: Backend,
    /// Advertised ALPN protocols, in configured order. Empty means none.
    pub protocols: Vec<String>,
}

impl Frontend {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            protocols: Vec::new(),
        }
    }

    /// Bridge a terminated downstream connection to the backend.
    ///
    /// When the backend requests it, a complete PROXY header is written
    /// upstream strictly before any downstream bytes. Returns the byte count
    /// of the direction that finished first.
    pub async fn serve<S>(
        &self,
        downstream: S,
        peer: SocketAddr,
        local: SocketAddr,
        tls: &TlsInfo,
    ) -> Result<u64>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut upstream = self.backend.dial().await?;

        if self.backend.proxy {
            let header = match self.backend.proxy_version {
                ProxyVersion::V1 => proxy_header::encode_v1(peer, local),
                ProxyVersion::V2 => proxy_header::encode_v2(peer, local, tls),
            };
            upstream.write_all(&header).await.map_err(|e| {
                Error::Backend(format!("failed to write PROXY protocol header: {e}"))
            })?;
        }

        Ok(duplex_copy(downstream, upstream).await?)
    }
}
