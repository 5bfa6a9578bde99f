//! TCP listener: accept loop, TLS handshake and SNI dispatch
//!
//! Each listener owns one bound socket and an atomically swappable table of
//! frontends keyed by server name. The accept path never takes a lock: a
//! handshake binds to the table snapshot visible at the moment the
//! connection arrived, and a reload installs a new snapshot with a single
//! pointer swap.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use rustls::ProtocolVersion;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::cert::CertStore;
use crate::error::{Error, Result};
use crate::frontend::Frontend;
use crate::proxy_header::{TlsInfo, TlsVersion};

/// The TLS handshake must complete within this window. Once it succeeds the
/// connection has no intrinsic deadline.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Initial delay after a transient accept error.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);

/// Backoff ceiling for repeated transient accept errors.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Frontends of one listener, keyed by server name. The empty string is the
/// default frontend; `*.suffix` entries match one leading label.
pub type FrontendTable = HashMap<String, Arc<Frontend>>;

/// A listening socket with its SNI dispatch table.
pub struct Listener {
    address: String,
    table: ArcSwap<FrontendTable>,
    cancel: CancellationToken,
    socket: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Listener {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            table: ArcSwap::from_pointee(HashMap::new()),
            cancel: CancellationToken::new(),
            socket: Mutex::new(None),
            local_addr: Mutex::new(None),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address the socket is actually bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("local addr lock poisoned")
    }

    /// Add a frontend under a server name during configuration load.
    pub fn register_frontend(&self, name: &str, frontend: Arc<Frontend>) -> Result<()> {
        let name = name.to_ascii_lowercase();
        let current = self.table.load();
        if current.contains_key(&name) {
            return Err(Error::Config(format!(
                "listener {:?}: duplicate frontends for server name {:?}",
                self.address, name
            )));
        }
        let mut next: FrontendTable = (**current).clone();
        next.insert(name, frontend);
        self.table.store(Arc::new(next));
        Ok(())
    }

    /// Replace the whole frontend table. Lock-free for in-flight handshakes:
    /// connections accepted earlier keep the snapshot they started with.
    pub fn set_table(&self, table: FrontendTable) {
        self.table.store(Arc::new(table));
    }

    /// Current table snapshot.
    pub fn table(&self) -> Arc<FrontendTable> {
        self.table.load_full()
    }

    /// Bind the socket without starting the accept loop.
    pub async fn bind(&self) -> Result<()> {
        let socket = TcpListener::bind(self.address.as_str()).await?;
        let local = socket.local_addr()?;
        info!(address = %self.address, local = %local, "listening");
        *self.local_addr.lock().expect("local addr lock poisoned") = Some(local);
        *self.socket.lock().expect("socket lock poisoned") = Some(socket);
        Ok(())
    }

    /// Start the accept loop on the previously bound socket.
    pub fn spawn(self: &Arc<Self>, store: Arc<CertStore>) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .expect("socket lock poisoned")
            .take()
            .ok_or_else(|| Error::Config(format!("listener {:?} is not bound", self.address)))?;
        let listener = self.clone();
        tokio::spawn(listener.serve(socket, store));
        Ok(())
    }

    /// Close the socket; the accept loop ends cleanly. In-flight connections
    /// are left to finish on their own.
    pub fn stop(&self) {
        self.cancel.cancel();
        // Drop a bound-but-not-started socket too.
        self.socket.lock().expect("socket lock poisoned").take();
    }

    async fn serve(self: Arc<Self>, socket: TcpListener, store: Arc<CertStore>) {
        let mut backoff = Backoff::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(address = %self.address, "listener closed");
                    return;
                }
                accepted = socket.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        let listener = self.clone();
                        let store = store.clone();
                        tokio::spawn(
                            async move {
                                if let Err(e) = listener.handle_connection(stream, peer, store).await {
                                    if e.is_client_error() {
                                        debug!(peer = %peer, error = %e, "client error");
                                    } else {
                                        warn!(peer = %peer, error = %e, "connection error");
                                    }
                                }
                            }
                            .instrument(tracing::debug_span!("connection", peer = %peer)),
                        );
                    }
                    Err(e) if is_transient(&e) => {
                        let delay = backoff.next();
                        warn!(address = %self.address, error = %e, delay_ms = delay.as_millis() as u64,
                            "transient accept error");
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        error!(address = %self.address, error = %e, "accept failed");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        store: Arc<CertStore>,
    ) -> Result<()> {
        let local = stream.local_addr()?;
        let table = self.table.load_full();

        let result = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let start =
                LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream).await?;
            let hello = start.client_hello();
            let server_name = hello
                .server_name()
                .unwrap_or("")
                .to_ascii_lowercase();

            let frontend = lookup_frontend(&table, &server_name)
                .ok_or_else(|| Error::NoFrontend(server_name.clone()))?;

            store.ensure_certificate(&server_name).await?;
            let config = store.server_config(&frontend.protocols);
            let tls = start.into_stream(config).await?;
            Ok::<_, Error>((tls, frontend))
        })
        .await
        .map_err(|_| Error::Timeout("TLS handshake".into()))?;

        let (tls, frontend) = match result {
            Ok(accepted) => accepted,
            // A peer that connects and hangs up without a handshake is noise.
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let info = {
            let (_, conn) = tls.get_ref();
            TlsInfo {
                server_name: conn.server_name().unwrap_or("").to_string(),
                alpn: conn.alpn_protocol().map(<[u8]>::to_vec).unwrap_or_default(),
                version: conn.protocol_version().and_then(tls_version),
            }
        };
        debug!(peer = %peer, server_name = %info.server_name, "handshake complete");

        let copied = frontend.serve(tls, peer, local, &info).await?;
        debug!(peer = %peer, bytes = copied, "connection closed");
        Ok(())
    }
}

/// Select a frontend for a server name.
///
/// Order: exact match, then the left-most-label wildcard (only when the
/// remainder still contains a dot), then the default entry.
pub fn lookup_frontend(table: &FrontendTable, server_name: &str) -> Option<Arc<Frontend>> {
    if let Some(frontend) = table.get(server_name) {
        return Some(frontend.clone());
    }
    if let Some((_, remainder)) = server_name.split_once('.') {
        if remainder.contains('.') {
            if let Some(frontend) = table.get(&format!("*.{remainder}")) {
                return Some(frontend.clone());
            }
        }
    }
    table.get("").cloned()
}

fn tls_version(version: ProtocolVersion) -> Option<TlsVersion> {
    match version {
        ProtocolVersion::TLSv1_0 => Some(TlsVersion::Tls10),
        ProtocolVersion::TLSv1_1 => Some(TlsVersion::Tls11),
        ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls12),
        ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls13),
        _ => None,
    }
}

/// Accept errors worth retrying: connection-level failures and resource
/// exhaustion. Anything else ends the listener.
fn is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // ENFILE, EMFILE, ENOMEM, ENOBUFS
    matches!(e.raw_os_error(), Some(23 | 24 | 12 | 105))
}

/// Exponential backoff for the accept loop: starts at 5 ms, doubles per
/// consecutive failure, capped at 1 s, reset by any successful accept.
#[derive(Debug)]
struct Backoff {
    delay: Option<Duration>,
}

impl Backoff {
    fn new() -> Self {
        Self { delay: None }
    }

    fn next(&mut self) -> Duration {
        let delay = match self.delay {
            None => ACCEPT_BACKOFF_MIN,
            Some(previous) => (previous * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.delay = Some(delay);
        delay
    }

    fn reset(&mut self) {
        self.delay = None;
    }
}
