//! TLS-terminating reverse proxy with SNI routing and automatic certificates
//!
//! Drawbridge accepts TLS connections, selects a frontend by the server name
//! the client indicated, terminates TLS with a certificate from the shared
//! certificate store, and bridges the decrypted stream to a TCP, TLS or Unix
//! socket backend, optionally prefixed with a PROXY protocol header.
//!
//! Configuration is reloaded without dropping connections: a new [`Server`]
//! built from the reparsed config takes over the previous generation's
//! sockets and certificate store through [`Server::replace`].

pub mod backend;
pub mod cert;
pub mod config;
pub mod error;
pub mod frontend;
pub mod listener;
pub mod pipe;
pub mod proxy_header;
pub mod server;

pub use backend::Backend;
pub use cert::{AcmeSettings, CertManager, CertStore};
pub use config::Directive;
pub use error::{Error, Result};
pub use frontend::Frontend;
pub use listener::Listener;
pub use server::Server;
