//! Server: configuration load, start, stop and hot replace

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::backend::Backend;
use crate::cert::{self, AcmeSettings, CertManager, CertStore};
use crate::config::Directive;
use crate::error::{Error, Result};
use crate::frontend::Frontend;
use crate::listener::Listener;

/// One generation of the proxy: listeners, frontends and the certificate
/// controller built from one parse of the configuration.
///
/// The certificate store is shared across generations; everything else is
/// owned by the generation that parsed it.
pub struct Server {
    listeners: HashMap<String, Arc<Listener>>,
    frontends: Vec<Arc<Frontend>>,
    managed_names: Vec<String>,
    unmanaged_certs: Vec<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    settings: AcmeSettings,
    store: Option<Arc<CertStore>>,
    manager: Option<Arc<CertManager>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").finish_non_exhaustive()
    }
}

impl Server {
    /// Apply a parsed configuration tree.
    pub fn load(directives: &[Directive], data_dir: impl Into<PathBuf>) -> Result<Self> {
        let mut server = Server {
            listeners: HashMap::new(),
            frontends: Vec::new(),
            managed_names: Vec::new(),
            unmanaged_certs: Vec::new(),
            settings: AcmeSettings::new(data_dir.into()),
            store: None,
            manager: None,
        };

        for directive in directives {
            match directive.name.as_str() {
                "frontend" => server.parse_frontend(directive)?,
                "tls" => server.parse_tls(directive)?,
                name => {
                    return Err(Error::Config(format!("unknown {name:?} directive")));
                }
            }
        }

        Ok(server)
    }

    fn parse_frontend(&mut self, d: &Directive) -> Result<()> {
        let backend_directive = d
            .child("backend")
            .ok_or_else(|| Error::Config("missing backend directive in frontend block".into()))?;
        let mut backend = Backend::parse(backend_directive.param(0)?)?;
        for child in &backend_directive.children {
            match child.name.as_str() {
                "tls_certfp" => backend.set_fingerprint(child.param(0)?, child.param(1)?)?,
                "proxy_version" => backend.set_proxy_version(child.param(0)?)?,
                name => {
                    return Err(Error::Config(format!("unknown {name:?} directive")));
                }
            }
        }

        let mut frontend = Frontend::new(backend);
        if let Some(protocol) = d.child("protocol") {
            if protocol.params.is_empty() {
                return Err(Error::Config(
                    "protocol directive needs at least one ALPN token".into(),
                ));
            }
            frontend.protocols = protocol.params.clone();
        }

        // A frontend that loads its own certificate opts its host names out
        // of managed issuance.
        let mut unmanaged = false;
        if let Some(tls_directive) = d.child("tls") {
            for child in &tls_directive.children {
                match child.name.as_str() {
                    "load" => {
                        let cert_pem = std::fs::read(child.param(0)?)?;
                        let key_pem = std::fs::read(child.param(1)?)?;
                        let chain = cert::parse_cert_pem(&cert_pem)?;
                        let key = cert::parse_key_pem(&key_pem)?;
                        self.unmanaged_certs.push((chain, key));
                        unmanaged = true;
                    }
                    name => {
                        return Err(Error::Config(format!("unknown {name:?} directive")));
                    }
                }
            }
        }

        let frontend = Arc::new(frontend);
        self.frontends.push(frontend.clone());

        let mut addresses: Vec<String> = d.params.clone();
        for listen in d.children_named("listen") {
            addresses.extend(listen.params.iter().cloned());
        }
        if addresses.is_empty() {
            return Err(Error::Config(
                "missing listening addresses in frontend block".into(),
            ));
        }

        for address in &addresses {
            let (host, port) = split_listen_addr(address)?;

            // Host names become SNI entries bound on all interfaces; IP
            // literals and localhost bind that address with no SNI entry.
            let (name, bind) = if host.is_empty() {
                (String::new(), format!("[::]:{port}"))
            } else if host.eq_ignore_ascii_case("localhost") || host.parse::<IpAddr>().is_ok() {
                (String::new(), join_host_port(&host, &port))
            } else {
                let name = host.to_ascii_lowercase();
                if !unmanaged && !self.managed_names.contains(&name) {
                    self.managed_names.push(name.clone());
                }
                (name, format!("[::]:{port}"))
            };

            let listener = self.register_listener(&bind);
            listener.register_frontend(&name, frontend.clone())?;
        }

        Ok(())
    }

    fn parse_tls(&mut self, d: &Directive) -> Result<()> {
        for child in &d.children {
            match child.name.as_str() {
                "acme_ca" => {
                    self.settings.directory_url = child.param(0)?.to_string();
                }
                "email" => {
                    self.settings.email = Some(child.param(0)?.to_string());
                }
                "on_demand" => {
                    for grandchild in &child.children {
                        match grandchild.name.as_str() {
                            "validate_command" => {
                                grandchild.param(0)?;
                                self.settings.on_demand_validate =
                                    Some(grandchild.params.clone());
                            }
                            name => {
                                return Err(Error::Config(format!(
                                    "unknown {name:?} directive"
                                )));
                            }
                        }
                    }
                }
                "acme_dns_command" => {
                    child.param(0)?;
                    self.settings.dns_command = Some(child.params.clone());
                }
                name => {
                    return Err(Error::Config(format!("unknown {name:?} directive")));
                }
            }
        }
        Ok(())
    }

    fn register_listener(&mut self, address: &str) -> Arc<Listener> {
        self.listeners
            .entry(address.to_string())
            .or_insert_with(|| Listener::new(address))
            .clone()
    }

    /// Insert the unmanaged certificates, begin managing the managed names
    /// and publish this generation's certificate controller into `store`.
    ///
    /// The publish comes last: on a reload `store` is the live cache still
    /// backing the previous generation, and a failure here must leave its
    /// controller pointer untouched.
    fn start_certs(&mut self, store: Arc<CertStore>) -> Result<()> {
        let manager = CertManager::new(store.clone(), self.settings.clone());

        for (chain, key) in std::mem::take(&mut self.unmanaged_certs) {
            store.cache_unmanaged_cert(chain, key)?;
        }
        manager.manage(&self.managed_names)?;

        store.set_manager(manager.clone());
        self.store = Some(store);
        self.manager = Some(manager);
        Ok(())
    }

    /// Start serving: create the certificate store, start certificate
    /// management, bind every listener and run its accept loop.
    pub async fn start(&mut self) -> Result<()> {
        let store = CertStore::new();
        self.start_certs(store.clone())?;

        let mut started: Vec<Arc<Listener>> = Vec::new();
        for listener in self.listeners.values() {
            let result = listener.bind().await.and_then(|()| listener.spawn(store.clone()));
            if let Err(e) = result {
                for l in &started {
                    l.stop();
                }
                self.stop_certs();
                return Err(e);
            }
            started.push(listener.clone());
        }
        Ok(())
    }

    /// Stop serving: cancel certificate management and close every listener
    /// socket. In-flight connections are not interrupted.
    pub fn stop(&self) {
        self.stop_certs();
        for listener in self.listeners.values() {
            listener.stop();
        }
    }

    fn stop_certs(&self) {
        if let Some(manager) = &self.manager {
            manager.stop();
            if let Some(store) = &self.store {
                store.clear_manager(manager);
            }
        }
    }

    /// Take over from a running generation without dropping connections.
    ///
    /// Sockets bound in both generations are carried over with their
    /// frontend table atomically swapped; the certificate store is adopted
    /// so cached certificates keep serving. On failure the old generation is
    /// left serving, except that its renewal work may already be cancelled.
    pub async fn replace(&mut self, old: &Server) -> Result<()> {
        // Bind addresses that are new in this generation. Any failure rolls
        // back our own sockets and leaves the old generation untouched.
        let mut newly_bound: Vec<Arc<Listener>> = Vec::new();
        for (address, listener) in &self.listeners {
            if old.listeners.contains_key(address) {
                continue;
            }
            if let Err(e) = listener.bind().await {
                for l in &newly_bound {
                    l.stop();
                }
                return Err(e);
            }
            newly_bound.push(listener.clone());
        }

        // Adopt the old generation's certificate store.
        let store = old.store.clone().ok_or_else(|| {
            Error::Config("cannot replace a server that was never started".into())
        })?;

        // The old renewal work stops now. If starting ours fails the process
        // is left without renewal until the next successful reload.
        if let Some(old_manager) = &old.manager {
            old_manager.stop();
        }
        if let Err(e) = self.start_certs(store.clone()) {
            for l in &newly_bound {
                l.stop();
            }
            return Err(e);
        }

        // Addresses present in both generations keep the old socket; only
        // the frontend table changes, atomically.
        for listener in self.listeners.values_mut() {
            if let Some(old_listener) = old.listeners.get(listener.address()) {
                old_listener.set_table((*listener.table()).clone());
                *listener = old_listener.clone();
            }
        }

        for listener in &newly_bound {
            listener.spawn(store.clone())?;
        }

        // Addresses only the old generation served are closed.
        for (address, old_listener) in &old.listeners {
            if !self.listeners.contains_key(address) {
                info!(address = %address, "closing removed listener");
                old_listener.stop();
            }
        }

        // Names the new configuration no longer references stop renewing.
        let kept: HashSet<&String> = self.managed_names.iter().collect();
        let unmanage: Vec<String> = old
            .managed_names
            .iter()
            .filter(|name| !kept.contains(name))
            .cloned()
            .collect();
        store.unmanage(&unmanage);

        Ok(())
    }

    pub fn listener(&self, address: &str) -> Option<&Arc<Listener>> {
        self.listeners.get(address)
    }

    pub fn listener_addresses(&self) -> impl Iterator<Item = &str> {
        self.listeners.keys().map(String::as_str)
    }

    pub fn managed_names(&self) -> &[String] {
        &self.managed_names
    }

    /// The shared certificate store, present once started.
    pub fn store(&self) -> Option<&Arc<CertStore>> {
        self.store.as_ref()
    }
}

/// Split a listen address into host (possibly empty) and port.
fn split_listen_addr(address: &str) -> Result<(String, String)> {
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| {
            Error::Config(format!("failed to parse listen address {address:?}"))
        })?;
        let port = rest.strip_prefix(':').ok_or_else(|| {
            Error::Config(format!("failed to parse listen address {address:?}"))
        })?;
        (host, port)
    } else {
        address.rsplit_once(':').ok_or_else(|| {
            Error::Config(format!("failed to parse listen address {address:?}"))
        })?
    };

    port.parse::<u16>().map_err(|_| {
        Error::Config(format!("invalid port in listen address {address:?}"))
    })?;
    Ok((host.to_string(), port.to_string()))
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::listener::lookup_frontend;

    fn load(text: &str) -> Result<Server> {
        let directives = config::parse(text).unwrap();
        Server::load(&directives, "/tmp/unused")
    }

    #[test]
    fn loads_a_basic_frontend() {
        let server = load(
            "frontend example.com:443 {\n    backend localhost:8080\n}\n",
        )
        .unwrap();

        assert_eq!(server.managed_names(), ["example.com"]);
        let listener = server.listener("[::]:443").unwrap();
        let table = listener.table();
        assert!(table.contains_key("example.com"));
    }

    #[test]
    fn localhost_and_ip_hosts_become_default_frontends() {
        let server = load(
            "frontend localhost:8443 {\n    backend localhost:8080\n}\n",
        )
        .unwrap();
        assert!(server.managed_names().is_empty());

        let listener = server.listener("localhost:8443").unwrap();
        assert!(listener.table().contains_key(""));

        let server = load(
            "frontend 127.0.0.1:9443 {\n    backend localhost:8080\n}\n",
        )
        .unwrap();
        assert!(server.managed_names().is_empty());
        assert!(server.listener("127.0.0.1:9443").is_some());
    }

    #[test]
    fn listen_children_extend_addresses() {
        let server = load(
            "frontend example.com:443 {\n    listen example.com:8443\n    backend localhost:8080\n}\n",
        )
        .unwrap();

        assert!(server.listener("[::]:443").is_some());
        assert!(server.listener("[::]:8443").is_some());
        // The name is managed once, not per address.
        assert_eq!(server.managed_names(), ["example.com"]);
    }

    #[test]
    fn wildcard_frontend_is_registered_and_managed() {
        let server = load(
            "frontend *.example.com:443 {\n    backend localhost:8080\n}\n",
        )
        .unwrap();

        assert_eq!(server.managed_names(), ["*.example.com"]);
        let table = server.listener("[::]:443").unwrap().table();
        assert!(lookup_frontend(&table, "foo.example.com").is_some());
        assert!(lookup_frontend(&table, "example.com").is_none());
    }

    #[test]
    fn duplicate_server_name_on_one_listener_is_rejected() {
        let err = load(
            "frontend example.com:443 {\n    backend localhost:8080\n}\n\
             frontend example.com:443 {\n    backend localhost:8081\n}\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn same_name_on_different_ports_is_fine() {
        let server = load(
            "frontend example.com:443 {\n    backend localhost:8080\n}\n\
             frontend example.com:8443 {\n    backend localhost:8081\n}\n",
        )
        .unwrap();
        assert_eq!(server.managed_names(), ["example.com"]);
    }

    #[test]
    fn missing_backend_is_rejected() {
        let err = load("frontend example.com:443 {\n    protocol h2\n}\n").unwrap_err();
        assert!(err.to_string().contains("backend"));
    }

    #[test]
    fn missing_listen_address_is_rejected() {
        let err = load("frontend {\n    backend localhost:8080\n}\n").unwrap_err();
        assert!(err.to_string().contains("listening"));
    }

    #[test]
    fn unknown_directives_are_rejected() {
        assert!(load("mystery\n").is_err());
        assert!(load("frontend example.com:443 {\n    backend h:1 {\n        nope\n    }\n}\n").is_err());
        assert!(load("tls {\n    nope\n}\n").is_err());
    }

    #[test]
    fn tls_settings_are_applied() {
        let server = load(
            "frontend example.com:443 {\n    backend localhost:8080\n}\n\
             tls {\n\
                 acme_ca https://ca.internal/directory\n\
                 email admin@example.com\n\
                 acme_dns_command /usr/bin/dns-hook --zone example.com\n\
                 on_demand {\n        validate_command /usr/bin/check-name\n    }\n\
             }\n",
        )
        .unwrap();

        assert_eq!(server.settings.directory_url, "https://ca.internal/directory");
        assert_eq!(server.settings.email.as_deref(), Some("admin@example.com"));
        assert_eq!(
            server.settings.dns_command.as_deref(),
            Some(&["/usr/bin/dns-hook".to_string(), "--zone".into(), "example.com".into()][..])
        );
        assert_eq!(
            server.settings.on_demand_validate.as_deref(),
            Some(&["/usr/bin/check-name".to_string()][..])
        );
    }

    #[test]
    fn frontend_protocols_preserve_order() {
        let server = load(
            "frontend example.com:443 {\n    backend localhost:8080\n    protocol h2 http/1.1\n}\n",
        )
        .unwrap();
        let table = server.listener("[::]:443").unwrap().table();
        let frontend = table.get("example.com").unwrap();
        assert_eq!(frontend.protocols, ["h2", "http/1.1"]);
    }

    #[test]
    fn loaded_cert_marks_names_unmanaged() {
        let dir = tempfile::tempdir().unwrap();
        let cert = rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.signing_key.serialize_pem()).unwrap();

        let server = load(&format!(
            "frontend example.com:443 {{\n    backend localhost:8080\n    tls {{\n        load {} {}\n    }}\n}}\n",
            cert_path.display(),
            key_path.display()
        ))
        .unwrap();

        assert!(server.managed_names().is_empty());
        assert_eq!(server.unmanaged_certs.len(), 1);
    }

    #[test]
    fn listen_addr_forms() {
        assert_eq!(
            split_listen_addr("example.com:443").unwrap(),
            ("example.com".into(), "443".into())
        );
        assert_eq!(split_listen_addr(":443").unwrap(), (String::new(), "443".into()));
        assert_eq!(
            split_listen_addr("[::1]:443").unwrap(),
            ("::1".into(), "443".into())
        );
        assert!(split_listen_addr("example.com").is_err());
        assert!(split_listen_addr("example.com:http").is_err());
    }
}
