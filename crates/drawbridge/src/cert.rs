//! Certificate store and lifecycle controller
//!
//! The [`CertStore`] is a single process-wide cache of certificates keyed by
//! their SAN names. It outlives individual [`crate::Server`] generations: a
//! reload publishes the new generation's [`CertManager`] into the existing
//! store through an atomic pointer, so certificates obtained before the
//! reload keep serving handshakes immediately after it.
//!
//! The [`CertManager`] is the per-generation controller: it owns the ACME
//! settings, the managed-name set and a cancel token scoped to its
//! generation. Renewal work stops when the generation is replaced or the
//! server shuts down.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwapOption;
use instant_acme::{
    Account, AccountCredentials, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder,
    OrderStatus,
};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, ServerConfig};
use rustls::sign::CertifiedKey;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::error::{Error, Result};

/// Renew a managed certificate when it expires within this window.
const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// How often the renewal loop re-checks the managed set.
const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// ACME and issuance settings for one server generation.
#[derive(Debug, Clone)]
pub struct AcmeSettings {
    /// ACME directory URL.
    pub directory_url: String,
    /// Contact email for account registration.
    pub email: Option<String>,
    /// Root directory for certificates and account credentials.
    pub data_dir: PathBuf,
    /// DNS-01 solver: command plus leading arguments.
    pub dns_command: Option<Vec<String>>,
    /// On-demand issuance validator: command plus leading arguments.
    pub on_demand_validate: Option<Vec<String>>,
}

impl AcmeSettings {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            directory_url: LetsEncrypt::Production.url().to_string(),
            email: None,
            data_dir,
            dns_command: None,
            on_demand_validate: None,
        }
    }
}

/// One cached certificate, indexed under each of its SAN names.
struct CachedCert {
    key: Arc<CertifiedKey>,
    not_after: Option<SystemTime>,
    managed: bool,
}

/// Process-wide certificate cache shared across server generations.
pub struct CertStore {
    entries: RwLock<HashMap<String, Arc<CachedCert>>>,
    /// Current generation's controller, read atomically by the hot path.
    manager: ArcSwapOption<CertManager>,
}

impl CertStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            manager: ArcSwapOption::empty(),
        })
    }

    /// Publish a generation's controller as the one the cache consults.
    pub fn set_manager(&self, manager: Arc<CertManager>) {
        self.manager.store(Some(manager));
    }

    /// Clear the controller pointer, but only if `expected` is still the
    /// published one. A superseded generation must not clear its successor.
    pub fn clear_manager(&self, expected: &Arc<CertManager>) {
        let current = self.manager.load();
        if let Some(current) = current.as_ref() {
            if Arc::ptr_eq(current, expected) {
                self.manager.store(None);
            }
        }
    }

    /// Current controller, if a generation is running.
    pub fn manager(&self) -> Option<Arc<CertManager>> {
        self.manager.load_full()
    }

    /// Select a certificate for a server name: exact match first, then the
    /// wildcard entry covering the name.
    pub fn resolve(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.entry(server_name).map(|e| e.key.clone())
    }

    fn entry(&self, server_name: &str) -> Option<Arc<CachedCert>> {
        let name = server_name.to_ascii_lowercase();
        let entries = self.entries.read().expect("cert store lock poisoned");
        if let Some(entry) = entries.get(&name) {
            return Some(entry.clone());
        }
        if let Some(wildcard) = wildcard_form(&name) {
            if let Some(entry) = entries.get(&wildcard) {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Expiry of the certificate currently cached for `name`, if any.
    pub fn expiry(&self, name: &str) -> Option<SystemTime> {
        self.entry(name).and_then(|e| e.not_after)
    }

    fn insert(
        &self,
        names: &[String],
        key: Arc<CertifiedKey>,
        not_after: Option<SystemTime>,
        managed: bool,
    ) {
        let entry = Arc::new(CachedCert {
            key,
            not_after,
            managed,
        });
        let mut entries = self.entries.write().expect("cert store lock poisoned");
        for name in names {
            entries.insert(name.to_ascii_lowercase(), entry.clone());
        }
    }

    /// Insert a locally loaded key pair, keyed by its SAN set.
    ///
    /// Returns the names the certificate was cached under.
    pub fn cache_unmanaged_cert(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Vec<String>> {
        let (certified, names, not_after) = certified_key(chain, key)?;
        if names.is_empty() {
            return Err(Error::Certificate(
                "certificate has no DNS names to cache under".into(),
            ));
        }
        self.insert(&names, certified, not_after, false);
        Ok(names)
    }

    /// Drop the given names from renewal; their cached entries are evicted.
    pub fn unmanage(&self, names: &[String]) {
        if names.is_empty() {
            return;
        }
        if let Some(manager) = self.manager.load_full() {
            manager.unmanage(names);
        }
        let mut entries = self.entries.write().expect("cert store lock poisoned");
        for name in names {
            let name = name.to_ascii_lowercase();
            if entries.get(&name).is_some_and(|e| e.managed) {
                entries.remove(&name);
            }
        }
    }

    /// Make sure a certificate for `server_name` can be resolved, issuing
    /// one on demand when the current generation allows it.
    ///
    /// Called from the accept path between ClientHello and handshake; a miss
    /// here is not an error, the handshake simply fails to find a cert.
    pub async fn ensure_certificate(&self, server_name: &str) -> Result<()> {
        if server_name.is_empty() || self.resolve(server_name).is_some() {
            return Ok(());
        }
        let Some(manager) = self.manager.load_full() else {
            return Ok(());
        };
        manager.obtain_on_demand(server_name).await
    }

    /// Build the TLS server configuration used for a handshake: certificates
    /// come from this store, and `alpn` (the selected frontend's protocol
    /// list) is appended to the advertised protocols.
    pub fn server_config(self: &Arc<Self>, alpn: &[String]) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(CacheResolver {
                store: self.clone(),
            }));
        config
            .alpn_protocols
            .extend(alpn.iter().map(|p| p.as_bytes().to_vec()));
        Arc::new(config)
    }
}

/// Wildcard lookup key for a name: `a.b.c` becomes `*.b.c`, but only when
/// the remainder still contains a dot (`*.com` never matches).
fn wildcard_form(name: &str) -> Option<String> {
    let (_, remainder) = name.split_once('.')?;
    if !remainder.contains('.') {
        return None;
    }
    Some(format!("*.{remainder}"))
}

/// rustls certificate resolver backed by the shared store.
struct CacheResolver {
    store: Arc<CertStore>,
}

impl fmt::Debug for CacheResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CacheResolver")
    }
}

impl ResolvesServerCert for CacheResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().unwrap_or("");
        self.store.resolve(name)
    }
}

/// Per-generation certificate controller.
pub struct CertManager {
    store: Arc<CertStore>,
    settings: Arc<AcmeSettings>,
    managed: RwLock<HashSet<String>>,
    cancel: CancellationToken,
    account: tokio::sync::Mutex<Option<Arc<Account>>>,
    /// Serializes ACME orders so concurrent handshakes for the same missing
    /// name produce one order.
    issue_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for CertManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl CertManager {
    pub fn new(store: Arc<CertStore>, settings: AcmeSettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            settings: Arc::new(settings),
            managed: RwLock::new(HashSet::new()),
            cancel: CancellationToken::new(),
            account: tokio::sync::Mutex::new(None),
            issue_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Asynchronously ensure every name in `names` has a valid certificate
    /// and keep renewing until the generation is cancelled.
    ///
    /// Name validation happens synchronously so a bad config fails at start.
    pub fn manage(self: &Arc<Self>, names: &[String]) -> Result<()> {
        for name in names {
            validate_hostname(name)?;
        }
        {
            let mut managed = self.managed.write().expect("managed set lock poisoned");
            managed.extend(names.iter().map(|n| n.to_ascii_lowercase()));
        }
        if names.is_empty() {
            return Ok(());
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.renewal_loop().await;
        });
        Ok(())
    }

    /// Remove names from the managed set; renewal stops picking them up.
    pub fn unmanage(&self, names: &[String]) {
        let mut managed = self.managed.write().expect("managed set lock poisoned");
        for name in names {
            managed.remove(&name.to_ascii_lowercase());
        }
    }

    /// Names currently managed by this generation.
    pub fn managed_names(&self) -> Vec<String> {
        let managed = self.managed.read().expect("managed set lock poisoned");
        managed.iter().cloned().collect()
    }

    fn is_managed(&self, name: &str) -> bool {
        let managed = self.managed.read().expect("managed set lock poisoned");
        managed.contains(&name.to_ascii_lowercase())
    }

    /// Cancel this generation's renewal and issuance work.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn renewal_loop(self: Arc<Self>) {
        loop {
            for name in self.managed_names() {
                if self.cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = self.ensure_managed(&name).await {
                    warn!(name = %name, error = %e, "certificate maintenance failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(RENEWAL_CHECK_INTERVAL) => {}
            }
        }
    }

    /// Make sure `name` has a certificate that is not about to expire.
    async fn ensure_managed(&self, name: &str) -> Result<()> {
        let deadline = SystemTime::now() + RENEW_BEFORE;
        if let Some(not_after) = self.store.expiry(name) {
            if not_after > deadline {
                return Ok(());
            }
        } else if let Some(not_after) = self.load_persisted(name).await? {
            if not_after > deadline {
                info!(name = %name, "loaded persisted certificate");
                return Ok(());
            }
        }
        self.obtain(name).await
    }

    /// On-demand path: issue a certificate for a name the cache misses.
    ///
    /// Managed names bypass the validate command; unknown names are only
    /// issued when on-demand validation is configured and authorizes them.
    pub(crate) async fn obtain_on_demand(&self, name: &str) -> Result<()> {
        if !self.is_managed(name) {
            let Some(command) = &self.settings.on_demand_validate else {
                return Ok(());
            };
            if validate_hostname(name).is_err() {
                return Ok(());
            }
            self.run_validate_command(command, name).await?;
        }
        self.obtain(name).await
    }

    async fn run_validate_command(&self, command: &[String], name: &str) -> Result<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("empty validate_command".into()))?;
        let status = tokio::process::Command::new(program)
            .args(args)
            .env("TLSTUNNEL_NAME", name)
            .status()
            .await
            .map_err(|e| Error::Acme(format!("failed to run validate command: {e}")))?;
        if !status.success() {
            return Err(Error::Acme(format!(
                "validate command denied certificate for {name:?} ({status})"
            )));
        }
        Ok(())
    }

    /// Obtain a certificate for `name` through an ACME order with a DNS-01
    /// challenge solved by the configured external command.
    async fn obtain(&self, name: &str) -> Result<()> {
        let _guard = self.issue_lock.lock().await;
        // A concurrent caller may have finished the same order.
        if let Some(not_after) = self.store.expiry(name) {
            if not_after > SystemTime::now() + RENEW_BEFORE {
                return Ok(());
            }
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Acme("certificate controller stopped".into()));
        }

        info!(name = %name, "requesting certificate");
        let account = self.account().await?;

        let identifier = Identifier::Dns(name.to_string());
        let mut order = account
            .new_order(&NewOrder::new(&[identifier]))
            .await
            .map_err(acme_err)?;

        // The record goes at _acme-challenge.<domain>; wildcards share the
        // base domain's record.
        let challenge_domain = name.trim_start_matches("*.").to_string();
        let mut deployed = false;

        let result = self
            .drive_order(&mut order, &challenge_domain, &mut deployed)
            .await;

        if deployed {
            if let Err(e) = self.run_dns_command("clean_challenge", &challenge_domain).await {
                warn!(domain = %challenge_domain, error = %e, "DNS challenge cleanup failed");
            }
        }

        let (cert_pem, key_pem) = result?;
        let chain = parse_cert_pem(cert_pem.as_bytes())?;
        let key = parse_key_pem(key_pem.as_bytes())?;
        let (certified, names, not_after) = certified_key(chain, key)?;

        self.persist(name, &cert_pem, &key_pem).await?;
        self.store.insert(&names, certified, not_after, true);
        info!(name = %name, "certificate obtained");
        Ok(())
    }

    async fn drive_order(
        &self,
        order: &mut instant_acme::Order,
        challenge_domain: &str,
        deployed: &mut bool,
    ) -> Result<(String, String)> {
        {
            let mut authorizations = order.authorizations();
            while let Some(result) = authorizations.next().await {
                let mut authz = result.map_err(acme_err)?;
                let mut challenge = authz.challenge(ChallengeType::Dns01).ok_or_else(|| {
                    Error::Acme("ACME server offered no DNS-01 challenge".into())
                })?;
                let value = challenge.key_authorization().dns_value();
                // The TXT record must exist before the CA is told to look.
                self.deploy_challenge(challenge_domain, &value).await?;
                *deployed = true;
                challenge.set_ready().await.map_err(acme_err)?;
            }
        }

        // Poll until the order is ready to finalize.
        let mut attempts = 0;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(Error::Acme("certificate controller stopped".into()));
                }
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            }

            order.refresh().await.map_err(acme_err)?;
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(Error::Acme(format!(
                        "order validation failed for {challenge_domain:?}"
                    )));
                }
                status => debug!(domain = %challenge_domain, ?status, "order pending"),
            }

            attempts += 1;
            if attempts >= 30 {
                return Err(Error::Acme(format!(
                    "challenge validation timed out for {challenge_domain:?}"
                )));
            }
        }

        let key_pem = order.finalize().await.map_err(acme_err)?;
        let cert_pem = loop {
            match order.certificate().await.map_err(acme_err)? {
                Some(chain) => break chain,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };
        Ok((cert_pem, key_pem))
    }

    /// Order the deploy command to publish the TXT record, then give DNS a
    /// moment to propagate before the CA looks it up.
    async fn deploy_challenge(&self, domain: &str, value: &str) -> Result<()> {
        self.run_dns_command_with_value("deploy_challenge", domain, value)
            .await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    async fn run_dns_command(&self, action: &str, domain: &str) -> Result<()> {
        self.run_dns_command_with_value(action, domain, "-").await
    }

    async fn run_dns_command_with_value(
        &self,
        action: &str,
        domain: &str,
        value: &str,
    ) -> Result<()> {
        let command = self.settings.dns_command.as_ref().ok_or_else(|| {
            Error::Acme("no acme_dns_command configured for the DNS-01 challenge".into())
        })?;
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Config("empty acme_dns_command".into()))?;

        let status = tokio::process::Command::new(program)
            .args(args)
            .arg(action)
            .arg(domain)
            .arg("-")
            .arg(value)
            .status()
            .await
            .map_err(|e| Error::Acme(format!("failed to run DNS command: {e}")))?;
        if !status.success() {
            return Err(Error::Acme(format!(
                "DNS command {action} failed for {domain:?} ({status})"
            )));
        }
        Ok(())
    }

    async fn account(&self) -> Result<Arc<Account>> {
        let mut cached = self.account.lock().await;
        if let Some(account) = cached.as_ref() {
            return Ok(account.clone());
        }

        let account_dir = self.settings.data_dir.join("acme");
        tokio::fs::create_dir_all(&account_dir).await?;
        let creds_path = account_dir.join("account.json");

        let account = if creds_path.exists() {
            debug!("loading ACME account credentials");
            let creds_json = tokio::fs::read_to_string(&creds_path).await?;
            let creds: AccountCredentials =
                serde_json::from_str(&creds_json).map_err(|e| Error::Acme(e.to_string()))?;
            Account::builder()
                .map_err(acme_err)?
                .from_credentials(creds)
                .await
                .map_err(acme_err)?
        } else {
            info!("registering new ACME account");
            let contacts: Vec<String> = self
                .settings
                .email
                .iter()
                .map(|email| format!("mailto:{email}"))
                .collect();
            let contact_refs: Vec<&str> = contacts.iter().map(String::as_str).collect();
            let (account, creds) = Account::builder()
                .map_err(acme_err)?
                .create(
                    &NewAccount {
                        contact: &contact_refs,
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    self.settings.directory_url.clone(),
                    None,
                )
                .await
                .map_err(acme_err)?;

            let creds_json =
                serde_json::to_string_pretty(&creds).map_err(|e| Error::Acme(e.to_string()))?;
            tokio::fs::write(&creds_path, creds_json).await?;
            account
        };

        let account = Arc::new(account);
        *cached = Some(account.clone());
        Ok(account)
    }

    fn cert_dir(&self, name: &str) -> PathBuf {
        self.settings
            .data_dir
            .join("certificates")
            .join(name.replace('*', "_wildcard_"))
    }

    async fn persist(&self, name: &str, cert_pem: &str, key_pem: &str) -> Result<()> {
        let dir = self.cert_dir(name);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("fullchain.pem"), cert_pem).await?;
        tokio::fs::write(dir.join("key.pem"), key_pem).await?;
        Ok(())
    }

    /// Load a previously obtained certificate from disk into the cache.
    ///
    /// Returns its expiry when one was loaded.
    async fn load_persisted(&self, name: &str) -> Result<Option<SystemTime>> {
        let dir = self.cert_dir(name);
        let cert_path = dir.join("fullchain.pem");
        let key_path = dir.join("key.pem");
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let cert_pem = tokio::fs::read(&cert_path).await?;
        let key_pem = tokio::fs::read(&key_path).await?;
        let chain = parse_cert_pem(&cert_pem)?;
        let key = parse_key_pem(&key_pem)?;
        let (certified, names, not_after) = certified_key(chain, key)?;

        if let Some(not_after) = not_after {
            if not_after <= SystemTime::now() {
                debug!(name = %name, "persisted certificate is expired");
                return Ok(None);
            }
        }

        self.store.insert(&names, certified, not_after, true);
        Ok(Some(not_after.unwrap_or(SystemTime::UNIX_EPOCH)))
    }
}

fn acme_err(e: instant_acme::Error) -> Error {
    Error::Acme(e.to_string())
}

/// A hostname we are willing to obtain a certificate for: non-empty, not an
/// IP literal, not localhost.
pub fn validate_hostname(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config("empty certificate host name".into()));
    }
    if name.eq_ignore_ascii_case("localhost") {
        return Err(Error::Config(
            "cannot manage a certificate for localhost".into(),
        ));
    }
    if name.parse::<std::net::IpAddr>().is_ok() {
        return Err(Error::Config(format!(
            "cannot manage a certificate for IP address {name:?}"
        )));
    }
    Ok(())
}

/// Parse a PEM certificate chain.
pub fn parse_cert_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Certificate(format!("failed to parse certificate: {e}")))?;
    if chain.is_empty() {
        return Err(Error::Certificate("no certificates found in PEM".into()));
    }
    Ok(chain)
}

/// Parse a PEM private key.
pub fn parse_key_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Certificate(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| Error::Certificate("no private key found in PEM".into()))
}

/// Build a rustls [`CertifiedKey`] and extract the leaf's DNS names and
/// expiry.
fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<(Arc<CertifiedKey>, Vec<String>, Option<SystemTime>)> {
    let (_, leaf) = X509Certificate::from_der(chain[0].as_ref())
        .map_err(|e| Error::Certificate(format!("failed to parse leaf certificate: {e}")))?;

    let mut names: Vec<String> = Vec::new();
    if let Ok(Some(san)) = leaf.subject_alternative_name() {
        for general_name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = general_name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }
    if names.is_empty() {
        if let Some(cn) = leaf
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
        {
            names.push(cn.to_ascii_lowercase());
        }
    }

    let timestamp = leaf.validity().not_after.timestamp();
    let not_after = u64::try_from(timestamp)
        .ok()
        .map(|secs| SystemTime::UNIX_EPOCH + Duration::from_secs(secs));

    let signing_key = any_supported_type(&key)
        .map_err(|e| Error::Certificate(format!("unsupported private key: {e}")))?;
    let certified = Arc::new(CertifiedKey::new(chain, signing_key));

    Ok((certified, names, not_after))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str]) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let cert = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let chain = parse_cert_pem(cert.cert.pem().as_bytes()).unwrap();
        let key = parse_key_pem(cert.signing_key.serialize_pem().as_bytes()).unwrap();
        (chain, key)
    }

    #[test]
    fn unmanaged_cert_is_keyed_by_san_set() {
        let store = CertStore::new();
        let (chain, key) = self_signed(&["example.com", "alt.example.com"]);
        let names = store.cache_unmanaged_cert(chain, key).unwrap();
        assert_eq!(names.len(), 2);

        assert!(store.resolve("example.com").is_some());
        assert!(store.resolve("alt.example.com").is_some());
        assert!(store.resolve("other.example.com").is_none());
    }

    #[test]
    fn resolve_is_case_insensitive() {
        let store = CertStore::new();
        let (chain, key) = self_signed(&["example.com"]);
        store.cache_unmanaged_cert(chain, key).unwrap();
        assert!(store.resolve("EXAMPLE.com").is_some());
    }

    #[test]
    fn wildcard_resolution() {
        let store = CertStore::new();
        let (chain, key) = self_signed(&["*.sub.example.com"]);
        store.cache_unmanaged_cert(chain, key).unwrap();

        assert!(store.resolve("foo.sub.example.com").is_some());
        // Exactly one label is substituted.
        assert!(store.resolve("a.b.sub.example.com").is_none());
        assert!(store.resolve("sub.example.com").is_none());
    }

    #[test]
    fn wildcard_needs_dot_in_remainder() {
        assert_eq!(
            wildcard_form("foo.example.com"),
            Some("*.example.com".into())
        );
        assert_eq!(wildcard_form("example.com"), None);
        assert_eq!(wildcard_form("com"), None);
    }

    #[test]
    fn hostname_validation() {
        assert!(validate_hostname("example.com").is_ok());
        assert!(validate_hostname("*.example.com").is_ok());
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("localhost").is_err());
        assert!(validate_hostname("LOCALHOST").is_err());
        assert!(validate_hostname("127.0.0.1").is_err());
        assert!(validate_hostname("::1").is_err());
    }

    #[tokio::test]
    async fn unmanage_removes_from_set_and_evicts() {
        let store = CertStore::new();
        let manager = CertManager::new(store.clone(), AcmeSettings::new("/tmp/unused".into()));
        store.set_manager(manager.clone());
        // Cancelled up front so the renewal task exits without touching ACME.
        manager.stop();
        manager
            .manage(&["a.example.com".to_string(), "b.example.com".to_string()])
            .unwrap();

        store.unmanage(&["a.example.com".to_string()]);
        let mut names = manager.managed_names();
        names.sort();
        assert_eq!(names, vec!["b.example.com".to_string()]);
    }

    #[test]
    fn unmanage_keeps_unmanaged_entries() {
        let store = CertStore::new();
        let (chain, key) = self_signed(&["example.com"]);
        store.cache_unmanaged_cert(chain, key).unwrap();

        store.unmanage(&["example.com".to_string()]);
        assert!(store.resolve("example.com").is_some());
    }

    #[test]
    fn manager_pointer_is_generation_scoped() {
        let store = CertStore::new();
        let first = CertManager::new(store.clone(), AcmeSettings::new("/tmp/unused".into()));
        let second = CertManager::new(store.clone(), AcmeSettings::new("/tmp/unused".into()));

        store.set_manager(first.clone());
        store.set_manager(second.clone());

        // A superseded generation cannot clear its successor's pointer.
        store.clear_manager(&first);
        assert!(store.manager().is_some());

        store.clear_manager(&second);
        assert!(store.manager().is_none());
    }

    #[test]
    fn manage_rejects_invalid_names() {
        let store = CertStore::new();
        let manager = CertManager::new(store, AcmeSettings::new("/tmp/unused".into()));
        assert!(manager.manage(&["localhost".to_string()]).is_err());
        assert!(manager.manage(&["10.0.0.1".to_string()]).is_err());
        manager.stop();
    }

    #[test]
    fn server_config_appends_alpn() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let store = CertStore::new();
        let config = store.server_config(&["h2".to_string(), "http/1.1".to_string()]);
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
