//! Certificate lifecycle orchestration
//!
//! One [`Orchestrator`] owns one domain set and its stores. Each
//! [`Orchestrator::run`] walks the same fixed sequence:
//!
//! ```text
//! account key ──► domain key ──► bundle stored? ──no──► obtain ──► save ──► available
//!                                      │
//!                                     yes
//!                                      ▼
//!                               leaf still valid? ──yes──► available
//!                                      │
//!                                      no
//!                                      ▼
//!                  unavailable ──► renew ──► save ──► available ──► renewed
//! ```
//!
//! A domain key generated during the run invalidates any stored bundle: the
//! old leaf is reported unavailable and a new certificate is obtained.
//!
//! Registry notifications never fail a run; their errors are logged and
//! returned in the [`RunReport`].

use std::fmt;
use std::sync::Arc;

use certkeeper_config::{AcmeConfig, CertificateConfig};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::ca::{AccountIdentity, CaConnector, CertificateAuthority};
use crate::cert::{Certificate, CertificateBundle};
use crate::checker::{TimeExpirationChecker, ValidityChecker, ValidityPolicy};
use crate::domains::DomainSet;
use crate::error::{LifecycleError, NotifierError};
use crate::key::{KeyAlgorithm, PrivateKey};
use crate::registry::Notifier;
use crate::storage::{CertStore, FileStore, KeyStore, MultiOutputCertStore};

/// What a run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAction {
    /// No bundle was stored, a new certificate was issued
    Obtained,
    /// The stored leaf was inside the renewal window and got replaced
    Renewed,
    /// The stored leaf is fresh, nothing changed
    StillValid,
}

impl fmt::Display for RunAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunAction::Obtained => f.write_str("obtained"),
            RunAction::Renewed => f.write_str("renewed"),
            RunAction::StillValid => f.write_str("still-valid"),
        }
    }
}

/// Outcome of a successful run
#[derive(Debug)]
pub struct RunReport {
    pub action: RunAction,
    /// Expiry of the leaf that is stored after the run
    pub not_after: DateTime<Utc>,
    /// Registry failures, in the order they happened
    pub notifier_errors: Vec<NotifierError>,
}

#[derive(Debug, Clone, Copy)]
enum KeyRole {
    Account,
    Domain,
}

impl KeyRole {
    fn as_str(&self) -> &'static str {
        match self {
            KeyRole::Account => "account key",
            KeyRole::Domain => "domain key",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Available,
    Unavailable,
    Renewed,
}

/// Keeps one domain set's certificate present, fresh and advertised
pub struct Orchestrator {
    name: String,
    email: String,
    domains: DomainSet,
    account_key_store: Box<dyn KeyStore>,
    domain_key_store: Box<dyn KeyStore>,
    cert_store: Box<dyn CertStore>,
    checker: Box<dyn ValidityChecker>,
    connector: Arc<dyn CaConnector>,
    notifier: Arc<dyn Notifier>,
    account_key_algorithm: KeyAlgorithm,
    domain_key_algorithm: KeyAlgorithm,
    ca: Option<Arc<dyn CertificateAuthority>>,
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// File backed orchestrator for one configured certificate
    pub fn from_config(
        acme: &AcmeConfig,
        cert: &CertificateConfig,
        connector: Arc<dyn CaConnector>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, LifecycleError> {
        let domains =
            DomainSet::new(&cert.domains).map_err(|e| LifecycleError::Config(e.to_string()))?;

        let cert_files = |dir: &std::path::Path, layout| {
            FileStore::new(dir, layout).with_cert_base_name(cert.cert_base_name.clone())
        };
        let primary = cert_files(cert.cert_dir.as_path(), cert.layout);
        let cert_store: Box<dyn CertStore> = if cert.mirrors.is_empty() {
            Box::new(primary)
        } else {
            let multi = cert.mirrors.iter().fold(
                MultiOutputCertStore::new(Box::new(primary)),
                |multi, mirror| multi.with_mirror(Box::new(cert_files(mirror.dir.as_path(), mirror.layout))),
            );
            Box::new(multi)
        };

        Self::builder()
            .name(cert.display_name())
            .email(acme.email.clone())
            .domains(domains)
            .account_key_store(Box::new(FileStore::for_keys(acme.account_key_dir.clone())))
            .domain_key_store(Box::new(
                FileStore::for_keys(cert.key_dir.clone()).with_key_name(cert.key_name.clone()),
            ))
            .cert_store(cert_store)
            .checker(Box::new(TimeExpirationChecker::new(ValidityPolicy::from_days(
                cert.renew_before_days,
            ))))
            .connector(connector)
            .notifier(notifier)
            .account_key_algorithm(acme.key_algorithm)
            .domain_key_algorithm(cert.key_algorithm.unwrap_or(acme.key_algorithm))
            .build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domains(&self) -> &DomainSet {
        &self.domains
    }

    /// Bring the certificate into the desired state
    pub async fn run(&mut self) -> Result<RunReport, LifecycleError> {
        let (account_key, _) = self.ensure_key(KeyRole::Account).await?;
        let (domain_key, domain_key_generated) = self.ensure_key(KeyRole::Domain).await?;
        let mut notifier_errors = Vec::new();

        if !self.cert_store.certs_exist() {
            debug!(certificate = %self.name, "No certificate bundle stored");
            return self
                .obtain(&account_key, &domain_key, notifier_errors)
                .await;
        }

        if domain_key_generated {
            warn!(
                certificate = %self.name,
                "Stored certificate was issued for another domain key, obtaining a new one"
            );
            match self.cert_store.load_certs() {
                Ok(stale) => {
                    self.notify(Event::Unavailable, stale.leaf(), &mut notifier_errors)
                        .await
                }
                Err(e) => debug!(certificate = %self.name, error = %e, "Stale bundle unreadable"),
            }
            return self
                .obtain(&account_key, &domain_key, notifier_errors)
                .await;
        }

        let bundle = match self.cert_store.load_certs() {
            Ok(bundle) => bundle,
            Err(e) if e.is_not_found() => {
                warn!(
                    certificate = %self.name,
                    error = %e,
                    "Certificate bundle disappeared, obtaining a new one"
                );
                return self
                    .obtain(&account_key, &domain_key, notifier_errors)
                    .await;
            }
            Err(e) => return Err(LifecycleError::storage("loading certificate bundle", e)),
        };

        let leaf = bundle.leaf();
        if self.checker.is_valid(leaf)? {
            info!(
                certificate = %self.name,
                not_after = %leaf.not_after(),
                "Certificate is still valid"
            );
            self.notify(Event::Available, leaf, &mut notifier_errors).await;
            return Ok(RunReport {
                action: RunAction::StillValid,
                not_after: leaf.not_after(),
                notifier_errors,
            });
        }

        info!(
            certificate = %self.name,
            not_after = %leaf.not_after(),
            "Certificate expires soon, renewing"
        );
        self.notify(Event::Unavailable, leaf, &mut notifier_errors).await;

        let ca = self.ca(&account_key).await?;
        let renewed = ca.renew(leaf, &domain_key).await?;
        self.save(&renewed)?;

        let new_leaf = renewed.leaf();
        self.notify(Event::Available, new_leaf, &mut notifier_errors).await;
        self.notify(Event::Renewed, new_leaf, &mut notifier_errors).await;

        info!(
            certificate = %self.name,
            not_after = %new_leaf.not_after(),
            "Certificate renewed"
        );
        Ok(RunReport {
            action: RunAction::Renewed,
            not_after: new_leaf.not_after(),
            notifier_errors,
        })
    }

    /// Withdraw the stored certificate from the registry
    pub async fn deregister(&self) -> Result<(), LifecycleError> {
        if !self.cert_store.certs_exist() {
            debug!(certificate = %self.name, "Nothing to deregister");
            return Ok(());
        }

        let bundle = match self.cert_store.load_certs() {
            Ok(bundle) => bundle,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(LifecycleError::storage("loading certificate bundle", e)),
        };

        self.notifier.deregister(bundle.leaf()).await?;
        info!(certificate = %self.name, "Deregistered certificate");
        Ok(())
    }

    async fn obtain(
        &mut self,
        account_key: &PrivateKey,
        domain_key: &PrivateKey,
        mut notifier_errors: Vec<NotifierError>,
    ) -> Result<RunReport, LifecycleError> {
        info!(certificate = %self.name, domains = %self.domains, "Obtaining certificate");

        let ca = self.ca(account_key).await?;
        let bundle = ca
            .obtain_certificate(&self.domains, domain_key)
            .await
            .map_err(LifecycleError::Obtain)?;
        self.save(&bundle)?;

        let leaf = bundle.leaf();
        self.notify(Event::Available, leaf, &mut notifier_errors).await;

        info!(
            certificate = %self.name,
            not_after = %leaf.not_after(),
            chain = bundle.chain().len(),
            "Certificate obtained"
        );
        Ok(RunReport {
            action: RunAction::Obtained,
            not_after: leaf.not_after(),
            notifier_errors,
        })
    }

    fn save(&self, bundle: &CertificateBundle) -> Result<(), LifecycleError> {
        self.cert_store
            .save_certs(bundle)
            .map_err(|e| LifecycleError::storage("saving certificate bundle", e))
    }

    /// Connected CA, connecting on first use
    async fn ca(
        &mut self,
        account_key: &PrivateKey,
    ) -> Result<Arc<dyn CertificateAuthority>, LifecycleError> {
        if let Some(ref ca) = self.ca {
            return Ok(Arc::clone(ca));
        }

        let identity = AccountIdentity::new(self.email.clone(), account_key.clone());
        let ca = self.connector.connect(&identity).await?;
        debug!(certificate = %self.name, email = %self.email, "Connected to CA");
        self.ca = Some(Arc::clone(&ca));
        Ok(ca)
    }

    /// Stored key for `role`, generating and saving one if absent
    ///
    /// The flag is true when the key was generated by this call.
    async fn ensure_key(&self, role: KeyRole) -> Result<(PrivateKey, bool), LifecycleError> {
        let (store, algorithm) = match role {
            KeyRole::Account => (&self.account_key_store, self.account_key_algorithm),
            KeyRole::Domain => (&self.domain_key_store, self.domain_key_algorithm),
        };

        if store.key_exists() {
            let key = store.load_key().map_err(|e| {
                LifecycleError::storage(
                    match role {
                        KeyRole::Account => "loading account key",
                        KeyRole::Domain => "loading domain key",
                    },
                    e,
                )
            })?;
            return Ok((key, false));
        }

        info!(
            certificate = %self.name,
            algorithm = %algorithm,
            "Generating {}",
            role.as_str()
        );
        let key = tokio::task::spawn_blocking(move || PrivateKey::generate(algorithm))
            .await
            .map_err(|e| LifecycleError::KeyGeneration {
                role: role.as_str(),
                reason: e.to_string(),
            })?
            .map_err(|e| LifecycleError::KeyGeneration {
                role: role.as_str(),
                reason: e.to_string(),
            })?;

        store.save_key(&key).map_err(|e| {
            LifecycleError::storage(
                match role {
                    KeyRole::Account => "saving account key",
                    KeyRole::Domain => "saving domain key",
                },
                e,
            )
        })?;
        Ok((key, true))
    }

    async fn notify(&self, event: Event, leaf: &Certificate, errors: &mut Vec<NotifierError>) {
        let result = match event {
            Event::Available => self.notifier.notify_certs_available(leaf).await,
            Event::Unavailable => self.notifier.notify_certs_unavailable(leaf).await,
            Event::Renewed => self.notifier.notify_certs_renewed(leaf).await,
        };

        if let Err(e) = result {
            warn!(
                certificate = %self.name,
                event = ?event,
                error = %e,
                "Registry notification failed"
            );
            errors.push(e);
        }
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("name", &self.name)
            .field("domains", &self.domains)
            .field("connected", &self.ca.is_some())
            .finish()
    }
}

/// Builder for [`Orchestrator`]
///
/// Every collaborator is required except the checker (30 day window), the
/// notifier (none) and the key algorithms (RSA 4096).
#[derive(Default)]
pub struct OrchestratorBuilder {
    name: Option<String>,
    email: Option<String>,
    domains: Option<DomainSet>,
    account_key_store: Option<Box<dyn KeyStore>>,
    domain_key_store: Option<Box<dyn KeyStore>>,
    cert_store: Option<Box<dyn CertStore>>,
    checker: Option<Box<dyn ValidityChecker>>,
    connector: Option<Arc<dyn CaConnector>>,
    notifier: Option<Arc<dyn Notifier>>,
    account_key_algorithm: KeyAlgorithm,
    domain_key_algorithm: KeyAlgorithm,
}

impl OrchestratorBuilder {
    /// Label used in logs, defaults to the primary domain
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn domains(mut self, domains: DomainSet) -> Self {
        self.domains = Some(domains);
        self
    }

    pub fn account_key_store(mut self, store: Box<dyn KeyStore>) -> Self {
        self.account_key_store = Some(store);
        self
    }

    pub fn domain_key_store(mut self, store: Box<dyn KeyStore>) -> Self {
        self.domain_key_store = Some(store);
        self
    }

    pub fn cert_store(mut self, store: Box<dyn CertStore>) -> Self {
        self.cert_store = Some(store);
        self
    }

    pub fn checker(mut self, checker: Box<dyn ValidityChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn CaConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn account_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.account_key_algorithm = algorithm;
        self
    }

    pub fn domain_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.domain_key_algorithm = algorithm;
        self
    }

    pub fn build(self) -> Result<Orchestrator, LifecycleError> {
        fn missing(what: &str) -> LifecycleError {
            LifecycleError::Config(format!("{} is required", what))
        }

        let domains = self.domains.ok_or_else(|| missing("domain set"))?;
        let email = self.email.ok_or_else(|| missing("account email"))?;
        if email.trim().is_empty() {
            return Err(missing("account email"));
        }

        Ok(Orchestrator {
            name: self.name.unwrap_or_else(|| domains.primary().to_string()),
            email,
            account_key_store: self
                .account_key_store
                .ok_or_else(|| missing("account key store"))?,
            domain_key_store: self
                .domain_key_store
                .ok_or_else(|| missing("domain key store"))?,
            cert_store: self.cert_store.ok_or_else(|| missing("certificate store"))?,
            checker: self.checker.unwrap_or_else(|| {
                Box::new(TimeExpirationChecker::new(ValidityPolicy::from_days(30)))
            }),
            connector: self.connector.ok_or_else(|| missing("CA connector"))?,
            notifier: self
                .notifier
                .unwrap_or_else(|| Arc::new(crate::registry::NoopNotifier)),
            account_key_algorithm: self.account_key_algorithm,
            domain_key_algorithm: self.domain_key_algorithm,
            domains,
            ca: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    struct Unreachable;

    #[async_trait::async_trait]
    impl CaConnector for Unreachable {
        async fn connect(
            &self,
            _identity: &AccountIdentity,
        ) -> Result<Arc<dyn CertificateAuthority>, crate::error::CaError> {
            Err(crate::error::CaError::Protocol("unreachable".to_string()))
        }
    }

    fn builder() -> OrchestratorBuilder {
        Orchestrator::builder()
            .email("admin@example.com")
            .domains(DomainSet::new(["example.com"]).unwrap())
            .account_key_store(Box::new(MemoryStore::new()))
            .domain_key_store(Box::new(MemoryStore::new()))
            .cert_store(Box::new(MemoryStore::new()))
            .connector(Arc::new(Unreachable))
    }

    #[test]
    fn test_builder_defaults() {
        let orchestrator = builder().build().unwrap();
        assert_eq!(orchestrator.name(), "example.com");
        assert_eq!(orchestrator.domains().primary(), "example.com");
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = Orchestrator::builder().build().unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));

        let err = builder().email("  ").build().unwrap_err();
        assert!(err.to_string().contains("account email"));
    }

    #[tokio::test]
    async fn test_failed_key_save_is_fatal_for_run() {
        let account_keys = MemoryStore::new();
        account_keys.fail_saves(Some("read-only"));
        let mut orchestrator = builder()
            .account_key_store(Box::new(account_keys))
            .account_key_algorithm(KeyAlgorithm::EcdsaP256)
            .build()
            .unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Storage { context: "saving account key", .. }));
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces() {
        let mut orchestrator = builder()
            .account_key_algorithm(KeyAlgorithm::EcdsaP256)
            .domain_key_algorithm(KeyAlgorithm::EcdsaP256)
            .build()
            .unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Ca(_)));
        assert!(err.is_retryable());
    }
}
