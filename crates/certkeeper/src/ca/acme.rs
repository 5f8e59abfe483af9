//! ACME certificate authority client
//!
//! Implements [`CertificateAuthority`] on top of `instant-acme`:
//!
//! 1. Restore the account from `account.json` or register a new one
//! 2. Create an order covering every name of the domain set
//! 3. Publish HTTP-01 responses into the webroot and mark challenges ready
//! 4. Poll the order until it is ready, bounded by the order timeout
//! 5. Finalize with a CSR signed by the stored domain key
//! 6. Download the chain and record what was issued
//!
//! `instant-acme` keeps its own JWS key inside the account credentials, so
//! the operator's account key is bound to the stored registration through its
//! SHA-256 fingerprint. A registration created for a different key is
//! rejected with [`CaError::AccountMismatch`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::challenge::WebrootSolver;
use super::state::{AccountRegistration, AcmeState, IssuanceRecord};
use super::{AccountIdentity, CaConnector, CertificateAuthority};
use crate::cert::{Certificate, CertificateBundle};
use crate::domains::DomainSet;
use crate::error::{CaError, ObtainFailures};
use crate::key::PrivateKey;

/// Default upper bound for an order to become ready
pub const DEFAULT_ORDER_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay between order status polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Connects to an ACME directory on behalf of an account identity
#[derive(Debug, Clone)]
pub struct AcmeConnector {
    directory_url: String,
    state_dir: PathBuf,
    webroot: PathBuf,
    order_timeout: Duration,
    poll_interval: Duration,
}

impl AcmeConnector {
    pub fn new(
        directory_url: impl Into<String>,
        state_dir: impl Into<PathBuf>,
        webroot: impl Into<PathBuf>,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            state_dir: state_dir.into(),
            webroot: webroot.into(),
            order_timeout: DEFAULT_ORDER_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Connector for the account settings of a configuration file
    pub fn from_config(config: &certkeeper_config::AcmeConfig) -> Self {
        Self::new(
            config.effective_directory_url(),
            config.state_dir.clone(),
            config.webroot.clone(),
        )
        .with_order_timeout(Duration::from_secs(config.order_timeout_secs))
    }

    pub fn with_order_timeout(mut self, timeout: Duration) -> Self {
        self.order_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    /// Restore the stored account or register a new one
    async fn account(&self, identity: &AccountIdentity, state: &AcmeState) -> Result<Account, CaError> {
        let fingerprint = identity.key.fingerprint();

        if let Some(registration) = state.load_registration()? {
            if registration.account_key_sha256 != fingerprint {
                error!(
                    email = %identity.email,
                    path = %state.account_path().display(),
                    "Stored ACME registration belongs to a different account key"
                );
                return Err(CaError::AccountMismatch {
                    path: state.account_path(),
                });
            }

            if registration.directory_url == self.directory_url {
                let credentials: AccountCredentials =
                    serde_json::from_value(registration.credentials).map_err(|e| {
                        CaError::CorruptState {
                            path: state.account_path(),
                            reason: e.to_string(),
                        }
                    })?;
                let account = Account::from_credentials(credentials)
                    .await
                    .map_err(|e| CaError::Protocol(format!("restoring account: {}", e)))?;
                info!(email = %identity.email, "Restored ACME account");
                return Ok(account);
            }

            warn!(
                email = %identity.email,
                stored = %registration.directory_url,
                configured = %self.directory_url,
                "Stored ACME registration is for another directory, registering again"
            );
        }

        info!(
            email = %identity.email,
            directory = %self.directory_url,
            "Registering new ACME account"
        );

        let contact = format!("mailto:{}", identity.email);
        let new_account = NewAccount {
            contact: &[contact.as_str()],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = Account::create(&new_account, &self.directory_url, None)
            .await
            .map_err(|e| CaError::Protocol(format!("account registration: {}", e)))?;

        let credentials = serde_json::to_value(&credentials)
            .map_err(|e| CaError::Protocol(format!("serializing account credentials: {}", e)))?;
        state.save_registration(&AccountRegistration {
            contact_email: identity.email.clone(),
            account_key_sha256: fingerprint,
            created: Utc::now(),
            directory_url: self.directory_url.clone(),
            credentials,
        })?;

        Ok(account)
    }
}

#[async_trait]
impl CaConnector for AcmeConnector {
    async fn connect(
        &self,
        identity: &AccountIdentity,
    ) -> Result<Arc<dyn CertificateAuthority>, CaError> {
        let state = AcmeState::new(&self.state_dir, &identity.email);
        let account = self.account(identity, &state).await?;

        Ok(Arc::new(AcmeCa {
            account,
            solver: WebrootSolver::new(self.webroot.clone()),
            state,
            order_timeout: self.order_timeout,
            poll_interval: self.poll_interval,
        }))
    }
}

/// A registered ACME account ready to issue certificates
pub struct AcmeCa {
    account: Account,
    solver: WebrootSolver,
    state: AcmeState,
    order_timeout: Duration,
    poll_interval: Duration,
}

impl AcmeCa {
    async fn issue(
        &self,
        domains: &DomainSet,
        key: &PrivateKey,
    ) -> Result<CertificateBundle, ObtainFailures> {
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|name| Identifier::Dns(name.to_string()))
            .collect();

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| {
                ObtainFailures::for_all(domains.iter(), CaError::Protocol(format!("new order: {}", e)))
            })?;
        debug!(domains = %domains, "Created ACME order");

        let result = self.drive_order(&mut order, domains, key).await;
        self.solver.clear().await;
        let bundle = result?;

        let record = IssuanceRecord {
            domains: domains.names().to_vec(),
            fingerprint: bundle.leaf().fingerprint().to_string(),
            issued: Utc::now(),
            not_after: bundle.leaf().not_after(),
        };
        if let Err(e) = self.state.save_record(domains.primary(), &record) {
            warn!(domain = %domains.primary(), error = %e, "Failed to write issuance record");
        }

        info!(
            domains = %domains,
            not_after = %bundle.leaf().not_after(),
            chain = bundle.chain().len(),
            "Certificate issued"
        );
        Ok(bundle)
    }

    async fn drive_order(
        &self,
        order: &mut Order,
        domains: &DomainSet,
        key: &PrivateKey,
    ) -> Result<CertificateBundle, ObtainFailures> {
        let all = |e: CaError| ObtainFailures::for_all(domains.iter(), e);

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| all(CaError::Protocol(format!("authorizations: {}", e))))?;

        let mut failures = ObtainFailures::new();
        for auth in &authorizations {
            let domain = identifier_name(&auth.identifier);
            debug!(domain = %domain, status = ?auth.status, "Processing authorization");

            if auth.status == AuthorizationStatus::Valid {
                continue;
            }
            if auth.status != AuthorizationStatus::Pending {
                failures.insert(
                    domain.clone(),
                    CaError::Challenge {
                        domain,
                        reason: format!("authorization is {:?}", auth.status),
                    },
                );
                continue;
            }

            let Some(challenge) = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
            else {
                failures.insert(
                    domain.clone(),
                    CaError::Challenge {
                        domain,
                        reason: "no HTTP-01 challenge offered".to_string(),
                    },
                );
                continue;
            };

            let key_auth = order.key_authorization(challenge);
            if let Err(e) = self.solver.add_challenge(&challenge.token, key_auth.as_str()).await {
                failures.insert(domain, e);
                continue;
            }

            if let Err(e) = order.set_challenge_ready(&challenge.url).await {
                failures.insert(
                    domain.clone(),
                    CaError::Challenge {
                        domain,
                        reason: format!("marking challenge ready: {}", e),
                    },
                );
            }
        }
        if !failures.is_empty() {
            return Err(failures);
        }

        let deadline = Instant::now() + self.order_timeout;
        let status = loop {
            order
                .refresh()
                .await
                .map_err(|e| all(CaError::Protocol(format!("order refresh: {}", e))))?;

            let status = order.state().status;
            debug!(domains = %domains, status = ?status, "Order status");

            match status {
                OrderStatus::Ready | OrderStatus::Valid => break status,
                OrderStatus::Invalid => return Err(invalid_order_failures(order, domains).await),
                OrderStatus::Pending | OrderStatus::Processing => {
                    if Instant::now() >= deadline {
                        return Err(all(CaError::Timeout(self.order_timeout, "order validation")));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };

        let key_pair = key.to_key_pair().map_err(|e| all(CaError::Key(e.to_string())))?;
        let mut params = CertificateParams::new(domains.names().to_vec())
            .map_err(|e| all(CaError::Key(format!("certificate request: {}", e))))?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domains.primary());
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| all(CaError::Key(format!("signing certificate request: {}", e))))?;

        if status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| all(CaError::Protocol(format!("finalize: {}", e))))?;
            debug!(domains = %domains, "Order finalized, waiting for certificate");
        }

        let chain = loop {
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        return Err(all(CaError::Timeout(self.order_timeout, "certificate download")));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    return Err(all(CaError::Protocol(format!("certificate download: {}", e))))
                }
            }
        };

        CertificateBundle::from_pem(chain).map_err(|e| all(CaError::InvalidCertificate(e.to_string())))
    }
}

/// Domain set to request when renewing `cert`
///
/// Prefers the issuance record stored for the certificate's names and falls
/// back to the names in the certificate itself. A record that exists but
/// cannot be read is an error, never skipped.
pub(crate) fn renewal_domains(state: &AcmeState, cert: &Certificate) -> Result<DomainSet, CaError> {
    let candidates = cert
        .common_name()
        .into_iter()
        .chain(cert.dns_names().iter().map(String::as_str));

    for name in candidates {
        let Some(record) = state.load_record(name)? else {
            continue;
        };
        if record.fingerprint != cert.fingerprint() {
            debug!(
                domain = %name,
                recorded = %record.fingerprint,
                current = %cert.fingerprint(),
                "Issuance record describes another certificate of the same domain set"
            );
        }
        return DomainSet::new(&record.domains).map_err(|e| CaError::CorruptState {
            path: state.record_path(name),
            reason: e.to_string(),
        });
    }

    debug!(names = ?cert.subject_names(), "No issuance record, renewing certificate names");
    DomainSet::new(cert.subject_names()).map_err(|e| CaError::InvalidCertificate(e.to_string()))
}

/// Per-domain causes of an order the CA marked invalid
async fn invalid_order_failures(order: &mut Order, domains: &DomainSet) -> ObtainFailures {
    let order_error = order
        .state()
        .error
        .as_ref()
        .map(|problem| format!("{:?}", problem))
        .unwrap_or_else(|| "order became invalid".to_string());

    let mut failures = ObtainFailures::new();
    if let Ok(authorizations) = order.authorizations().await {
        for auth in authorizations {
            if auth.status == AuthorizationStatus::Valid {
                continue;
            }
            let domain = identifier_name(&auth.identifier);
            let reason = auth
                .challenges
                .iter()
                .find_map(|c| c.error.as_ref().map(|problem| format!("{:?}", problem)))
                .unwrap_or_else(|| format!("authorization is {:?}", auth.status));
            failures.insert(domain.clone(), CaError::Challenge { domain, reason });
        }
    }

    if failures.is_empty() {
        return ObtainFailures::for_all(domains.iter(), CaError::OrderInvalid(order_error));
    }
    failures
}

#[allow(unreachable_patterns)]
fn identifier_name(identifier: &Identifier) -> String {
    match identifier {
        Identifier::Dns(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

/// Collapse a failure map to the error a renewal reports
fn renewal_error(failures: ObtainFailures) -> CaError {
    for (domain, e) in failures.iter() {
        warn!(domain = %domain, error = %e, "Renewal failed for domain");
    }
    let fatal = failures.iter().find(|(_, e)| e.is_fatal()).map(|(_, e)| e.clone());
    fatal
        .or_else(|| failures.iter().next().map(|(_, e)| e.clone()))
        .unwrap_or_else(|| CaError::OrderInvalid(failures.to_string()))
}

#[async_trait]
impl CertificateAuthority for AcmeCa {
    async fn obtain_certificate(
        &self,
        domains: &DomainSet,
        key: &PrivateKey,
    ) -> Result<CertificateBundle, ObtainFailures> {
        info!(domains = %domains, "Requesting certificate");
        self.issue(domains, key).await
    }

    async fn renew(&self, cert: &Certificate, key: &PrivateKey) -> Result<CertificateBundle, CaError> {
        let domains = renewal_domains(&self.state, cert)?;
        info!(domains = %domains, not_after = %cert.not_after(), "Renewing certificate");
        self.issue(&domains, key).await.map_err(renewal_error)
    }

    async fn revoke(&self, _cert: &Certificate, _key: &PrivateKey) -> Result<(), CaError> {
        Err(CaError::Unsupported("certificate revocation"))
    }
}

impl fmt::Debug for AcmeCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeCa")
            .field("state", &self.state.dir())
            .field("webroot", &self.solver.webroot())
            .field("order_timeout", &self.order_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyAlgorithm;
    use crate::test_support::{issue_cert, CertSpec};
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn identity() -> AccountIdentity {
        AccountIdentity::new(
            "admin@example.com",
            PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_rejects_registration_for_other_key() {
        let temp = TempDir::new().unwrap();
        let identity = identity();
        let state = AcmeState::new(temp.path(), &identity.email);
        state
            .save_registration(&AccountRegistration {
                contact_email: identity.email.clone(),
                account_key_sha256: "ff".repeat(32),
                created: Utc::now(),
                directory_url: "https://acme.test/directory".to_string(),
                credentials: serde_json::json!({}),
            })
            .unwrap();

        let connector = AcmeConnector::new("https://acme.test/directory", temp.path(), temp.path());
        let err = connector.connect(&identity).await.err().expect("connect should fail");
        assert!(matches!(err, CaError::AccountMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_corrupt_registration_is_fatal() {
        let temp = TempDir::new().unwrap();
        let identity = identity();
        let state = AcmeState::new(temp.path(), &identity.email);
        std::fs::create_dir_all(state.dir()).unwrap();
        std::fs::write(state.account_path(), "not json").unwrap();

        let connector = AcmeConnector::new("https://acme.test/directory", temp.path(), temp.path());
        let err = connector.connect(&identity).await.err().expect("connect should fail");
        assert!(matches!(err, CaError::CorruptState { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let temp = TempDir::new().unwrap();
        let identity = identity();
        let connector = AcmeConnector::new(
            format!("{}/directory", server.uri()),
            temp.path(),
            temp.path(),
        );

        let err = connector.connect(&identity).await.err().expect("connect should fail");
        assert!(matches!(err, CaError::Protocol(_)));
        assert!(!err.is_fatal());
        assert!(!AcmeState::new(temp.path(), &identity.email)
            .account_path()
            .exists());
    }

    #[test]
    fn test_renewal_domains_prefers_record() {
        let temp = TempDir::new().unwrap();
        let state = AcmeState::new(temp.path(), "admin@example.com");
        let cert = issue_cert(CertSpec::valid_for_days(20).names(&["example.com"]));

        state
            .save_record(
                "example.com",
                &IssuanceRecord {
                    domains: vec!["example.com".to_string(), "www.example.com".to_string()],
                    fingerprint: cert.fingerprint().to_string(),
                    issued: Utc::now(),
                    not_after: cert.not_after(),
                },
            )
            .unwrap();

        let domains = renewal_domains(&state, &cert).unwrap();
        assert_eq!(domains.names(), ["example.com", "www.example.com"]);
    }

    #[test]
    fn test_renewal_domains_falls_back_to_cert_names() {
        let temp = TempDir::new().unwrap();
        let state = AcmeState::new(temp.path(), "admin@example.com");
        let cert = issue_cert(CertSpec::valid_for_days(20).names(&["a.example.com", "b.example.com"]));

        let domains = renewal_domains(&state, &cert).unwrap();
        assert_eq!(domains.names(), ["a.example.com", "b.example.com"]);
    }

    #[test]
    fn test_renewal_domains_never_skips_broken_record() {
        let temp = TempDir::new().unwrap();
        let state = AcmeState::new(temp.path(), "admin@example.com");
        let cert = issue_cert(CertSpec::valid_for_days(20).names(&["example.com"]));
        let path = state.record_path("example.com");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[").unwrap();

        assert!(matches!(
            renewal_domains(&state, &cert),
            Err(CaError::CorruptState { .. })
        ));
    }

    #[test]
    fn test_renewal_error_prefers_fatal() {
        let mut failures = ObtainFailures::new();
        failures.insert("a.example.com", CaError::Protocol("503".into()));
        failures.insert("b.example.com", CaError::Key("bad key".into()));
        assert!(matches!(renewal_error(failures), CaError::Key(_)));
    }
}
