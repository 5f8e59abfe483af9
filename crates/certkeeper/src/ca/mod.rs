//! Certificate authority client contracts
//!
//! The orchestrator talks to a CA through [`CertificateAuthority`], obtained
//! from a [`CaConnector`] once the account identity is known. The ACME
//! implementation lives in [`acme`].

pub mod acme;
pub mod challenge;
pub mod state;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cert::{Certificate, CertificateBundle};
use crate::domains::DomainSet;
use crate::error::{CaError, ObtainFailures};
use crate::key::PrivateKey;

pub use acme::{AcmeConnector, AcmeCa};
pub use challenge::WebrootSolver;
pub use state::{AccountRegistration, AcmeState, IssuanceRecord};

/// Contact email plus the key the CA account is bound to
#[derive(Debug, Clone)]
pub struct AccountIdentity {
    pub email: String,
    pub key: PrivateKey,
}

impl AccountIdentity {
    pub fn new(email: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            email: email.into(),
            key,
        }
    }
}

/// A connected certificate authority
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Issue a certificate for `domains`, signed over `key`
    ///
    /// Either the whole bundle or a non-empty per-domain failure map; never a
    /// partial bundle.
    async fn obtain_certificate(
        &self,
        domains: &DomainSet,
        key: &PrivateKey,
    ) -> Result<CertificateBundle, ObtainFailures>;

    /// Issue a replacement for `cert`, keeping its domain set and `key`
    async fn renew(&self, cert: &Certificate, key: &PrivateKey)
        -> Result<CertificateBundle, CaError>;

    /// Revoke `cert`
    async fn revoke(&self, cert: &Certificate, key: &PrivateKey) -> Result<(), CaError>;
}

/// Binds an account identity to a connected CA client
#[async_trait]
pub trait CaConnector: Send + Sync {
    async fn connect(
        &self,
        identity: &AccountIdentity,
    ) -> Result<Arc<dyn CertificateAuthority>, CaError>;
}
