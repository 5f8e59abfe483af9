//! ACME certificate lifecycle management
//!
//! Keeps TLS certificates for one or more domain sets present on disk, renews
//! them before they expire and advertises their availability to Consul.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │  RenewalScheduler  │  once / every N hours, signals
//! └─────────┬──────────┘
//!           │ one per domain set
//! ┌─────────▼──────────┐     ┌──────────────┐
//! │    Orchestrator    │────►│ CaConnector  │──► CertificateAuthority (ACME)
//! └──┬──────┬───────┬──┘     └──────────────┘
//!    │      │       │
//!    │      │       └──► Notifier (Consul / none)
//!    │      └──► ValidityChecker
//!    └──► KeyStore / CertStore (files, memory, mirrors)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let mut orchestrator = Orchestrator::builder()
//!     .email("admin@example.com")
//!     .domains(DomainSet::parse_list("example.com,www.example.com")?)
//!     .account_key_store(Box::new(FileStore::new("/etc/ssl/account", CertLayout::Concat)))
//!     .domain_key_store(Box::new(FileStore::new("/etc/ssl/example", CertLayout::Concat)))
//!     .cert_store(Box::new(FileStore::new("/etc/ssl/example", CertLayout::Concat)))
//!     .connector(Arc::new(AcmeConnector::new(LETS_ENCRYPT_STAGING, "./.letsencrypt", "/var/www")))
//!     .build()?;
//!
//! let report = orchestrator.run().await?;
//! ```

pub mod ca;
pub mod cert;
pub mod checker;
pub mod domains;
pub mod error;
pub mod key;
pub mod orchestrator;
pub mod pem;
pub mod registry;
pub mod scheduler;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_support;

pub use ca::{AccountIdentity, AcmeConnector, CaConnector, CertificateAuthority};
pub use cert::{Certificate, CertificateBundle};
pub use checker::{is_valid_at, TimeExpirationChecker, ValidityChecker, ValidityPolicy};
pub use domains::DomainSet;
pub use error::{
    CaError, CheckError, ErrorKind, LifecycleError, NotifierError, ObtainFailures, PemError,
    StorageError,
};
pub use key::{KeyAlgorithm, KeyKind, PrivateKey};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunAction, RunReport};
pub use registry::{ConsulNotifier, NoopNotifier, Notifier};
pub use scheduler::{RenewalScheduler, ScheduleMode, SchedulerError};
pub use storage::{CertStore, FileStore, KeyStore, MemoryStore, MultiOutputCertStore};

pub use certkeeper_config::{CertLayout, LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
