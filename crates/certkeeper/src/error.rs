//! Error types for certificate lifecycle operations.
//!
//! Every component has its own error enum; [`LifecycleError`] aggregates them
//! for the orchestrator and maps each onto the closed [`ErrorKind`] taxonomy
//! the scheduler uses to decide between "retry on the next pass" and "stop".

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid settings, unusable persisted state. Never retried.
    FatalConfig,
    /// The CA refused or failed to issue for one or more domains.
    PartialCaFailure,
    /// Storage, CA or network trouble that the next pass may not see.
    TransientIo,
    /// Advertising availability failed; the certificate itself is fine.
    NotifierNonFatal,
}

impl ErrorKind {
    /// Whether the next scheduled pass should try again
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::FatalConfig)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FatalConfig => "fatal-config",
            ErrorKind::PartialCaFailure => "partial-ca-failure",
            ErrorKind::TransientIo => "transient-io",
            ErrorKind::NotifierNonFatal => "notifier-nonfatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PEM / DER codec errors
#[derive(Debug, Error)]
pub enum PemError {
    #[error("malformed PEM: {0}")]
    Malformed(#[from] pem::PemError),

    #[error("no certificate blocks found")]
    NoCertificates,

    #[error("no private key block found")]
    NoPrivateKey,

    #[error("unsupported PEM block '{0}'")]
    UnsupportedLabel(String),

    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

/// Key and certificate storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{} not found", .path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: PemError,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("mirror #{index} failed: {source}")]
    Mirror {
        index: usize,
        #[source]
        source: Box<StorageError>,
    },
}

impl StorageError {
    /// Wrap an I/O error, keeping "file does not exist" distinguishable
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            StorageError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound { .. } | StorageError::Unavailable(_) => ErrorKind::TransientIo,
            StorageError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorKind::FatalConfig
            }
            StorageError::Io { .. } => ErrorKind::TransientIo,
            StorageError::Decode { .. } => ErrorKind::FatalConfig,
            StorageError::Mirror { source, .. } => source.kind(),
        }
    }
}

/// Validity checker errors
#[derive(Debug, Error)]
pub enum CheckError {
    #[error("cannot evaluate certificate validity: {0}")]
    Evaluation(String),
}

/// Certificate authority errors
#[derive(Debug, Clone, Error)]
pub enum CaError {
    #[error("ACME request failed: {0}")]
    Protocol(String),

    #[error("challenge for {domain} failed: {reason}")]
    Challenge { domain: String, reason: String },

    #[error("order rejected by the CA: {0}")]
    OrderInvalid(String),

    #[error("timed out after {0:?} waiting for {1}")]
    Timeout(Duration, &'static str),

    #[error("CA returned unusable certificate material: {0}")]
    InvalidCertificate(String),

    #[error("CA state at {} is unusable: {reason}", .path.display())]
    CorruptState { path: PathBuf, reason: String },

    #[error("account key does not match the registration stored at {}", .path.display())]
    AccountMismatch { path: PathBuf },

    #[error("CA state I/O failed on {}: {reason}", .path.display())]
    Io { path: PathBuf, reason: String },

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("key material rejected: {0}")]
    Key(String),
}

impl CaError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        CaError::Io {
            path: path.to_path_buf(),
            reason: source.to_string(),
        }
    }

    /// Errors that no amount of retrying will fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaError::CorruptState { .. }
                | CaError::AccountMismatch { .. }
                | CaError::Unsupported(_)
                | CaError::Key(_)
        )
    }
}

/// Per-domain failures of an obtain request
///
/// Never empty when returned from a CA client.
#[derive(Debug, Clone, Default)]
pub struct ObtainFailures {
    failures: BTreeMap<String, CaError>,
}

impl ObtainFailures {
    pub fn new() -> Self {
        Self::default()
    }

    /// The same error recorded against every listed domain
    pub fn for_all<'a>(domains: impl IntoIterator<Item = &'a str>, error: CaError) -> Self {
        let mut failures = Self::new();
        for domain in domains {
            failures.insert(domain, error.clone());
        }
        failures
    }

    pub fn insert(&mut self, domain: impl Into<String>, error: CaError) {
        self.failures.insert(domain.into(), error);
    }

    pub fn get(&self, domain: &str) -> Option<&CaError> {
        self.failures.get(domain)
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CaError)> {
        self.failures.iter().map(|(d, e)| (d.as_str(), e))
    }
}

impl fmt::Display for ObtainFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "certificate could not be obtained ({} failing domain(s))",
            self.failures.len()
        )?;
        for (domain, error) in &self.failures {
            write!(f, "; {}: {}", domain, error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ObtainFailures {}

/// Registry notification errors
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("registry request {method} {url} failed: {reason}")]
    Request {
        method: &'static str,
        url: String,
        reason: String,
    },

    #[error("registry rejected {method} {url} with status {status}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
    },

    #[error("invalid registry address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
}

/// Errors returned by a lifecycle run
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to generate {role}: {reason}")]
    KeyGeneration { role: &'static str, reason: String },

    #[error("{context}: {source}")]
    Storage {
        context: &'static str,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Obtain(ObtainFailures),

    #[error("CA operation failed: {0}")]
    Ca(#[from] CaError),

    #[error("validity check failed: {0}")]
    Check(#[from] CheckError),

    #[error("registry notification failed: {0}")]
    Notifier(#[from] NotifierError),
}

impl LifecycleError {
    pub(crate) fn storage(context: &'static str, source: StorageError) -> Self {
        LifecycleError::Storage { context, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LifecycleError::Config(_)
            | LifecycleError::KeyGeneration { .. }
            | LifecycleError::Check(_) => ErrorKind::FatalConfig,
            LifecycleError::Storage { source, .. } => source.kind(),
            LifecycleError::Obtain(_) => ErrorKind::PartialCaFailure,
            LifecycleError::Ca(e) if e.is_fatal() => ErrorKind::FatalConfig,
            LifecycleError::Ca(_) => ErrorKind::TransientIo,
            LifecycleError::Notifier(_) => ErrorKind::NotifierNonFatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
