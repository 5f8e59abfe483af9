//! Advertising certificate availability to a service registry

mod consul;

pub use consul::{ConsulNotifier, DEFAULT_CHECK_TTL, DEFAULT_SERVICE_NAME};

use async_trait::async_trait;

use crate::cert::Certificate;
use crate::error::NotifierError;

/// Receives lifecycle events for a certificate
///
/// Failures are reported back to the caller, which records them without
/// failing the lifecycle run.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// `leaf` is stored and valid
    async fn notify_certs_available(&self, leaf: &Certificate) -> Result<(), NotifierError>;

    /// `leaf` is about to be replaced or is no longer usable
    async fn notify_certs_unavailable(&self, leaf: &Certificate) -> Result<(), NotifierError>;

    /// `leaf` replaced a previous certificate
    async fn notify_certs_renewed(&self, leaf: &Certificate) -> Result<(), NotifierError>;

    /// Remove every registration of `leaf`
    async fn deregister(&self, leaf: &Certificate) -> Result<(), NotifierError>;
}

/// Notifier used when no registry is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify_certs_available(&self, _leaf: &Certificate) -> Result<(), NotifierError> {
        Ok(())
    }

    async fn notify_certs_unavailable(&self, _leaf: &Certificate) -> Result<(), NotifierError> {
        Ok(())
    }

    async fn notify_certs_renewed(&self, _leaf: &Certificate) -> Result<(), NotifierError> {
        Ok(())
    }

    async fn deregister(&self, _leaf: &Certificate) -> Result<(), NotifierError> {
        Ok(())
    }
}
