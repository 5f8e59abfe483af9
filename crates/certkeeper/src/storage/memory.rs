//! In-memory key and certificate store

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{CertStore, KeyStore};
use crate::cert::CertificateBundle;
use crate::error::StorageError;
use crate::key::PrivateKey;

#[derive(Debug, Default)]
struct Inner {
    key: Option<PrivateKey>,
    bundle: Option<CertificateBundle>,
    fail_saves: Option<String>,
    key_saves: usize,
    cert_saves: usize,
}

/// Store that keeps everything in process memory
///
/// Clones share state, so a test can keep a handle to a store it has moved
/// into an orchestrator.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: PrivateKey) -> Self {
        let store = Self::new();
        store.inner.lock().key = Some(key);
        store
    }

    pub fn with_bundle(bundle: CertificateBundle) -> Self {
        let store = Self::new();
        store.inner.lock().bundle = Some(bundle);
        store
    }

    /// Make every following save fail with `reason`, or succeed again on `None`
    pub fn fail_saves(&self, reason: Option<&str>) {
        self.inner.lock().fail_saves = reason.map(str::to_string);
    }

    pub fn key(&self) -> Option<PrivateKey> {
        self.inner.lock().key.clone()
    }

    pub fn bundle(&self) -> Option<CertificateBundle> {
        self.inner.lock().bundle.clone()
    }

    /// Successful key saves so far
    pub fn key_saves(&self) -> usize {
        self.inner.lock().key_saves
    }

    /// Successful certificate saves so far
    pub fn cert_saves(&self) -> usize {
        self.inner.lock().cert_saves
    }

    fn not_found(what: &str) -> StorageError {
        StorageError::NotFound {
            path: PathBuf::from(format!("memory:{}", what)),
        }
    }
}

impl KeyStore for MemoryStore {
    fn key_exists(&self) -> bool {
        self.inner.lock().key.is_some()
    }

    fn load_key(&self) -> Result<PrivateKey, StorageError> {
        self.inner
            .lock()
            .key
            .clone()
            .ok_or_else(|| Self::not_found("key"))
    }

    fn save_key(&self, key: &PrivateKey) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if let Some(ref reason) = inner.fail_saves {
            return Err(StorageError::Unavailable(reason.clone()));
        }
        inner.key = Some(key.clone());
        inner.key_saves += 1;
        Ok(())
    }
}

impl CertStore for MemoryStore {
    fn certs_exist(&self) -> bool {
        self.inner.lock().bundle.is_some()
    }

    fn load_certs(&self) -> Result<CertificateBundle, StorageError> {
        self.inner
            .lock()
            .bundle
            .clone()
            .ok_or_else(|| Self::not_found("certificates"))
    }

    fn save_certs(&self, bundle: &CertificateBundle) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if let Some(ref reason) = inner.fail_saves {
            return Err(StorageError::Unavailable(reason.clone()));
        }
        inner.bundle = Some(bundle.clone());
        inner.cert_saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyAlgorithm;
    use crate::test_support::{issue_cert, CertSpec};

    #[test]
    fn test_clones_share_state() {
        let store = MemoryStore::new();
        let handle = store.clone();
        assert!(!handle.key_exists());
        assert!(handle.load_key().unwrap_err().is_not_found());

        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        store.save_key(&key).unwrap();

        assert_eq!(handle.load_key().unwrap(), key);
        assert_eq!(handle.key_saves(), 1);
    }

    #[test]
    fn test_injected_failure() {
        let store = MemoryStore::new();
        store.fail_saves(Some("disk full"));

        let bundle = CertificateBundle::new(vec![issue_cert(CertSpec::valid_for_days(10))]).unwrap();
        assert!(matches!(
            store.save_certs(&bundle),
            Err(StorageError::Unavailable(reason)) if reason == "disk full"
        ));
        assert!(!store.certs_exist());

        store.fail_saves(None);
        store.save_certs(&bundle).unwrap();
        assert_eq!(store.bundle(), Some(bundle));
        assert_eq!(store.cert_saves(), 1);
    }
}
