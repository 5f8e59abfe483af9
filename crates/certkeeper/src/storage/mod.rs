//! Key and certificate persistence
//!
//! The orchestrator only sees the [`KeyStore`] and [`CertStore`] capabilities.
//! Implementations:
//!
//! - [`FileStore`]: one directory, concatenated or split certificate layout
//! - [`MemoryStore`]: in-process store, shares state between clones
//! - [`MultiOutputCertStore`]: primary store plus ordered mirrors
//!
//! # Directory Structure
//!
//! ```text
//! key_dir/
//! └── private.key       # PKCS#8 PEM
//! cert_dir/
//! ├── server.crt        # concatenated layout: leaf then chain
//! └── server0.crt ...   # split layout: one certificate per file
//! ```

mod file;
mod memory;
mod multi;

pub use file::{FileStore, DEFAULT_CERT_BASE_NAME, DEFAULT_CERT_EXTENSION, DEFAULT_KEY_NAME};
pub use memory::MemoryStore;
pub use multi::MultiOutputCertStore;

use crate::cert::CertificateBundle;
use crate::error::StorageError;
use crate::key::PrivateKey;

/// Persistence of a single private key
pub trait KeyStore: Send + Sync {
    fn key_exists(&self) -> bool;

    fn load_key(&self) -> Result<PrivateKey, StorageError>;

    fn save_key(&self, key: &PrivateKey) -> Result<(), StorageError>;
}

/// Persistence of a single certificate bundle
pub trait CertStore: Send + Sync {
    /// Whether a bundle appears to be present
    ///
    /// A `true` answer does not guarantee that [`CertStore::load_certs`]
    /// succeeds.
    fn certs_exist(&self) -> bool;

    fn load_certs(&self) -> Result<CertificateBundle, StorageError>;

    fn save_certs(&self, bundle: &CertificateBundle) -> Result<(), StorageError>;
}

impl<T: KeyStore + ?Sized> KeyStore for Box<T> {
    fn key_exists(&self) -> bool {
        (**self).key_exists()
    }

    fn load_key(&self) -> Result<PrivateKey, StorageError> {
        (**self).load_key()
    }

    fn save_key(&self, key: &PrivateKey) -> Result<(), StorageError> {
        (**self).save_key(key)
    }
}

impl<T: CertStore + ?Sized> CertStore for Box<T> {
    fn certs_exist(&self) -> bool {
        (**self).certs_exist()
    }

    fn load_certs(&self) -> Result<CertificateBundle, StorageError> {
        (**self).load_certs()
    }

    fn save_certs(&self, bundle: &CertificateBundle) -> Result<(), StorageError> {
        (**self).save_certs(bundle)
    }
}
