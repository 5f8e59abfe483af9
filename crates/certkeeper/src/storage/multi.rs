//! Certificate store fanning out to mirror outputs

use tracing::{debug, warn};

use super::CertStore;
use crate::cert::CertificateBundle;
use crate::error::StorageError;

/// Primary certificate store plus ordered mirrors
///
/// Reads only consult the primary. Saves go to the primary first and then to
/// each mirror in order; the first mirror failure stops the fan-out and is
/// returned as [`StorageError::Mirror`]. Earlier writes are kept.
pub struct MultiOutputCertStore {
    primary: Box<dyn CertStore>,
    mirrors: Vec<Box<dyn CertStore>>,
}

impl MultiOutputCertStore {
    pub fn new(primary: Box<dyn CertStore>) -> Self {
        Self {
            primary,
            mirrors: Vec::new(),
        }
    }

    pub fn with_mirror(mut self, mirror: Box<dyn CertStore>) -> Self {
        self.mirrors.push(mirror);
        self
    }

    pub fn mirror_count(&self) -> usize {
        self.mirrors.len()
    }
}

impl CertStore for MultiOutputCertStore {
    fn certs_exist(&self) -> bool {
        self.primary.certs_exist()
    }

    fn load_certs(&self) -> Result<CertificateBundle, StorageError> {
        self.primary.load_certs()
    }

    fn save_certs(&self, bundle: &CertificateBundle) -> Result<(), StorageError> {
        self.primary.save_certs(bundle)?;

        for (index, mirror) in self.mirrors.iter().enumerate() {
            if let Err(e) = mirror.save_certs(bundle) {
                warn!(mirror = index, error = %e, "Failed to write certificate mirror");
                return Err(StorageError::Mirror {
                    index,
                    source: Box::new(e),
                });
            }
            debug!(mirror = index, "Wrote certificate mirror");
        }

        Ok(())
    }
}

impl std::fmt::Debug for MultiOutputCertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiOutputCertStore")
            .field("mirrors", &self.mirrors.len())
            .finish()
    }
}
