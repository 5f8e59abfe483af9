//! Filesystem backed key and certificate store

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, trace, warn};

use super::{CertStore, KeyStore};
use crate::cert::CertificateBundle;
use crate::error::StorageError;
use crate::key::PrivateKey;
use crate::pem;

pub use certkeeper_config::{CertLayout, DEFAULT_CERT_BASE_NAME, DEFAULT_KEY_NAME};

pub const DEFAULT_CERT_EXTENSION: &str = "crt";

/// Key and certificate files in one directory
///
/// Writes go through a temporary file in the target directory that is then
/// renamed over the destination, so readers never observe a half written
/// file. Directories are created with mode 0700 and files with 0600 on Unix.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    layout: CertLayout,
    key_name: String,
    cert_base_name: String,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, layout: CertLayout) -> Self {
        Self {
            dir: dir.into(),
            layout,
            key_name: DEFAULT_KEY_NAME.to_string(),
            cert_base_name: DEFAULT_CERT_BASE_NAME.to_string(),
        }
    }

    /// Store used only for a private key
    pub fn for_keys(dir: impl Into<PathBuf>) -> Self {
        Self::new(dir, CertLayout::Concat)
    }

    pub fn with_key_name(mut self, name: impl Into<String>) -> Self {
        self.key_name = name.into();
        self
    }

    pub fn with_cert_base_name(mut self, name: impl Into<String>) -> Self {
        self.cert_base_name = name.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> CertLayout {
        self.layout
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(&self.key_name)
    }

    /// Path of the concatenated bundle
    pub fn bundle_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.{}", self.cert_base_name, DEFAULT_CERT_EXTENSION))
    }

    /// Path of the split layout member at `index`
    pub fn member_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!(
            "{}{}.{}",
            self.cert_base_name, index, DEFAULT_CERT_EXTENSION
        ))
    }

    /// Existing split members, by index
    fn split_members(&self) -> Vec<(usize, PathBuf)> {
        let pattern = format!(
            "{}/{}*.{}",
            glob::Pattern::escape(&self.dir.to_string_lossy()),
            glob::Pattern::escape(&self.cert_base_name),
            DEFAULT_CERT_EXTENSION
        );

        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid certificate glob pattern");
                return Vec::new();
            }
        };

        let suffix = format!(".{}", DEFAULT_CERT_EXTENSION);
        let mut members: Vec<(usize, PathBuf)> = paths
            .filter_map(Result::ok)
            .filter_map(|path| {
                let index = path
                    .file_name()?
                    .to_str()?
                    .strip_prefix(self.cert_base_name.as_str())?
                    .strip_suffix(suffix.as_str())?
                    .parse::<usize>()
                    .ok()?;
                Some((index, path))
            })
            .collect();
        members.sort_by_key(|(index, _)| *index);
        members
    }

    fn ensure_dir(&self) -> Result<(), StorageError> {
        if self.dir.is_dir() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| StorageError::io(&self.dir, e))?;
        }

        debug!(path = %self.dir.display(), "Created storage directory");
        Ok(())
    }

    /// Write `content` into a temporary file next to `path`
    fn stage(&self, path: &Path, content: &str) -> Result<NamedTempFile, StorageError> {
        let mut file = NamedTempFile::new_in(&self.dir).map_err(|e| StorageError::io(path, e))?;
        file.write_all(content.as_bytes())
            .and_then(|_| file.as_file().sync_all())
            .map_err(|e| StorageError::io(path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))
                .map_err(|e| StorageError::io(path, e))?;
        }

        Ok(file)
    }

    fn commit(file: NamedTempFile, path: &Path) -> Result<(), StorageError> {
        file.persist(path)
            .map(|_| ())
            .map_err(|e| StorageError::io(path, e.error))
    }

    fn read(path: &Path) -> Result<String, StorageError> {
        fs::read_to_string(path).map_err(|e| StorageError::io(path, e))
    }

    fn save_concat(&self, bundle: &CertificateBundle) -> Result<(), StorageError> {
        let path = self.bundle_path();
        let staged = self.stage(&path, &bundle.to_pem())?;
        Self::commit(staged, &path)?;

        info!(
            path = %path.display(),
            certificates = bundle.len(),
            "Saved certificate bundle"
        );
        Ok(())
    }

    fn save_split(&self, bundle: &CertificateBundle) -> Result<(), StorageError> {
        let mut staged = Vec::with_capacity(bundle.len());
        for (index, cert) in bundle.certificates().iter().enumerate() {
            let path = self.member_path(index);
            staged.push((self.stage(&path, &pem::encode_certificate(cert))?, path));
        }

        for (file, path) in staged {
            Self::commit(file, &path)?;
        }

        for (index, path) in self.split_members() {
            if index < bundle.len() {
                continue;
            }
            fs::remove_file(&path).map_err(|e| StorageError::io(&path, e))?;
            debug!(path = %path.display(), "Removed stale chain member");
        }

        info!(
            dir = %self.dir.display(),
            certificates = bundle.len(),
            "Saved split certificate bundle"
        );
        Ok(())
    }

    fn load_concat(&self) -> Result<CertificateBundle, StorageError> {
        let path = self.bundle_path();
        let content = Self::read(&path)?;
        CertificateBundle::from_pem(content).map_err(|source| StorageError::Decode { path, source })
    }

    fn load_split(&self) -> Result<CertificateBundle, StorageError> {
        let mut certs = Vec::new();
        loop {
            let path = self.member_path(certs.len());
            let content = match Self::read(&path) {
                Ok(content) => content,
                Err(e) if e.is_not_found() && !certs.is_empty() => {
                    // members past a gap mean the chain on disk is broken
                    if self.split_members().iter().any(|(index, _)| *index > certs.len()) {
                        warn!(path = %path.display(), "Split certificate chain has a gap");
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            };
            let decoded = pem::decode_certificates(content)
                .map_err(|source| StorageError::Decode { path, source })?;
            certs.extend(decoded);
        }

        trace!(dir = %self.dir.display(), certificates = certs.len(), "Loaded split bundle");
        CertificateBundle::new(certs).map_err(|source| StorageError::Decode {
            path: self.member_path(0),
            source,
        })
    }
}

impl KeyStore for FileStore {
    fn key_exists(&self) -> bool {
        self.key_path().is_file()
    }

    fn load_key(&self) -> Result<PrivateKey, StorageError> {
        let path = self.key_path();
        let content = Self::read(&path)?;
        let key = pem::decode_private_key(content)
            .map_err(|source| StorageError::Decode { path: path.clone(), source })?;
        debug!(path = %path.display(), kind = ?key.kind(), "Loaded private key");
        Ok(key)
    }

    fn save_key(&self, key: &PrivateKey) -> Result<(), StorageError> {
        self.ensure_dir()?;
        let path = self.key_path();
        let staged = self.stage(&path, &pem::encode_private_key(key))?;
        Self::commit(staged, &path)?;
        info!(path = %path.display(), kind = ?key.kind(), "Saved private key");
        Ok(())
    }
}

impl CertStore for FileStore {
    fn certs_exist(&self) -> bool {
        match self.layout {
            CertLayout::Concat => self.bundle_path().is_file(),
            CertLayout::Split => !self.split_members().is_empty(),
        }
    }

    fn load_certs(&self) -> Result<CertificateBundle, StorageError> {
        match self.layout {
            CertLayout::Concat => self.load_concat(),
            CertLayout::Split => self.load_split(),
        }
    }

    fn save_certs(&self, bundle: &CertificateBundle) -> Result<(), StorageError> {
        self.ensure_dir()?;
        match self.layout {
            CertLayout::Concat => self.save_concat(bundle),
            CertLayout::Split => self.save_split(bundle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyAlgorithm;
    use crate::test_support::{issue_cert, CertSpec};
    use tempfile::TempDir;

    fn bundle(len: usize) -> CertificateBundle {
        let certs = (0..len)
            .map(|i| issue_cert(CertSpec::valid_for_days(30).names(&[&format!("c{}.example.com", i)])))
            .collect();
        CertificateBundle::new(certs).unwrap()
    }

    #[test]
    fn test_key_round_trip_creates_dir() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path().join("keys/nested"), CertLayout::Concat);
        assert!(!store.key_exists());
        assert!(store.load_key().unwrap_err().is_not_found());

        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        store.save_key(&key).unwrap();

        assert!(store.key_exists());
        assert!(store.key_path().ends_with("private.key"));
        assert_eq!(store.load_key().unwrap(), key);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(store.key_path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let mode = fs::metadata(store.dir()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_custom_names() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path(), CertLayout::Concat)
            .with_key_name("domain.key")
            .with_cert_base_name("fullchain");

        store.save_certs(&bundle(1)).unwrap();
        assert!(temp.path().join("fullchain.crt").is_file());
        assert_eq!(store.key_path(), temp.path().join("domain.key"));
    }

    #[test]
    fn test_concat_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path(), CertLayout::Concat);
        assert!(!store.certs_exist());

        let original = bundle(3);
        store.save_certs(&original).unwrap();

        assert!(store.certs_exist());
        assert!(temp.path().join("server.crt").is_file());
        assert_eq!(store.load_certs().unwrap(), original);
    }

    #[test]
    fn test_concat_empty_file_is_decode_error() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("server.crt"), "").unwrap();
        let store = FileStore::new(temp.path(), CertLayout::Concat);

        assert!(store.certs_exist());
        assert!(matches!(
            store.load_certs(),
            Err(StorageError::Decode { .. })
        ));
    }

    #[test]
    fn test_split_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path(), CertLayout::Split);
        assert!(!store.certs_exist());
        assert!(store.load_certs().unwrap_err().is_not_found());

        let original = bundle(3);
        store.save_certs(&original).unwrap();

        for i in 0..3 {
            assert!(temp.path().join(format!("server{}.crt", i)).is_file());
        }
        assert!(store.certs_exist());
        assert_eq!(store.load_certs().unwrap(), original);
    }

    #[test]
    fn test_split_removes_stale_members() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path(), CertLayout::Split);

        store.save_certs(&bundle(4)).unwrap();
        let shorter = bundle(2);
        store.save_certs(&shorter).unwrap();

        assert!(!temp.path().join("server2.crt").exists());
        assert!(!temp.path().join("server3.crt").exists());
        assert_eq!(store.load_certs().unwrap(), shorter);
    }

    #[test]
    fn test_split_gap_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path(), CertLayout::Split);
        store.save_certs(&bundle(3)).unwrap();
        fs::remove_file(temp.path().join("server1.crt")).unwrap();

        let err = store.load_certs().unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("server1.crt"));

        // a full save repairs the chain
        let repaired = bundle(2);
        store.save_certs(&repaired).unwrap();
        assert!(!temp.path().join("server2.crt").exists());
        assert_eq!(store.load_certs().unwrap(), repaired);
    }

    #[test]
    fn test_key_store_ignores_layout() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::for_keys(temp.path());
        assert_eq!(store.layout(), CertLayout::Concat);

        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        store.save_key(&key).unwrap();
        assert_eq!(store.key_path(), temp.path().join("private.key"));
        assert_eq!(store.load_key().unwrap(), key);
    }

    #[test]
    fn test_split_exists_is_weak() {
        let temp = TempDir::new().unwrap();
        let store = FileStore::new(temp.path(), CertLayout::Split);
        fs::write(temp.path().join("server7.crt"), "junk").unwrap();

        // only server0.crt anchors a load
        assert!(store.certs_exist());
        assert!(store.load_certs().unwrap_err().is_not_found());
    }

    #[test]
    fn test_concat_ignores_split_files() {
        let temp = TempDir::new().unwrap();
        FileStore::new(temp.path(), CertLayout::Split)
            .save_certs(&bundle(1))
            .unwrap();

        let concat = FileStore::new(temp.path(), CertLayout::Concat);
        assert!(!concat.certs_exist());
    }
}
