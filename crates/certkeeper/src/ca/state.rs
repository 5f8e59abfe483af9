//! Persistent ACME state
//!
//! # Directory Structure
//!
//! ```text
//! state_dir/
//! └── admin@example.com/
//!     ├── account.json          # registration bound to the account key
//!     └── certificates/
//!         └── example.com.json  # issuance record per primary name
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, trace};

use crate::error::CaError;

/// Registration stored after the account was created at the CA
///
/// `credentials` holds the serialized `instant_acme::AccountCredentials`
/// verbatim; `account_key_sha256` ties the registration to the account key
/// it was created for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRegistration {
    pub contact_email: String,
    pub account_key_sha256: String,
    pub created: DateTime<Utc>,
    pub directory_url: String,
    pub credentials: serde_json::Value,
}

/// What was issued for a domain set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceRecord {
    pub domains: Vec<String>,
    pub fingerprint: String,
    pub issued: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// State directory of one ACME account
#[derive(Debug, Clone)]
pub struct AcmeState {
    dir: PathBuf,
}

impl AcmeState {
    /// State for `email` under `base`
    pub fn new(base: &Path, email: &str) -> Self {
        Self {
            dir: base.join(email),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn account_path(&self) -> PathBuf {
        self.dir.join("account.json")
    }

    pub fn record_path(&self, primary: &str) -> PathBuf {
        // `*` is not portable in file names
        let name = primary.replace('*', "_wildcard_");
        self.dir.join("certificates").join(format!("{}.json", name))
    }

    /// Load the stored registration, `None` when there is none yet
    pub fn load_registration(&self) -> Result<Option<AccountRegistration>, CaError> {
        let path = self.account_path();
        let registration: Option<AccountRegistration> = read_json(&path)?;
        if let Some(ref reg) = registration {
            debug!(
                contact = %reg.contact_email,
                created = %reg.created,
                "Loaded ACME account registration"
            );
        } else {
            trace!(path = %path.display(), "No stored ACME account registration");
        }
        Ok(registration)
    }

    pub fn save_registration(&self, registration: &AccountRegistration) -> Result<(), CaError> {
        let path = self.account_path();
        write_json(&path, registration)?;
        info!(
            contact = %registration.contact_email,
            path = %path.display(),
            "Saved ACME account registration"
        );
        Ok(())
    }

    pub fn load_record(&self, primary: &str) -> Result<Option<IssuanceRecord>, CaError> {
        read_json(&self.record_path(primary))
    }

    pub fn save_record(&self, primary: &str, record: &IssuanceRecord) -> Result<(), CaError> {
        let path = self.record_path(primary);
        write_json(&path, record)?;
        debug!(domain = %primary, path = %path.display(), "Saved issuance record");
        Ok(())
    }
}

/// Read a JSON document; a missing file is `None`, anything unreadable is fatal
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CaError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CaError::CorruptState {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| CaError::CorruptState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CaError> {
    let dir = path
        .parent()
        .ok_or_else(|| CaError::Io {
            path: path.to_path_buf(),
            reason: "path has no parent directory".to_string(),
        })?;

    if !dir.is_dir() {
        fs::create_dir_all(dir).map_err(|e| CaError::io(dir, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| CaError::io(dir, e))?;
        }
    }

    let content = serde_json::to_string_pretty(value).map_err(|e| CaError::Io {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| CaError::io(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| CaError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| CaError::io(path, e))?;
    }

    file.persist(path)
        .map(|_| ())
        .map_err(|e| CaError::io(path, e.error))
}
