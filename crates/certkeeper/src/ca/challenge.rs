//! HTTP-01 challenge responses served from a webroot
//!
//! The key authorization for each pending token is written to
//! `<webroot>/.well-known/acme-challenge/<token>` so that whatever web server
//! already serves the domain answers the CA's validation request.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::CaError;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Writes and cleans up challenge response files
///
/// Clones share the set of pending tokens.
#[derive(Debug, Clone)]
pub struct WebrootSolver {
    webroot: PathBuf,
    pending: Arc<Mutex<Vec<String>>>,
}

impl WebrootSolver {
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        Self {
            webroot: webroot.into(),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn webroot(&self) -> &Path {
        &self.webroot
    }

    fn challenge_dir(&self) -> PathBuf {
        self.webroot.join(".well-known").join("acme-challenge")
    }

    /// File serving `token`, `None` for tokens that would escape the directory
    pub fn token_path(&self, token: &str) -> Option<PathBuf> {
        let valid = !token.is_empty()
            && token
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| self.challenge_dir().join(token))
    }

    /// Publish the key authorization for `token`
    pub async fn add_challenge(&self, token: &str, key_authorization: &str) -> Result<(), CaError> {
        let path = self.token_path(token).ok_or_else(|| {
            CaError::Protocol(format!("CA sent an unusable challenge token '{}'", token))
        })?;

        let dir = self.challenge_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CaError::io(&dir, e))?;
        tokio::fs::write(&path, key_authorization)
            .await
            .map_err(|e| CaError::io(&path, e))?;

        self.pending.lock().push(token.to_string());
        debug!(
            token = %token,
            path = %path.display(),
            url_path = %format!("{}{}", ACME_CHALLENGE_PREFIX, token),
            "Published HTTP-01 challenge response"
        );
        Ok(())
    }

    /// Remove the response file for `token`
    pub async fn remove_challenge(&self, token: &str) {
        self.pending.lock().retain(|t| t != token);
        let Some(path) = self.token_path(token) else {
            return;
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => trace!(token = %token, "Removed HTTP-01 challenge response"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                token = %token,
                path = %path.display(),
                error = %e,
                "Failed to remove HTTP-01 challenge response"
            ),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Remove every response file published through this solver
    pub async fn clear(&self) {
        let tokens: Vec<String> = std::mem::take(&mut *self.pending.lock());
        let count = tokens.len();
        for token in tokens {
            self.remove_challenge(&token).await;
        }
        if count > 0 {
            debug!(cleared = count, "Cleared pending HTTP-01 challenges");
        }
    }
}
