//! Configuration for certkeeper
//!
//! Configuration is either assembled from command line flags (one certificate)
//! or loaded from a TOML file that can describe several certificates sharing a
//! single ACME account.
//!
//! # Example
//!
//! ```toml
//! [acme]
//! email = "admin@example.com"
//! account-key-dir = "/var/lib/certkeeper/account"
//! webroot = "/var/www/acme"
//! key-algorithm = "ecdsa-p256"
//!
//! [registry]
//! address = "127.0.0.1:8500"
//! service-name = "tls-certs"
//!
//! [schedule]
//! interval-hours = 12
//!
//! [[certificate]]
//! domains = ["example.com", "www.example.com"]
//! key-dir = "/etc/ssl/example"
//! key-name = "example.key"
//! cert-dir = "/etc/ssl/example"
//! cert-base-name = "example"
//! renew-before-days = 30
//!
//! [[certificate.mirrors]]
//! dir = "/srv/nginx/certs"
//! layout = "split"
//! ```

mod domain;
mod types;

pub use domain::validate_domain_name;
pub use types::{CertLayout, KeyAlgorithm};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};
use validator::{Validate, ValidationErrors};

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid domain name '{name}': {reason}")]
    InvalidDomain { name: String, reason: &'static str },

    #[error("no certificates configured")]
    NoCertificates,

    #[error("{what} {} is shared by '{first}' and '{second}'", .path.display())]
    SharedPath {
        what: &'static str,
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("unknown {kind} '{value}'")]
    UnknownVariant { kind: &'static str, value: String },
}

impl From<ValidationErrors> for ConfigError {
    fn from(errors: ValidationErrors) -> Self {
        ConfigError::Invalid(errors.to_string())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// ACME account and CA settings shared by every certificate
    pub acme: AcmeConfig,

    /// Service registry; availability is not advertised when absent
    #[serde(default)]
    pub registry: Option<RegistryConfig>,

    /// Run-once vs. periodic operation
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Managed certificates, one per domain set
    #[serde(default, rename = "certificate")]
    pub certificates: Vec<CertificateConfig>,
}

/// ACME account and CA settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct AcmeConfig {
    /// Contact email of the ACME account
    #[validate(email)]
    pub email: String,

    /// ACME directory URL
    #[serde(default = "default_directory_url")]
    #[validate(url)]
    pub directory_url: String,

    /// Use the Let's Encrypt staging directory instead of `directory_url`
    #[serde(default)]
    pub staging: bool,

    /// Base directory for account registration state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory holding the account private key
    pub account_key_dir: PathBuf,

    /// Webroot served at `/.well-known/acme-challenge/` for HTTP-01
    pub webroot: PathBuf,

    /// Algorithm for newly generated keys
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,

    /// Upper bound for a single ACME order to become valid
    #[serde(default = "default_order_timeout_secs")]
    #[validate(range(min = 10, max = 3600))]
    pub order_timeout_secs: u64,
}

impl AcmeConfig {
    /// Directory URL actually used, honoring the `staging` switch
    pub fn effective_directory_url(&self) -> &str {
        if self.staging {
            LETS_ENCRYPT_STAGING
        } else {
            &self.directory_url
        }
    }
}

/// Consul registry settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Consul agent address, e.g. `127.0.0.1:8500` or `http://consul:8500`
    #[validate(length(min = 1))]
    pub address: String,

    /// Service name certificates are registered under
    #[serde(default = "default_service_name")]
    #[validate(length(min = 1))]
    pub service_name: String,

    /// TTL of the health check attached to each certificate
    #[serde(default = "default_check_ttl_secs")]
    #[validate(range(min = 60))]
    pub check_ttl_secs: u64,
}

/// Scheduling settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduleConfig {
    /// Run a single pass and exit
    #[serde(default)]
    pub once: bool,

    /// Hours between passes when running continuously
    #[serde(default = "default_interval_hours")]
    #[validate(range(min = 1, max = 720))]
    pub interval_hours: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            once: false,
            interval_hours: default_interval_hours(),
        }
    }
}

/// One managed certificate (domain set)
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "kebab-case")]
pub struct CertificateConfig {
    /// Label used in logs; defaults to the first domain
    #[serde(default)]
    pub name: Option<String>,

    /// Subject names, first one is the primary name
    #[validate(length(min = 1))]
    pub domains: Vec<String>,

    /// Directory holding the domain private key
    pub key_dir: PathBuf,

    /// File name of the domain private key inside `key-dir`
    #[serde(default = "default_key_name")]
    pub key_name: String,

    /// Directory holding the certificate bundle
    pub cert_dir: PathBuf,

    /// Certificate file base name: `<base>.crt`, or `<base><N>.crt` when split
    #[serde(default = "default_cert_base_name")]
    pub cert_base_name: String,

    /// On-disk layout of the certificate bundle
    #[serde(default)]
    pub layout: CertLayout,

    /// Additional directories that receive a copy of every saved bundle
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,

    /// Renew when fewer than this many days of validity remain
    #[serde(default = "default_renew_before_days")]
    #[validate(range(min = 1, max = 365))]
    pub renew_before_days: u32,

    /// Overrides the account-wide key algorithm for the domain key
    #[serde(default)]
    pub key_algorithm: Option<KeyAlgorithm>,
}

impl CertificateConfig {
    /// Name used in logs
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or_else(|| self.domains.first().map(String::as_str))
            .unwrap_or("<unnamed>")
    }
}

/// A mirror output for certificate bundles
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MirrorConfig {
    pub dir: PathBuf,
    #[serde(default)]
    pub layout: CertLayout,
}

fn default_directory_url() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./.letsencrypt")
}

fn default_order_timeout_secs() -> u64 {
    300
}

fn default_service_name() -> String {
    "tls-certs".to_string()
}

fn default_check_ttl_secs() -> u64 {
    // 5 days
    432_000
}

fn default_interval_hours() -> u64 {
    24
}

fn default_renew_before_days() -> u32 {
    30
}

/// Default file name of a private key
pub const DEFAULT_KEY_NAME: &str = "private.key";

/// Default base name of certificate files
pub const DEFAULT_CERT_BASE_NAME: &str = "server";

fn default_key_name() -> String {
    DEFAULT_KEY_NAME.to_string()
}

fn default_cert_base_name() -> String {
    DEFAULT_CERT_BASE_NAME.to_string()
}

/// A bare file name: non-empty, no separators, not `.` or `..`
fn validate_file_name(what: &str, name: &str) -> Result<(), ConfigError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ConfigError::Invalid(format!(
            "{} '{}' must be a plain file name",
            what, name
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        trace!(path = %path.display(), "Reading configuration file");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(
            path = %path.display(),
            certificates = config.certificates.len(),
            registry = config.registry.is_some(),
            "Loaded configuration file"
        );

        Ok(config)
    }

    /// Validate the whole configuration
    ///
    /// Besides field-level checks this rejects certificates that would share a
    /// key or certificate directory, since every domain set must own its files
    /// exclusively.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.acme.validate()?;
        self.schedule.validate()?;
        if let Some(ref registry) = self.registry {
            registry.validate()?;
        }

        if self.certificates.is_empty() {
            return Err(ConfigError::NoCertificates);
        }

        // the account key must never double as a domain key
        let mut key_dirs: HashMap<&Path, &str> = HashMap::new();
        key_dirs.insert(&self.acme.account_key_dir, "ACME account");
        let mut cert_dirs: HashMap<&Path, &str> = HashMap::new();

        for cert in &self.certificates {
            cert.validate()?;
            for domain in &cert.domains {
                validate_domain_name(domain)?;
                if domain.starts_with("*.") {
                    return Err(ConfigError::InvalidDomain {
                        name: domain.clone(),
                        reason: "wildcard names need DNS-01, only HTTP-01 is supported",
                    });
                }
            }
            validate_file_name("key name", &cert.key_name)?;
            validate_file_name("certificate base name", &cert.cert_base_name)?;

            let name = cert.display_name();
            if let Some(first) = key_dirs.insert(&cert.key_dir, name) {
                return Err(ConfigError::SharedPath {
                    what: "key directory",
                    path: cert.key_dir.clone(),
                    first: first.to_string(),
                    second: name.to_string(),
                });
            }
            let outputs = std::iter::once(&cert.cert_dir).chain(cert.mirrors.iter().map(|m| &m.dir));
            for dir in outputs {
                if let Some(first) = cert_dirs.insert(dir, name) {
                    return Err(ConfigError::SharedPath {
                        what: "certificate directory",
                        path: dir.clone(),
                        first: first.to_string(),
                        second: name.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }
}
