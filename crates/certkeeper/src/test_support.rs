//! Certificate fixtures for unit tests

use rcgen::{CertificateParams, KeyPair};
use time::{Duration, OffsetDateTime};

use crate::cert::Certificate;

pub(crate) struct CertSpec {
    names: Vec<String>,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
}

impl CertSpec {
    /// Issued a day ago, expiring `days` from now
    pub(crate) fn valid_for_days(days: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            names: vec!["example.com".to_string()],
            not_before: now - Duration::days(1),
            not_after: now + Duration::days(days),
        }
    }

    /// Expired `days` ago
    pub(crate) fn expired_days_ago(days: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            names: vec!["example.com".to_string()],
            not_before: now - Duration::days(days + 90),
            not_after: now - Duration::days(days),
        }
    }

    /// Not valid until `days` from now
    pub(crate) fn not_yet_valid(days: i64) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            names: vec!["example.com".to_string()],
            not_before: now + Duration::days(days),
            not_after: now + Duration::days(days + 90),
        }
    }

    pub(crate) fn names(mut self, names: &[&str]) -> Self {
        self.names = names.iter().map(|n| n.to_string()).collect();
        self
    }
}

pub(crate) fn issue_cert(spec: CertSpec) -> Certificate {
    let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params = CertificateParams::new(spec.names).unwrap();
    params.not_before = spec.not_before;
    params.not_after = spec.not_after;
    let cert = params.self_signed(&key_pair).unwrap();
    Certificate::from_der(cert.der().to_vec()).unwrap()
}
