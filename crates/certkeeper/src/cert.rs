//! X.509 certificates and certificate bundles

use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use crate::error::PemError;

/// A parsed X.509 certificate
///
/// Keeps the DER encoding plus the handful of fields the lifecycle needs.
/// Equality compares the DER bytes.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    common_name: Option<String>,
    dns_names: Vec<String>,
    fingerprint: String,
}

impl Certificate {
    /// Parse a DER encoded certificate
    pub fn from_der(der: Vec<u8>) -> Result<Self, PemError> {
        let (not_before, not_after, common_name, dns_names) = {
            let (rest, cert) = parse_x509_certificate(&der)
                .map_err(|e| PemError::InvalidCertificate(e.to_string()))?;
            if !rest.is_empty() {
                return Err(PemError::InvalidCertificate(format!(
                    "{} trailing bytes after certificate",
                    rest.len()
                )));
            }

            let validity = cert.validity();
            let not_before = timestamp(validity.not_before.timestamp())?;
            let not_after = timestamp(validity.not_after.timestamp())?;

            let common_name = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string);

            let dns_names = match cert.subject_alternative_name() {
                Ok(Some(san)) => san
                    .value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect(),
                Ok(None) => Vec::new(),
                Err(e) => return Err(PemError::InvalidCertificate(e.to_string())),
            };

            (not_before, not_after, common_name, dns_names)
        };

        let fingerprint = hex::encode(Sha256::digest(&der));

        Ok(Self {
            der,
            not_before,
            not_after,
            common_name,
            dns_names,
            fingerprint,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// DNS names from the subject alternative name extension
    pub fn dns_names(&self) -> &[String] {
        &self.dns_names
    }

    /// SHA-256 over the DER encoding, hex encoded
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Names this certificate was issued for
    ///
    /// The SAN DNS names, or the common name for certificates without SANs.
    pub fn subject_names(&self) -> Vec<String> {
        if !self.dns_names.is_empty() {
            return self.dns_names.clone();
        }
        self.common_name.iter().cloned().collect()
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, PemError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PemError::InvalidCertificate(format!("timestamp {} out of range", secs)))
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name)
            .field("dns_names", &self.dns_names)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// Leaf certificate followed by its issuer chain
///
/// Never empty; index 0 is always the leaf, the chain keeps the order the CA
/// returned it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    certs: Vec<Certificate>,
}

impl CertificateBundle {
    pub fn new(certs: Vec<Certificate>) -> Result<Self, PemError> {
        if certs.is_empty() {
            return Err(PemError::NoCertificates);
        }
        Ok(Self { certs })
    }

    pub fn from_parts(leaf: Certificate, chain: Vec<Certificate>) -> Self {
        let mut certs = Vec::with_capacity(chain.len() + 1);
        certs.push(leaf);
        certs.extend(chain);
        Self { certs }
    }

    /// Decode a PEM stream, leaf first
    pub fn from_pem(data: impl AsRef<[u8]>) -> Result<Self, PemError> {
        Self::new(crate::pem::decode_certificates(data)?)
    }

    pub fn leaf(&self) -> &Certificate {
        &self.certs[0]
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.certs[1..]
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certs
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Always false, a bundle holds at least the leaf
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Concatenated PEM stream, leaf first
    pub fn to_pem(&self) -> String {
        crate::pem::encode_certificates(&self.certs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{issue_cert, CertSpec};
    use chrono::Duration;

    #[test]
    fn test_parses_fields() {
        let cert = issue_cert(CertSpec::valid_for_days(60).names(&["a.example.com", "b.example.com"]));

        assert_eq!(cert.dns_names(), ["a.example.com", "b.example.com"]);
        assert_eq!(cert.subject_names(), ["a.example.com", "b.example.com"]);
        assert!(cert.not_after() > Utc::now() + Duration::days(59));
        assert!(cert.not_before() < Utc::now());
        assert_eq!(cert.fingerprint().len(), 64);
    }

    #[test]
    fn test_rejects_garbage_der() {
        assert!(matches!(
            Certificate::from_der(vec![0x30, 0x03, 0x01, 0x01, 0xff]),
            Err(PemError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_bundle_requires_leaf() {
        assert!(matches!(
            CertificateBundle::new(Vec::new()),
            Err(PemError::NoCertificates)
        ));
    }

    #[test]
    fn test_bundle_order() {
        let leaf = issue_cert(CertSpec::valid_for_days(90).names(&["leaf.example.com"]));
        let issuer = issue_cert(CertSpec::valid_for_days(900).names(&["issuer.example.com"]));

        let bundle = CertificateBundle::from_parts(leaf.clone(), vec![issuer.clone()]);
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.leaf(), &leaf);
        assert_eq!(bundle.chain(), [issuer]);

        let decoded = CertificateBundle::from_pem(bundle.to_pem()).unwrap();
        assert_eq!(decoded, bundle);
    }
}
