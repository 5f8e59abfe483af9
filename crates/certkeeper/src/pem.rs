//! PEM codec for keys and certificate chains
//!
//! Stateless conversions between [`PrivateKey`] / [`Certificate`] values and
//! their textual PEM form. Keys are written as PKCS#8 `PRIVATE KEY`; legacy
//! PKCS#1 `RSA PRIVATE KEY` blocks are accepted on input.

use pem::Pem;
use tracing::trace;

use crate::cert::Certificate;
use crate::error::PemError;
use crate::key::PrivateKey;

pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";
pub const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";
pub const RSA_PRIVATE_KEY_LABEL: &str = "RSA PRIVATE KEY";

pub fn encode_certificate(cert: &Certificate) -> String {
    pem::encode(&Pem::new(CERTIFICATE_LABEL, cert.der().to_vec()))
}

/// Encode certificates as one PEM stream, preserving order
pub fn encode_certificates(certs: &[Certificate]) -> String {
    let blocks: Vec<Pem> = certs
        .iter()
        .map(|cert| Pem::new(CERTIFICATE_LABEL, cert.der().to_vec()))
        .collect();
    pem::encode_many(&blocks)
}

/// Decode every `CERTIFICATE` block of a PEM stream in encounter order
///
/// Blocks with other labels are skipped. A stream without any certificate is
/// an error.
pub fn decode_certificates(data: impl AsRef<[u8]>) -> Result<Vec<Certificate>, PemError> {
    let blocks = pem::parse_many(data)?;
    let mut certs = Vec::with_capacity(blocks.len());

    for block in blocks {
        if block.tag() != CERTIFICATE_LABEL {
            trace!(label = %block.tag(), "Skipping non-certificate PEM block");
            continue;
        }
        certs.push(Certificate::from_der(block.into_contents())?);
    }

    if certs.is_empty() {
        return Err(PemError::NoCertificates);
    }
    Ok(certs)
}

pub fn encode_private_key(key: &PrivateKey) -> String {
    pem::encode(&Pem::new(PRIVATE_KEY_LABEL, key.pkcs8_der().to_vec()))
}

/// Decode the first private key block of a PEM stream
pub fn decode_private_key(data: impl AsRef<[u8]>) -> Result<PrivateKey, PemError> {
    let blocks = pem::parse_many(data)?;
    let block = blocks
        .into_iter()
        .find(|block| block.tag().ends_with("PRIVATE KEY"))
        .ok_or(PemError::NoPrivateKey)?;

    match block.tag() {
        PRIVATE_KEY_LABEL => PrivateKey::from_pkcs8_der(block.into_contents()),
        RSA_PRIVATE_KEY_LABEL => PrivateKey::from_pkcs1_der(block.contents()),
        other => Err(PemError::UnsupportedLabel(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{KeyAlgorithm, KeyKind};
    use crate::test_support::{issue_cert, CertSpec};
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::DecodePrivateKey;

    #[test]
    fn test_key_round_trip() {
        for algorithm in [KeyAlgorithm::EcdsaP256, KeyAlgorithm::EcdsaP384, KeyAlgorithm::Rsa2048] {
            let key = PrivateKey::generate(algorithm).unwrap();
            let pem = encode_private_key(&key);
            assert!(pem.contains("BEGIN PRIVATE KEY"));

            let decoded = decode_private_key(&pem).unwrap();
            assert_eq!(decoded, key);
            assert_eq!(decoded.kind(), key.kind());
        }
    }

    #[test]
    fn test_accepts_pkcs1_rsa_key() {
        let key = PrivateKey::generate(KeyAlgorithm::Rsa2048).unwrap();
        let rsa_key = rsa::RsaPrivateKey::from_pkcs8_der(key.pkcs8_der()).unwrap();
        let pkcs1 = rsa_key.to_pkcs1_der().unwrap();
        let legacy = pem::encode(&Pem::new(RSA_PRIVATE_KEY_LABEL, pkcs1.as_bytes().to_vec()));

        let decoded = decode_private_key(legacy).unwrap();
        assert_eq!(decoded.kind(), KeyKind::Rsa { bits: 2048 });
        assert_eq!(decoded, key);
    }

    #[test]
    fn test_rejects_sec1_ec_key() {
        let blob = pem::encode(&Pem::new("EC PRIVATE KEY", vec![1, 2, 3]));
        assert!(matches!(
            decode_private_key(blob),
            Err(PemError::UnsupportedLabel(label)) if label == "EC PRIVATE KEY"
        ));
    }

    #[test]
    fn test_missing_key_block() {
        let cert = issue_cert(CertSpec::valid_for_days(30));
        assert!(matches!(
            decode_private_key(encode_certificate(&cert)),
            Err(PemError::NoPrivateKey)
        ));
    }

    #[test]
    fn test_chain_round_trip_preserves_order() {
        let certs: Vec<Certificate> = ["leaf.example.com", "int.example.com", "root.example.com"]
            .iter()
            .map(|name| issue_cert(CertSpec::valid_for_days(30).names(&[name])))
            .collect();

        let decoded = decode_certificates(encode_certificates(&certs)).unwrap();
        assert_eq!(decoded, certs);
    }

    #[test]
    fn test_decode_skips_foreign_blocks() {
        let cert = issue_cert(CertSpec::valid_for_days(30));
        let key = PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let mixed = format!("{}{}", encode_private_key(&key), encode_certificate(&cert));

        let decoded = decode_certificates(mixed).unwrap();
        assert_eq!(decoded, vec![cert]);
    }

    #[test]
    fn test_decode_empty_stream() {
        assert!(matches!(decode_certificates(""), Err(PemError::NoCertificates)));
        assert!(decode_certificates("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n").is_err());
    }
}
