//! Private keys for ACME accounts and certificate subjects

use std::fmt;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use crate::error::PemError;

pub use certkeeper_config::KeyAlgorithm;

/// Concrete kind of a loaded key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Rsa { bits: usize },
    EcdsaP256,
    EcdsaP384,
}

/// An RSA or ECDSA private key, held as PKCS#8 DER
///
/// Used both as the domain key a certificate is issued for and as the ACME
/// account key. Equality compares the encoded key material.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey {
    kind: KeyKind,
    pkcs8: Vec<u8>,
}

impl PrivateKey {
    /// Generate a fresh key
    ///
    /// RSA generation is CPU heavy; call from a blocking context.
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self, PemError> {
        match algorithm.rsa_bits() {
            Some(bits) => {
                let key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
                    .map_err(|e| PemError::InvalidKey(e.to_string()))?;
                let der = key
                    .to_pkcs8_der()
                    .map_err(|e| PemError::InvalidKey(e.to_string()))?;
                Ok(Self {
                    kind: KeyKind::Rsa { bits },
                    pkcs8: der.as_bytes().to_vec(),
                })
            }
            None => {
                let (alg, kind) = match algorithm {
                    KeyAlgorithm::EcdsaP384 => (&rcgen::PKCS_ECDSA_P384_SHA384, KeyKind::EcdsaP384),
                    _ => (&rcgen::PKCS_ECDSA_P256_SHA256, KeyKind::EcdsaP256),
                };
                let key_pair = rcgen::KeyPair::generate_for(alg)
                    .map_err(|e| PemError::InvalidKey(e.to_string()))?;
                Ok(Self {
                    kind,
                    pkcs8: key_pair.serialize_der(),
                })
            }
        }
    }

    /// Build from PKCS#8 DER, detecting the key kind
    pub fn from_pkcs8_der(der: Vec<u8>) -> Result<Self, PemError> {
        if let Ok(rsa_key) = RsaPrivateKey::from_pkcs8_der(&der) {
            return Ok(Self {
                kind: KeyKind::Rsa {
                    bits: rsa_key.size() * 8,
                },
                pkcs8: der,
            });
        }

        let pem = pem::encode(&pem::Pem::new(crate::pem::PRIVATE_KEY_LABEL, der.clone()));
        let key_pair =
            rcgen::KeyPair::from_pem(&pem).map_err(|e| PemError::InvalidKey(e.to_string()))?;
        let kind = if key_pair.algorithm() == &rcgen::PKCS_ECDSA_P256_SHA256 {
            KeyKind::EcdsaP256
        } else if key_pair.algorithm() == &rcgen::PKCS_ECDSA_P384_SHA384 {
            KeyKind::EcdsaP384
        } else {
            return Err(PemError::InvalidKey(
                "only RSA, ECDSA P-256 and P-384 keys are supported".to_string(),
            ));
        };

        Ok(Self { kind, pkcs8: der })
    }

    /// Build from a legacy PKCS#1 `RSA PRIVATE KEY` body
    pub fn from_pkcs1_der(der: &[u8]) -> Result<Self, PemError> {
        let rsa_key =
            RsaPrivateKey::from_pkcs1_der(der).map_err(|e| PemError::InvalidKey(e.to_string()))?;
        let pkcs8 = rsa_key
            .to_pkcs8_der()
            .map_err(|e| PemError::InvalidKey(e.to_string()))?;
        Ok(Self {
            kind: KeyKind::Rsa {
                bits: rsa_key.size() * 8,
            },
            pkcs8: pkcs8.as_bytes().to_vec(),
        })
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// SHA-256 over the PKCS#8 encoding, hex encoded
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.pkcs8))
    }

    /// Key pair usable for signing a CSR
    pub fn to_key_pair(&self) -> Result<rcgen::KeyPair, PemError> {
        let pem = crate::pem::encode_private_key(self);
        let key_pair = match self.kind {
            KeyKind::Rsa { .. } => {
                rcgen::KeyPair::from_pkcs8_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)
            }
            KeyKind::EcdsaP256 | KeyKind::EcdsaP384 => rcgen::KeyPair::from_pem(&pem),
        };
        key_pair.map_err(|e| PemError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("kind", &self.kind)
            .field("pkcs8", &"<redacted>")
            .finish()
    }
}
