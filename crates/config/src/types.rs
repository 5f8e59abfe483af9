//! Enumerations shared between configuration and the lifecycle crate

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::ConfigError;

/// Algorithm for generated private keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    Rsa2048,
    #[default]
    Rsa4096,
    EcdsaP256,
    EcdsaP384,
}

impl KeyAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 => "rsa2048",
            KeyAlgorithm::Rsa4096 => "rsa4096",
            KeyAlgorithm::EcdsaP256 => "ecdsa-p256",
            KeyAlgorithm::EcdsaP384 => "ecdsa-p384",
        }
    }

    /// RSA modulus size, `None` for elliptic curve keys
    pub fn rsa_bits(&self) -> Option<usize> {
        match self {
            KeyAlgorithm::Rsa2048 => Some(2048),
            KeyAlgorithm::Rsa4096 => Some(4096),
            KeyAlgorithm::EcdsaP256 | KeyAlgorithm::EcdsaP384 => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa2048" => Ok(KeyAlgorithm::Rsa2048),
            "rsa4096" | "rsa" => Ok(KeyAlgorithm::Rsa4096),
            "ecdsa-p256" | "p256" | "ec" => Ok(KeyAlgorithm::EcdsaP256),
            "ecdsa-p384" | "p384" => Ok(KeyAlgorithm::EcdsaP384),
            _ => Err(ConfigError::UnknownVariant {
                kind: "key algorithm",
                value: s.to_string(),
            }),
        }
    }
}

/// On-disk layout of a certificate bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertLayout {
    /// Every certificate in one PEM file
    #[default]
    Concat,
    /// One numbered file per certificate
    Split,
}

impl fmt::Display for CertLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertLayout::Concat => f.write_str("concat"),
            CertLayout::Split => f.write_str("split"),
        }
    }
}

impl FromStr for CertLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "concat" | "concatenated" => Ok(CertLayout::Concat),
            "split" => Ok(CertLayout::Split),
            _ => Err(ConfigError::UnknownVariant {
                kind: "certificate layout",
                value: s.to_string(),
            }),
        }
    }
}
