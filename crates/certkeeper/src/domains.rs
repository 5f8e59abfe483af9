//! Domain sets a certificate is issued for

use std::fmt;

use certkeeper_config::{validate_domain_name, ConfigError};

/// Ordered, non-empty, de-duplicated list of DNS names
///
/// Names are lowercased and stripped of a trailing root dot. The first name is
/// the primary name; it becomes the certificate's common name and keys the
/// issuance record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainSet {
    names: Vec<String>,
}

impl DomainSet {
    pub fn new<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim().trim_end_matches('.').to_ascii_lowercase();
            validate_domain_name(&name)?;
            if !normalized.contains(&name) {
                normalized.push(name);
            }
        }

        if normalized.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one domain is required".to_string(),
            ));
        }

        Ok(Self { names: normalized })
    }

    /// Parse a comma separated list, as given on the command line
    pub fn parse_list(list: &str) -> Result<Self, ConfigError> {
        Self::new(list.split(',').filter(|part| !part.trim().is_empty()))
    }

    pub fn primary(&self) -> &str {
        &self.names[0]
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false, a domain set holds at least the primary name
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_and_dedups() {
        let set = DomainSet::new(["Example.COM", "www.example.com.", "example.com"]).unwrap();
        assert_eq!(set.names(), ["example.com", "www.example.com"]);
        assert_eq!(set.primary(), "example.com");
        assert_eq!(set.len(), 2);
        assert!(set.contains("WWW.example.com"));
    }

    #[test]
    fn test_parse_list() {
        let set = DomainSet::parse_list("a.example.com, *.b.example.com,").unwrap();
        assert_eq!(set.names(), ["a.example.com", "*.b.example.com"]);
        assert_eq!(set.to_string(), "a.example.com,*.b.example.com");
    }

    #[test]
    fn test_rejects_empty_and_invalid() {
        assert!(DomainSet::new(Vec::<String>::new()).is_err());
        assert!(DomainSet::parse_list(" , ").is_err());
        assert!(matches!(
            DomainSet::new(["bad_domain.example.com"]),
            Err(ConfigError::InvalidDomain { .. })
        ));
    }
}
