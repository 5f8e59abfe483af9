//! Domain name validation

use crate::ConfigError;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Validate a DNS name as accepted by an ACME CA
///
/// A single leading `*.` wildcard label is allowed as long as at least two
/// labels follow it. [`Config::validate`](crate::Config::validate) rejects
/// wildcards on top of this, since HTTP-01 cannot validate them.
pub fn validate_domain_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &'static str| ConfigError::InvalidDomain {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("domain cannot be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(invalid("domain exceeds 253 characters"));
    }

    let (wildcard, rest) = match name.strip_prefix("*.") {
        Some(rest) => (true, rest),
        None => (false, name),
    };

    if rest.starts_with('.') || rest.ends_with('.') {
        return Err(invalid("domain cannot start or end with a dot"));
    }

    let mut labels = 0;
    for label in rest.split('.') {
        labels += 1;
        if label.is_empty() {
            return Err(invalid("domain contains an empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label exceeds 63 characters"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("only letters, digits and '-' are allowed"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("labels cannot start or end with '-'"));
        }
    }

    if wildcard && labels < 2 {
        return Err(invalid("wildcard must cover at least a registrable domain"));
    }

    Ok(())
}
