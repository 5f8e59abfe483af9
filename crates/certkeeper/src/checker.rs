//! Certificate freshness checks

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::cert::Certificate;
use crate::error::CheckError;

/// How far ahead a certificate must stay valid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityPolicy {
    look_ahead: Duration,
}

impl ValidityPolicy {
    pub fn new(look_ahead: Duration) -> Self {
        Self { look_ahead }
    }

    pub fn from_days(days: u32) -> Self {
        Self::new(Duration::days(i64::from(days)))
    }

    pub fn look_ahead(&self) -> Duration {
        self.look_ahead
    }
}

/// True iff `cert` is already valid at `now` and still valid at `now + look_ahead`
///
/// A look-ahead that overflows the time range counts as expiring too soon.
pub fn is_valid_at(cert: &Certificate, look_ahead: Duration, now: DateTime<Utc>) -> bool {
    if now < cert.not_before() {
        return false;
    }
    match now.checked_add_signed(look_ahead) {
        Some(horizon) => horizon <= cert.not_after(),
        None => false,
    }
}

/// Decides whether a certificate is fresh enough to keep
pub trait ValidityChecker: Send + Sync {
    fn is_valid(&self, cert: &Certificate) -> Result<bool, CheckError>;
}

/// Checks the validity window against the wall clock
#[derive(Debug, Clone)]
pub struct TimeExpirationChecker {
    policy: ValidityPolicy,
}

impl TimeExpirationChecker {
    pub fn new(policy: ValidityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ValidityPolicy {
        self.policy
    }
}

impl ValidityChecker for TimeExpirationChecker {
    fn is_valid(&self, cert: &Certificate) -> Result<bool, CheckError> {
        let now = Utc::now();
        let valid = is_valid_at(cert, self.policy.look_ahead, now);
        debug!(
            not_before = %cert.not_before(),
            not_after = %cert.not_after(),
            days_left = (cert.not_after() - now).num_days(),
            look_ahead_days = self.policy.look_ahead.num_days(),
            valid,
            "Checked certificate validity"
        );
        Ok(valid)
    }
}
