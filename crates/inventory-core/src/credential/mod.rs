//! Credential security: password hashing, brute-force lockout and
//! administrative session tracking.

pub mod lockout;
pub mod password;
pub mod sanitize;
pub mod session;
pub mod strength;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::ErrorClass;
use crate::paths::Layout;

pub use lockout::{FailureOutcome, LockoutPolicy, LockoutRecord, LockoutTracker};
pub use password::CredentialFormat;
pub use session::{SessionState, SessionTracker};
pub use strength::StrengthReport;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("password must not be empty")]
    EmptyPassword,
}

impl CredentialError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::SecurityPolicy
    }
}

/// Outcome of [`CredentialGuard::authenticate`]. Refusals are values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Granted {
        /// Stored value is plaintext or below the current work factor.
        needs_rehash: bool,
    },
    Denied {
        remaining_attempts: u32,
    },
    LockedOut {
        until: DateTime<Utc>,
    },
}

pub struct CredentialGuard {
    lockout: LockoutTracker,
    session: SessionTracker,
}

impl CredentialGuard {
    pub fn new(lockout: LockoutTracker, session: SessionTracker) -> Self {
        Self { lockout, session }
    }

    /// Default policy with lockout state persisted under the data root.
    pub fn open(layout: &Layout) -> Self {
        Self::new(
            LockoutTracker::open(layout.lockout_file(), LockoutPolicy::default()),
            SessionTracker::default(),
        )
    }

    pub fn in_memory() -> Self {
        Self::new(
            LockoutTracker::in_memory(LockoutPolicy::default()),
            SessionTracker::default(),
        )
    }

    pub fn hash_password(&self, plaintext: &str) -> Result<String, CredentialError> {
        password::hash_password(plaintext)
    }

    pub fn verify_password(&self, plaintext: &str, stored: &str) -> bool {
        password::verify_password(plaintext, stored)
    }

    pub fn validate_strength(&self, plaintext: &str) -> StrengthReport {
        strength::validate_strength(plaintext)
    }

    pub fn is_locked(&self, identity: &str) -> bool {
        self.lockout.is_locked(identity)
    }

    pub fn record_failure(&self, identity: &str) -> FailureOutcome {
        self.lockout.record_failure(identity)
    }

    pub fn reset(&self, identity: &str) {
        self.lockout.reset(identity)
    }

    pub fn lockout(&self) -> &LockoutTracker {
        &self.lockout
    }

    /// Lockout check, verification, bookkeeping and session start in one step.
    pub fn authenticate(&self, identity: &str, plaintext: &str, stored: &str) -> AuthOutcome {
        self.authenticate_at(identity, plaintext, stored, Utc::now())
    }

    pub fn authenticate_at(
        &self,
        identity: &str,
        plaintext: &str,
        stored: &str,
        now: DateTime<Utc>,
    ) -> AuthOutcome {
        let who = sanitize::for_log(identity);
        if self.lockout.is_locked_at(identity, now) {
            let until = self
                .lockout
                .remaining_lock(identity, now)
                .map(|d| now + d)
                .unwrap_or(now);
            warn!(identity = %who, "login refused: identity locked");
            return AuthOutcome::LockedOut { until };
        }
        if password::verify_password(plaintext, stored) {
            self.lockout.reset(identity);
            self.session.start_at(now);
            info!(identity = %who, "login succeeded");
            return AuthOutcome::Granted {
                needs_rehash: password::needs_rehash(stored),
            };
        }
        match self.lockout.record_failure_at(identity, now) {
            FailureOutcome::Counted { remaining_attempts } => {
                warn!(identity = %who, remaining_attempts, "login failed");
                AuthOutcome::Denied { remaining_attempts }
            }
            FailureOutcome::Locked { until } => AuthOutcome::LockedOut { until },
        }
    }

    pub fn start_session(&self) {
        self.session.start_at(Utc::now())
    }

    pub fn touch_session(&self) {
        self.session.touch_at(Utc::now())
    }

    pub fn is_session_expired(&self) -> bool {
        self.session.is_expired_at(Utc::now())
    }

    pub fn minutes_remaining(&self) -> i64 {
        self.session.minutes_remaining_at(Utc::now())
    }

    pub fn end_session(&self) {
        self.session.end()
    }

    pub fn session(&self) -> &SessionTracker {
        &self.session
    }

    pub fn session_timeout(&self) -> Duration {
        self.session.timeout()
    }
}
