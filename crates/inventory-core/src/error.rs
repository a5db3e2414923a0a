//! Error taxonomy shared by every component.
//!
//! Each module owns its own `thiserror` enum; `ErrorClass` is the coarse
//! category callers branch on (retry, abort, refuse, ignore).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Feature disabled or path missing. Short-circuits, non-fatal.
    Configuration,
    /// Copy/read/write failure.
    Io,
    /// Checksum mismatch or structural probe failure.
    Integrity,
    /// Store busy/locked. Retried with bounded backoff, then surfaced.
    Contention,
    /// Authentication tag failure, malformed ciphertext, key-size mismatch. Never retried.
    Crypto,
    /// Lockout active, weak password.
    SecurityPolicy,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Contention)
    }
}
