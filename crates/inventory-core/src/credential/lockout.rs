//! Per-identity brute-force lockout with exponential backoff.
//!
//! State is flushed to a JSON file after every change. The flush is not
//! transactional with the in-memory update; losing the latest increment on a
//! crash is acceptable here.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::sanitize;
use crate::fsutil;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_failures: u32,
    pub base_lock: Duration,
    pub multiplier: u32,
    pub max_lock: Duration,
    /// Records older than this are not reloaded at startup.
    pub stale_after: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            base_lock: Duration::minutes(5),
            multiplier: 2,
            max_lock: Duration::minutes(60),
            stale_after: Duration::hours(24),
        }
    }
}

impl LockoutPolicy {
    /// Lock length for the `lockouts`-th lockout (1-based):
    /// `base * multiplier^(lockouts - 1)`, capped at `max_lock`.
    pub fn lock_duration(&self, lockouts: u32) -> Duration {
        let exponent = lockouts.saturating_sub(1);
        let factor = self.multiplier.max(1).checked_pow(exponent);
        match factor.and_then(|f| self.base_lock.checked_mul(i32::try_from(f).ok()?)) {
            Some(d) if d < self.max_lock => d,
            _ => self.max_lock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutRecord {
    pub failed_attempts: u32,
    pub consecutive_lockouts: u32,
    pub last_attempt: DateTime<Utc>,
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
}

/// What a failed attempt led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still below the threshold.
    Counted { remaining_attempts: u32 },
    /// Threshold reached; locked until the given instant.
    Locked { until: DateTime<Utc> },
}

pub struct LockoutTracker {
    policy: LockoutPolicy,
    path: Option<PathBuf>,
    records: Mutex<HashMap<String, LockoutRecord>>,
}

impl LockoutTracker {
    /// Tracker without persistence.
    pub fn in_memory(policy: LockoutPolicy) -> Self {
        Self {
            policy,
            path: None,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Load still-relevant records from `path`. An unreadable or corrupt file
    /// starts empty.
    pub fn open(path: impl AsRef<Path>, policy: LockoutPolicy) -> Self {
        Self::open_at(path, policy, Utc::now())
    }

    pub fn open_at(path: impl AsRef<Path>, policy: LockoutPolicy, now: DateTime<Utc>) -> Self {
        let path = path.as_ref().to_path_buf();
        let records = match load(&path) {
            Ok(all) => {
                let total = all.len();
                let kept: HashMap<_, _> = all
                    .into_iter()
                    .filter(|(_, r)| {
                        r.failed_attempts >= policy.max_failures
                            && now - r.last_attempt < policy.stale_after
                    })
                    .collect();
                if total > 0 {
                    info!(loaded = kept.len(), pruned = total - kept.len(), "lockout state loaded");
                }
                kept
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "lockout state unreadable; starting empty");
                HashMap::new()
            }
        };
        Self {
            policy,
            path: Some(path),
            records: Mutex::new(records),
        }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    pub fn is_locked(&self, identity: &str) -> bool {
        self.is_locked_at(identity, Utc::now())
    }

    /// An elapsed lock clears the attempt counter but keeps the lockout count.
    pub fn is_locked_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(identity) else {
            return false;
        };
        if record.locked_until.is_some_and(|until| until > now) {
            return true;
        }
        if clear_if_elapsed(record, now) {
            debug!(identity = %sanitize::for_log(identity), "lockout elapsed");
            self.persist(&records);
        }
        false
    }

    pub fn remaining_lock(&self, identity: &str, now: DateTime<Utc>) -> Option<Duration> {
        let records = self.records.lock();
        records
            .get(identity)
            .and_then(|r| r.locked_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn record_failure(&self, identity: &str) -> FailureOutcome {
        self.record_failure_at(identity, Utc::now())
    }

    pub fn record_failure_at(&self, identity: &str, now: DateTime<Utc>) -> FailureOutcome {
        let mut records = self.records.lock();
        let record = records
            .entry(identity.to_string())
            .or_insert_with(|| LockoutRecord {
                failed_attempts: 0,
                consecutive_lockouts: 0,
                last_attempt: now,
                locked_until: None,
            });
        record.last_attempt = now;

        if let Some(until) = record.locked_until.filter(|u| *u > now) {
            self.persist(&records);
            return FailureOutcome::Locked { until };
        }

        if clear_if_elapsed(record, now) {
            debug!(identity = %sanitize::for_log(identity), "lockout elapsed");
        }
        record.failed_attempts += 1;
        let outcome = if record.failed_attempts >= self.policy.max_failures {
            record.consecutive_lockouts += 1;
            let duration = self.policy.lock_duration(record.consecutive_lockouts);
            let until = now + duration;
            record.locked_until = Some(until);
            warn!(
                identity = %sanitize::for_log(identity),
                lockouts = record.consecutive_lockouts,
                minutes = duration.num_minutes(),
                "identity locked after repeated failures"
            );
            FailureOutcome::Locked { until }
        } else {
            FailureOutcome::Counted {
                remaining_attempts: self.policy.max_failures - record.failed_attempts,
            }
        };
        self.persist(&records);
        outcome
    }

    /// Forget everything about `identity` (successful login).
    pub fn reset(&self, identity: &str) {
        let mut records = self.records.lock();
        if records.remove(identity).is_some() {
            self.persist(&records);
        }
    }

    pub fn record(&self, identity: &str) -> Option<LockoutRecord> {
        self.records.lock().get(identity).cloned()
    }

    fn persist(&self, records: &HashMap<String, LockoutRecord>) {
        let Some(path) = &self.path else {
            return;
        };
        let result = serde_json::to_vec_pretty(records)
            .map_err(io::Error::other)
            .and_then(|bytes| fsutil::write_atomic(path, &bytes));
        match result {
            Ok(()) => fsutil::restrict_to_owner(path),
            Err(e) => warn!(path = %path.display(), error = %e, "cannot persist lockout state"),
        }
    }
}

/// Drop an elapsed lock and restart the attempt count. The lockout count is
/// kept so the next lock escalates.
fn clear_if_elapsed(record: &mut LockoutRecord, now: DateTime<Utc>) -> bool {
    match record.locked_until {
        Some(until) if until <= now => {
            record.failed_attempts = 0;
            record.locked_until = None;
            true
        }
        _ => false,
    }
}

fn load(path: &Path) -> io::Result<HashMap<String, LockoutRecord>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn durations_grow_and_cap() {
        let p = LockoutPolicy::default();
        assert_eq!(p.lock_duration(1), Duration::minutes(5));
        assert_eq!(p.lock_duration(2), Duration::minutes(10));
        assert_eq!(p.lock_duration(3), Duration::minutes(20));
        assert_eq!(p.lock_duration(5), Duration::minutes(60));
        assert_eq!(p.lock_duration(40), Duration::minutes(60));
    }

    #[test]
    fn counts_down_then_locks() {
        let tracker = LockoutTracker::in_memory(LockoutPolicy::default());
        let now = t0();
        for left in (1..5).rev() {
            assert_eq!(
                tracker.record_failure_at("ana", now),
                FailureOutcome::Counted {
                    remaining_attempts: left
                }
            );
        }
        assert!(matches!(
            tracker.record_failure_at("ana", now),
            FailureOutcome::Locked { .. }
        ));
        assert!(tracker.is_locked_at("ana", now));
        assert!(!tracker.is_locked_at("luis", now));
    }

    #[test]
    fn failures_while_locked_do_not_escalate() {
        let tracker = LockoutTracker::in_memory(LockoutPolicy::default());
        let now = t0();
        for _ in 0..5 {
            tracker.record_failure_at("ana", now);
        }
        tracker.record_failure_at("ana", now + Duration::minutes(1));
        assert_eq!(tracker.record("ana").unwrap().consecutive_lockouts, 1);
    }

    #[test]
    fn first_failure_after_elapsed_lock_counts_from_zero() {
        let tracker = LockoutTracker::in_memory(LockoutPolicy::default());
        let now = t0();
        for _ in 0..5 {
            tracker.record_failure_at("ana", now);
        }
        // no is_locked check in between
        let later = now + Duration::minutes(6);
        assert_eq!(
            tracker.record_failure_at("ana", later),
            FailureOutcome::Counted {
                remaining_attempts: 4
            }
        );
        let record = tracker.record("ana").unwrap();
        assert_eq!(record.failed_attempts, 1);
        assert_eq!(record.consecutive_lockouts, 1);
        assert_eq!(record.locked_until, None);
    }

    #[test]
    fn reset_clears_record() {
        let tracker = LockoutTracker::in_memory(LockoutPolicy::default());
        tracker.record_failure_at("ana", t0());
        tracker.reset("ana");
        assert!(tracker.record("ana").is_none());
    }

    #[test]
    fn reload_keeps_only_recent_lockouts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lockout_state.json");
        let now = t0();
        {
            let tracker = LockoutTracker::open_at(&path, LockoutPolicy::default(), now);
            for _ in 0..5 {
                tracker.record_failure_at("locked", now);
            }
            tracker.record_failure_at("few", now);
            for _ in 0..5 {
                tracker.record_failure_at("old", now - Duration::hours(30));
            }
        }
        let reloaded = LockoutTracker::open_at(&path, LockoutPolicy::default(), now);
        assert!(reloaded.is_locked_at("locked", now));
        assert!(reloaded.record("few").is_none());
        assert!(reloaded.record("old").is_none());
    }

    #[test]
    fn corrupt_state_file_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lockout_state.json");
        fs::write(&path, b"{ not json").unwrap();
        let tracker = LockoutTracker::open(&path, LockoutPolicy::default());
        assert!(!tracker.is_locked("anyone"));
    }
}
