//! Administrative session idle tracking with lazy expiry.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::info;

pub const DEFAULT_TIMEOUT_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionState {
    pub active: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

pub struct SessionTracker {
    timeout: Duration,
    state: Mutex<SessionState>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_TIMEOUT_MINUTES))
    }
}

impl SessionTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn snapshot(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn start_at(&self, now: DateTime<Utc>) {
        *self.state.lock() = SessionState {
            active: true,
            last_activity: Some(now),
        };
        info!("admin session started");
    }

    /// Extend an active session. Does nothing when inactive.
    pub fn touch_at(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        if state.active {
            state.last_activity = Some(now);
        }
    }

    /// True when there is no live session. Detecting expiry clears the state.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if !state.active {
            return true;
        }
        let idle = state.last_activity.map(|t| now - t).unwrap_or(self.timeout);
        if idle >= self.timeout {
            *state = SessionState::default();
            info!(idle_minutes = idle.num_minutes(), "admin session expired");
            return true;
        }
        false
    }

    /// Whole minutes left before expiry, 0 when inactive or expired.
    pub fn minutes_remaining_at(&self, now: DateTime<Utc>) -> i64 {
        let state = self.state.lock();
        match (state.active, state.last_activity) {
            (true, Some(t)) => (self.timeout - (now - t)).num_minutes().max(0),
            _ => 0,
        }
    }

    pub fn end(&self) {
        let mut state = self.state.lock();
        if state.active {
            *state = SessionState::default();
            info!("admin session ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn inactive_session_is_expired_and_touch_is_noop() {
        let session = SessionTracker::default();
        session.touch_at(t0());
        assert!(!session.snapshot().active);
        assert!(session.is_expired_at(t0()));
        assert_eq!(session.minutes_remaining_at(t0()), 0);
    }

    #[test]
    fn touch_extends_and_idle_expires() {
        let session = SessionTracker::default();
        session.start_at(t0());
        session.touch_at(t0() + Duration::minutes(20));
        assert!(!session.is_expired_at(t0() + Duration::minutes(40)));
        assert_eq!(session.minutes_remaining_at(t0() + Duration::minutes(40)), 10);
        assert!(session.is_expired_at(t0() + Duration::minutes(50)));
        assert_eq!(session.snapshot(), SessionState::default());
    }

    #[test]
    fn end_clears_state() {
        let session = SessionTracker::default();
        session.start_at(t0());
        session.end();
        assert!(session.is_expired_at(t0()));
    }
}
