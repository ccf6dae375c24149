use crate::error::ErrorKind;
use crate::history::UsagePoint;
use chrono::{DateTime, Utc};

/// One reading of both quota windows, or the failure that prevented it
#[derive(Debug, Clone, Default)]
pub struct UsageSnapshot {
    pub session_pct: f64,
    pub session_reset_at: Option<DateTime<Utc>>,
    pub weekly_pct: f64,
    pub weekly_reset_at: Option<DateTime<Utc>>,
    pub plan_label: String,
    pub error: Option<String>,
    pub error_kind: ErrorKind,
}

/// Change detection: compares every value and the error message, but not the error kind
impl PartialEq for UsageSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.session_pct == other.session_pct
            && self.session_reset_at == other.session_reset_at
            && self.weekly_pct == other.weekly_pct
            && self.weekly_reset_at == other.weekly_reset_at
            && self.plan_label == other.plan_label
            && self.error == other.error
    }
}

impl UsageSnapshot {
    pub fn failed(kind: ErrorKind, message: impl Into<String>, plan_label: &str) -> Self {
        Self {
            plan_label: plan_label.to_string(),
            error: Some(message.into()),
            error_kind: kind,
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.error_kind.is_error()
    }
}

/// Last successful snapshot, kept across failures
#[derive(Debug, Clone, PartialEq)]
pub struct LastKnownGood {
    pub snapshot: UsageSnapshot,
    pub observed_at: DateTime<Utc>,
}

impl LastKnownGood {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.observed_at)
    }
}

/// Represents the data state with error tracking and last-known-good support
#[derive(Debug, Clone, Default)]
pub struct AppState {
    /// Most recent cycle result, successful or not (None before the first cycle)
    pub current: Option<UsageSnapshot>,
    /// Last successfully fetched data (None if never succeeded)
    pub last_known_good: Option<LastKnownGood>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_success(&mut self, snapshot: UsageSnapshot, now: DateTime<Utc>) {
        self.last_known_good = Some(LastKnownGood {
            snapshot: snapshot.clone(),
            observed_at: now,
        });
        self.current = Some(snapshot);
    }

    /// Keeps the last-known-good snapshot untouched
    pub fn update_error(&mut self, snapshot: UsageSnapshot) {
        self.current = Some(snapshot);
    }
}

/// Everything the presentation layer needs after a state change
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageUpdate {
    pub current: Option<UsageSnapshot>,
    pub last_known_good: Option<LastKnownGood>,
    pub history: Vec<UsagePoint>,
    pub consecutive_failures: u32,
    pub retry_scheduled: bool,
    pub network_available: bool,
    pub in_flight: bool,
}

impl UsageUpdate {
    /// The snapshot to render: live data when the latest cycle succeeded,
    /// otherwise the stale last-known-good reading, otherwise the failure itself.
    pub fn display_snapshot(&self) -> Option<&UsageSnapshot> {
        match &self.current {
            Some(current) if current.is_success() => Some(current),
            Some(current) => self
                .last_known_good
                .as_ref()
                .map(|lkg| &lkg.snapshot)
                .or(Some(current)),
            None => self.last_known_good.as_ref().map(|lkg| &lkg.snapshot),
        }
    }

    /// True when a stale reading is shown because live data could not be fetched
    pub fn is_stale(&self) -> bool {
        matches!(&self.current, Some(current) if !current.is_success())
            && self.last_known_good.is_some()
    }

    pub fn current_error(&self) -> Option<&UsageSnapshot> {
        self.current.as_ref().filter(|s| !s.is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};

    fn reading(session: f64) -> UsageSnapshot {
        UsageSnapshot {
            session_pct: session,
            weekly_pct: 10.0,
            plan_label: "Claude Pro".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_equality_ignores_error_kind() {
        let a = UsageSnapshot::failed(ErrorKind::HttpError(500), "Server error", "Claude Pro");
        let b = UsageSnapshot::failed(ErrorKind::HttpError(503), "Server error", "Claude Pro");
        assert!(a == b);

        let c = UsageSnapshot::failed(ErrorKind::HttpError(503), "Rate limited", "Claude Pro");
        assert!(a != c);
        assert!(reading(1.0) != reading(2.0));
    }

    #[test]
    fn test_error_keeps_last_known_good() {
        let mut state = AppState::new();
        let now = Utc::now();
        state.update_success(reading(40.0), now);
        state.update_error(UsageSnapshot::failed(ErrorKind::NetworkOffline, "Offline", ""));

        let_assert!(Some(lkg) = state.last_known_good.as_ref());
        assert!(lkg.snapshot.session_pct == 40.0);
        assert!(lkg.observed_at == now);
        assert!(!state.current.as_ref().unwrap().is_success());
    }

    #[test]
    fn test_display_prefers_stale_reading_over_error() {
        let mut update = UsageUpdate {
            current: Some(UsageSnapshot::failed(ErrorKind::NetworkTimeout, "Timed out", "")),
            ..Default::default()
        };
        assert!(!update.is_stale());
        assert!(update.display_snapshot().unwrap().error_kind == ErrorKind::NetworkTimeout);

        update.last_known_good = Some(LastKnownGood {
            snapshot: reading(55.0),
            observed_at: Utc::now(),
        });
        assert!(update.is_stale());
        assert!(update.display_snapshot().unwrap().session_pct == 55.0);

        update.current = Some(reading(60.0));
        assert!(!update.is_stale());
        assert!(update.display_snapshot().unwrap().session_pct == 60.0);
    }
}
