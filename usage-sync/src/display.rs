use crate::history::compute_trend;
use crate::state::{UsageSnapshot, UsageUpdate};
use chrono::{DateTime, Local, TimeZone, Utc};

/// Compact time-to-reset: `""` without a reset time, `"now"` once it passed,
/// otherwise `2d05h`, `3h07m` or `12m`. Partial minutes round up.
pub fn format_countdown(reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(reset_at) = reset_at else {
        return String::new();
    };

    let seconds = (reset_at - now).num_seconds();
    if seconds <= 0 {
        return "now".to_string();
    }

    let minutes = (seconds + 59) / 60;
    let days = minutes / (24 * 60);
    let hours = (minutes % (24 * 60)) / 60;
    let mins = minutes % 60;

    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else {
        format!("{mins}m")
    }
}

/// Absolute reset time in local time, e.g. `10/16 3:05 PM`
pub fn format_reset_time(reset_at: Option<DateTime<Utc>>) -> String {
    format_reset_time_in(reset_at, &Local)
}

pub fn format_reset_time_in<Tz: TimeZone>(reset_at: Option<DateTime<Utc>>, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    match reset_at {
        Some(reset_at) => reset_at
            .with_timezone(tz)
            .format("%-m/%-d %-I:%M %p")
            .to_string(),
        None => "-".to_string(),
    }
}

fn format_age(age: chrono::Duration) -> String {
    let seconds = age.num_seconds().max(0);
    match seconds {
        0..=59 => format!("{seconds}s"),
        60..=3599 => format!("{}m", seconds / 60),
        _ => format!("{}h{:02}m", seconds / 3600, (seconds % 3600) / 60),
    }
}

fn window_line(label: &str, pct: f64, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    match reset_at {
        Some(_) => format!(
            "{label}: {pct:.0}% (resets in {}, {})",
            format_countdown(reset_at, now),
            format_reset_time(reset_at)
        ),
        None => format!("{label}: {pct:.0}%"),
    }
}

fn usage_lines(snapshot: &UsageSnapshot, now: DateTime<Utc>) -> [String; 2] {
    [
        window_line("Session", snapshot.session_pct, snapshot.session_reset_at, now),
        window_line("Weekly", snapshot.weekly_pct, snapshot.weekly_reset_at, now),
    ]
}

/// Human-readable summary of an update
pub fn status_lines(update: &UsageUpdate, now: DateTime<Utc>) -> Vec<String> {
    let shown = update.display_snapshot().filter(|s| s.is_success());

    let plan = update
        .display_snapshot()
        .map(|s| s.plan_label.as_str())
        .filter(|p| !p.is_empty());
    let mut lines = vec![match plan {
        Some(plan) => format!("Claude Usage ({plan})"),
        None => "Claude Usage".to_string(),
    }];

    match shown {
        Some(snapshot) => lines.extend(usage_lines(snapshot, now)),
        None if update.in_flight => lines.push("Fetching usage...".to_string()),
        None => lines.push("No data available yet".to_string()),
    }

    if let Some(failure) = update.current_error() {
        let kind = failure.error_kind;
        let message = failure.error.as_deref().unwrap_or("Unknown error");
        lines.push(format!("⚠ {}: {}", kind.category(), message));

        if let Some(hint) = kind.remediation_hint() {
            lines.push(hint.to_string());
        }

        if update.is_stale()
            && let Some(lkg) = &update.last_known_good
        {
            lines.push(format!("Data is stale (updated {} ago)", format_age(lkg.age(now))));
        }

        if !update.network_available {
            lines.push("Waiting for network".to_string());
        } else if update.retry_scheduled {
            lines.push(format!(
                "Retrying automatically ({} consecutive failures)",
                update.consecutive_failures
            ));
        }
    }

    match compute_trend(&update.history).latest() {
        Some(rate) => lines.push(format!("Trend: {:.2}%/min", rate.rate)),
        None => lines.push("Trend: insufficient data".to_string()),
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;
    use crate::error::ErrorKind;
    use crate::history::UsagePoint;
    use crate::state::LastKnownGood;
    use chrono::{Duration, FixedOffset};
    use rstest::rstest;

    #[rstest]
    #[case(Duration::seconds(-5), "now")]
    #[case(Duration::zero(), "now")]
    #[case(Duration::seconds(1), "1m")]
    #[case(Duration::seconds(60), "1m")]
    #[case(Duration::seconds(61), "2m")]
    #[case(Duration::minutes(59), "59m")]
    #[case(Duration::minutes(60), "1h00m")]
    #[case(Duration::minutes(187), "3h07m")]
    #[case(Duration::hours(24), "1d00h")]
    #[case(Duration::hours(53) + Duration::minutes(10), "2d05h")]
    fn test_format_countdown(#[case] remaining: Duration, #[case] expected: &str) {
        let now = Utc::now();
        assert!(format_countdown(Some(now + remaining), now) == expected);
    }

    #[test]
    fn test_format_countdown_without_reset() {
        assert!(format_countdown(None, Utc::now()) == "");
    }

    #[test]
    fn test_format_reset_time() {
        let reset = "2025-03-07T15:05:00Z".parse::<DateTime<Utc>>().unwrap();
        assert!(format_reset_time_in(Some(reset), &Utc) == "3/7 3:05 PM");

        let tokyo = FixedOffset::east_opt(9 * 3600).unwrap();
        assert!(format_reset_time_in(Some(reset), &tokyo) == "3/8 12:05 AM");

        assert!(format_reset_time(None) == "-");
    }

    fn reading() -> UsageSnapshot {
        UsageSnapshot {
            session_pct: 42.4,
            weekly_pct: 10.0,
            plan_label: "Claude Max 5x".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_lines_for_fresh_data() {
        let update = UsageUpdate {
            current: Some(reading()),
            network_available: true,
            ..Default::default()
        };

        let lines = status_lines(&update, Utc::now());
        assert!(lines[0] == "Claude Usage (Claude Max 5x)");
        assert!(lines[1] == "Session: 42%");
        assert!(lines[2] == "Weekly: 10%");
        assert!(lines.last().unwrap() == "Trend: insufficient data");
    }

    #[test]
    fn test_status_lines_for_stale_data_with_hint() {
        let now = Utc::now();
        let update = UsageUpdate {
            current: Some(UsageSnapshot::failed(
                ErrorKind::HttpError(401),
                "Auth expired - re-login required",
                "Claude Max 5x",
            )),
            last_known_good: Some(LastKnownGood {
                snapshot: reading(),
                observed_at: now - Duration::minutes(12),
            }),
            network_available: true,
            ..Default::default()
        };

        let lines = status_lines(&update, now);
        assert!(lines.contains(&"Session: 42%".to_string()));
        assert!(lines.contains(&"⚠ Authentication Error: Auth expired - re-login required".to_string()));
        assert!(lines.contains(&"Session expired - run `claude` and log in again".to_string()));
        assert!(lines.contains(&"Data is stale (updated 12m ago)".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("Retrying")));
    }

    #[test]
    fn test_status_lines_without_data() {
        let update = UsageUpdate {
            current: Some(UsageSnapshot::failed(ErrorKind::NoToken, "No token", "")),
            network_available: true,
            ..Default::default()
        };

        let lines = status_lines(&update, Utc::now());
        assert!(lines[0] == "Claude Usage");
        assert!(lines[1] == "No data available yet");
        assert!(lines.contains(&"Keychain access needed - relaunch & click Allow".to_string()));
    }

    #[test]
    fn test_status_lines_reports_retry_and_trend() {
        let now = Utc::now();
        let history = (0..3)
            .map(|i| UsagePoint {
                timestamp: now - Duration::minutes(2 - i),
                session_pct: 10.0 + i as f64,
            })
            .collect();

        let update = UsageUpdate {
            current: Some(UsageSnapshot::failed(ErrorKind::HttpError(503), "Server error (HTTP 503)", "")),
            history,
            consecutive_failures: 2,
            retry_scheduled: true,
            network_available: true,
            ..Default::default()
        };

        let lines = status_lines(&update, now);
        assert!(lines.contains(&"Retrying automatically (2 consecutive failures)".to_string()));
        assert!(lines.last().unwrap() == "Trend: 1.00%/min");
    }

    #[test]
    fn test_status_lines_offline() {
        let update = UsageUpdate {
            current: Some(UsageSnapshot::failed(ErrorKind::NetworkOffline, "No connection", "")),
            network_available: false,
            ..Default::default()
        };

        let lines = status_lines(&update, Utc::now());
        assert!(lines.contains(&"Waiting for network".to_string()));
    }
}
