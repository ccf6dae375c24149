//! Session usage history and consumption-rate trend.
//!
//! The history keeps the last five hours of session readings, persisted as a JSON array
//! of `{date, sessionPct}` objects and rewritten wholesale (temp file + rename) after
//! every append. The trend is derived on demand and never stored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::HistoryError;

pub const RETENTION: chrono::Duration = chrono::Duration::hours(5);

/// Centered moving-average width, in samples
pub const SMOOTHING_WINDOW: usize = 40;

/// Smallest value used as the full-scale reference when normalizing rates (%/min)
pub const MIN_FULL_SCALE_RATE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsagePoint {
    #[serde(rename = "date")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sessionPct")]
    pub session_pct: f64,
}

/// Bounded, persisted series of session readings
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    points: Vec<UsagePoint>,
}

impl HistoryStore {
    /// Start empty without reading the file
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            points: Vec::new(),
        }
    }

    /// Read the persisted series and prune it. A missing or unreadable file yields
    /// an empty history.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        Self::load_at(path, Utc::now()).await
    }

    pub async fn load_at(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        let mut store = Self::empty(path);

        match read_points(&store.path).await {
            Ok(mut points) => {
                points.sort_by_key(|p| p.timestamp);
                store.points = points;
                store.prune(now);
                debug!(
                    path = %store.path.display(),
                    points = store.points.len(),
                    "Usage history loaded"
                );
            }
            Err(HistoryError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %store.path.display(), "No usage history yet");
            }
            Err(e) => {
                warn!(path = %store.path.display(), error = %e, "Discarding unreadable usage history");
            }
        }

        store
    }

    pub async fn record(&mut self, session_pct: f64) -> Result<(), HistoryError> {
        self.record_at(session_pct, Utc::now()).await
    }

    /// Append, prune, persist. Non-finite readings are dropped since JSON cannot hold them.
    pub async fn record_at(&mut self, session_pct: f64, now: DateTime<Utc>) -> Result<(), HistoryError> {
        if !session_pct.is_finite() {
            warn!(session_pct, "Skipping non-finite usage reading");
            return Ok(());
        }

        let point = UsagePoint {
            timestamp: now,
            session_pct,
        };
        let index = self.points.partition_point(|p| p.timestamp <= now);
        self.points.insert(index, point);

        self.prune(now);
        self.persist().await
    }

    /// Drop every point older than `now - RETENTION`
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - RETENTION;
        let first_kept = self.points.partition_point(|p| p.timestamp < cutoff);
        if first_kept > 0 {
            self.points = self.points.split_off(first_kept);
        }
    }

    pub fn points(&self) -> &[UsagePoint] {
        &self.points
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn trend(&self) -> Trend {
        compute_trend(&self.points)
    }

    async fn persist(&self) -> Result<(), HistoryError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string(&self.points)?;

        let temp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), points = self.points.len(), "Usage history saved");
        Ok(())
    }
}

async fn read_points(path: &Path) -> Result<Vec<UsagePoint>, HistoryError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePoint {
    /// End of the interval the rate was measured over
    pub timestamp: DateTime<Utc>,
    /// Smoothed consumption rate in percentage points per minute
    pub rate: f64,
    /// `rate` scaled to 0..=100 for plotting
    pub normalized: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Trend {
    InsufficientData,
    Rates(Vec<RatePoint>),
}

impl Trend {
    pub fn latest(&self) -> Option<&RatePoint> {
        match self {
            Trend::InsufficientData => None,
            Trend::Rates(rates) => rates.last(),
        }
    }
}

/// Smoothed consumption rate over consecutive points.
///
/// Needs at least three points. A drop in percentage (quota reset) counts as zero
/// consumption; intervals with no elapsed time also count as zero.
pub fn compute_trend(points: &[UsagePoint]) -> Trend {
    if points.len() < 3 {
        return Trend::InsufficientData;
    }

    let raw: Vec<(DateTime<Utc>, f64)> = points
        .windows(2)
        .map(|pair| {
            let delta_pct = (pair[1].session_pct - pair[0].session_pct).max(0.0);
            let minutes = (pair[1].timestamp - pair[0].timestamp).num_milliseconds() as f64 / 60_000.0;
            let rate = if minutes > 0.0 { delta_pct / minutes } else { 0.0 };
            (pair[1].timestamp, rate)
        })
        .collect();

    let smoothed = centered_moving_average(&raw.iter().map(|(_, r)| *r).collect::<Vec<_>>());

    let full_scale = smoothed
        .iter()
        .copied()
        .fold(MIN_FULL_SCALE_RATE, f64::max);

    Trend::Rates(
        raw.iter()
            .zip(smoothed)
            .map(|((timestamp, _), rate)| RatePoint {
                timestamp: *timestamp,
                rate,
                normalized: (rate / full_scale * 100.0).clamp(0.0, 100.0),
            })
            .collect(),
    )
}

/// The window shrinks at the ends of the series instead of wrapping or padding
fn centered_moving_average(values: &[f64]) -> Vec<f64> {
    let half = SMOOTHING_WINDOW / 2;

    (0..values.len())
        .map(|i| {
            let start = i.saturating_sub(half);
            let end = (i + half).min(values.len());
            let window = &values[start..end.max(i + 1)];
            window.iter().sum::<f64>() / window.len() as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{assert, let_assert};
    use chrono::Duration;

    fn point(now: DateTime<Utc>, minutes_ago: i64, pct: f64) -> UsagePoint {
        UsagePoint {
            timestamp: now - Duration::minutes(minutes_ago),
            session_pct: pct,
        }
    }

    #[test]
    fn test_prune_drops_points_outside_window() {
        let now = Utc::now();
        let mut store = HistoryStore::empty("unused.json");
        store.points = vec![point(now, 5 * 60 + 1, 10.0), point(now, 4 * 60 + 59, 20.0)];

        store.prune(now);

        assert!(store.points().len() == 1);
        assert!(store.points()[0].session_pct == 20.0);
    }

    #[tokio::test]
    async fn test_record_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");
        let now = Utc::now();

        let mut store = HistoryStore::empty(&path);
        store.record_at(10.0, now - Duration::minutes(2)).await.unwrap();
        store.record_at(12.5, now).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = HistoryStore::load_at(&path, now).await;
        assert!(reloaded.points() == store.points());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let first = &raw.as_array().unwrap()[0];
        assert!(first.get("date").is_some());
        assert!(first.get("sessionPct").unwrap().as_f64() == Some(10.0));
    }

    #[tokio::test]
    async fn test_non_finite_reading_keeps_history_loadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let now = Utc::now();

        let mut store = HistoryStore::empty(&path);
        store.record_at(10.0, now - Duration::minutes(2)).await.unwrap();
        store.record_at(12.0, now - Duration::minutes(1)).await.unwrap();
        let_assert!(Ok(()) = store.record_at(f64::NAN, now).await);
        let_assert!(Ok(()) = store.record_at(f64::INFINITY, now).await);
        assert!(store.points().len() == 2);

        let reloaded = HistoryStore::load_at(&path, now).await;
        assert!(reloaded.points().len() == 2);
        assert!(reloaded.points() == store.points());
    }

    #[tokio::test]
    async fn test_load_prunes_old_points() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        let now = Utc::now();

        let points = vec![point(now, 6 * 60, 1.0), point(now, 301, 2.0), point(now, 10, 3.0)];
        std::fs::write(&path, serde_json::to_string(&points).unwrap()).unwrap();

        let store = HistoryStore::load_at(&path, now).await;
        assert!(store.points().len() == 1);
        assert!(store.points()[0].session_pct == 3.0);
    }

    #[tokio::test]
    async fn test_load_missing_or_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = HistoryStore::load(dir.path().join("nope.json")).await;
        assert!(missing.points().is_empty());

        let corrupt_path = dir.path().join("corrupt.json");
        std::fs::write(&corrupt_path, "{not json").unwrap();
        let corrupt = HistoryStore::load(&corrupt_path).await;
        assert!(corrupt.points().is_empty());
    }

    #[tokio::test]
    async fn test_record_prunes_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        let mut store = HistoryStore::empty(dir.path().join("history.json"));
        store.points = vec![point(now, 400, 50.0)];

        store.record_at(5.0, now).await.unwrap();

        assert!(store.points().len() == 1);
        assert!(store.points()[0].session_pct == 5.0);
    }

    #[test]
    fn test_trend_needs_three_points() {
        let now = Utc::now();
        assert!(compute_trend(&[]) == Trend::InsufficientData);
        assert!(
            compute_trend(&[point(now, 2, 1.0), point(now, 1, 2.0)]) == Trend::InsufficientData
        );
    }

    #[test]
    fn test_trend_on_three_increasing_points() {
        let now = Utc::now();
        let points = [point(now, 2, 10.0), point(now, 1, 12.0), point(now, 0, 13.0)];

        let_assert!(Trend::Rates(rates) = compute_trend(&points));

        assert!(rates.len() == 2);
        for rate in &rates {
            assert!(rate.rate.is_finite() && rate.rate >= 0.0);
            assert!((0.0..=100.0).contains(&rate.normalized));
        }
        // window covers both raw rates (2.0 and 1.0 %/min)
        assert!((rates[0].rate - 1.5).abs() < 1e-9);
        assert!((rates[1].normalized - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_trend_clamps_quota_reset_to_zero() {
        let now = Utc::now();
        let points = [point(now, 3, 90.0), point(now, 2, 95.0), point(now, 1, 0.0), point(now, 0, 0.0)];

        let_assert!(Trend::Rates(rates) = compute_trend(&points));
        assert!(rates.iter().all(|r| r.rate >= 0.0));
    }

    #[test]
    fn test_trend_floor_keeps_idle_series_low() {
        let now = Utc::now();
        let points = [point(now, 20, 10.0), point(now, 10, 10.1), point(now, 0, 10.2)];

        let_assert!(Trend::Rates(rates) = compute_trend(&points));
        // 0.01 %/min against the 0.5 floor
        assert!(rates.iter().all(|r| r.normalized < 5.0));
    }

    #[test]
    fn test_trend_handles_duplicate_timestamps() {
        let now = Utc::now();
        let points = [point(now, 1, 10.0), point(now, 1, 20.0), point(now, 0, 21.0)];

        let_assert!(Trend::Rates(rates) = compute_trend(&points));
        assert!(rates.iter().all(|r| r.rate.is_finite()));
    }

    #[test]
    fn test_moving_average_window_shrinks_at_edges() {
        let values: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let smoothed = centered_moving_average(&values);

        // first sample averages indices 0..20
        assert!((smoothed[0] - 9.5).abs() < 1e-9);
        // middle sample averages indices 30..70
        assert!((smoothed[50] - 49.5).abs() < 1e-9);
        // last sample averages indices 79..100
        assert!((smoothed[99] - 89.0).abs() < 1e-9);
    }
}
