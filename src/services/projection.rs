//! Short-horizon projections over the stored reading series.
//!
//! A [`Projection`] is a snapshot of the readings in the look-back window
//! ending at a terminal instant. All estimates are derived from that snapshot;
//! nothing is interpolated; each boundary uses the nearest stored point.

use core::fmt;
use diesel::SqliteConnection;
use std::error::Error;
use std::ops::RangeInclusive;

use crate::db::connection::StoreError;
use crate::db::models::Reading;
use crate::db::readings;
use crate::timestamp::{MinuteStamp, TimeRange};
use crate::utils::TargetRange;

#[derive(Debug, Clone)]
pub struct ProjectionSettings {
    /// How far back the snapshot reaches; also the cap for time out of range.
    pub lookback_mins: i64,
    /// Horizon of the stored projection and of the velocity.
    pub horizon_mins: i64,
    /// Look-back windows averaged by [`Projection::averaged_projection`].
    pub slope_windows: RangeInclusive<i64>,
    pub target: TargetRange,
}

impl Default for ProjectionSettings {
    fn default() -> Self {
        ProjectionSettings {
            lookback_mins: 120,
            horizon_mins: 20,
            slope_windows: 5..=15,
            target: TargetRange::default(),
        }
    }
}

#[derive(Debug)]
pub enum ProjectionError {
    /// Not enough stored points to derive the requested estimate.
    InsufficientData { at: MinuteStamp, detail: String },
    Store(StoreError),
}

impl fmt::Display for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionError::InsufficientData { at, detail } => {
                write!(f, "insufficient data at {}: {}", at, detail)
            }
            ProjectionError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl Error for ProjectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ProjectionError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for ProjectionError {
    fn from(value: StoreError) -> Self {
        ProjectionError::Store(value)
    }
}

/// Computed values for one instant, ready to be stored or reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    pub at: MinuteStamp,
    pub present: i32,
    pub projected: i32,
    pub velocity: f64,
    pub minutes_out_of_range: i64,
}

#[derive(Debug, Clone)]
pub struct Projection {
    settings: ProjectionSettings,
    at: MinuteStamp,
    /// Non-zero readings at or before `at`, newest first.
    window: Vec<Reading>,
}

impl Projection {
    /// Snapshot the look-back window ending at `at` from the store.
    pub fn load(
        conn: &mut SqliteConnection,
        at: MinuteStamp,
        settings: &ProjectionSettings,
    ) -> Result<Self, ProjectionError> {
        let rows = readings::fetch_range(conn, TimeRange::ending_at(at, settings.lookback_mins))?;
        Ok(Self::from_window(at, rows, settings))
    }

    /// Build from readings already in hand. Order does not matter; points
    /// after `at` and empty values are dropped.
    pub fn from_window(at: MinuteStamp, mut rows: Vec<Reading>, settings: &ProjectionSettings) -> Self {
        rows.retain(|r| r.timestamp <= at && r.reading_now != 0);
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.dedup_by_key(|r| r.timestamp);
        Projection {
            settings: settings.clone(),
            at,
            window: rows,
        }
    }

    fn insufficient(&self, detail: impl Into<String>) -> ProjectionError {
        ProjectionError::InsufficientData {
            at: self.at,
            detail: detail.into(),
        }
    }

    /// Most recent stored reading at or before the terminal instant.
    pub fn present_reading(&self) -> Result<&Reading, ProjectionError> {
        self.window
            .first()
            .ok_or_else(|| self.insufficient("no readings in look-back window"))
    }

    /// Per-minute change between the present reading and the oldest stored
    /// point no more than `mins_in_past` minutes before it.
    pub fn slope(&self, mins_in_past: i64) -> Result<f64, ProjectionError> {
        if mins_in_past <= 0 {
            return Err(self.insufficient(format!("look-back of {} min", mins_in_past)));
        }
        let present = self.present_reading()?;
        let earliest = present.timestamp.minus_minutes(mins_in_past);
        let boundary = self
            .window
            .iter()
            .take_while(|r| r.timestamp >= earliest)
            .last()
            .filter(|r| r.timestamp < present.timestamp)
            .ok_or_else(|| self.insufficient(format!("fewer than 2 points in the last {} min", mins_in_past)))?;
        Ok(f64::from(present.reading_now - boundary.reading_now) / mins_in_past as f64)
    }

    /// `present + slope(mins_in_past) * mins_in_future`, truncated toward zero.
    pub fn projected(&self, mins_in_future: i64, mins_in_past: i64) -> Result<i32, ProjectionError> {
        let present = self.present_reading()?.reading_now;
        let slope = self.slope(mins_in_past)?;
        Ok((f64::from(present) + slope * mins_in_future as f64).trunc() as i32)
    }

    /// Truncated mean of [`Self::projected`] over the configured look-back
    /// windows. Windows without a second point are left out.
    pub fn averaged_projection(&self, mins_in_future: i64) -> Result<i32, ProjectionError> {
        let mut total = 0.0;
        let mut samples = 0u32;
        for mins_in_past in self.settings.slope_windows.clone() {
            match self.projected(mins_in_future, mins_in_past) {
                Ok(v) => {
                    total += f64::from(v);
                    samples += 1;
                }
                Err(ProjectionError::InsufficientData { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        if samples == 0 {
            return Err(self.insufficient("no look-back window has two points"));
        }
        Ok((total / f64::from(samples)).trunc() as i32)
    }

    /// Average rate of change per minute implied by the averaged projection
    /// over the horizon.
    pub fn velocity(&self) -> Result<f64, ProjectionError> {
        let horizon = self.settings.horizon_mins;
        let present = self.present_reading()?.reading_now;
        let projected = self.averaged_projection(horizon)?;
        Ok(f64::from(projected - present) / horizon as f64)
    }

    /// Minutes since the series was last inside the target band. Zero when
    /// the present reading is in band; the look-back length when no in-band
    /// point exists in the window.
    pub fn time_out_of_range(&self) -> Result<i64, ProjectionError> {
        let present = self.present_reading()?;
        let target = self.settings.target;
        if target.contains(present.reading_now) {
            return Ok(0);
        }
        let minutes = self
            .window
            .iter()
            .skip(1)
            .find(|r| target.contains(r.reading_now))
            .map(|r| present.timestamp.minutes_since(r.timestamp))
            .unwrap_or(self.settings.lookback_mins);
        Ok(minutes)
    }

    pub fn estimate(&self) -> Result<Estimate, ProjectionError> {
        let present = self.present_reading()?;
        Ok(Estimate {
            at: present.timestamp,
            present: present.reading_now,
            projected: self.averaged_projection(self.settings.horizon_mins)?,
            velocity: self.velocity()?,
            minutes_out_of_range: self.time_out_of_range()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::open_in_memory;

    fn base() -> MinuteStamp {
        MinuteStamp::parse_key("2025-03-09 12:00").unwrap()
    }

    /// One reading per minute, `values[0]` at `base()` and going back in time.
    fn series(values: &[i32]) -> Vec<Reading> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Reading::new(base().minus_minutes(i as i64), *v))
            .collect()
    }

    fn linear(rate: i32, minutes: i64) -> Vec<Reading> {
        (0..=minutes)
            .map(|i| Reading::new(base().minus_minutes(i), 100 + rate * (minutes - i) as i32))
            .collect()
    }

    #[test]
    fn slope_of_linear_series_is_its_rate_for_any_window() {
        for rate in [-3, 0, 2] {
            let p = Projection::from_window(base(), linear(rate, 30), &ProjectionSettings::default());
            for window in 1..=30 {
                assert_eq!(p.slope(window).unwrap(), f64::from(rate), "rate {rate}, window {window}");
            }
        }
    }

    #[test]
    fn slope_uses_nearest_point_inside_the_window() {
        // points at T, T-4 and T-10
        let rows = vec![
            Reading::new(base(), 130),
            Reading::new(base().minus_minutes(4), 122),
            Reading::new(base().minus_minutes(10), 100),
        ];
        let p = Projection::from_window(base(), rows, &ProjectionSettings::default());
        assert_eq!(p.slope(5).unwrap(), (130.0 - 122.0) / 5.0);
        assert_eq!(p.slope(10).unwrap(), 3.0);
    }

    #[test]
    fn single_point_is_insufficient() {
        let p = Projection::from_window(base(), series(&[120]), &ProjectionSettings::default());
        assert_eq!(p.present_reading().unwrap().reading_now, 120);
        assert!(matches!(p.slope(5), Err(ProjectionError::InsufficientData { .. })));
        assert!(matches!(p.averaged_projection(20), Err(ProjectionError::InsufficientData { .. })));
        assert!(matches!(p.velocity(), Err(ProjectionError::InsufficientData { .. })));
    }

    #[test]
    fn empty_window_is_insufficient() {
        let p = Projection::from_window(base(), Vec::new(), &ProjectionSettings::default());
        assert!(matches!(p.present_reading(), Err(ProjectionError::InsufficientData { .. })));
    }

    #[test]
    fn projections_truncate_toward_zero() {
        // slope = -7 / 5 = -1.4 ; 50 + -1.4 * 20 = 22.0 ; over 3 min: 50 - 4.2 = 45.8 -> 45
        let rows = vec![Reading::new(base(), 50), Reading::new(base().minus_minutes(5), 57)];
        let p = Projection::from_window(base(), rows, &ProjectionSettings::default());
        assert_eq!(p.projected(3, 5).unwrap(), 45);
        // falling below zero still truncates toward zero: 50 - 1.4 * 37 = -1.8 -> -1
        assert_eq!(p.projected(37, 5).unwrap(), -1);
    }

    #[test]
    fn flat_series_projects_its_constant() {
        let p = Projection::from_window(base(), series(&[117; 20]), &ProjectionSettings::default());
        for future in [0, 5, 20, 45] {
            assert_eq!(p.averaged_projection(future).unwrap(), 117);
        }
        assert_eq!(p.velocity().unwrap(), 0.0);
    }

    #[test]
    fn velocity_comes_from_the_averaged_projection() {
        let p = Projection::from_window(base(), linear(2, 30), &ProjectionSettings::default());
        let present = p.present_reading().unwrap().reading_now;
        assert_eq!(p.averaged_projection(20).unwrap(), present + 40);
        assert_eq!(p.velocity().unwrap(), 2.0);
    }

    #[test]
    fn time_out_of_range_walks_back_to_last_in_band_point() {
        // present 180, the 11 minutes before it all >= 150, 140 twelve minutes ago
        let mut values = vec![180];
        values.extend(std::iter::repeat_n(155, 11));
        values.push(140);
        values.extend(std::iter::repeat_n(120, 5));
        let p = Projection::from_window(base(), series(&values), &ProjectionSettings::default());
        assert_eq!(p.time_out_of_range().unwrap(), 12);
    }

    #[test]
    fn time_out_of_range_is_zero_in_band_and_capped_by_window() {
        let settings = ProjectionSettings::default();
        let p = Projection::from_window(base(), series(&[120, 200, 210]), &settings);
        assert_eq!(p.time_out_of_range().unwrap(), 0);

        let p = Projection::from_window(base(), series(&[60, 62, 65]), &settings);
        assert_eq!(p.time_out_of_range().unwrap(), settings.lookback_mins);
    }

    #[test]
    fn load_reads_only_up_to_the_terminal_instant() {
        let mut conn = open_in_memory().unwrap();
        for r in linear(1, 20) {
            readings::insert(&mut conn, &r).unwrap();
        }
        readings::insert(&mut conn, &Reading::new(base().plus_minutes(1), 999)).unwrap();
        let p = Projection::load(&mut conn, base(), &ProjectionSettings::default()).unwrap();
        assert_eq!(p.present_reading().unwrap().timestamp, base());
        assert_eq!(p.slope(10).unwrap(), 1.0);
        let est = p.estimate().unwrap();
        assert_eq!(est.present, 120);
        assert_eq!(est.projected, 140);
        assert_eq!(est.minutes_out_of_range, 0);
    }
}
