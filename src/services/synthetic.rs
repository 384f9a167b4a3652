//! Deterministic glucose generator for offline runs and demos.
//!
//! Values are a pure function of the seed and the minute, so repeated fetches
//! agree on overlapping history the way the real API does.

use chrono::Timelike;
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

use crate::client::{ClientError, ReadingSource, SourceSnapshot};
use crate::timestamp::MinuteStamp;

/// Spacing of history samples, matching the cloud API's graph data.
const HISTORY_STEP_MINUTES: i64 = 15;
const HISTORY_SPAN_MINUTES: i64 = 12 * 60;

pub struct SyntheticSource {
    seed: u64,
}

impl SyntheticSource {
    pub fn new(seed: u64) -> Self {
        SyntheticSource { seed }
    }

    /// Glucose in mg/dL for one minute.
    pub fn value_at(&self, ts: MinuteStamp) -> i32 {
        let minute_index = ts.naive().and_utc().timestamp() / 60;
        let mut rng = SmallRng::seed_from_u64(self.seed ^ (minute_index as u64));

        let time = ts.naive().time();
        let day_fraction = f64::from(time.num_seconds_from_midnight()) / 86_400.0;
        let dawn = gaussian(day_fraction, 0.25, 0.05) * 25.0;
        let meals = [0.33, 0.54, 0.79]
            .iter()
            .map(|center| gaussian(day_fraction, *center, 0.03) * 60.0)
            .sum::<f64>();
        let drift = ((minute_index as f64) / 180.0 * 2.0 * PI).sin() * 12.0;
        let noise = rng.random_range(-3.0..=3.0);
        (105.0 + dawn + meals + drift + noise).clamp(40.0, 400.0).round() as i32
    }

    /// Snapshot as the API would return it at `now`: the current minute plus
    /// quarter-hour history.
    pub fn snapshot_at(&self, now: MinuteStamp) -> SourceSnapshot {
        let aligned_minute = i64::from(now.naive().minute()) % HISTORY_STEP_MINUTES;
        let newest_step = now.minus_minutes(aligned_minute);
        let history = (0..=HISTORY_SPAN_MINUTES / HISTORY_STEP_MINUTES)
            .rev()
            .map(|i| newest_step.minus_minutes(i * HISTORY_STEP_MINUTES))
            .filter(|ts| *ts < now)
            .map(|ts| (ts, self.value_at(ts)))
            .collect();
        SourceSnapshot {
            latest: Some((now, self.value_at(now))),
            history,
        }
    }
}

impl ReadingSource for SyntheticSource {
    fn fetch(&mut self) -> Result<SourceSnapshot, ClientError> {
        let snapshot = self.snapshot_at(MinuteStamp::now());
        debug!("Synthetic source: {} history point(s)", snapshot.history.len());
        Ok(snapshot)
    }
}

fn gaussian(x: f64, center: f64, width: f64) -> f64 {
    let exponent = -((x - center) * (x - center)) / (2.0 * width * width);
    exponent.exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_repeatable_and_plausible() {
        let source = SyntheticSource::new(7);
        let ts = MinuteStamp::parse_key("2025-03-09 12:07").unwrap();
        assert_eq!(source.value_at(ts), source.value_at(ts));
        for offset in 0..(24 * 60) {
            let v = source.value_at(ts.plus_minutes(offset));
            assert!((40..=400).contains(&v), "{v}");
        }
    }

    #[test]
    fn snapshot_history_is_quarter_hourly_and_before_latest() {
        let source = SyntheticSource::new(7);
        let now = MinuteStamp::parse_key("2025-03-09 12:07").unwrap();
        let snapshot = source.snapshot_at(now);
        assert_eq!(snapshot.latest.map(|(ts, _)| ts), Some(now));
        let (newest, _) = *snapshot.history.last().unwrap();
        assert_eq!(newest.to_key(), "2025-03-09 12:00");
        assert!(snapshot.history.windows(2).all(|w| w[1].0.minutes_since(w[0].0) == 15));
        assert_eq!(snapshot.merged().len(), snapshot.history.len() + 1);
    }
}
