//! Per-cycle notification decision.
//!
//! Every tick summarises the newest reading, compares it with the previous
//! summary and decides whether a regular message and/or an alert goes out.
//! The previous summary lives only in memory.

use core::fmt;
use diesel::SqliteConnection;
use log::{debug, error, info, warn};

use crate::db::readings;
use crate::services::projection::{Estimate, Projection, ProjectionError, ProjectionSettings};
use crate::services::reconcile::CycleError;
use crate::timestamp::MinuteStamp;
use crate::utils::TargetRange;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// Alert when heading above the band at least this fast.
    pub rising_velocity: f64,
    /// Alert when heading below the band at least this fast (negative).
    pub falling_velocity: f64,
    /// Alert on any movement at least this fast.
    pub extreme_velocity: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        AlertThresholds {
            rising_velocity: 0.8,
            falling_velocity: -0.8,
            extreme_velocity: 3.5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub projection: ProjectionSettings,
    pub thresholds: AlertThresholds,
    /// A newest reading older than this skips the tick.
    pub stale_after_mins: i64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        NotifySettings {
            projection: ProjectionSettings::default(),
            thresholds: AlertThresholds::default(),
            stale_after_mins: 15,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleSummary {
    pub at: MinuteStamp,
    pub current: i32,
    pub projected: i32,
    pub velocity: f64,
    /// Change of `current` since the previous summary.
    pub delta: Option<i32>,
    pub minutes_out_of_range: i64,
}

impl CycleSummary {
    pub fn from_estimate(estimate: &Estimate, previous: Option<&CycleSummary>) -> Self {
        CycleSummary {
            at: estimate.at,
            current: estimate.present,
            projected: estimate.projected,
            velocity: estimate.velocity,
            delta: previous.map(|p| estimate.present - p.current),
            minutes_out_of_range: estimate.minutes_out_of_range,
        }
    }

    pub fn message(&self) -> String {
        let mut text = format!("{} to {}, {:.2}/min", self.current, self.projected, self.velocity);
        if self.minutes_out_of_range > 0 {
            text.push_str(&format!(", out of range {}m", self.minutes_out_of_range));
        }
        text
    }

    /// Same values as `other` at message precision.
    fn repeats(&self, other: &CycleSummary) -> bool {
        self.current == other.current
            && self.projected == other.projected
            && format!("{:.2}", self.velocity) == format!("{:.2}", other.velocity)
    }

    fn needs_alert(&self, target: &TargetRange, thresholds: &AlertThresholds) -> bool {
        (target.is_high(self.projected) && self.velocity >= thresholds.rising_velocity)
            || (target.is_low(self.projected) && self.velocity <= thresholds.falling_velocity)
            || self.velocity.abs() >= thresholds.extreme_velocity
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decision {
    pub regular: Option<String>,
    pub alert: Option<String>,
}

#[derive(Debug, Default)]
pub struct NotificationState {
    previous: Option<CycleSummary>,
}

impl NotificationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous(&self) -> Option<&CycleSummary> {
        self.previous.as_ref()
    }

    /// Decide what to send for `estimate` and replace the stored summary.
    pub fn observe(&mut self, estimate: &Estimate, target: &TargetRange, thresholds: &AlertThresholds) -> Decision {
        let summary = CycleSummary::from_estimate(estimate, self.previous.as_ref());
        let duplicate = self.previous.as_ref().is_some_and(|p| summary.repeats(p));
        let decision = if duplicate {
            Decision::default()
        } else {
            let text = summary.message();
            let alert = summary.needs_alert(target, thresholds).then(|| text.clone());
            Decision {
                regular: Some(text),
                alert,
            }
        };
        self.previous = Some(summary);
        decision
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Regular,
    Alert,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Regular => f.write_str("regular"),
            Channel::Alert => f.write_str("alert"),
        }
    }
}

/// Message sink. Chat transports live outside this crate.
pub trait Notifier {
    fn send(&mut self, channel: Channel, text: &str) -> Result<(), String>;
}

/// Writes messages to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&mut self, channel: Channel, text: &str) -> Result<(), String> {
        match channel {
            Channel::Regular => info!("[{}] {}", channel, text),
            Channel::Alert => warn!("[{}] {}", channel, text),
        }
        Ok(())
    }
}

/// One notifier tick at `now`. Returns the decision, or `None` when the tick
/// was skipped (no data, stale data or not enough history).
pub fn tick(
    conn: &mut SqliteConnection,
    now: MinuteStamp,
    state: &mut NotificationState,
    settings: &NotifySettings,
    notifier: &mut dyn Notifier,
) -> Result<Option<Decision>, CycleError> {
    let Some(latest) = readings::latest_at_or_before(conn, now)? else {
        debug!("No readings yet; skipping notification");
        return Ok(None);
    };
    let age = now.minutes_since(latest.timestamp);
    if age > settings.stale_after_mins {
        warn!("Newest reading is {} min old ({}); skipping notification", age, latest.timestamp);
        return Ok(None);
    }

    let estimate = match Projection::load(conn, latest.timestamp, &settings.projection).and_then(|p| p.estimate()) {
        Ok(estimate) => estimate,
        Err(ProjectionError::InsufficientData { at, detail }) => {
            debug!("Skipping notification at {}: {}", at, detail);
            return Ok(None);
        }
        Err(ProjectionError::Store(e)) => return Err(e.into()),
    };

    let decision = state.observe(&estimate, &settings.projection.target, &settings.thresholds);
    for (channel, text) in [(Channel::Regular, &decision.regular), (Channel::Alert, &decision.alert)] {
        let Some(text) = text else { continue };
        if let Err(e) = notifier.send(channel, text) {
            error!("Sending {} message failed: {}", channel, e);
        }
    }
    Ok(Some(decision))
}
