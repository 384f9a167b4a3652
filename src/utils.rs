//! Glucose band helpers shared by the projection engine and the notifier.

use serde::Serialize;

/// Values below this are treated as very low regardless of the target band.
pub const VERY_LOW_BELOW: i32 = 70;
/// Values at or above this are treated as very high regardless of the target band.
pub const VERY_HIGH_FROM: i32 = 200;

/// Target band `[low, high)` in mg/dL.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TargetRange {
    pub low: i32,
    pub high: i32,
}

impl Default for TargetRange {
    fn default() -> Self {
        TargetRange { low: 90, high: 150 }
    }
}

impl TargetRange {
    pub fn contains(&self, value: i32) -> bool {
        value >= self.low && value < self.high
    }

    pub fn is_high(&self, value: i32) -> bool {
        value >= self.high
    }

    pub fn is_low(&self, value: i32) -> bool {
        value < self.low
    }

    pub fn band(&self, value: i32) -> Band {
        if value < VERY_LOW_BELOW.min(self.low) {
            Band::VeryLow
        } else if value < self.low {
            Band::Low
        } else if value < self.high {
            Band::InRange
        } else if value < VERY_HIGH_FROM.max(self.high) {
            Band::High
        } else {
            Band::VeryHigh
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum Band {
    VeryLow,
    Low,
    InRange,
    High,
    VeryHigh,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_edges() {
        let t = TargetRange::default();
        assert_eq!(t.band(69), Band::VeryLow);
        assert_eq!(t.band(70), Band::Low);
        assert_eq!(t.band(90), Band::InRange);
        assert_eq!(t.band(149), Band::InRange);
        assert_eq!(t.band(150), Band::High);
        assert_eq!(t.band(200), Band::VeryHigh);
        assert!(t.is_high(150) && !t.contains(150));
        assert!(t.is_low(89) && !t.contains(89));
    }
}
