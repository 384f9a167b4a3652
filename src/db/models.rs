//! Diesel row structs and the domain records built from them.
//!
//! Rows carry the persisted text key; domain records carry a parsed
//! [`MinuteStamp`]. Conversion from a row fails only when the stored key is
//! malformed, which indicates a corrupted database.

use diesel::prelude::*;
use serde::Serialize;

use crate::schema;
use crate::timestamp::{MinuteStamp, TimestampError};

#[derive(Debug, Clone, PartialEq, Queryable, Selectable, Insertable)]
#[diesel(table_name = schema::readings, check_for_backend(diesel::sqlite::Sqlite))]
pub struct ReadingRow {
    pub timestamp: String,
    pub reading_now: i32,
    pub reading_20: i32,
    pub velocity: f64,
}

#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = schema::annotations, check_for_backend(diesel::sqlite::Sqlite))]
pub struct AnnotationRow {
    pub id: i32,
    pub timestamp: String,
    pub ins_units: i32,
    pub food_note: String,
    pub misc_note: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::annotations)]
pub struct NewAnnotationRow<'a> {
    pub timestamp: &'a str,
    pub ins_units: i32,
    pub food_note: &'a str,
    pub misc_note: &'a str,
}

/// One device sample. Zero in any field means "not known yet".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub timestamp: MinuteStamp,
    pub reading_now: i32,
    pub reading_20: i32,
    pub velocity: f64,
}

impl Reading {
    pub fn new(timestamp: MinuteStamp, reading_now: i32) -> Self {
        Reading {
            timestamp,
            reading_now,
            reading_20: 0,
            velocity: 0.0,
        }
    }

    /// Merge a newer write into this (stored) reading.
    ///
    /// Per field: a zero never replaces a non-zero, and a non-zero newer value
    /// replaces whatever was stored, including a different non-zero value.
    pub fn merged_with(&self, newer: &Reading) -> Reading {
        Reading {
            timestamp: self.timestamp,
            reading_now: if newer.reading_now != 0 {
                newer.reading_now
            } else {
                self.reading_now
            },
            reading_20: if newer.reading_20 != 0 {
                newer.reading_20
            } else {
                self.reading_20
            },
            velocity: if newer.velocity != 0.0 {
                newer.velocity
            } else {
                self.velocity
            },
        }
    }

    pub fn to_row(&self) -> ReadingRow {
        ReadingRow {
            timestamp: self.timestamp.to_key(),
            reading_now: self.reading_now,
            reading_20: self.reading_20,
            velocity: self.velocity,
        }
    }
}

impl TryFrom<ReadingRow> for Reading {
    type Error = TimestampError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        Ok(Reading {
            timestamp: MinuteStamp::parse_key(&row.timestamp)?,
            reading_now: row.reading_now,
            reading_20: row.reading_20,
            velocity: row.velocity,
        })
    }
}

/// A manually logged event. `id` is 0 until the row has been stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Annotation {
    pub id: i32,
    pub timestamp: MinuteStamp,
    pub ins_units: i32,
    pub food_note: String,
    pub misc_note: String,
}

impl Annotation {
    pub fn new(timestamp: MinuteStamp) -> Self {
        Annotation {
            id: 0,
            timestamp,
            ins_units: 0,
            food_note: String::new(),
            misc_note: String::new(),
        }
    }

    pub fn with_insulin(mut self, units: i32) -> Self {
        self.ins_units = units;
        self
    }

    pub fn with_food(mut self, text: impl Into<String>) -> Self {
        self.food_note = text.into();
        self
    }

    pub fn with_misc(mut self, text: impl Into<String>) -> Self {
        self.misc_note = text.into();
        self
    }

    /// Additive merge: insulin sums, notes are unioned. Keeps this row's id.
    /// `None` when the insulin total does not fit.
    pub fn merged_with(&self, incoming: &Annotation) -> Option<Annotation> {
        Some(Annotation {
            id: self.id,
            timestamp: self.timestamp,
            ins_units: self.ins_units.checked_add(incoming.ins_units)?,
            food_note: union_notes(&self.food_note, &incoming.food_note),
            misc_note: union_notes(&self.misc_note, &incoming.misc_note),
        })
    }
}

impl TryFrom<AnnotationRow> for Annotation {
    type Error = TimestampError;

    fn try_from(row: AnnotationRow) -> Result<Self, Self::Error> {
        Ok(Annotation {
            id: row.id,
            timestamp: MinuteStamp::parse_key(&row.timestamp)?,
            ins_units: row.ins_units,
            food_note: row.food_note,
            misc_note: row.misc_note,
        })
    }
}

/// Comma-joined union of two note fields. Blank entries are dropped and
/// duplicates (after trimming) are kept once.
pub fn union_notes(existing: &str, incoming: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in existing.split(',').chain(incoming.split(',')) {
        let part = part.trim();
        if !part.is_empty() && !parts.contains(&part) {
            parts.push(part);
        }
    }
    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> MinuteStamp {
        MinuteStamp::parse_key("2025-03-09 21:30").unwrap()
    }

    #[test]
    fn zero_never_overwrites_non_zero() {
        let stored = Reading {
            timestamp: ts(),
            reading_now: 120,
            reading_20: 131,
            velocity: 0.55,
        };
        let merged = stored.merged_with(&Reading::new(ts(), 0));
        assert_eq!(merged, stored);
    }

    #[test]
    fn newest_non_zero_wins() {
        let stored = Reading {
            timestamp: ts(),
            reading_now: 120,
            reading_20: 131,
            velocity: 0.55,
        };
        let newer = Reading {
            timestamp: ts(),
            reading_now: 0,
            reading_20: 140,
            velocity: 1.0,
        };
        let merged = stored.merged_with(&newer);
        assert_eq!(merged.reading_now, 120);
        assert_eq!(merged.reading_20, 140);
        assert_eq!(merged.velocity, 1.0);
    }

    #[test]
    fn notes_union_without_duplicates() {
        assert_eq!(union_notes("", "bread"), "bread");
        assert_eq!(union_notes("bread", "bread"), "bread");
        assert_eq!(union_notes("bread, jam", "jam,tea"), "bread,jam,tea");
        assert_eq!(union_notes("bread", " , "), "bread");
    }

    #[test]
    fn annotation_merge_is_additive() {
        let stored = Annotation::new(ts()).with_insulin(3).with_food("rice");
        let merged = stored
            .merged_with(&Annotation::new(ts()).with_insulin(5).with_misc("walk"))
            .unwrap();
        assert_eq!(merged.ins_units, 8);
        assert_eq!(merged.food_note, "rice");
        assert_eq!(merged.misc_note, "walk");
    }

    #[test]
    fn insulin_sum_that_does_not_fit_is_refused() {
        let stored = Annotation::new(ts()).with_insulin(2_000_000_000);
        assert_eq!(stored.merged_with(&Annotation::new(ts()).with_insulin(2_000_000_000)), None);
        assert!(stored.merged_with(&Annotation::new(ts()).with_insulin(5)).is_some());
    }

    #[test]
    fn malformed_row_key_is_rejected() {
        let row = ReadingRow {
            timestamp: "not a time".into(),
            reading_now: 100,
            reading_20: 0,
            velocity: 0.0,
        };
        assert!(Reading::try_from(row).is_err());
    }
}
