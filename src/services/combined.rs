//! Combined view: readings and annotations merged per minute, newest first.

use core::fmt;
use diesel::SqliteConnection;
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::error::Error;

use crate::db::annotations;
use crate::db::connection::StoreError;
use crate::db::models::{Annotation, Reading};
use crate::db::readings;
use crate::timestamp::{MinuteStamp, TimeRange};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedRecord {
    pub timestamp: MinuteStamp,
    pub reading_now: i32,
    pub reading_20: i32,
    pub velocity: f64,
    pub annotation_id: Option<i32>,
    pub ins_units: i32,
    pub food_note: String,
    pub misc_note: String,
}

#[derive(Debug)]
pub enum CombineError {
    /// A source row does not belong to the record built for its minute.
    Mismatch { record: MinuteStamp, source: MinuteStamp },
    /// The same minute appears twice in one input.
    Duplicate(MinuteStamp),
    Store(StoreError),
}

impl fmt::Display for CombineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CombineError::Mismatch { record, source } => {
                write!(f, "record at {} built from a row at {}", record, source)
            }
            CombineError::Duplicate(ts) => write!(f, "duplicate input row at {}", ts),
            CombineError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl Error for CombineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CombineError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for CombineError {
    fn from(value: StoreError) -> Self {
        CombineError::Store(value)
    }
}

impl CombinedRecord {
    /// Build the record for `timestamp` from whichever sides exist.
    pub fn from_parts(
        timestamp: MinuteStamp,
        reading: Option<&Reading>,
        annotation: Option<&Annotation>,
    ) -> Result<Self, CombineError> {
        let mut record = CombinedRecord {
            timestamp,
            reading_now: 0,
            reading_20: 0,
            velocity: 0.0,
            annotation_id: None,
            ins_units: 0,
            food_note: String::new(),
            misc_note: String::new(),
        };
        if let Some(r) = reading {
            if r.timestamp != timestamp {
                return Err(CombineError::Mismatch {
                    record: timestamp,
                    source: r.timestamp,
                });
            }
            record.reading_now = r.reading_now;
            record.reading_20 = r.reading_20;
            record.velocity = r.velocity;
        }
        if let Some(a) = annotation {
            if a.timestamp != timestamp {
                return Err(CombineError::Mismatch {
                    record: timestamp,
                    source: a.timestamp,
                });
            }
            record.annotation_id = Some(a.id);
            record.ins_units = a.ins_units;
            record.food_note = a.food_note.clone();
            record.misc_note = a.misc_note.clone();
        }
        Ok(record)
    }
}

fn index_by_minute<'a, T>(
    rows: &'a [T],
    key: impl Fn(&T) -> MinuteStamp,
) -> Result<BTreeMap<MinuteStamp, &'a T>, CombineError> {
    let mut map = BTreeMap::new();
    for row in rows {
        match map.entry(key(row)) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(slot) => return Err(CombineError::Duplicate(*slot.key())),
        }
    }
    Ok(map)
}

/// One record per distinct minute of either input, newest first.
pub fn combine(readings: &[Reading], annotations: &[Annotation]) -> Result<Vec<CombinedRecord>, CombineError> {
    let by_reading = index_by_minute(readings, |r| r.timestamp)?;
    let by_annotation = index_by_minute(annotations, |a| a.timestamp)?;

    let mut keys: Vec<MinuteStamp> = by_reading.keys().chain(by_annotation.keys()).copied().collect();
    keys.sort_unstable_by(|a, b| b.cmp(a));
    keys.dedup();

    keys.into_iter()
        .map(|ts| CombinedRecord::from_parts(ts, by_reading.get(&ts).copied(), by_annotation.get(&ts).copied()))
        .collect()
}

/// Load both stores over `range` and combine them.
pub fn combined_range(conn: &mut SqliteConnection, range: TimeRange) -> Result<Vec<CombinedRecord>, CombineError> {
    let readings = readings::fetch_range(conn, range)?;
    let annotations = annotations::fetch_range(conn, range)?;
    combine(&readings, &annotations)
}
