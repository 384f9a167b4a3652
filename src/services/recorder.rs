//! Caller-side annotation policies on top of the annotation store.

use diesel::SqliteConnection;
use log::info;

use crate::db::annotations::{self, AnnotationRef};
use crate::db::connection::StoreError;
use crate::db::models::Annotation;
use crate::timestamp::{MinuteStamp, TimeRange};

pub const DEFAULT_INSULIN_WINDOW_MINS: i64 = 120;
pub const DEFAULT_FOOD_SEARCH_HOURS: i64 = 4;
/// Largest single dose accepted from user input.
pub const MAX_INSULIN_UNITS: i32 = 100;

/// Credit `units` to each of the `window_mins` minutes starting at `at`
/// (flat, then cut off). The first minute also carries a `"{units}u-added"`
/// note. Returns the annotation stored at `at`.
pub fn record_insulin(
    conn: &mut SqliteConnection,
    at: MinuteStamp,
    units: i32,
    window_mins: i64,
) -> Result<Annotation, StoreError> {
    if !(1..=MAX_INSULIN_UNITS).contains(&units) {
        return Err(StoreError::InvalidValue(format!(
            "dose of {}u outside 1..={}",
            units, MAX_INSULIN_UNITS
        )));
    }
    let window_mins = window_mins.max(1);
    let first = conn.immediate_transaction(|conn| {
        let first = annotations::merge_in(
            conn,
            &Annotation::new(at)
                .with_insulin(units)
                .with_misc(format!("{}u-added", units)),
        )?;
        for offset in 1..window_mins {
            annotations::merge_in(conn, &Annotation::new(at.plus_minutes(offset)).with_insulin(units))?;
        }
        Ok::<_, StoreError>(first)
    })?;
    info!("Recorded {}u insulin at {} over {} min", units, at, window_mins);
    Ok(first)
}

pub fn record_food(conn: &mut SqliteConnection, at: MinuteStamp, text: &str) -> Result<Annotation, StoreError> {
    let stored = annotations::record(conn, &Annotation::new(at).with_food(text))?;
    info!("Recorded food at {}: {}", at, stored.food_note);
    Ok(stored)
}

pub fn record_misc(conn: &mut SqliteConnection, at: MinuteStamp, text: &str) -> Result<Annotation, StoreError> {
    let stored = annotations::record(conn, &Annotation::new(at).with_misc(text))?;
    info!("Recorded note at {}: {}", at, stored.misc_note);
    Ok(stored)
}

/// Food logs matching `needle` within the last `hours` hours before `now`.
pub fn find_food(
    conn: &mut SqliteConnection,
    now: MinuteStamp,
    needle: &str,
    hours: i64,
) -> Result<Vec<AnnotationRef>, StoreError> {
    annotations::search_food(conn, needle, TimeRange::ending_at(now, hours * 60))
}
