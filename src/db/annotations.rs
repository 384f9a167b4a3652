//! Annotation store: manually logged insulin, food and notes.
//!
//! Writes never overwrite: a second log for the same minute is merged into
//! the existing row (see [`Annotation::merged_with`]).

use diesel::prelude::*;
use diesel::SqliteConnection;
use serde::Serialize;

use crate::db::connection::StoreError;
use crate::db::models::{Annotation, AnnotationRow, NewAnnotationRow};
use crate::schema;
use crate::timestamp::{MinuteStamp, TimeRange};

use schema::annotations::dsl as A;

/// Pointer to a stored annotation, handed out by searches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnnotationRef {
    pub id: i32,
    pub timestamp: MinuteStamp,
    pub food_note: String,
}

/// Create or additively merge the annotation for its minute.
pub fn record(conn: &mut SqliteConnection, annotation: &Annotation) -> Result<Annotation, StoreError> {
    conn.immediate_transaction(|conn| merge_in(conn, annotation))
}

/// Merge without opening a transaction; callers batching several minutes
/// wrap the whole batch in one.
pub(crate) fn merge_in(conn: &mut SqliteConnection, incoming: &Annotation) -> Result<Annotation, StoreError> {
    let key = incoming.timestamp.to_key();
    match find(conn, incoming.timestamp)? {
        None => {
            let fresh = merge(&Annotation::new(incoming.timestamp), incoming)?;
            diesel::insert_into(A::annotations)
                .values(&NewAnnotationRow {
                    timestamp: &key,
                    ins_units: fresh.ins_units,
                    food_note: &fresh.food_note,
                    misc_note: &fresh.misc_note,
                })
                .execute(conn)?;
        }
        Some(existing) => {
            let merged = merge(&existing, incoming)?;
            diesel::update(A::annotations.filter(A::id.eq(existing.id)))
                .set((
                    A::ins_units.eq(merged.ins_units),
                    A::food_note.eq(&merged.food_note),
                    A::misc_note.eq(&merged.misc_note),
                ))
                .execute(conn)?;
        }
    }
    fetch(conn, incoming.timestamp)
}

pub fn fetch(conn: &mut SqliteConnection, ts: MinuteStamp) -> Result<Annotation, StoreError> {
    find(conn, ts)?.ok_or_else(|| StoreError::NotFound(ts.to_key()))
}

pub fn fetch_by_id(conn: &mut SqliteConnection, id: i32) -> Result<Annotation, StoreError> {
    let row: Option<AnnotationRow> = A::annotations
        .filter(A::id.eq(id))
        .select(AnnotationRow::as_select())
        .first(conn)
        .optional()?;
    match row {
        Some(row) => Ok(Annotation::try_from(row)?),
        None => Err(StoreError::NotFound(format!("annotation #{}", id))),
    }
}

/// Annotations in `[start, end)`, newest first.
pub fn fetch_range(conn: &mut SqliteConnection, range: TimeRange) -> Result<Vec<Annotation>, StoreError> {
    let rows: Vec<AnnotationRow> = A::annotations
        .filter(A::timestamp.ge(range.start.to_key()).and(A::timestamp.lt(range.end.to_key())))
        .order(A::timestamp.desc())
        .select(AnnotationRow::as_select())
        .load(conn)?;
    rows.into_iter()
        .map(|row| Annotation::try_from(row).map_err(StoreError::from))
        .collect()
}

/// Food annotations in `range` whose text contains `needle`
/// (case-insensitive), newest first. An empty needle matches every food log.
pub fn search_food(
    conn: &mut SqliteConnection,
    needle: &str,
    range: TimeRange,
) -> Result<Vec<AnnotationRef>, StoreError> {
    let needle = needle.trim().to_lowercase();
    let rows: Vec<AnnotationRow> = A::annotations
        .filter(A::timestamp.ge(range.start.to_key()).and(A::timestamp.lt(range.end.to_key())))
        .filter(A::food_note.ne(""))
        .order(A::timestamp.desc())
        .select(AnnotationRow::as_select())
        .load(conn)?;

    let mut found = Vec::new();
    for row in rows {
        if needle.is_empty() || row.food_note.to_lowercase().contains(&needle) {
            let annotation = Annotation::try_from(row)?;
            found.push(AnnotationRef {
                id: annotation.id,
                timestamp: annotation.timestamp,
                food_note: annotation.food_note,
            });
        }
    }
    Ok(found)
}

fn merge(existing: &Annotation, incoming: &Annotation) -> Result<Annotation, StoreError> {
    existing.merged_with(incoming).ok_or_else(|| {
        StoreError::InvalidValue(format!(
            "insulin at {} overflows ({}u + {}u)",
            existing.timestamp, existing.ins_units, incoming.ins_units
        ))
    })
}

fn find(conn: &mut SqliteConnection, ts: MinuteStamp) -> Result<Option<Annotation>, StoreError> {
    let row: Option<AnnotationRow> = A::annotations
        .filter(A::timestamp.eq(ts.to_key()))
        .select(AnnotationRow::as_select())
        .first(conn)
        .optional()?;
    row.map(Annotation::try_from).transpose().map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::open_in_memory;

    fn at(key: &str) -> MinuteStamp {
        MinuteStamp::parse_key(key).unwrap()
    }

    #[test]
    fn insulin_logged_twice_in_a_minute_adds_up() {
        let mut conn = open_in_memory().unwrap();
        let ts = at("2025-03-09 08:15");
        record(&mut conn, &Annotation::new(ts).with_insulin(3)).unwrap();
        record(&mut conn, &Annotation::new(ts).with_insulin(5)).unwrap();
        assert_eq!(fetch(&mut conn, ts).unwrap().ins_units, 8);
    }

    #[test]
    fn overflowing_insulin_total_is_rejected_and_leaves_the_row_alone() {
        let mut conn = open_in_memory().unwrap();
        let ts = at("2025-03-09 08:15");
        record(&mut conn, &Annotation::new(ts).with_insulin(2_000_000_000)).unwrap();
        let err = record(&mut conn, &Annotation::new(ts).with_insulin(2_000_000_000)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue(_)), "got {err:?}");
        assert_eq!(fetch(&mut conn, ts).unwrap().ins_units, 2_000_000_000);
    }

    #[test]
    fn notes_are_unioned_not_overwritten() {
        let mut conn = open_in_memory().unwrap();
        let ts = at("2025-03-09 08:15");
        record(&mut conn, &Annotation::new(ts).with_food("toast")).unwrap();
        record(&mut conn, &Annotation::new(ts).with_food("coffee").with_misc("run")).unwrap();
        let stored = record(&mut conn, &Annotation::new(ts).with_food("toast")).unwrap();
        assert_eq!(stored.food_note, "toast,coffee");
        assert_eq!(stored.misc_note, "run");
    }

    #[test]
    fn row_identifier_is_stable_across_merges() {
        let mut conn = open_in_memory().unwrap();
        let ts = at("2025-03-09 08:15");
        let first = record(&mut conn, &Annotation::new(ts).with_food("toast")).unwrap();
        let second = record(&mut conn, &Annotation::new(ts).with_insulin(2)).unwrap();
        assert!(first.id > 0);
        assert_eq!(first.id, second.id);
        assert_eq!(fetch_by_id(&mut conn, first.id).unwrap().timestamp, ts);
        assert!(matches!(fetch_by_id(&mut conn, first.id + 100), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn range_is_descending_and_search_is_case_insensitive() {
        let mut conn = open_in_memory().unwrap();
        let base = at("2025-03-09 08:00");
        record(&mut conn, &Annotation::new(base).with_food("Bread")).unwrap();
        record(&mut conn, &Annotation::new(base.plus_minutes(30)).with_misc("walk")).unwrap();
        record(&mut conn, &Annotation::new(base.plus_minutes(60)).with_food("bread, butter")).unwrap();

        let range = TimeRange::new(base, base.plus_minutes(61));
        let all = fetch_range(&mut conn, range).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp > w[1].timestamp));

        let hits = search_food(&mut conn, "bread", range).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].timestamp, base.plus_minutes(60));

        let any_food = search_food(&mut conn, "", range).unwrap();
        assert_eq!(any_food.len(), 2);
        assert!(search_food(&mut conn, "rice", range).unwrap().is_empty());
    }
}
