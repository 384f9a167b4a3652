//! Reading store: one row per minute, merged on every write.

use diesel::prelude::*;
use diesel::SqliteConnection;

use crate::db::connection::StoreError;
use crate::db::models::{Reading, ReadingRow};
use crate::schema;
use crate::timestamp::{MinuteStamp, TimeRange};

use schema::readings::dsl as R;

/// Insert a reading seen for the first time. Fails with
/// [`StoreError::IntegrityConflict`] if the timestamp is already stored.
pub fn insert(conn: &mut SqliteConnection, reading: &Reading) -> Result<(), StoreError> {
    diesel::insert_into(R::readings)
        .values(&reading.to_row())
        .execute(conn)?;
    Ok(())
}

/// Insert or merge. Calling twice with the same reading leaves the row as it
/// was after the first call.
pub fn upsert(conn: &mut SqliteConnection, reading: &Reading) -> Result<Reading, StoreError> {
    conn.immediate_transaction(|conn| {
        let merged = match find(conn, reading.timestamp)? {
            Some(existing) => existing.merged_with(reading),
            None => reading.clone(),
        };
        diesel::replace_into(R::readings)
            .values(&merged.to_row())
            .execute(conn)?;
        Ok(merged)
    })
}

pub fn exists(conn: &mut SqliteConnection, ts: MinuteStamp) -> Result<bool, StoreError> {
    let found = diesel::select(diesel::dsl::exists(R::readings.filter(R::timestamp.eq(ts.to_key()))))
        .get_result::<bool>(conn)?;
    Ok(found)
}

pub fn fetch(conn: &mut SqliteConnection, ts: MinuteStamp) -> Result<Reading, StoreError> {
    find(conn, ts)?.ok_or_else(|| StoreError::NotFound(ts.to_key()))
}

/// Readings in `[start, end)`, newest first.
pub fn fetch_range(conn: &mut SqliteConnection, range: TimeRange) -> Result<Vec<Reading>, StoreError> {
    let rows: Vec<ReadingRow> = R::readings
        .filter(R::timestamp.ge(range.start.to_key()).and(R::timestamp.lt(range.end.to_key())))
        .order(R::timestamp.desc())
        .select(ReadingRow::as_select())
        .load(conn)?;
    rows.into_iter()
        .map(|row| Reading::try_from(row).map_err(StoreError::from))
        .collect()
}

/// Most recent reading with a value at or before `at`.
pub fn latest_at_or_before(conn: &mut SqliteConnection, at: MinuteStamp) -> Result<Option<Reading>, StoreError> {
    let row: Option<ReadingRow> = R::readings
        .filter(R::timestamp.le(at.to_key()).and(R::reading_now.ne(0)))
        .order(R::timestamp.desc())
        .select(ReadingRow::as_select())
        .first(conn)
        .optional()?;
    row.map(Reading::try_from).transpose().map_err(StoreError::from)
}

fn find(conn: &mut SqliteConnection, ts: MinuteStamp) -> Result<Option<Reading>, StoreError> {
    let row: Option<ReadingRow> = R::readings
        .filter(R::timestamp.eq(ts.to_key()))
        .select(ReadingRow::as_select())
        .first(conn)
        .optional()?;
    row.map(Reading::try_from).transpose().map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::open_in_memory;

    fn at(key: &str) -> MinuteStamp {
        MinuteStamp::parse_key(key).unwrap()
    }

    #[test]
    fn fetch_missing_is_not_found() {
        let mut conn = open_in_memory().unwrap();
        let err = fetch(&mut conn, at("2025-03-09 10:00")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!exists(&mut conn, at("2025-03-09 10:00")).unwrap());
    }

    #[test]
    fn duplicate_insert_is_an_integrity_conflict() {
        let mut conn = open_in_memory().unwrap();
        let reading = Reading::new(at("2025-03-09 10:00"), 110);
        insert(&mut conn, &reading).unwrap();
        let err = insert(&mut conn, &reading).unwrap_err();
        assert!(matches!(err, StoreError::IntegrityConflict(_)), "got {err:?}");
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut conn = open_in_memory().unwrap();
        let reading = Reading {
            timestamp: at("2025-03-09 10:00"),
            reading_now: 110,
            reading_20: 118,
            velocity: 0.4,
        };
        let first = upsert(&mut conn, &reading).unwrap();
        let second = upsert(&mut conn, &reading).unwrap();
        assert_eq!(first, second);
        assert_eq!(fetch(&mut conn, reading.timestamp).unwrap(), reading);
    }

    #[test]
    fn upserts_never_regress_non_zero_fields() {
        let mut conn = open_in_memory().unwrap();
        let ts = at("2025-03-09 10:00");
        let writes = [
            Reading::new(ts, 110),
            Reading {
                timestamp: ts,
                reading_now: 0,
                reading_20: 125,
                velocity: 0.75,
            },
            Reading::new(ts, 0),
            Reading {
                timestamp: ts,
                reading_now: 0,
                reading_20: 0,
                velocity: 0.0,
            },
        ];
        for w in &writes {
            upsert(&mut conn, w).unwrap();
            let stored = fetch(&mut conn, ts).unwrap();
            assert_eq!(stored.reading_now, 110);
        }
        let stored = fetch(&mut conn, ts).unwrap();
        assert_eq!(stored.reading_20, 125);
        assert_eq!(stored.velocity, 0.75);
    }

    #[test]
    fn conflicting_non_zero_values_take_the_newest() {
        let mut conn = open_in_memory().unwrap();
        let ts = at("2025-03-09 10:00");
        upsert(&mut conn, &Reading::new(ts, 110)).unwrap();
        upsert(&mut conn, &Reading::new(ts, 112)).unwrap();
        assert_eq!(fetch(&mut conn, ts).unwrap().reading_now, 112);
    }

    #[test]
    fn fetch_range_is_half_open_and_descending() {
        let mut conn = open_in_memory().unwrap();
        let base = at("2025-03-09 10:00");
        // insert out of order to make sure ordering comes from the query
        for offset in [3, 0, 4, 1, 2] {
            insert(&mut conn, &Reading::new(base.plus_minutes(offset), 100 + offset as i32)).unwrap();
        }
        let got = fetch_range(&mut conn, TimeRange::new(base, base.plus_minutes(4))).unwrap();
        let keys: Vec<String> = got.iter().map(|r| r.timestamp.to_key()).collect();
        assert_eq!(
            keys,
            vec!["2025-03-09 10:03", "2025-03-09 10:02", "2025-03-09 10:01", "2025-03-09 10:00"]
        );
        assert!(got.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[test]
    fn latest_skips_empty_values_and_future_rows() {
        let mut conn = open_in_memory().unwrap();
        let base = at("2025-03-09 10:00");
        insert(&mut conn, &Reading::new(base, 101)).unwrap();
        insert(&mut conn, &Reading::new(base.plus_minutes(1), 0)).unwrap();
        insert(&mut conn, &Reading::new(base.plus_minutes(5), 120)).unwrap();
        let got = latest_at_or_before(&mut conn, base.plus_minutes(2)).unwrap().unwrap();
        assert_eq!(got.timestamp, base);
        assert!(latest_at_or_before(&mut conn, base.minus_minutes(1)).unwrap().is_none());
    }
}
