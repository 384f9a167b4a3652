//! Ingestion reconciler: turns overlapping source snapshots into exactly-once
//! writes to the reading store.
//!
//! Each cycle diffs the fetched timestamps against the previous cycle's fetch
//! (not the store), commits the new ones oldest first and fills in their
//! projection right after.

use core::fmt;
use diesel::SqliteConnection;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::error::Error;

use crate::client::{ClientError, ReadingSource};
use crate::db::connection::StoreError;
use crate::db::models::Reading;
use crate::db::readings;
use crate::services::projection::{Projection, ProjectionError, ProjectionSettings};
use crate::timestamp::MinuteStamp;

/// Failure of one poll or notify cycle.
#[derive(Debug)]
pub enum CycleError {
    Remote(ClientError),
    Store(StoreError),
}

impl CycleError {
    /// Errors that retrying on the next tick cannot fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            CycleError::Remote(e) => e.is_fatal(),
            CycleError::Store(StoreError::InvalidTimestamp(_)) => true,
            CycleError::Store(StoreError::Migration(_)) => true,
            CycleError::Store(_) => false,
        }
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleError::Remote(e) => write!(f, "remote source: {}", e),
            CycleError::Store(e) => write!(f, "store: {}", e),
        }
    }
}

impl Error for CycleError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CycleError::Remote(e) => Some(e),
            CycleError::Store(e) => Some(e),
        }
    }
}

impl From<ClientError> for CycleError {
    fn from(value: ClientError) -> Self {
        CycleError::Remote(value)
    }
}

impl From<StoreError> for CycleError {
    fn from(value: StoreError) -> Self {
        CycleError::Store(value)
    }
}

pub struct Reconciler<S: ReadingSource> {
    source: S,
    settings: ProjectionSettings,
    /// Timestamps fetched by the last successful cycle; `None` before the first.
    previous: Option<BTreeSet<MinuteStamp>>,
}

impl<S: ReadingSource> Reconciler<S> {
    pub fn new(source: S, settings: ProjectionSettings) -> Self {
        Reconciler {
            source,
            settings,
            previous: None,
        }
    }

    /// Fetch once and commit every timestamp not seen by the previous cycle.
    /// Returns the timestamps actually written by this cycle.
    pub fn poll_once(&mut self, conn: &mut SqliteConnection) -> Result<BTreeSet<MinuteStamp>, CycleError> {
        let snapshot = self.source.fetch()?;
        let fetched = snapshot.merged();
        let current: BTreeSet<MinuteStamp> = fetched.keys().copied().collect();

        let mut committed = BTreeSet::new();
        // BTreeMap iteration is oldest to newest
        for (ts, value) in &fetched {
            if self.previous.as_ref().is_some_and(|prev| prev.contains(ts)) {
                continue;
            }
            match readings::insert(conn, &Reading::new(*ts, *value)) {
                Ok(()) => {}
                Err(StoreError::IntegrityConflict(msg)) => {
                    warn!("Reading at {} already stored, skipping ({})", ts, msg);
                    // an earlier cycle may have died between insert and projection
                    if readings::fetch(conn, *ts)?.reading_20 == 0 {
                        self.fill_projection(conn, *ts)?;
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            self.fill_projection(conn, *ts)?;
            committed.insert(*ts);
        }

        if self.previous.is_none() {
            info!("First cycle: committed {} of {} fetched reading(s)", committed.len(), current.len());
        } else if !committed.is_empty() {
            debug!("Committed {} new reading(s)", committed.len());
        }
        self.previous = Some(current);
        Ok(committed)
    }

    fn fill_projection(&self, conn: &mut SqliteConnection, ts: MinuteStamp) -> Result<(), CycleError> {
        let estimate = match Projection::load(conn, ts, &self.settings).and_then(|p| p.estimate()) {
            Ok(estimate) => estimate,
            Err(ProjectionError::InsufficientData { at, detail }) => {
                debug!("No projection at {}: {}", at, detail);
                return Ok(());
            }
            Err(ProjectionError::Store(e)) => return Err(e.into()),
        };
        readings::upsert(
            conn,
            &Reading {
                timestamp: ts,
                reading_now: 0,
                reading_20: estimate.projected,
                velocity: estimate.velocity,
            },
        )?;
        Ok(())
    }
}
