//! Plot requests: pick a window around an instant, gather the combined view
//! plus projected points, and hand it to a renderer on a worker thread.

use core::fmt;
use diesel::SqliteConnection;
use log::{debug, info};
use serde::Serialize;
use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use crate::db::annotations;
use crate::db::connection::{self, StoreError};
use crate::db::readings;
use crate::services::combined::{self, CombineError, CombinedRecord};
use crate::services::projection::ProjectionSettings;
use crate::timestamp::{MinuteStamp, TimeRange};
use crate::utils::Band;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotRequest {
    /// Around the newest stored reading.
    Latest,
    /// Around a logged annotation, by row id.
    Annotation(i32),
    At(MinuteStamp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlotWindow {
    pub before_mins: i64,
    pub after_mins: i64,
}

impl PlotWindow {
    pub const DEFAULT: PlotWindow = PlotWindow {
        before_mins: 120,
        after_mins: 20,
    };
    /// Meals are followed for a few hours after the log.
    pub const FOOD: PlotWindow = PlotWindow {
        before_mins: 30,
        after_mins: 240,
    };
}

impl Default for PlotWindow {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug)]
pub enum PlotError {
    NoData,
    Store(StoreError),
    Combine(CombineError),
    Render(String),
}

impl fmt::Display for PlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlotError::NoData => write!(f, "nothing to plot"),
            PlotError::Store(e) => write!(f, "{}", e),
            PlotError::Combine(e) => write!(f, "{}", e),
            PlotError::Render(e) => write!(f, "rendering failed: {}", e),
        }
    }
}

impl Error for PlotError {}

impl From<StoreError> for PlotError {
    fn from(value: StoreError) -> Self {
        PlotError::Store(value)
    }
}

impl From<CombineError> for PlotError {
    fn from(value: CombineError) -> Self {
        PlotError::Combine(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotPoint {
    #[serde(flatten)]
    pub record: CombinedRecord,
    pub band: Option<Band>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedPoint {
    pub timestamp: MinuteStamp,
    pub value: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotData {
    pub center: MinuteStamp,
    pub window: PlotWindow,
    pub target_low: i32,
    pub target_high: i32,
    /// Newest first.
    pub points: Vec<PlotPoint>,
    /// Stored projections placed at the minute they refer to.
    pub projected: Vec<ProjectedPoint>,
}

fn resolve_center(conn: &mut SqliteConnection, request: PlotRequest, now: MinuteStamp) -> Result<MinuteStamp, PlotError> {
    match request {
        PlotRequest::Latest => readings::latest_at_or_before(conn, now)?
            .map(|r| r.timestamp)
            .ok_or(PlotError::NoData),
        PlotRequest::Annotation(id) => Ok(annotations::fetch_by_id(conn, id)?.timestamp),
        PlotRequest::At(ts) => Ok(ts),
    }
}

pub fn build_plot_data(
    conn: &mut SqliteConnection,
    request: PlotRequest,
    window: PlotWindow,
    now: MinuteStamp,
    settings: &ProjectionSettings,
) -> Result<PlotData, PlotError> {
    let center = resolve_center(conn, request, now)?;
    let range = TimeRange::around(center, window.before_mins, window.after_mins);
    let records = combined::combined_range(conn, range)?;
    if records.is_empty() {
        return Err(PlotError::NoData);
    }

    let projected = records
        .iter()
        .filter(|r| r.reading_20 != 0)
        .map(|r| ProjectedPoint {
            timestamp: r.timestamp.plus_minutes(settings.horizon_mins),
            value: r.reading_20,
        })
        .collect();
    let points = records
        .into_iter()
        .map(|record| {
            let band = (record.reading_now != 0).then(|| settings.target.band(record.reading_now));
            PlotPoint { record, band }
        })
        .collect();

    Ok(PlotData {
        center,
        window,
        target_low: settings.target.low,
        target_high: settings.target.high,
        points,
        projected,
    })
}

/// Turns plot data into a file for the message layer to deliver.
pub trait PlotRenderer {
    fn render(&self, data: &PlotData) -> Result<PathBuf, String>;
}

/// Writes the plot data as pretty JSON for an external chart tool.
#[derive(Debug, Clone)]
pub struct JsonRenderer {
    pub output_dir: PathBuf,
}

impl PlotRenderer for JsonRenderer {
    fn render(&self, data: &PlotData) -> Result<PathBuf, String> {
        let name = format!("plot-{}.json", data.center.naive().format("%Y%m%d-%H%M"));
        let path = self.output_dir.join(name);
        let file = File::create(&path).map_err(|e| format!("create {}: {}", path.display(), e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), data)
            .map_err(|e| format!("write {}: {}", path.display(), e))?;
        Ok(path)
    }
}

/// Database access for a plot worker.
#[derive(Debug, Clone)]
pub struct PlotJob {
    pub database_path: String,
    pub busy_timeout: Duration,
    pub settings: ProjectionSettings,
}

/// Build and render on a separate thread with its own connection. The result
/// is reported through `on_done`; nobody waits for it.
pub fn spawn_plot<R, F>(
    job: PlotJob,
    request: PlotRequest,
    window: PlotWindow,
    renderer: R,
    on_done: F,
) -> thread::JoinHandle<()>
where
    R: PlotRenderer + Send + 'static,
    F: FnOnce(Result<PathBuf, PlotError>) + Send + 'static,
{
    thread::spawn(move || {
        let result = run_plot_job(&job, request, window, &renderer);
        if let Ok(path) = &result {
            info!("Plot written to {}", path.display());
        }
        on_done(result);
    })
}

fn run_plot_job(
    job: &PlotJob,
    request: PlotRequest,
    window: PlotWindow,
    renderer: &dyn PlotRenderer,
) -> Result<PathBuf, PlotError> {
    let mut conn = connection::open(&job.database_path, job.busy_timeout)?;
    let data = build_plot_data(&mut conn, request, window, MinuteStamp::now(), &job.settings)?;
    debug!("Plot {:?}: {} point(s) around {}", request, data.points.len(), data.center);
    renderer.render(&data).map_err(PlotError::Render)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connection::open_in_memory;
    use crate::db::models::{Annotation, Reading};
    use std::sync::mpsc;

    fn base() -> MinuteStamp {
        MinuteStamp::parse_key("2025-03-09 12:00").unwrap()
    }

    fn seed(conn: &mut SqliteConnection) -> i32 {
        for i in 0..200 {
            let ts = base().minus_minutes(i);
            readings::upsert(
                conn,
                &Reading {
                    timestamp: ts,
                    reading_now: 140,
                    reading_20: 150,
                    velocity: 0.5,
                },
            )
            .unwrap();
        }
        annotations::record(conn, &Annotation::new(base().minus_minutes(150)).with_food("rice"))
            .unwrap()
            .id
    }

    #[test]
    fn latest_uses_default_window_around_newest_reading() {
        let mut conn = open_in_memory().unwrap();
        seed(&mut conn);
        let settings = ProjectionSettings::default();
        let data = build_plot_data(&mut conn, PlotRequest::Latest, PlotWindow::DEFAULT, base().plus_minutes(5), &settings)
            .unwrap();
        assert_eq!(data.center, base());
        assert_eq!(data.points.len(), 121);
        assert_eq!(data.points[0].band, Some(Band::InRange));
        assert_eq!(data.projected[0].timestamp, base().plus_minutes(20));
    }

    #[test]
    fn annotation_request_centers_on_the_logged_minute() {
        let mut conn = open_in_memory().unwrap();
        let id = seed(&mut conn);
        let settings = ProjectionSettings::default();
        let data = build_plot_data(&mut conn, PlotRequest::Annotation(id), PlotWindow::FOOD, base(), &settings).unwrap();
        assert_eq!(data.center, base().minus_minutes(150));
        // 30 before the meal, then up to the newest reading 150 after it
        assert_eq!(data.points.len(), 181);
        let meal = data.points.iter().find(|p| p.record.annotation_id == Some(id)).unwrap();
        assert_eq!(meal.record.food_note, "rice");
    }

    #[test]
    fn explicit_time_centers_on_that_minute() {
        let mut conn = open_in_memory().unwrap();
        seed(&mut conn);
        let settings = ProjectionSettings::default();
        let at = base().minus_minutes(60);
        let data = build_plot_data(&mut conn, PlotRequest::At(at), PlotWindow::DEFAULT, base(), &settings).unwrap();
        assert_eq!(data.center, at);
        // 120 before plus the centre and 20 after
        assert_eq!(data.points.len(), 141);
        assert_eq!(data.points[0].record.timestamp, at.plus_minutes(20));
    }

    #[test]
    fn unknown_annotation_and_empty_store_fail() {
        let mut conn = open_in_memory().unwrap();
        let settings = ProjectionSettings::default();
        assert!(matches!(
            build_plot_data(&mut conn, PlotRequest::Latest, PlotWindow::DEFAULT, base(), &settings),
            Err(PlotError::NoData)
        ));
        assert!(matches!(
            build_plot_data(&mut conn, PlotRequest::Annotation(9), PlotWindow::DEFAULT, base(), &settings),
            Err(PlotError::Store(StoreError::NotFound(_)))
        ));
    }

    #[test]
    fn worker_renders_json_and_reports_back() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("plot.sqlite");
        let db_path = db_path.to_str().unwrap().to_string();
        let now = MinuteStamp::now();
        {
            let mut conn = connection::open(&db_path, Duration::from_millis(500)).unwrap();
            readings::insert(&mut conn, &Reading::new(now.minus_minutes(1), 111)).unwrap();
        }

        let job = PlotJob {
            database_path: db_path,
            busy_timeout: Duration::from_millis(500),
            settings: ProjectionSettings::default(),
        };
        let renderer = JsonRenderer {
            output_dir: dir.path().to_path_buf(),
        };
        let (tx, rx) = mpsc::channel();
        spawn_plot(job, PlotRequest::Latest, PlotWindow::DEFAULT, renderer, move |result| {
            let _ = tx.send(result);
        })
        .join()
        .unwrap();

        let path = rx.recv().unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["points"][0]["reading_now"], 111);
        assert_eq!(json["points"][0]["band"], "InRange");
        assert_eq!(json["center"], now.minus_minutes(1).to_key());
    }
}
