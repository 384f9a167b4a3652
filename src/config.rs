//! Minimal runtime configuration helpers.
//! Defaults match a single-user setup with the database next to the binary.

use std::num::NonZeroU32;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::utils::TargetRange;

pub const DEFAULT_DATABASE_PATH: &str = "cgm-sentinel.sqlite";
pub const DEFAULT_API_URL: &str = "https://api.libreview.io";
pub const DEFAULT_CLIENT_VERSION: &str = "4.12.0";
pub const DEFAULT_POLL_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Libre { email: String, password: String },
    /// Seeded generator, no network.
    Synthetic { seed: u64 },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    /// How long a connection waits on a locked database.
    pub busy_timeout: Duration,
    pub source: SourceKind,
    pub api_url: String,
    /// App version reported to the CGM API; old versions get rejected.
    pub client_version: String,
    pub poll_interval: Duration,
    pub notify_interval: Duration,
    pub max_request_retries: NonZeroU32,
    pub target: TargetRange,
    pub stale_after_mins: i64,
    pub insulin_window_mins: i64,
    pub plot_output_dir: PathBuf,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match var(name) {
        Some(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| format!("{} must be a number, got {:?}", name, s)),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let database_path = var("DATABASE_PATH").unwrap_or_else(|| DEFAULT_DATABASE_PATH.to_string());
        let busy_timeout = Duration::from_millis(parse_var("DB_BUSY_TIMEOUT_MS", 6000u64)?);

        let source = match var("CGM_SOURCE").as_deref().map(str::trim) {
            None | Some("libre") => SourceKind::Libre {
                email: var("CGM_EMAIL").ok_or("Missing CGM_EMAIL (required when CGM_SOURCE=libre)")?,
                password: var("CGM_PASSWORD").ok_or("Missing CGM_PASSWORD (required when CGM_SOURCE=libre)")?,
            },
            Some("synthetic") => SourceKind::Synthetic {
                seed: parse_var("SYNTHETIC_SEED", 0x5eed_u64)?,
            },
            Some(other) => return Err(format!("CGM_SOURCE must be libre or synthetic, got {:?}", other)),
        };

        let max_request_retries = NonZeroU32::new(parse_var("MAX_REQUEST_RETRIES", 3u32)?)
            .ok_or("MAX_REQUEST_RETRIES must be at least 1")?;

        let target = TargetRange {
            low: parse_var("TARGET_LOW", TargetRange::default().low)?,
            high: parse_var("TARGET_HIGH", TargetRange::default().high)?,
        };
        if target.low >= target.high {
            return Err(format!("TARGET_LOW ({}) must be below TARGET_HIGH ({})", target.low, target.high));
        }

        Ok(Config {
            database_path,
            busy_timeout,
            source,
            api_url: var("CGM_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            client_version: var("CGM_CLIENT_VERSION").unwrap_or_else(|| DEFAULT_CLIENT_VERSION.to_string()),
            poll_interval: Duration::from_secs(parse_var("POLL_INTERVAL_SECS", DEFAULT_POLL_SECS)?),
            notify_interval: Duration::from_secs(parse_var("NOTIFY_INTERVAL_SECS", DEFAULT_POLL_SECS)?),
            max_request_retries,
            target,
            stale_after_mins: parse_var("STALE_AFTER_MINS", 15i64)?,
            insulin_window_mins: parse_var("INSULIN_WINDOW_MINS", 120i64)?,
            plot_output_dir: PathBuf::from(var("PLOT_OUTPUT_DIR").unwrap_or_else(|| ".".to_string())),
        })
    }
}
