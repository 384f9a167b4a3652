pub mod models {
    pub mod libre;
}

pub mod client;
pub mod config;
pub mod db {
    pub mod annotations;
    pub mod connection;
    pub mod models;
    pub mod readings;
}
pub mod schema;
pub mod timestamp;
pub mod utils;
pub mod services {
    pub mod cadence;
    pub mod combined;
    pub mod conversation;
    pub mod notify;
    pub mod plot;
    pub mod projection;
    pub mod reconcile;
    pub mod recorder;
    pub mod synthetic;
}

use crate::client::{LibreClient, LibreSettings, ReadingSource};
use crate::config::{Config, SourceKind};
use crate::services::conversation::{Conversations, Reply};
use crate::services::notify::{LogNotifier, NotificationState, NotifySettings};
use crate::services::plot::{JsonRenderer, PlotJob};
use crate::services::projection::ProjectionSettings;
use crate::services::reconcile::Reconciler;
use crate::services::synthetic::SyntheticSource;
use crate::services::{cadence, notify, plot};
use crate::timestamp::MinuteStamp;
use diesel::SqliteConnection;
use log::{error, info};
use std::io::BufRead;
use std::path::PathBuf;

#[derive(Debug)]
struct LoadedEnvFile {
    path: PathBuf,
    explicit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Poll and notify in one loop.
    Watch,
    Ingest,
    Notify,
    /// Read commands from stdin.
    Console,
}

impl Role {
    fn parse(s: &str) -> Option<Role> {
        match s {
            "watch" => Some(Role::Watch),
            "ingest" => Some(Role::Ingest),
            "notify" => Some(Role::Notify),
            "console" => Some(Role::Console),
            _ => None,
        }
    }
}

fn build_source(cfg: &Config) -> Result<Box<dyn ReadingSource>, String> {
    match &cfg.source {
        SourceKind::Libre { email, password } => {
            let client = LibreClient::connect(LibreSettings {
                base_url: cfg.api_url.clone(),
                email: email.clone(),
                password: password.clone(),
                client_version: cfg.client_version.clone(),
                max_request_retries: cfg.max_request_retries,
            })
            .map_err(|e| format!("CGM auth failed (check CGM_EMAIL/CGM_PASSWORD): {}", e))?;
            info!("Authenticated to CGM API");
            Ok(Box::new(client))
        }
        SourceKind::Synthetic { seed } => {
            info!("Using synthetic readings (seed {})", seed);
            Ok(Box::new(SyntheticSource::new(*seed)))
        }
    }
}

fn run_console(conn: &mut SqliteConnection, cfg: &Config, settings: &ProjectionSettings) -> Result<(), String> {
    const SESSION: i64 = 0;
    let mut conversations = Conversations::new(cfg.insulin_window_mins);
    let job = PlotJob {
        database_path: cfg.database_path.clone(),
        busy_timeout: cfg.busy_timeout,
        settings: settings.clone(),
    };
    println!("{}", services::conversation::MENU);

    for line in std::io::stdin().lock().lines() {
        let line = line.map_err(|e| format!("reading stdin failed: {}", e))?;
        match conversations.handle(conn, SESSION, MinuteStamp::now(), &line) {
            Ok(Reply::Text(text)) => println!("{}", text),
            Ok(Reply::Plot(request, window)) => {
                let renderer = JsonRenderer {
                    output_dir: cfg.plot_output_dir.clone(),
                };
                plot::spawn_plot(job.clone(), request, window, renderer, |result| match result {
                    Ok(path) => println!("plot: {}", path.display()),
                    Err(e) => println!("plot failed: {}", e),
                });
                println!("Plotting...");
            }
            Err(e) => error!("Command failed: {}", e),
        }
    }
    Ok(())
}

fn run(role: Role) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_env()?;
    info!(
        "Config loaded (role={:?}, database={}, poll_interval={}s, notify_interval={}s, target={}..{}, max_request_retries={})",
        role,
        cfg.database_path,
        cfg.poll_interval.as_secs(),
        cfg.notify_interval.as_secs(),
        cfg.target.low,
        cfg.target.high,
        cfg.max_request_retries.get()
    );

    // 2) Open DB and apply pending migrations
    let mut conn = db::connection::open(&cfg.database_path, cfg.busy_timeout).map_err(|e| e.to_string())?;
    info!("Opened database {}", cfg.database_path);

    let projection = ProjectionSettings {
        target: cfg.target,
        ..ProjectionSettings::default()
    };
    let notify_settings = NotifySettings {
        projection: projection.clone(),
        stale_after_mins: cfg.stale_after_mins,
        ..NotifySettings::default()
    };
    let mut state = NotificationState::new();
    let mut notifier = LogNotifier;

    // 3) Role loop (steady cadence)
    match role {
        Role::Watch => {
            let mut reconciler = Reconciler::new(build_source(&cfg)?, projection);
            cadence::run_every("watch", cfg.poll_interval, || {
                reconciler.poll_once(&mut conn)?;
                notify::tick(&mut conn, MinuteStamp::now(), &mut state, &notify_settings, &mut notifier)?;
                Ok(())
            })
        }
        Role::Ingest => {
            let mut reconciler = Reconciler::new(build_source(&cfg)?, projection);
            cadence::run_every("ingest", cfg.poll_interval, || {
                reconciler.poll_once(&mut conn)?;
                Ok(())
            })
        }
        Role::Notify => cadence::run_every("notify", cfg.notify_interval, || {
            notify::tick(&mut conn, MinuteStamp::now(), &mut state, &notify_settings, &mut notifier)?;
            Ok(())
        }),
        Role::Console => run_console(&mut conn, &cfg, &projection),
    }
}

fn configure_env_from_cli() -> Result<(Option<LoadedEnvFile>, Role), String> {
    let mut args = std::env::args_os();
    args.next(); // skip program name

    let mut env_file: Option<PathBuf> = None;
    let mut role: Option<Role> = None;

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--env-file") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--env-file` requires a path argument".to_string())?;
                env_file = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--env-file=") => {
                if env_file.is_some() {
                    return Err("`--env-file` provided more than once".to_string());
                }
                let path_str = &s["--env-file=".len()..];
                if path_str.is_empty() {
                    return Err("`--env-file` requires a path argument".to_string());
                }
                env_file = Some(PathBuf::from(path_str));
            }
            Some(s) if !s.starts_with('-') && role.is_none() => {
                role = Some(Role::parse(s).ok_or_else(|| {
                    format!("unknown role: {} (expected watch, ingest, notify or console)", s)
                })?);
            }
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }
    let role = role.unwrap_or(Role::Watch);

    // existing process variables win over the file
    if let Some(path) = env_file {
        if !path.is_file() {
            return Err(format!("env file not found: {}", path.display()));
        }
        dotenvy::from_path(&path).map_err(|e| format!("failed to load {}: {}", path.display(), e))?;
        Ok((Some(LoadedEnvFile { path, explicit: true }), role))
    } else {
        let cwd = std::env::current_dir().map_err(|e| format!("unable to read current directory: {}", e))?;
        let default_path = cwd.join(".env");
        if default_path.is_file() {
            dotenvy::from_path(&default_path)
                .map_err(|e| format!("failed to load {}: {}", default_path.display(), e))?;
            Ok((
                Some(LoadedEnvFile {
                    path: default_path,
                    explicit: false,
                }),
                role,
            ))
        } else {
            Ok((None, role))
        }
    }
}

fn main() {
    let (loaded_env, role) = match configure_env_from_cli() {
        Ok(v) => v,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    // Init logging after environment so RUST_LOG from .env is respected.
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if let Some(info) = loaded_env.as_ref() {
        let origin = if info.explicit { "CLI-specified" } else { "default" };
        info!("Environment loaded from {} .env file: {}", origin, info.path.display());
    }

    info!(
        "cgm-sentinel {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(role) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
