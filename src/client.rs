//! Blocking HTTP client for the CGM cloud API (LibreLinkUp-style).
//!
//! - Blocking client using `ureq` (no async).
//! - Authenticates with email/password and keeps the bearer token together
//!   with its absolute expiry. The token is refreshed lazily: only once the
//!   expiry instant has passed, or once after an HTTP 401.
//! - The patient id is resolved once per token lifetime.
//! - Transport failures, 429 and 5xx responses are retried with exponential
//!   backoff and jitter.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rand::Rng;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::thread;
use std::time::Duration;

use crate::models::libre::{AuthTicket, Envelope, GlucoseItem, GraphData, LoginData, PatientConnection};
use crate::timestamp::{MinuteStamp, TimestampError};

const PRODUCT: &str = "llu.android";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ClientError {
    MissingAuth,
    Transport(String),
    Http { status: u16, message: String },
    Json(String),
    Auth(String),
    /// The account has no patient connection to read from.
    NoPatient,
    InvalidTimestamp(TimestampError),
}

impl core::fmt::Display for ClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ClientError::MissingAuth => write!(f, "missing bearer token for authenticated endpoint"),
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ClientError::Json(e) => write!(f, "json error: {}", e),
            ClientError::Auth(e) => write!(f, "auth error: {}", e),
            ClientError::NoPatient => write!(f, "account has no patient connections"),
            ClientError::InvalidTimestamp(e) => write!(f, "remote sample has {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<TimestampError> for ClientError {
    fn from(value: TimestampError) -> Self {
        ClientError::InvalidTimestamp(value)
    }
}

impl ClientError {
    /// Worth trying the same request again after a pause.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// The poller cannot make progress without operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Auth(_) | ClientError::NoPatient | ClientError::InvalidTimestamp(_)
        )
    }
}

/// One fetch from a reading source: the newest sample plus the recent history
/// window the source chose to return.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceSnapshot {
    pub latest: Option<(MinuteStamp, i32)>,
    pub history: Vec<(MinuteStamp, i32)>,
}

impl SourceSnapshot {
    /// Fold history and latest into one series. On a duplicate minute the
    /// latest sample wins; empty (zero) values are dropped.
    pub fn merged(&self) -> BTreeMap<MinuteStamp, i32> {
        let mut series = BTreeMap::new();
        for (ts, value) in self.history.iter().chain(self.latest.iter()) {
            if *value != 0 {
                series.insert(*ts, *value);
            }
        }
        series
    }
}

/// Anything that can be polled for CGM readings.
pub trait ReadingSource {
    fn fetch(&mut self) -> Result<SourceSnapshot, ClientError>;
}

impl<S: ReadingSource + ?Sized> ReadingSource for Box<S> {
    fn fetch(&mut self) -> Result<SourceSnapshot, ClientError> {
        (**self).fetch()
    }
}

#[derive(Debug, Clone)]
pub struct LibreSettings {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub client_version: String,
    pub max_request_retries: NonZeroU32,
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: DateTime<Utc>,
    account_id: Option<String>,
    patient_id: Option<String>,
}

impl Session {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn apply_ticket(&mut self, ticket: &AuthTicket) {
        self.token = ticket.token.clone();
        self.expires_at = expiry_instant(ticket);
    }
}

fn expiry_instant(ticket: &AuthTicket) -> DateTime<Utc> {
    // an unrepresentable expiry counts as already expired
    DateTime::<Utc>::from_timestamp(ticket.expires, 0).unwrap_or_else(Utc::now)
}

fn account_id_for(user_id: &str) -> String {
    format!("{:x}", Sha256::digest(user_id.as_bytes()))
}

pub struct LibreClient {
    agent: ureq::Agent,
    settings: LibreSettings,
    session: Option<Session>,
}

impl LibreClient {
    /// Build the client and authenticate once, so bad credentials surface at
    /// startup instead of on the first poll.
    pub fn connect(settings: LibreSettings) -> Result<Self, ClientError> {
        let config = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build();
        let mut client = LibreClient {
            agent: ureq::Agent::new_with_config(config),
            settings,
            session: None,
        };
        client.login()?;
        client.patient_id()?;
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    fn login(&mut self) -> Result<(), ClientError> {
        // one region redirect is expected at most
        for _ in 0..2 {
            let url = self.url("/llu/auth/login");
            let body = serde_json::json!({
                "email": self.settings.email,
                "password": self.settings.password,
            });
            let envelope: Envelope<LoginData> = self.with_retries("login", || {
                let resp = self
                    .agent
                    .post(url.as_str())
                    .header("product", PRODUCT)
                    .header("version", self.settings.client_version.as_str())
                    .header("Accept", "application/json")
                    .send_json(&body);
                decode("login", resp)
            })?;

            let data = match (envelope.status, envelope.data) {
                (0, Some(data)) => data,
                (status, _) => {
                    let message = envelope
                        .error
                        .and_then(|e| e.message)
                        .unwrap_or_else(|| format!("login rejected with status {}", status));
                    return Err(ClientError::Auth(message));
                }
            };

            if data.redirect {
                let region = data
                    .region
                    .ok_or_else(|| ClientError::Auth("redirect without region".into()))?;
                self.settings.base_url = format!("https://api-{}.libreview.io", region);
                info!("Login redirected to region {} ({})", region, self.settings.base_url);
                continue;
            }

            let ticket = data
                .auth_ticket
                .ok_or_else(|| ClientError::Auth("login response carries no auth ticket".into()))?;
            let session = Session {
                token: ticket.token.clone(),
                expires_at: expiry_instant(&ticket),
                account_id: data.user.map(|u| account_id_for(&u.id)),
                patient_id: None,
            };
            info!("Authenticated to CGM API (token valid until {})", session.expires_at);
            self.session = Some(session);
            return Ok(());
        }
        Err(ClientError::Auth("login kept redirecting".into()))
    }

    fn ensure_session(&mut self) -> Result<(), ClientError> {
        let expired = match &self.session {
            None => true,
            Some(s) => s.is_expired(Utc::now()),
        };
        if expired {
            debug!("Bearer token missing or expired; logging in again");
            self.login()?;
        }
        Ok(())
    }

    fn patient_id(&mut self) -> Result<String, ClientError> {
        self.ensure_session()?;
        if let Some(id) = self.session.as_ref().and_then(|s| s.patient_id.clone()) {
            return Ok(id);
        }
        let envelope: Envelope<Vec<PatientConnection>> = self.get_json("/llu/connections")?;
        let first = envelope
            .data
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or(ClientError::NoPatient)?;
        debug!(
            "Resolved patient {} ({} {})",
            first.patient_id,
            first.first_name.as_deref().unwrap_or("-"),
            first.last_name.as_deref().unwrap_or("-")
        );
        if let Some(s) = self.session.as_mut() {
            s.patient_id = Some(first.patient_id.clone());
        }
        Ok(first.patient_id)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Envelope<T>, ClientError> {
        let session = self.session.as_ref().ok_or(ClientError::MissingAuth)?;
        let url = self.url(path);
        let bearer = format!("Bearer {}", session.token);
        self.with_retries(path, || {
            let mut req = self
                .agent
                .get(url.as_str())
                .header("product", PRODUCT)
                .header("version", self.settings.client_version.as_str())
                .header("Accept", "application/json")
                .header("Authorization", bearer.as_str());
            if let Some(account_id) = &session.account_id {
                req = req.header("account-id", account_id.as_str());
            }
            decode(path, req.call())
        })
    }

    fn graph(&mut self) -> Result<Envelope<GraphData>, ClientError> {
        let patient_id = self.patient_id()?;
        let path = format!("/llu/connections/{}/graph", patient_id);
        match self.get_json(&path) {
            Err(ClientError::Http { status: 401, .. }) => {
                warn!("Token rejected before its expiry; logging in again");
                self.session = None;
                let patient_id = self.patient_id()?;
                self.get_json(&format!("/llu/connections/{}/graph", patient_id))
            }
            other => other,
        }
    }

    fn with_retries<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, ClientError>) -> Result<T, ClientError> {
        let attempts = self.settings.max_request_retries.get();
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {} ms",
                        what,
                        attempt,
                        attempts,
                        e,
                        delay.as_millis()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

impl ReadingSource for LibreClient {
    fn fetch(&mut self) -> Result<SourceSnapshot, ClientError> {
        let envelope = self.graph()?;
        if let (Some(ticket), Some(session)) = (envelope.ticket.as_ref(), self.session.as_mut()) {
            session.apply_ticket(ticket);
        }
        let data = envelope
            .data
            .ok_or_else(|| ClientError::Json("graph response carries no data".into()))?;
        snapshot_from_graph(&data)
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
    let jitter = Duration::from_millis(rand::rng().random_range(0..250));
    exp.min(BACKOFF_CAP) + jitter
}

fn decode<T: DeserializeOwned>(
    what: &str,
    result: Result<http::Response<ureq::Body>, ureq::Error>,
) -> Result<T, ClientError> {
    let mut resp = result.map_err(|e| ClientError::Transport(format!("{}: {}", what, e)))?;
    let status = resp.status();
    let body = resp
        .body_mut()
        .read_to_string()
        .map_err(|e| ClientError::Transport(format!("{}: reading body: {}", what, e)))?;
    if !status.is_success() {
        return Err(ClientError::Http {
            status: status.as_u16(),
            message: body,
        });
    }
    parse_body(what, &body)
}

/// Deserialize with the JSON path of the failing field in the error.
pub fn parse_body<T: DeserializeOwned>(what: &str, body: &str) -> Result<T, ClientError> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|e| ClientError::Json(format!("{}: {}", what, e)))
}

fn sample(item: &GlucoseItem) -> Result<(MinuteStamp, i32), ClientError> {
    let ts = MinuteStamp::parse_remote(&item.timestamp)?;
    Ok((ts, item.value_mg_per_dl.round() as i32))
}

pub fn snapshot_from_graph(data: &GraphData) -> Result<SourceSnapshot, ClientError> {
    let latest = data.connection.glucose_item.as_ref().map(sample).transpose()?;
    let history = data.graph_data.iter().map(sample).collect::<Result<Vec<_>, _>>()?;
    Ok(SourceSnapshot { latest, history })
}
