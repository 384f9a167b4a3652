//! Response shapes of the LibreLinkUp-style CGM cloud API.
//!
//! Scope: only the fields the client reads. Unknown fields are ignored, so
//! the API can grow without breaking deserialization.

use serde::Deserialize;

/// Every endpoint wraps its payload in the same envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub status: i32,
    pub data: Option<T>,
    /// Refreshed ticket; present on most authenticated responses.
    pub ticket: Option<AuthTicket>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthTicket {
    pub token: String,
    /// Absolute expiry, unix seconds.
    pub expires: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    /// Set when the account lives in another region; `region` names it.
    #[serde(default)]
    pub redirect: bool,
    pub region: Option<String>,
    pub user: Option<LoginUser>,
    pub auth_ticket: Option<AuthTicket>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginUser {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatientConnection {
    pub patient_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphData {
    pub connection: GraphConnection,
    #[serde(default)]
    pub graph_data: Vec<GlucoseItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConnection {
    pub glucose_item: Option<GlucoseItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlucoseItem {
    /// Device-local time, `%m/%d/%Y %I:%M:%S %p`.
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "ValueInMgPerDl")]
    pub value_mg_per_dl: f64,
}
