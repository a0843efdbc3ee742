use chrono::{NaiveDateTime, TimeDelta, Timelike};
use reqwest::{header, StatusCode};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::EcobullesError;

pub const BASE_URL: &str = "https://ecobulles.agom.net/cmd/";

const CLIENT_USER_AGENT: &str = "Ecobulles";
const LOGIN_PATH: &str = "loginAppUserCo2.php";
const DEVICE_INFO_PATH: &str = "getAppUserCo2.php";
const USAGE_PATH: &str = "getConsoBoiteItemAppFilter.php";

// Fixed values the vendor backend expects from its mobile app.
const REGISTRATION_ID: &str = "cI7TFH55eX4:APA91bE-DyQ1QgCIcO2BBfIL1MiAl_afxm9t4o4jQIyXazceonlcmqkUF7BHwZ4J_r06EpVxOY0n8bOIm-0a7VpjItHLBM61-fdEBj4Yy_gR5dyDbyvGtI7YbFHwqfGTwN-eg_4kyKy4";
const SAND: &str = "B3A2F41213";

const WINDOW_FORMAT: &str = "%Y-%m-%d %H:00:00";

/// Client for the Ecobulles cloud API.
///
/// Every call is a single form-encoded POST without retries or an internal
/// timeout; callers bound the wait themselves.
#[derive(Debug, Clone)]
pub struct EcobullesClient {
    base_url: String,
    client: reqwest::Client,
}

impl Default for EcobullesClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EcobullesClient {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Logs in and returns the account's user id and its single device.
    pub async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Authentication, EcobullesError> {
        let hashed_password = hash_password(password);
        let response: LoginResponse = self
            .post_form(
                LOGIN_PATH,
                &[
                    ("email", email),
                    ("password", &hashed_password),
                    ("registrationId", REGISTRATION_ID),
                    ("sand", SAND),
                ],
            )
            .await?;
        response.into_authentication()
    }

    pub async fn fetch_device_info(&self, device_ref: &str) -> Result<DeviceRecord, EcobullesError> {
        let response: DeviceInfoResponse = self
            .post_form(DEVICE_INFO_PATH, &[("eco_ref", device_ref)])
            .await?;
        response.into_device_record(device_ref)
    }

    /// Reads the cumulative water and CO2 totals for `window`.
    pub async fn fetch_usage(
        &self,
        device_ref: &str,
        window: &UsageWindow,
    ) -> Result<UsageSnapshot, EcobullesError> {
        let start = window.start_param();
        let stop = window.stop_param();
        let response: UsageResponse = self
            .post_form(
                USAGE_PATH,
                &[
                    ("eco_ref", device_ref),
                    ("eau", "1"),
                    ("startdate", &start),
                    ("stopdate", &stop),
                ],
            )
            .await?;
        response.into_snapshot()
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, &str)],
    ) -> Result<T, EcobullesError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), path);
        debug!("POST {url}");
        let response = self
            .client
            .post(&url)
            .header(header::USER_AGENT, CLIENT_USER_AGENT)
            .form(form)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(EcobullesError::ConnectionFailed(status.as_u16()));
        }

        // The backend labels JSON as text/html, so the body is parsed as-is.
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// SHA-1 hex digest of the password, as the vendor login expects.
///
/// This is a wire-compatibility requirement, not a secure password scheme.
pub fn hash_password(password: &str) -> String {
    hex::encode(Sha1::digest(password.as_bytes()))
}

/// Query window for a usage request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl UsageWindow {
    /// The hour containing `now` and the following hour boundary.
    pub fn current_hour(now: NaiveDateTime) -> Self {
        let start = now
            .date()
            .and_hms_opt(now.hour(), 0, 0)
            .unwrap_or(now);
        Self {
            start,
            end: start + TimeDelta::hours(1),
        }
    }

    fn start_param(&self) -> String {
        self.start.format(WINDOW_FORMAT).to_string()
    }

    fn stop_param(&self) -> String {
        self.end.format(WINDOW_FORMAT).to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    pub user_id: String,
    pub device_ref: String,
    pub device_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_ref: String,
    pub name: String,
    pub serial_number: String,
    pub firmware_version: String,
    pub install_date: String,
    pub last_contact: String,
    pub activated: bool,
    pub locked: bool,
    pub suspended: bool,
    pub suspended_time: Option<String>,
    pub suspended_date: Option<String>,
    pub last_alert: Option<Value>,
}

/// Latest usage totals and the server-side time they were computed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Cumulative CO2 injected, in milligrams.
    pub total_gas: u64,
    /// Cumulative water treated, in litres.
    pub total_water: u64,
    pub last_updated: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: Option<Value>,
    // Only decoded once the status says the login succeeded.
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    userid: Option<Value>,
    eco_ref: Option<Value>,
    conso: Option<LoginConso>,
}

#[derive(Debug, Deserialize)]
struct LoginConso {
    boite: Option<NamedBoite>,
}

#[derive(Debug, Deserialize)]
struct NamedBoite {
    name: Option<String>,
}

impl LoginResponse {
    fn into_authentication(self) -> Result<Authentication, EcobullesError> {
        let status = self
            .status
            .as_ref()
            .and_then(value_as_i64)
            .ok_or_else(|| EcobullesError::missing("status"))?;
        if status != 1 {
            return Err(EcobullesError::AuthenticationFailed(format!(
                "server returned status {status}"
            )));
        }

        let data: LoginData =
            serde_json::from_value(self.data.ok_or_else(|| EcobullesError::missing("data"))?)?;
        let user_id = data
            .userid
            .as_ref()
            .and_then(value_as_string)
            .ok_or_else(|| EcobullesError::missing("data.userid"))?;
        let device_ref = data
            .eco_ref
            .as_ref()
            .and_then(value_as_string)
            .ok_or_else(|| EcobullesError::missing("data.eco_ref"))?;
        let device_name = data
            .conso
            .and_then(|conso| conso.boite)
            .and_then(|boite| boite.name)
            .ok_or_else(|| EcobullesError::missing("data.conso.boite.name"))?;

        Ok(Authentication {
            user_id,
            device_ref,
            device_name: device_name.trim().to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct DeviceInfoResponse {
    data: Option<DeviceInfoData>,
}

#[derive(Debug, Deserialize)]
struct DeviceInfoData {
    boite: Option<RawBoite>,
}

#[derive(Debug, Deserialize)]
struct RawBoite {
    name: Option<String>,
    installdate: Option<RawDate>,
    firm_ver: Option<Value>,
    num_serie: Option<Value>,
    lastdatereceive: Option<String>,
    activated: Option<Value>,
    locked: Option<Value>,
    suspended: Option<Value>,
    suspended_time: Option<Value>,
    suspended_date: Option<String>,
    last_alert: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RawDate {
    date: Option<String>,
}

impl DeviceInfoResponse {
    fn into_device_record(self, device_ref: &str) -> Result<DeviceRecord, EcobullesError> {
        let boite = self
            .data
            .and_then(|data| data.boite)
            .ok_or_else(|| EcobullesError::missing("data.boite"))?;

        let name = boite
            .name
            .ok_or_else(|| EcobullesError::missing("data.boite.name"))?;
        let install_date = boite
            .installdate
            .and_then(|installdate| installdate.date)
            .ok_or_else(|| EcobullesError::missing("data.boite.installdate.date"))?;
        let firmware_version = boite
            .firm_ver
            .as_ref()
            .and_then(value_as_string)
            .ok_or_else(|| EcobullesError::missing("data.boite.firm_ver"))?;
        let serial_number = boite
            .num_serie
            .as_ref()
            .and_then(value_as_string)
            .ok_or_else(|| EcobullesError::missing("data.boite.num_serie"))?;
        let last_contact = boite
            .lastdatereceive
            .ok_or_else(|| EcobullesError::missing("data.boite.lastdatereceive"))?;

        Ok(DeviceRecord {
            device_ref: device_ref.to_string(),
            name: name.trim().to_string(),
            serial_number,
            firmware_version,
            install_date: normalize_date(&install_date),
            last_contact: normalize_date(&last_contact),
            activated: value_as_flag(boite.activated.as_ref()),
            locked: value_as_flag(boite.locked.as_ref()),
            suspended: value_as_flag(boite.suspended.as_ref()),
            suspended_time: boite.suspended_time.as_ref().and_then(value_as_string),
            suspended_date: boite.suspended_date.as_deref().map(normalize_date),
            last_alert: boite.last_alert.filter(|alert| !alert.is_null()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct UsageResponse {
    data: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    infoconso: Option<InfoConso>,
}

#[derive(Debug, Deserialize)]
struct InfoConso {
    graph: Option<Vec<GraphPoint>>,
    total_gas: Option<Value>,
    total_eau: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct GraphPoint {
    date: Option<String>,
}

impl UsageResponse {
    fn into_snapshot(self) -> Result<UsageSnapshot, EcobullesError> {
        let Some(infoconso) = self.data.and_then(|data| data.infoconso) else {
            return Ok(UsageSnapshot::default());
        };

        // The series is time ordered; only the newest point matters.
        let last_updated = match infoconso.graph.as_ref().and_then(|graph| graph.last()) {
            Some(point) => {
                let date = point
                    .date
                    .as_deref()
                    .ok_or_else(|| EcobullesError::missing("data.infoconso.graph[].date"))?;
                Some(normalize_date(date))
            }
            None => None,
        };

        Ok(UsageSnapshot {
            total_gas: parse_counter(infoconso.total_gas.as_ref(), "total_gas")?,
            total_water: parse_counter(infoconso.total_eau.as_ref(), "total_eau")?,
            last_updated,
        })
    }
}

/// `2024/01/01 10:00:00` -> `2024-01-01T10:00:00`
pub fn normalize_date(date: &str) -> String {
    date.trim().replace(' ', "T").replace('/', "-")
}

fn parse_counter(value: Option<&Value>, field: &str) -> Result<u64, EcobullesError> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => number
            .as_u64()
            .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .ok_or_else(|| {
                EcobullesError::MalformedResponse(format!("`{field}` is not a counter: {number}"))
            }),
        Some(Value::String(text)) => text.trim().parse().map_err(|_| {
            EcobullesError::MalformedResponse(format!("`{field}` is not a counter: {text:?}"))
        }),
        Some(other) => Err(EcobullesError::MalformedResponse(format!(
            "`{field}` is not a counter: {other}"
        ))),
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn value_as_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(other) => value_as_i64(other).unwrap_or_default() != 0,
        None => false,
    }
}
