//! Service configuration.
//!
//! Values are read from the process environment (plus a `.env` file when one exists, courtesy of
//! [`dotenvy`]), deserialized into a flat, stringly-typed [`Env`] and then parsed into the typed
//! [`Config`] the rest of the service consumes.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::FixedOffset;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::constants::DEFAULT_SERVER_PORT;

static CONFIG: LazyLock<OnceCell<Config>> = LazyLock::new(OnceCell::new);
pub async fn config() -> EnvResult<&'static Config> {
    CONFIG.get_or_try_init(|| async { Config::from_env() }).await
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
struct Env {
    database_url: String,
    gateway_token: String,
    server_api_port: Option<String>,
    cors_allow_origins: Option<String>,
    store_timeout_ms: Option<String>,
    event_utc_offset: Option<String>,
    log_format: Option<String>,
    otel_exporter_otlp_endpoint: Option<String>,
    api_service_name: Option<String>,
    api_tracer_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub gateway_token: String,
    pub server_api_port: u16,
    pub cors_allow_origins: String,
    /// Upper bound applied to every storage call
    pub store_timeout: Duration,
    /// Offset event schedules (wall-clock date + `HH:MM`) are interpreted in
    pub event_utc_offset: FixedOffset,
    pub log_format: LogFormat,
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub api_service_name: String,
    pub api_tracer_name: String,
}

impl Config {
    pub fn from_env() -> EnvResult<Self> {
        Self::from_iter(dotenvy::vars())
    }

    pub fn from_iter<Iter>(vars: Iter) -> EnvResult<Self>
    where
        Iter: IntoIterator<Item = (String, String)>,
    {
        let map: Map<String, Value> = vars
            .into_iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(k, v)| (k, Value::String(v)))
            .collect();

        let env: Env = serde_json::from_value(Value::Object(map))?;
        env.try_into()
    }
}

impl TryFrom<Env> for Config {
    type Error = EnvErr;

    fn try_from(env: Env) -> EnvResult<Self> {
        let server_api_port = match env.server_api_port {
            Some(port) => port.trim().parse::<u16>().map_err(|_| EnvErr::Invalid {
                var: "SERVER_API_PORT",
                value: port,
            })?,
            None => DEFAULT_SERVER_PORT,
        };

        let store_timeout = match env.store_timeout_ms {
            Some(ms) => match ms.trim().parse::<u64>() {
                Ok(v) if v > 0 => Duration::from_millis(v),
                _ => {
                    return Err(EnvErr::Invalid {
                        var: "STORE_TIMEOUT_MS",
                        value: ms,
                    });
                }
            },
            None => Duration::from_millis(2000),
        };

        let event_utc_offset = match env.event_utc_offset {
            Some(raw) => parse_utc_offset(&raw).ok_or(EnvErr::Invalid {
                var: "EVENT_UTC_OFFSET",
                value: raw,
            })?,
            // IST unless configured otherwise
            None => FixedOffset::east_opt(5 * 3600 + 30 * 60).ok_or(EnvErr::Invalid {
                var: "EVENT_UTC_OFFSET",
                value: String::from("+05:30"),
            })?,
        };

        let log_format = match env.log_format.as_deref().map(str::trim) {
            None | Some("plain") => LogFormat::Plain,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(EnvErr::Invalid {
                    var: "LOG_FORMAT",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            database_url: env.database_url,
            gateway_token: env.gateway_token,
            server_api_port,
            cors_allow_origins: env.cors_allow_origins.unwrap_or_else(|| String::from("*")),
            store_timeout,
            event_utc_offset,
            log_format,
            otel_exporter_otlp_endpoint: env.otel_exporter_otlp_endpoint,
            api_service_name: env
                .api_service_name
                .unwrap_or_else(|| String::from("cleanup-attendance-api")),
            api_tracer_name: env
                .api_tracer_name
                .unwrap_or_else(|| String::from("cleanup-attendance-tracer")),
        })
    }
}

/// Parses `+HH:MM`, `-HH:MM`, `Z` or `UTC`
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0);
    }

    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => return None,
    };

    let (hours, minutes) = rest.split_once(':')?;
    let hours = hours.parse::<u32>().ok()?;
    let minutes = minutes.parse::<u32>().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60) as i32)
}

pub type EnvResult<T> = core::result::Result<T, EnvErr>;

#[derive(Debug, Error)]
pub enum EnvErr {
    #[error("env deserialization error: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },
}
