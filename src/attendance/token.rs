use chrono::{DateTime, TimeDelta, Utc};
use ring::rand::{self, SystemRandom};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{TOKEN_BYTES, TOKEN_TTL_MINUTES};
use crate::db::models::event::{AttendanceToken, EventId};
use crate::util::constant_time_cmp;

pub type TokenResult<T> = core::result::Result<T, TokenError>;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("ring::error::Unspecified error occurred")]
    UnspecifiedRingErr,

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// What a client scans: exactly `{"eventId": "...", "token": "..."}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScanPayload {
    pub event_id: EventId,
    pub token: String,
}

/// A freshly minted (or currently live) token along with its scannable payload
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub event_id: EventId,
    pub payload: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints per-event attendance tokens from the OS CSPRNG.
#[derive(Debug)]
pub struct TokenIssuer {
    rng: SystemRandom,
    ttl: TimeDelta,
}

impl TokenIssuer {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
            ttl: TimeDelta::minutes(TOKEN_TTL_MINUTES),
        }
    }

    pub fn issue(&self, event_id: EventId, now: DateTime<Utc>) -> TokenResult<IssuedToken> {
        let bytes: [u8; TOKEN_BYTES] = rand::generate(&self.rng)
            .map_err(|_| TokenError::UnspecifiedRingErr)?
            .expose();
        let token = hex::encode(bytes);

        IssuedToken::new(event_id, token, now + self.ttl)
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl IssuedToken {
    fn new(event_id: EventId, token: String, expires_at: DateTime<Utc>) -> TokenResult<Self> {
        let payload = ScanPayload {
            event_id,
            token: token.clone(),
        }
        .encode()?;

        Ok(Self {
            event_id,
            payload,
            token,
            expires_at,
        })
    }

    /// Rebuilds the payload for the token an event currently holds
    pub fn for_current(event_id: EventId, current: &AttendanceToken) -> TokenResult<Self> {
        Self::new(event_id, current.value.clone(), current.expires_at)
    }

    pub fn attendance_token(&self) -> AttendanceToken {
        AttendanceToken {
            value: self.token.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl ScanPayload {
    /// Strict parse; anything but the two expected string keys (with a well-formed event id and a
    /// non-empty token) is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let payload: ScanPayload = serde_json::from_str(raw.trim()).ok()?;
        (!payload.token.is_empty()).then_some(payload)
    }

    pub fn encode(&self) -> TokenResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl AttendanceToken {
    /// Live iff `presented` matches and `now` is strictly before expiry
    pub fn accepts(&self, presented: &str, now: DateTime<Utc>) -> bool {
        let matches = constant_time_cmp(&self.value, presented);
        matches && now < self.expires_at
    }
}
