//! Bearer token decoding and expiry evaluation
//!
//! Tokens are treated as opaque JWS compact strings: the payload segment is
//! decoded without signature verification. Validation of the signature is the
//! resource server's job; the client only needs the claims to know when the
//! credential stops being usable.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TokenError;

/// Tokens expiring within this many seconds count as expired
pub const DEFAULT_EXPIRY_THRESHOLD_SECS: i64 = 60;

// Standard alphabet, padding optional: payload segments arrive unpadded
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Source of the current time in epoch seconds
pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Claims embedded in a token payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// `exp` as epoch seconds
    pub fn expires_at(&self) -> Option<i64> {
        self.0.get("exp").and_then(numeric_date)
    }

    /// `iat` as epoch seconds
    pub fn issued_at(&self) -> Option<i64> {
        self.0.get("iat").and_then(numeric_date)
    }

    pub fn subject(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

fn numeric_date(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|secs| secs as i64))
}

/// Decode the payload segment of `token`
pub fn decode_claims(token: &str) -> Result<Claims, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::SegmentCount(segments.len()));
    }

    let repaired = segments[1].replace('-', "+").replace('_', "/");
    let bytes = PAYLOAD_ENGINE
        .decode(repaired.as_bytes())
        .map_err(|e| TokenError::Base64(e.to_string()))?;
    let text = String::from_utf8(bytes).map_err(|_| TokenError::Utf8)?;

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Ok(Claims(map)),
        Ok(_) => Err(TokenError::NotAnObject),
        Err(e) => Err(TokenError::Json(e.to_string())),
    }
}

/// Decode `token`, `None` on any malformed input
pub fn decode(token: &str) -> Option<Claims> {
    decode_claims(token).ok()
}

/// Whether `token` should no longer be used, judged against the wall clock
pub fn is_expired(token: &str, threshold_secs: i64) -> bool {
    is_expired_at(token, threshold_secs, SystemClock.now_epoch_seconds())
}

/// Whether `token` should no longer be used at `now` (epoch seconds).
/// Undecodable tokens and tokens without `exp` are expired.
pub fn is_expired_at(token: &str, threshold_secs: i64, now: i64) -> bool {
    match decode(token).and_then(|claims| claims.expires_at()) {
        Some(expires_at) => now.saturating_add(threshold_secs) >= expires_at,
        None => true,
    }
}

/// A bearer token together with the claims decoded from it
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    access_token: String,
    claims: Claims,
    expires_at: i64,
    issued_at: Option<i64>,
}

impl Credential {
    /// Build a credential from a token; requires a numeric `exp` claim
    pub fn from_token(token: impl Into<String>) -> Result<Self, TokenError> {
        let access_token = token.into();
        let claims = decode_claims(&access_token)?;
        let expires_at = claims.expires_at().ok_or(TokenError::MissingExpiry)?;
        let issued_at = claims.issued_at();

        Ok(Self {
            access_token,
            claims,
            expires_at,
            issued_at,
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn issued_at(&self) -> Option<i64> {
        self.issued_at
    }

    pub fn is_expired_at(&self, threshold_secs: i64, now: i64) -> bool {
        now.saturating_add(threshold_secs) >= self.expires_at
    }

    /// Seconds left before the threshold makes this credential expired
    pub fn seconds_remaining(&self, threshold_secs: i64, now: i64) -> i64 {
        self.expires_at
            .saturating_sub(threshold_secs)
            .saturating_sub(now)
            .max(0)
    }
}
