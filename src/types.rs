//! Type definitions for authentication

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A token is refreshed once it is within this many seconds of its expiration
pub const EXPIRATION_THRESHOLD_SECS: i64 = 30;

/// Short-lived access token issued in exchange for an API key
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Check if the token expires within [`EXPIRATION_THRESHOLD_SECS`] of `now` (inclusive)
    pub fn is_about_to_expire(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRATION_THRESHOLD_SECS) >= self.expires_at
    }

    /// Same as [`AccessToken::is_about_to_expire`], an absent token always needs a refresh
    pub fn needs_refresh(token: Option<&AccessToken>, now: DateTime<Utc>) -> bool {
        token.map_or(true, |token| token.is_about_to_expire(now))
    }
}

// The token value is a credential, only its presence is ever printed.
impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &if self.token.is_empty() { "<unset>" } else { "<set>" })
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Serialized form of an [`AccessToken`], shared by the token file and the issuance response
///
/// `expires_at` is a Unix timestamp in seconds, sub-second precision is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
}

impl From<&AccessToken> for TokenRecord {
    fn from(token: &AccessToken) -> Self {
        Self {
            token: token.token.clone(),
            expires_at: token.expires_at,
        }
    }
}

impl From<TokenRecord> for AccessToken {
    fn from(record: TokenRecord) -> Self {
        Self {
            token: record.token,
            expires_at: record.expires_at,
        }
    }
}

/// Body of the token issuance request
#[derive(Debug, Serialize)]
pub(crate) struct IssueTokenRequest<'a> {
    pub api_key: &'a str,
}

/// Long-lived API key, printable in logs without leaking it whole
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ApiKey(String);

impl ApiKey {
    const VISIBLE_PREFIX: usize = 16;

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex SHA-256 of the key, used to name its on-disk cache directory
    pub fn credential_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<unset>");
        }

        let prefix: String = self.0.chars().take(Self::VISIBLE_PREFIX).collect();
        f.write_str(&prefix)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiKey({self})")
    }
}

/// Source of the current time, replaceable in tests
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
