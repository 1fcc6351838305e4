use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AuthError;

/// Third-party platforms a visitor can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Spotify,
    Tidal,
    #[serde(rename = "youtube")]
    YouTubeMusic,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Spotify, Provider::Tidal, Provider::YouTubeMusic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Spotify => "spotify",
            Provider::Tidal => "tidal",
            Provider::YouTubeMusic => "youtube",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "spotify" => Ok(Provider::Spotify),
            "tidal" => Ok(Provider::Tidal),
            "youtube" | "youtube_music" | "youtube-music" | "ytmusic" => Ok(Provider::YouTubeMusic),
            other => Err(AuthError::UnknownProvider(other.to_string())),
        }
    }
}

/// How a provider treats the refresh token presented in a refresh_token grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshTokenRotation {
    /// Keep the previous refresh token when the provider does not send a new one.
    #[default]
    Preserve,
    /// Every use invalidates the presented refresh token; only a returned one survives.
    Rotating,
}

/// Successful token-endpoint response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

/// Longest token lifetime taken at face value: one year.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 3600;

/// Provider-reported `expires_in` as a duration, clamped to `0..=MAX_TOKEN_LIFETIME_SECS`.
pub fn token_lifetime(expires_in: i64) -> Duration {
    Duration::seconds(expires_in.clamp(0, MAX_TOKEN_LIFETIME_SECS))
}

/// Account fields returned by a provider's identity endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIdentity {
    pub user_id: String,
    pub display_name: String,
    pub country: Option<String>,
}

/// Completed provider credential for one visitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: Provider,
    pub visitor_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub scope: Option<String>,
    pub provider_user_id: String,
    pub provider_display_name: String,
    pub provider_country: Option<String>,
}

impl Credential {
    /// Build a credential from a fresh grant. `expires_at` is always `now + expires_in`.
    pub fn from_grant(
        provider: Provider,
        visitor_id: &str,
        grant: TokenGrant,
        identity: ProviderIdentity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            provider,
            visitor_id: visitor_id.to_string(),
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            expires_at: now + token_lifetime(grant.expires_in),
            issued_at: now,
            scope: grant.scope,
            provider_user_id: identity.user_id,
            provider_display_name: identity.display_name,
            provider_country: identity.country,
        }
    }

    /// Apply a refresh grant, keeping identity fields.
    pub fn refreshed(
        &self,
        grant: TokenGrant,
        now: DateTime<Utc>,
        rotation: RefreshTokenRotation,
    ) -> Self {
        let refresh_token = match (grant.refresh_token, rotation) {
            (Some(new), _) => Some(new),
            (None, RefreshTokenRotation::Preserve) => self.refresh_token.clone(),
            (None, RefreshTokenRotation::Rotating) => None,
        };
        Self {
            access_token: grant.access_token,
            refresh_token,
            expires_at: now + token_lifetime(grant.expires_in),
            issued_at: now,
            scope: grant.scope.or_else(|| self.scope.clone()),
            ..self.clone()
        }
    }

    /// Fresh means usable without a refresh: `now < expires_at - skew`.
    pub fn is_fresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now < self.expires_at - skew
    }
}

/// In-flight PKCE handshake, keyed by `state` in the context store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkceContext {
    pub code_verifier: String,
    pub visitor_id: String,
    #[serde(default)]
    pub provider: Option<Provider>,
}

/// Login URL plus the context the caller must persist under `state`.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub context: PkceContext,
}

/// RFC 8628 device authorization session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAuthSession {
    pub provider: Provider,
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: i64,
    pub interval: i64,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of one device-code poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePoll {
    /// Poll again after `interval` seconds.
    Pending { interval: i64 },
    Complete(Credential),
}
