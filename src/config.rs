use crate::models::{Provider, RefreshTokenRotation};
use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // path to database file (credentials + handshake contexts)
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Tokens are refreshed this many seconds before they expire.
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: i64,
    #[serde(default = "default_pkce_ttl")]
    pub pkce_ttl_secs: i64,
    /// How long an expired device session is kept so late polls see the expiry.
    #[serde(default = "default_device_grace")]
    pub device_grace_secs: i64,
    #[serde(default = "default_retention_days")]
    pub credential_retention_days: i64,

    // outbound HTTP
    #[serde(default = "default_connect_timeout")]
    pub http_connect_timeout_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default)]
    pub spotify: Option<ProviderConfig>,
    #[serde(default)]
    pub tidal: Option<ProviderConfig>,
    #[serde(default)]
    pub youtube: Option<ProviderConfig>,
}

/// Per-provider client registration and endpoint overrides.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProviderConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// Replaces the provider's default scope list when set.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,

    // endpoint overrides (tests, proxies)
    #[serde(default)]
    pub auth_base: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,

    #[serde(default)]
    pub revoke_on_disconnect: bool,
    #[serde(default)]
    pub refresh_token_rotation: RefreshTokenRotation,
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join("music-provider-auth")
        .join("auth.db")
}
fn default_log_dir() -> PathBuf { "/var/log/music-provider-auth".into() }
fn default_refresh_skew() -> i64 { 60 }
fn default_pkce_ttl() -> i64 { 600 }
fn default_device_grace() -> i64 { 300 }
fn default_retention_days() -> i64 { crate::store::DEFAULT_RETENTION_DAYS }
fn default_connect_timeout() -> u64 { 5 }
fn default_http_timeout() -> u64 { 15 }

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_dir: default_log_dir(),
            refresh_skew_secs: default_refresh_skew(),
            pkce_ttl_secs: default_pkce_ttl(),
            device_grace_secs: default_device_grace(),
            credential_retention_days: default_retention_days(),
            http_connect_timeout_secs: default_connect_timeout(),
            http_timeout_secs: default_http_timeout(),
            spotify: None,
            tidal: None,
            youtube: None,
        }
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = toml::from_str(s)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        match provider {
            Provider::Spotify => self.spotify.as_ref(),
            Provider::Tidal => self.tidal.as_ref(),
            Provider::YouTubeMusic => self.youtube.as_ref(),
        }
    }

    fn provider_mut(&mut self, provider: Provider) -> &mut Option<ProviderConfig> {
        match provider {
            Provider::Spotify => &mut self.spotify,
            Provider::Tidal => &mut self.tidal,
            Provider::YouTubeMusic => &mut self.youtube,
        }
    }

    /// Environment wins over the file: `SPOTIFY_CLIENT_ID`, `TIDAL_CLIENT_SECRET`,
    /// `YOUTUBE_REDIRECT_URI`, `*_AUTH_BASE`, `*_API_BASE`. A client id in the
    /// environment enables a provider the file leaves out.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|k| std::env::var(k).ok());
    }

    fn apply_overrides_from(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("MUSIC_AUTH_DB_PATH") {
            self.db_path = p.into();
        }
        for provider in Provider::ALL {
            let prefix = provider.as_str().to_ascii_uppercase();
            let get = |suffix: &str| var(&format!("{}_{}", prefix, suffix)).filter(|v| !v.is_empty());
            let slot = self.provider_mut(provider);
            if slot.is_none() {
                match get("CLIENT_ID") {
                    Some(_) => *slot = Some(ProviderConfig::default()),
                    None => continue,
                }
            }
            let Some(pc) = slot.as_mut() else { continue };
            if let Some(v) = get("CLIENT_ID") {
                pc.client_id = v;
            }
            if let Some(v) = get("CLIENT_SECRET") {
                pc.client_secret = Some(v);
            }
            if let Some(v) = get("REDIRECT_URI") {
                pc.redirect_uri = Some(v);
            }
            if let Some(v) = get("AUTH_BASE") {
                pc.auth_base = Some(v);
            }
            if let Some(v) = get("API_BASE") {
                pc.api_base = Some(v);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_skew_secs < 0 {
            return Err(anyhow!("refresh_skew_secs must not be negative"));
        }
        if self.pkce_ttl_secs <= 0 || self.credential_retention_days <= 0 {
            return Err(anyhow!("pkce_ttl_secs and credential_retention_days must be positive"));
        }
        if self.http_connect_timeout_secs == 0 || self.http_timeout_secs == 0 {
            return Err(anyhow!("http timeouts must be positive"));
        }
        let mut configured = 0;
        for provider in Provider::ALL {
            let Some(pc) = self.provider(provider) else { continue };
            configured += 1;
            if pc.client_id.trim().is_empty() {
                return Err(anyhow!("[{}] client_id is empty", provider));
            }
            for (field, value) in [
                ("redirect_uri", &pc.redirect_uri),
                ("auth_base", &pc.auth_base),
                ("api_base", &pc.api_base),
            ] {
                if let Some(v) = value {
                    url::Url::parse(v)
                        .map_err(|e| anyhow!("[{}] {} is not a valid URL: {}", provider, field, e))?;
                }
            }
        }
        if configured == 0 {
            return Err(anyhow!("no provider configured"));
        }
        Ok(())
    }
}
