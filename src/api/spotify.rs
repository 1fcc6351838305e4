use super::oauth::{self, ClientAuth, OAuthAdapter, ProviderProfile};
use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::models::{Provider, ProviderIdentity};
use reqwest::Client;
use std::sync::Arc;

const AUTH_BASE: &str = "https://accounts.spotify.com";
const API_BASE: &str = "https://api.spotify.com/v1";

/// Read access needed by the playlist/library import.
const SCOPES: &[&str] = &[
    "user-read-private",
    "user-read-email",
    "playlist-read-private",
    "playlist-read-collaborative",
    "user-library-read",
];

/// Spotify: HTTP Basic client auth on `/api/token`, identity from `/me`.
pub fn profile(cfg: &ProviderConfig) -> ProviderProfile {
    let auth = oauth::base_or(&cfg.auth_base, AUTH_BASE);
    let api = oauth::base_or(&cfg.api_base, API_BASE);
    ProviderProfile {
        provider: Provider::Spotify,
        authorize_url: format!("{}/authorize", auth),
        token_url: format!("{}/api/token", auth),
        identity_url: format!("{}/me", api),
        device_authorization_url: None,
        revocation_url: None,
        scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
        client_auth: ClientAuth::Basic,
        extra_authorize_params: vec![("show_dialog".into(), "true".into())],
        parse_identity,
        fallback_identity: None,
    }
}

pub fn adapter(cfg: &ProviderConfig, client: Client, clock: Arc<dyn Clock>) -> OAuthAdapter {
    oauth::adapter_from_config(profile(cfg), cfg, client, clock)
}

fn parse_identity(j: &serde_json::Value) -> Option<ProviderIdentity> {
    let user_id = j["id"].as_str()?.to_string();
    let display_name = j["display_name"]
        .as_str()
        .filter(|s| !s.is_empty())
        .unwrap_or(&user_id)
        .to_string();
    Some(ProviderIdentity {
        display_name,
        country: j["country"].as_str().map(String::from),
        user_id,
    })
}
