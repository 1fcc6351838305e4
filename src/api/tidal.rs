use super::oauth::{self, ClientAuth, OAuthAdapter, ProviderProfile};
use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::models::{Provider, ProviderIdentity};
use reqwest::Client;
use std::sync::Arc;

const LOGIN_URL: &str = "https://login.tidal.com/authorize";
const AUTH_BASE: &str = "https://auth.tidal.com";
const API_BASE: &str = "https://openapi.tidal.com/v2";

const SCOPES: &[&str] = &["user.read", "collection.read", "playlists.read"];

/// TIDAL: public client (client_id in the body), browser PKCE plus the
/// device authorization grant for clients without a redirect.
pub fn profile(cfg: &ProviderConfig) -> ProviderProfile {
    let auth = oauth::base_or(&cfg.auth_base, AUTH_BASE);
    let api = oauth::base_or(&cfg.api_base, API_BASE);
    // The login page lives on its own host unless everything is overridden.
    let authorize_url = match &cfg.auth_base {
        Some(_) => format!("{}/authorize", auth),
        None => LOGIN_URL.to_string(),
    };
    ProviderProfile {
        provider: Provider::Tidal,
        authorize_url,
        token_url: format!("{}/v1/oauth2/token", auth),
        identity_url: format!("{}/users/me", api),
        device_authorization_url: Some(format!("{}/v1/oauth2/device_authorization", auth)),
        revocation_url: None,
        scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
        client_auth: ClientAuth::Body,
        extra_authorize_params: Vec::new(),
        parse_identity,
        fallback_identity: None,
    }
}

pub fn adapter(cfg: &ProviderConfig, client: Client, clock: Arc<dyn Clock>) -> OAuthAdapter {
    oauth::adapter_from_config(profile(cfg), cfg, client, clock)
}

/// JSON:API document: `{"data": {"id": "...", "attributes": {...}}}`.
fn parse_identity(j: &serde_json::Value) -> Option<ProviderIdentity> {
    let data = &j["data"];
    let user_id = match &data["id"] {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let attrs = &data["attributes"];
    let display_name = attrs["username"]
        .as_str()
        .or_else(|| attrs["email"].as_str())
        .unwrap_or(&user_id)
        .to_string();
    Some(ProviderIdentity {
        display_name,
        country: attrs["country"].as_str().map(String::from),
        user_id,
    })
}
