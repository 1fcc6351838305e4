use super::oauth::{self, ClientAuth, IdentityParser, OAuthAdapter, ProviderProfile};
use crate::clock::Clock;
use crate::config::ProviderConfig;
use crate::models::{Provider, ProviderIdentity};
use reqwest::Client;
use std::sync::Arc;

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_BASE: &str = "https://oauth2.googleapis.com";
const API_BASE: &str = "https://www.googleapis.com/youtube/v3";
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

const SCOPES: &[&str] = &[
    "openid",
    "profile",
    "https://www.googleapis.com/auth/youtube.readonly",
];

/// YouTube Music through Google OAuth. `access_type=offline` and
/// `prompt=consent` make Google issue a refresh token on every login.
pub fn profile(cfg: &ProviderConfig) -> ProviderProfile {
    let token_base = oauth::base_or(&cfg.auth_base, TOKEN_BASE);
    let api = oauth::base_or(&cfg.api_base, API_BASE);
    let (authorize_url, userinfo_url) = match &cfg.auth_base {
        Some(_) => (
            format!("{}/authorize", token_base),
            format!("{}/userinfo", token_base),
        ),
        None => (AUTHORIZE_URL.to_string(), USERINFO_URL.to_string()),
    };
    ProviderProfile {
        provider: Provider::YouTubeMusic,
        authorize_url,
        token_url: format!("{}/token", token_base),
        identity_url: format!("{}/channels?part=snippet&mine=true", api),
        device_authorization_url: None,
        revocation_url: Some(format!("{}/revoke", token_base)),
        scopes: SCOPES.iter().map(|s| s.to_string()).collect(),
        client_auth: ClientAuth::Body,
        extra_authorize_params: vec![
            ("access_type".into(), "offline".into()),
            ("prompt".into(), "consent".into()),
            ("include_granted_scopes".into(), "true".into()),
        ],
        parse_identity,
        fallback_identity: Some((userinfo_url, parse_userinfo as IdentityParser)),
    }
}

pub fn adapter(cfg: &ProviderConfig, client: Client, clock: Arc<dyn Clock>) -> OAuthAdapter {
    oauth::adapter_from_config(profile(cfg), cfg, client, clock)
}

/// The first channel of the signed-in account stands in for the user.
fn parse_identity(j: &serde_json::Value) -> Option<ProviderIdentity> {
    let channel = j["items"].as_array()?.first()?;
    let user_id = channel["id"].as_str()?.to_string();
    let snippet = &channel["snippet"];
    Some(ProviderIdentity {
        display_name: snippet["title"].as_str().unwrap_or(&user_id).to_string(),
        country: snippet["country"].as_str().map(String::from),
        user_id,
    })
}

/// Google accounts without a channel still have an OpenID subject.
fn parse_userinfo(j: &serde_json::Value) -> Option<ProviderIdentity> {
    let user_id = j["sub"].as_str()?.to_string();
    Some(ProviderIdentity {
        display_name: j["name"].as_str().unwrap_or(&user_id).to_string(),
        country: None,
        user_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_from_first_channel() {
        let id = parse_identity(&json!({
            "items": [{"id": "UC123", "snippet": {"title": "Carol", "country": "DE"}}]
        }))
        .unwrap();
        assert_eq!(id.user_id, "UC123");
        assert_eq!(id.display_name, "Carol");
        assert!(parse_identity(&json!({"items": []})).is_none());
    }

    #[test]
    fn userinfo_subject_stands_in_without_a_channel() {
        let id = parse_userinfo(&json!({"sub": "1077", "name": "Dana"})).unwrap();
        assert_eq!(id.user_id, "1077");
        assert_eq!(id.display_name, "Dana");
        assert!(parse_userinfo(&json!({"name": "no subject"})).is_none());
        let p = profile(&ProviderConfig::default());
        assert_eq!(p.fallback_identity.as_ref().map(|(u, _)| u.as_str()), Some(USERINFO_URL));
    }

    #[test]
    fn requests_offline_access() {
        let p = profile(&ProviderConfig::default());
        assert!(p
            .extra_authorize_params
            .iter()
            .any(|(k, v)| k == "access_type" && v == "offline"));
        assert_eq!(p.revocation_url.as_deref(), Some("https://oauth2.googleapis.com/revoke"));
    }
}
