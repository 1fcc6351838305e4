use super::{pkce, ProviderAdapter};
use crate::clock::Clock;
use crate::error::{AuthError, AuthResult};
use crate::models::{
    AuthorizationRequest, Credential, DeviceAuthSession, DevicePoll, PkceContext, Provider,
    token_lifetime, ProviderIdentity, RefreshTokenRotation, TokenGrant,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use log::{debug, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// RFC 8628 §3.5: on `slow_down` the interval grows by 5 seconds.
const SLOW_DOWN_STEP: i64 = 5;

/// How the client authenticates to the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuth {
    /// `Authorization: Basic base64(client_id:client_secret)`.
    Basic,
    /// `client_id` (and `client_secret` if set) in the form body.
    Body,
}

/// Reads the provider user out of an identity response; `None` when it names nobody.
pub type IdentityParser = fn(&serde_json::Value) -> Option<ProviderIdentity>;

/// Everything provider-specific, as data. One generic adapter drives all of them.
#[derive(Clone)]
pub struct ProviderProfile {
    pub provider: Provider,
    pub authorize_url: String,
    pub token_url: String,
    pub identity_url: String,
    pub device_authorization_url: Option<String>,
    pub revocation_url: Option<String>,
    pub scopes: Vec<String>,
    pub client_auth: ClientAuth,
    pub extra_authorize_params: Vec<(String, String)>,
    pub parse_identity: IdentityParser,
    /// Second identity endpoint, asked only when the first names no user.
    pub fallback_identity: Option<(String, IdentityParser)>,
}

#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterOptions {
    pub revoke_on_disconnect: bool,
    pub rotation: RefreshTokenRotation,
}

/// Build the shared HTTP client; every provider call carries these timeouts.
pub fn http_client(
    connect_timeout: std::time::Duration,
    timeout: std::time::Duration,
) -> anyhow::Result<Client> {
    let client = Client::builder()
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .user_agent(concat!("music-provider-auth/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceAuthorizationResponse {
    #[serde(alias = "deviceCode")]
    device_code: String,
    #[serde(alias = "userCode")]
    user_code: String,
    #[serde(alias = "verificationUri", alias = "verification_url")]
    verification_uri: String,
    #[serde(default, alias = "verificationUriComplete")]
    verification_uri_complete: Option<String>,
    #[serde(alias = "expiresIn")]
    expires_in: i64,
    #[serde(default = "default_interval")]
    interval: i64,
}

fn default_interval() -> i64 {
    5
}

/// Token endpoint answer that reached us intact.
enum TokenReply {
    Granted(TokenGrant),
    Rejected { status: StatusCode, error: String, description: Option<String> },
}

impl TokenReply {
    fn describe(error: &str, description: &Option<String>) -> String {
        match description {
            Some(d) if !d.is_empty() => format!("{}: {}", error, d),
            _ => error.to_string(),
        }
    }
}

pub struct OAuthAdapter {
    profile: ProviderProfile,
    credentials: ClientCredentials,
    options: AdapterOptions,
    client: Client,
    clock: Arc<dyn Clock>,
}

impl OAuthAdapter {
    pub fn new(
        profile: ProviderProfile,
        credentials: ClientCredentials,
        options: AdapterOptions,
        client: Client,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            profile,
            credentials,
            options,
            client,
            clock,
        }
    }

    pub fn profile(&self) -> &ProviderProfile {
        &self.profile
    }

    fn with_client_auth(
        &self,
        req: RequestBuilder,
        form: &mut Vec<(&'static str, String)>,
    ) -> RequestBuilder {
        match self.profile.client_auth {
            ClientAuth::Basic => {
                let secret = self.credentials.client_secret.clone().unwrap_or_default();
                let auth_header = format!(
                    "Basic {}",
                    general_purpose::STANDARD
                        .encode(format!("{}:{}", self.credentials.client_id, secret))
                );
                req.header(AUTHORIZATION, auth_header)
            }
            ClientAuth::Body => {
                form.push(("client_id", self.credentials.client_id.clone()));
                if let Some(secret) = self.credentials.client_secret.as_ref().filter(|s| !s.is_empty()) {
                    form.push(("client_secret", secret.clone()));
                }
                req
            }
        }
    }

    /// POST a form to `url` with client authentication. Transport failures,
    /// 5xx and 429 are `ProviderUnreachable`; everything else is a reply.
    async fn post_form(
        &self,
        url: &str,
        mut form: Vec<(&'static str, String)>,
    ) -> AuthResult<(StatusCode, String)> {
        let req = self.client.post(url).header(ACCEPT, "application/json");
        let req = self.with_client_auth(req, &mut form);
        let resp = req.form(&form).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::ProviderUnreachable(format!(
                "{} answered {}",
                self.profile.provider, status
            )));
        }
        Ok((status, body))
    }

    async fn post_token(&self, form: Vec<(&'static str, String)>) -> AuthResult<TokenReply> {
        let (status, body) = self.post_form(&self.profile.token_url, form).await?;
        if status.is_success() {
            let grant: TokenGrant =
                serde_json::from_str(&body).map_err(|e| malformed(self.profile.provider, e))?;
            return Ok(TokenReply::Granted(grant));
        }
        let parsed: Option<OAuthErrorBody> = serde_json::from_str(&body).ok();
        let (error, description) = match parsed {
            Some(OAuthErrorBody {
                error: Some(error),
                error_description,
            }) => (error, error_description),
            Some(OAuthErrorBody {
                error: None,
                error_description,
            }) => (status.to_string(), error_description),
            None => (status.to_string(), Some(body).filter(|b| !b.is_empty())),
        };
        Ok(TokenReply::Rejected {
            status,
            error,
            description,
        })
    }

    async fn identity_document(&self, url: &str, access_token: &str) -> AuthResult<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = resp.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AuthError::ProviderUnreachable(format!(
                "{} identity lookup answered {}",
                self.profile.provider, status
            )));
        }
        if !status.is_success() {
            let txt = resp.text().await.unwrap_or_default();
            return Err(AuthError::AuthExchangeFailed(format!(
                "identity lookup failed: {} => {}",
                status, txt
            )));
        }
        Ok(resp.json().await?)
    }

    async fn fetch_identity(&self, access_token: &str) -> AuthResult<ProviderIdentity> {
        let j = self
            .identity_document(&self.profile.identity_url, access_token)
            .await?;
        if let Some(identity) = (self.profile.parse_identity)(&j) {
            return Ok(identity);
        }
        if let Some((url, parse)) = &self.profile.fallback_identity {
            debug!(
                "{} identity response names no user; trying fallback endpoint",
                self.profile.provider
            );
            let j = self.identity_document(url, access_token).await?;
            if let Some(identity) = parse(&j) {
                return Ok(identity);
            }
        }
        Err(AuthError::AuthExchangeFailed(
            "identity response has no user id".into(),
        ))
    }

    fn scope(&self) -> String {
        self.profile.scopes.join(" ")
    }
}

fn malformed(provider: Provider, e: serde_json::Error) -> AuthError {
    AuthError::AuthExchangeFailed(format!("malformed {} response: {}", provider, e))
}

#[async_trait]
impl ProviderAdapter for OAuthAdapter {
    fn provider(&self) -> Provider {
        self.profile.provider
    }

    fn supports_device_flow(&self) -> bool {
        self.profile.device_authorization_url.is_some()
    }

    fn build_authorization_url(
        &self,
        visitor_id: &str,
        redirect_uri: &str,
    ) -> AuthResult<AuthorizationRequest> {
        let verifier = pkce::generate_code_verifier();
        let challenge = pkce::code_challenge_s256(&verifier);
        let state = pkce::generate_state();

        let mut url = Url::parse(&self.profile.authorize_url)
            .map_err(|_| AuthError::ProviderNotConfigured(self.profile.provider))?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("response_type", "code")
                .append_pair("client_id", &self.credentials.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.scope())
                .append_pair("state", &state)
                .append_pair("code_challenge_method", "S256")
                .append_pair("code_challenge", &challenge);
            for (k, v) in &self.profile.extra_authorize_params {
                q.append_pair(k, v);
            }
        }

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
            context: PkceContext {
                code_verifier: verifier,
                visitor_id: visitor_id.to_string(),
                provider: Some(self.profile.provider),
            },
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        context: &PkceContext,
        redirect_uri: &str,
    ) -> AuthResult<Credential> {
        let form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri.to_string()),
            ("code_verifier", context.code_verifier.clone()),
        ];
        let grant = match self.post_token(form).await? {
            TokenReply::Granted(grant) => grant,
            TokenReply::Rejected {
                status,
                error,
                description,
            } => {
                warn!(
                    "{} code exchange rejected ({}): {}",
                    self.profile.provider, status, error
                );
                return Err(AuthError::AuthExchangeFailed(TokenReply::describe(
                    &error,
                    &description,
                )));
            }
        };
        let issued_at = self.clock.now();
        let identity = self.fetch_identity(&grant.access_token).await?;
        debug!(
            "{} code exchange succeeded for provider user {}",
            self.profile.provider, identity.user_id
        );
        Ok(Credential::from_grant(
            self.profile.provider,
            &context.visitor_id,
            grant,
            identity,
            issued_at,
        ))
    }

    async fn refresh(&self, credential: &Credential) -> AuthResult<Credential> {
        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or(AuthError::ReauthorizationRequired)?;
        let form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        match self.post_token(form).await? {
            TokenReply::Granted(grant) => {
                debug!("{} token refreshed", self.profile.provider);
                Ok(credential.refreshed(grant, self.clock.now(), self.options.rotation))
            }
            TokenReply::Rejected { error, .. } if error == "invalid_grant" => {
                warn!("{} refresh token rejected as invalid_grant", self.profile.provider);
                Err(AuthError::ReauthorizationRequired)
            }
            TokenReply::Rejected {
                status,
                error,
                description,
            } => {
                warn!(
                    "{} refresh failed ({}): {}",
                    self.profile.provider, status, error
                );
                Err(AuthError::AuthExchangeFailed(TokenReply::describe(
                    &error,
                    &description,
                )))
            }
        }
    }

    async fn init_device_authorization(&self) -> AuthResult<DeviceAuthSession> {
        let url = self
            .profile
            .device_authorization_url
            .clone()
            .ok_or(AuthError::UnsupportedFlow {
                provider: self.profile.provider,
                flow: "device authorization",
            })?;
        let form = vec![("scope", self.scope())];
        let (status, body) = self.post_form(&url, form).await?;
        if !status.is_success() {
            let parsed: Option<OAuthErrorBody> = serde_json::from_str(&body).ok();
            let msg = match parsed {
                Some(OAuthErrorBody {
                    error: Some(e),
                    error_description,
                }) => TokenReply::describe(&e, &error_description),
                _ => format!("device authorization failed: {} => {}", status, body),
            };
            return Err(AuthError::AuthExchangeFailed(msg));
        }
        let r: DeviceAuthorizationResponse = serde_json::from_str(&body)
            .map_err(|e| malformed(self.profile.provider, e))?;
        // Tidal hands out the bare host; make it clickable.
        let verification_uri = if r.verification_uri.starts_with("http") {
            r.verification_uri
        } else {
            format!("https://{}", r.verification_uri)
        };
        let verification_uri_complete = r.verification_uri_complete.map(|u| {
            if u.starts_with("http") {
                u
            } else {
                format!("https://{}", u)
            }
        });
        Ok(DeviceAuthSession {
            provider: self.profile.provider,
            device_code: r.device_code,
            user_code: r.user_code,
            verification_uri,
            verification_uri_complete,
            expires_in: r.expires_in,
            interval: r.interval,
            expires_at: self.clock.now() + token_lifetime(r.expires_in),
        })
    }

    async fn poll_device_authorization(&self, session: &DeviceAuthSession) -> AuthResult<DevicePoll> {
        let form = vec![
            ("grant_type", DEVICE_CODE_GRANT.to_string()),
            ("device_code", session.device_code.clone()),
            ("scope", self.scope()),
        ];
        match self.post_token(form).await? {
            TokenReply::Granted(grant) => {
                let issued_at = self.clock.now();
                let identity = self.fetch_identity(&grant.access_token).await?;
                Ok(DevicePoll::Complete(Credential::from_grant(
                    self.profile.provider,
                    "",
                    grant,
                    identity,
                    issued_at,
                )))
            }
            TokenReply::Rejected { error, description, .. } => match error.as_str() {
                "authorization_pending" => Ok(DevicePoll::Pending {
                    interval: session.interval,
                }),
                "slow_down" => Ok(DevicePoll::Pending {
                    interval: session.interval + SLOW_DOWN_STEP,
                }),
                "expired_token" => Err(AuthError::DeviceCodeExpired),
                "access_denied" => Err(AuthError::AccessDenied),
                _ => Err(AuthError::AuthExchangeFailed(TokenReply::describe(
                    &error,
                    &description,
                ))),
            },
        }
    }

    async fn revoke(&self, credential: &Credential) -> AuthResult<()> {
        if !self.options.revoke_on_disconnect {
            return Ok(());
        }
        let Some(url) = self.profile.revocation_url.clone() else {
            debug!(
                "{} has no revocation endpoint; skipping server-side revoke",
                self.profile.provider
            );
            return Ok(());
        };
        let (form, hint) = match &credential.refresh_token {
            Some(rt) => (vec![("token", rt.clone())], "refresh_token"),
            None => (vec![("token", credential.access_token.clone())], "access_token"),
        };
        let mut form = form;
        form.push(("token_type_hint", hint.to_string()));
        let (status, body) = self.post_form(&url, form).await?;
        if !status.is_success() {
            return Err(AuthError::AuthExchangeFailed(format!(
                "revocation failed: {} => {}",
                status, body
            )));
        }
        Ok(())
    }
}

/// Wire an adapter from a profile and the provider's config table.
pub fn adapter_from_config(
    profile: ProviderProfile,
    cfg: &crate::config::ProviderConfig,
    client: Client,
    clock: Arc<dyn Clock>,
) -> OAuthAdapter {
    let mut profile = profile;
    if let Some(scopes) = &cfg.scopes {
        profile.scopes = scopes.clone();
    }
    OAuthAdapter::new(
        profile,
        ClientCredentials {
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
        },
        AdapterOptions {
            revoke_on_disconnect: cfg.revoke_on_disconnect,
            rotation: cfg.refresh_token_rotation,
        },
        client,
        clock,
    )
}

/// Base URL from config, or the provider default, without a trailing slash.
pub(crate) fn base_or(configured: &Option<String>, default: &str) -> String {
    configured
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}
