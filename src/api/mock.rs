use super::{pkce, ProviderAdapter};
use crate::clock::Clock;
use crate::error::{AuthError, AuthResult};
use crate::models::{
    AuthorizationRequest, Credential, DeviceAuthSession, DevicePoll, PkceContext, Provider,
    ProviderIdentity, RefreshTokenRotation, TokenGrant,
};
use async_trait::async_trait;
use chrono::Duration;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::info;

/// What the next refresh should do.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// Issue `AT-refreshed-{n}` access tokens valid for `expires_in` seconds.
    Succeed { expires_in: i64 },
    Reauthorize,
    Unreachable,
}

/// Scripted device-poll replies, consumed front to back.
#[derive(Debug, Clone)]
pub enum DeviceStep {
    Pending,
    SlowDown,
    Approve,
    Deny,
    Expire,
}

/// Deterministic adapter for tests and offline development. Issues fake
/// tokens, counts calls, and can be scripted to fail.
pub struct MockAdapter {
    provider: Provider,
    clock: Arc<dyn Clock>,
    grant: TokenGrant,
    refresh_outcome: Mutex<RefreshOutcome>,
    refresh_delay: std::time::Duration,
    device_script: Mutex<VecDeque<DeviceStep>>,
    exchange_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(provider: Provider, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            clock,
            grant: TokenGrant {
                access_token: "AT".into(),
                token_type: Some("Bearer".into()),
                expires_in: 3600,
                refresh_token: Some("RT".into()),
                scope: None,
            },
            refresh_outcome: Mutex::new(RefreshOutcome::Succeed { expires_in: 3600 }),
            refresh_delay: std::time::Duration::ZERO,
            device_script: Mutex::new(VecDeque::new()),
            exchange_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            revoke_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    /// Grant returned by code exchange and device approval.
    pub fn with_grant(mut self, grant: TokenGrant) -> Self {
        self.grant = grant;
        self
    }

    /// Make each refresh take a while, to widen race windows in tests.
    pub fn with_refresh_delay(mut self, delay: std::time::Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_device_script(self, steps: Vec<DeviceStep>) -> Self {
        *self.device_script.lock().unwrap_or_else(|e| e.into_inner()) = steps.into();
        self
    }

    pub fn set_refresh_outcome(&self, outcome: RefreshOutcome) {
        *self.refresh_outcome.lock().unwrap_or_else(|e| e.into_inner()) = outcome;
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
    pub fn revoke_calls(&self) -> usize {
        self.revoke_calls.load(Ordering::SeqCst)
    }
    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            user_id: format!("{}-user", self.provider),
            display_name: "Mock User".into(),
            country: None,
        }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn supports_device_flow(&self) -> bool {
        true
    }

    fn build_authorization_url(
        &self,
        visitor_id: &str,
        redirect_uri: &str,
    ) -> AuthResult<AuthorizationRequest> {
        let verifier = pkce::generate_code_verifier();
        let state = pkce::generate_state();
        let mut url = url::Url::parse("https://mock.invalid/authorize")
            .map_err(|_| AuthError::ProviderNotConfigured(self.provider))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", &state)
            .append_pair("code_challenge_method", "S256")
            .append_pair("code_challenge", &pkce::code_challenge_s256(&verifier));
        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
            context: PkceContext {
                code_verifier: verifier,
                visitor_id: visitor_id.to_string(),
                provider: Some(self.provider),
            },
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        context: &PkceContext,
        _redirect_uri: &str,
    ) -> AuthResult<Credential> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        info!("MockAdapter: exchange_code for {}", self.provider);
        if code.is_empty() || code == "bad" {
            return Err(AuthError::AuthExchangeFailed(
                "invalid_grant: Invalid authorization code".into(),
            ));
        }
        Ok(Credential::from_grant(
            self.provider,
            &context.visitor_id,
            self.grant.clone(),
            self.identity(),
            self.clock.now(),
        ))
    }

    async fn refresh(&self, credential: &Credential) -> AuthResult<Credential> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        info!("MockAdapter: refresh #{} for {}", n, self.provider);
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let outcome = self
            .refresh_outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match outcome {
            RefreshOutcome::Succeed { expires_in } => {
                if credential.refresh_token.is_none() {
                    return Err(AuthError::ReauthorizationRequired);
                }
                let grant = TokenGrant {
                    access_token: format!("AT-refreshed-{}", n),
                    token_type: Some("Bearer".into()),
                    expires_in,
                    refresh_token: None,
                    scope: None,
                };
                Ok(credential.refreshed(grant, self.clock.now(), RefreshTokenRotation::Preserve))
            }
            RefreshOutcome::Reauthorize => Err(AuthError::ReauthorizationRequired),
            RefreshOutcome::Unreachable => Err(AuthError::ProviderUnreachable(
                "mock provider timed out".into(),
            )),
        }
    }

    async fn init_device_authorization(&self) -> AuthResult<DeviceAuthSession> {
        let device_code = pkce::generate_state();
        Ok(DeviceAuthSession {
            provider: self.provider,
            user_code: device_code[..6].to_ascii_uppercase(),
            device_code,
            verification_uri: "https://mock.invalid/device".into(),
            verification_uri_complete: None,
            expires_in: 300,
            interval: 5,
            expires_at: self.clock.now() + Duration::seconds(300),
        })
    }

    async fn poll_device_authorization(&self, session: &DeviceAuthSession) -> AuthResult<DevicePoll> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .device_script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(DeviceStep::Pending);
        match step {
            DeviceStep::Pending => Ok(DevicePoll::Pending {
                interval: session.interval,
            }),
            DeviceStep::SlowDown => Ok(DevicePoll::Pending {
                interval: session.interval + 5,
            }),
            DeviceStep::Approve => Ok(DevicePoll::Complete(Credential::from_grant(
                self.provider,
                "",
                self.grant.clone(),
                self.identity(),
                self.clock.now(),
            ))),
            DeviceStep::Deny => Err(AuthError::AccessDenied),
            DeviceStep::Expire => Err(AuthError::DeviceCodeExpired),
        }
    }

    async fn revoke(&self, _credential: &Credential) -> AuthResult<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
