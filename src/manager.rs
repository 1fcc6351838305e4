//! Token lifecycle: login URL -> code exchange -> stored credential ->
//! valid token on demand (refreshing transparently) -> disconnect.
//!
//! Per `(provider, visitor)` the states are Unauthenticated, HandshakePending
//! (only visible as a context-store entry), Authenticated and Refreshing.
//! Refreshes for one key are serialized so concurrent callers never trigger
//! two refresh_token grants for the same credential.

use crate::api::{self, ProviderAdapter};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db;
use crate::error::{AuthError, AuthResult};
use crate::models::{Credential, DeviceAuthSession, DevicePoll, Provider};
use crate::store::{ContextStore, CredentialStore, SqliteContextStore, SqliteCredentialStore};
use anyhow::{anyhow, Context};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct LifecyclePolicy {
    /// A token counts as stale from `expires_at - refresh_skew` on.
    pub refresh_skew: Duration,
    pub pkce_ttl: Duration,
    /// Extra lifetime of a device session after its own expiry.
    pub device_grace: Duration,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            refresh_skew: Duration::seconds(60),
            pkce_ttl: Duration::minutes(10),
            device_grace: Duration::minutes(5),
        }
    }
}

impl LifecyclePolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            refresh_skew: Duration::seconds(cfg.refresh_skew_secs),
            pkce_ttl: Duration::seconds(cfg.pkce_ttl_secs),
            device_grace: Duration::seconds(cfg.device_grace_secs),
        }
    }
}

type KeyLock = tokio::sync::Mutex<()>;

/// One async mutex per `(provider, visitor)`, alive only while someone holds it.
#[derive(Default)]
struct KeyedLocks {
    inner: Mutex<HashMap<(Provider, String), Weak<KeyLock>>>,
}

impl KeyedLocks {
    fn handle(&self, provider: Provider, visitor_id: &str) -> Arc<KeyLock> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (provider, visitor_id.to_string());
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        map.retain(|_, w| w.strong_count() > 0);
        let lock = Arc::new(KeyLock::new(()));
        map.insert(key, Arc::downgrade(&lock));
        lock
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Run a store call on the blocking pool.
async fn blocking<T, F>(f: F) -> AuthResult<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AuthError::Storage(anyhow!("store task failed: {}", e)))?
        .map_err(AuthError::Storage)
}

pub struct TokenLifecycleManager {
    adapters: HashMap<Provider, Arc<dyn ProviderAdapter>>,
    credentials: Arc<dyn CredentialStore>,
    contexts: Arc<dyn ContextStore>,
    clock: Arc<dyn Clock>,
    policy: LifecyclePolicy,
    locks: KeyedLocks,
}

impl TokenLifecycleManager {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        contexts: Arc<dyn ContextStore>,
        clock: Arc<dyn Clock>,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            adapters: HashMap::new(),
            credentials,
            contexts,
            clock,
            policy,
            locks: KeyedLocks::default(),
        }
    }

    /// Register (or replace) the adapter for its provider.
    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// SQLite-backed stores, shared HTTP client, one adapter per configured provider.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let pool = db::open_pool(&cfg.db_path)?;
        let credentials = Arc::new(SqliteCredentialStore::new(
            pool.clone(),
            Duration::days(cfg.credential_retention_days),
            clock.clone(),
        ));
        let contexts = Arc::new(SqliteContextStore::new(pool, clock.clone()));
        let http = api::oauth::http_client(
            std::time::Duration::from_secs(cfg.http_connect_timeout_secs),
            std::time::Duration::from_secs(cfg.http_timeout_secs),
        )
        .context("building HTTP client")?;

        let mut manager = Self::new(
            credentials,
            contexts,
            clock.clone(),
            LifecyclePolicy::from_config(cfg),
        );
        for provider in Provider::ALL {
            let Some(pc) = cfg.provider(provider) else { continue };
            let adapter: Arc<dyn ProviderAdapter> = match provider {
                Provider::Spotify => Arc::new(api::spotify::adapter(pc, http.clone(), clock.clone())),
                Provider::Tidal => Arc::new(api::tidal::adapter(pc, http.clone(), clock.clone())),
                Provider::YouTubeMusic => {
                    Arc::new(api::youtube::adapter(pc, http.clone(), clock.clone()))
                }
            };
            manager = manager.with_adapter(adapter);
        }
        Ok(manager)
    }

    pub fn policy(&self) -> &LifecyclePolicy {
        &self.policy
    }

    pub fn configured_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.adapters.contains_key(p))
            .collect()
    }

    fn adapter(&self, provider: Provider) -> AuthResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(AuthError::ProviderNotConfigured(provider))
    }

    async fn load_credential(&self, provider: Provider, visitor_id: &str) -> AuthResult<Option<Credential>> {
        let store = self.credentials.clone();
        let visitor = visitor_id.to_string();
        blocking(move || store.get(provider, &visitor)).await
    }

    async fn save_credential(&self, credential: Credential) -> AuthResult<()> {
        let store = self.credentials.clone();
        blocking(move || store.save(credential.provider, &credential.visitor_id, &credential)).await
    }

    async fn remove_credential(&self, provider: Provider, visitor_id: &str) -> AuthResult<()> {
        let store = self.credentials.clone();
        let visitor = visitor_id.to_string();
        blocking(move || store.remove(provider, &visitor)).await
    }

    async fn store_device_session(&self, session: &DeviceAuthSession) -> AuthResult<()> {
        let ttl = (session.expires_at - self.clock.now()) + self.policy.device_grace;
        let contexts = self.contexts.clone();
        let session = session.clone();
        blocking(move || contexts.put_device_session(&session, ttl)).await
    }

    /// Start a browser login. Each call issues an independent state/verifier
    /// pair; earlier ones stay valid until their own TTL runs out.
    pub async fn get_login_url(
        &self,
        provider: Provider,
        visitor_id: &str,
        redirect_uri: &str,
    ) -> AuthResult<String> {
        let adapter = self.adapter(provider)?;
        let request = adapter.build_authorization_url(visitor_id, redirect_uri)?;
        let contexts = self.contexts.clone();
        let ttl = self.policy.pkce_ttl;
        let state = request.state.clone();
        let context = request.context.clone();
        blocking(move || contexts.put_pkce_context(&state, &context, ttl)).await?;
        info!(%provider, visitor = visitor_id, "issued login URL");
        Ok(request.url)
    }

    /// Finish a browser login. The visitor comes from the consumed context,
    /// never from the caller, and a state can be used exactly once.
    pub async fn complete_authorization(
        &self,
        provider: Provider,
        code: &str,
        state: &str,
        redirect_uri: &str,
    ) -> AuthResult<Credential> {
        let adapter = self.adapter(provider)?;
        let contexts = self.contexts.clone();
        let state_owned = state.to_string();
        let context = blocking(move || contexts.take_pkce_context(&state_owned))
            .await?
            .ok_or(AuthError::InvalidOrExpiredState)?;
        if context.provider.map_or(false, |p| p != provider) {
            warn!(%provider, "authorization state was issued for another provider");
            return Err(AuthError::InvalidOrExpiredState);
        }

        let mut credential = adapter.exchange_code(code, &context, redirect_uri).await?;
        credential.provider = provider;
        credential.visitor_id = context.visitor_id.clone();

        let handle = self.locks.handle(provider, &context.visitor_id);
        let _guard = handle.lock().await;
        self.save_credential(credential.clone()).await?;
        info!(
            %provider,
            visitor = %context.visitor_id,
            provider_user = %credential.provider_user_id,
            "provider connected"
        );
        Ok(credential)
    }

    /// Current credential, refreshed first if it is within the skew of expiry.
    pub async fn get_valid_credential(
        &self,
        provider: Provider,
        visitor_id: &str,
    ) -> AuthResult<Credential> {
        let credential = self
            .load_credential(provider, visitor_id)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;
        if credential.is_fresh(self.clock.now(), self.policy.refresh_skew) {
            return Ok(credential);
        }

        let adapter = self.adapter(provider)?;
        let handle = self.locks.handle(provider, visitor_id);
        let _guard = handle.lock().await;

        // Whoever held the lock before us may already have refreshed or evicted.
        let credential = self
            .load_credential(provider, visitor_id)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;
        if credential.is_fresh(self.clock.now(), self.policy.refresh_skew) {
            debug!(%provider, visitor = visitor_id, "token refreshed by a concurrent caller");
            return Ok(credential);
        }

        debug!(%provider, visitor = visitor_id, "token stale; refreshing");
        match adapter.refresh(&credential).await {
            Ok(mut refreshed) => {
                refreshed.provider = provider;
                refreshed.visitor_id = visitor_id.to_string();
                self.save_credential(refreshed.clone()).await?;
                info!(%provider, visitor = visitor_id, expires_at = %refreshed.expires_at, "token refreshed");
                Ok(refreshed)
            }
            Err(AuthError::ReauthorizationRequired) => {
                warn!(%provider, visitor = visitor_id, "refresh token rejected; evicting credential");
                self.remove_credential(provider, visitor_id).await?;
                Err(AuthError::NotAuthenticated)
            }
            Err(e) => {
                warn!(%provider, visitor = visitor_id, error = %e, "token refresh failed");
                Err(e)
            }
        }
    }

    pub async fn get_valid_token(&self, provider: Provider, visitor_id: &str) -> AuthResult<String> {
        Ok(self.get_valid_credential(provider, visitor_id).await?.access_token)
    }

    /// Forget the credential. Server-side revocation only happens when the
    /// adapter is configured for it, and its failure never blocks removal.
    pub async fn disconnect(&self, provider: Provider, visitor_id: &str) -> AuthResult<()> {
        let handle = self.locks.handle(provider, visitor_id);
        let _guard = handle.lock().await;
        if let (Some(credential), Ok(adapter)) = (
            self.load_credential(provider, visitor_id).await?,
            self.adapter(provider),
        ) {
            if let Err(e) = adapter.revoke(&credential).await {
                warn!(%provider, visitor = visitor_id, error = %e, "server-side revoke failed");
            }
        }
        self.remove_credential(provider, visitor_id).await?;
        info!(%provider, visitor = visitor_id, "provider disconnected");
        Ok(())
    }

    pub async fn is_connected(&self, provider: Provider, visitor_id: &str) -> AuthResult<bool> {
        let store = self.credentials.clone();
        let visitor = visitor_id.to_string();
        blocking(move || store.exists(provider, &visitor)).await
    }

    /// Start an RFC 8628 device authorization. The session is not tied to a
    /// visitor until a poll succeeds.
    pub async fn init_device_authorization(&self, provider: Provider) -> AuthResult<DeviceAuthSession> {
        let adapter = self.adapter(provider)?;
        if !adapter.supports_device_flow() {
            return Err(AuthError::UnsupportedFlow {
                provider,
                flow: "device authorization",
            });
        }
        let session = adapter.init_device_authorization().await?;
        self.store_device_session(&session).await?;
        info!(%provider, user_code = %session.user_code, "device authorization started");
        Ok(session)
    }

    /// Poll once. On approval the credential is bound to `visitor_id` and
    /// stored; approval and denial are reported once and end the session.
    /// Past the session's expiry (local or provider-reported) the result is
    /// `DeviceCodeExpired` until the grace period drops the session.
    pub async fn poll_device(&self, device_code: &str, visitor_id: &str) -> AuthResult<DevicePoll> {
        let contexts = self.contexts.clone();
        let code = device_code.to_string();
        let session = blocking(move || contexts.get_device_session(&code))
            .await?
            .ok_or(AuthError::InvalidOrExpiredState)?;
        if self.clock.now() >= session.expires_at {
            return Err(AuthError::DeviceCodeExpired);
        }
        let adapter = self.adapter(session.provider)?;

        let outcome = adapter.poll_device_authorization(&session).await;
        match outcome {
            Ok(DevicePoll::Pending { interval }) => {
                if interval > session.interval {
                    let slowed = DeviceAuthSession {
                        interval,
                        ..session
                    };
                    self.store_device_session(&slowed).await?;
                }
                Ok(DevicePoll::Pending { interval })
            }
            Ok(DevicePoll::Complete(mut credential)) => {
                self.end_device_session(device_code).await?;
                credential.provider = session.provider;
                credential.visitor_id = visitor_id.to_string();
                let handle = self.locks.handle(session.provider, visitor_id);
                let _guard = handle.lock().await;
                self.save_credential(credential.clone()).await?;
                info!(provider = %session.provider, visitor = visitor_id, "provider connected via device flow");
                Ok(DevicePoll::Complete(credential))
            }
            Err(e) if e.is_transient() => Err(e),
            Err(AuthError::DeviceCodeExpired) => {
                // Keep the session, marked expired, so late polls still see the expiry.
                let expired = DeviceAuthSession {
                    expires_at: self.clock.now(),
                    ..session
                };
                self.store_device_session(&expired).await?;
                warn!(provider = %expired.provider, "device code expired at the provider");
                Err(AuthError::DeviceCodeExpired)
            }
            Err(e) => {
                self.end_device_session(device_code).await?;
                warn!(provider = %session.provider, error = %e, "device authorization ended");
                Err(e)
            }
        }
    }

    async fn end_device_session(&self, device_code: &str) -> AuthResult<()> {
        let contexts = self.contexts.clone();
        let code = device_code.to_string();
        blocking(move || contexts.remove_device_session(&code)).await
    }

    /// Sweep abandoned handshakes.
    pub async fn purge_expired_contexts(&self) -> AuthResult<usize> {
        let contexts = self.contexts.clone();
        blocking(move || contexts.purge_expired()).await
    }

    /// Drop credentials of visitors inactive for longer than the retention window.
    pub async fn purge_stale_credentials(&self) -> AuthResult<usize> {
        let store = self.credentials.clone();
        let purged = blocking(move || store.purge_stale()).await?;
        if purged > 0 {
            info!(purged, "purged credentials past retention");
        }
        Ok(purged)
    }
}
