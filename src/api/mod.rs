pub mod mock;
pub mod oauth;
pub mod pkce;
pub mod spotify;
pub mod tidal;
pub mod youtube;

use crate::error::{AuthError, AuthResult};
use crate::models::{AuthorizationRequest, Credential, DeviceAuthSession, DevicePoll, PkceContext, Provider};

/// Provider adapter: the operations the lifecycle manager needs from one
/// identity provider. Implementations: oauth::OAuthAdapter (configured by the
/// spotify/tidal/youtube profiles) and mock::MockAdapter.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// True when the adapter implements the RFC 8628 device flow.
    fn supports_device_flow(&self) -> bool {
        false
    }

    /// Build the login URL with a fresh `state` and PKCE pair. The caller
    /// persists `(state -> context)` before handing the URL out.
    fn build_authorization_url(
        &self,
        visitor_id: &str,
        redirect_uri: &str,
    ) -> AuthResult<AuthorizationRequest>;

    /// Trade an authorization code for a credential, including one identity lookup.
    async fn exchange_code(
        &self,
        code: &str,
        context: &PkceContext,
        redirect_uri: &str,
    ) -> AuthResult<Credential>;

    /// refresh_token grant. A dead refresh token is `ReauthorizationRequired`.
    async fn refresh(&self, credential: &Credential) -> AuthResult<Credential>;

    async fn init_device_authorization(&self) -> AuthResult<DeviceAuthSession> {
        Err(AuthError::UnsupportedFlow {
            provider: self.provider(),
            flow: "device authorization",
        })
    }

    /// One poll for `session.device_code`. A returned credential is not yet
    /// bound to a visitor.
    async fn poll_device_authorization(&self, _session: &DeviceAuthSession) -> AuthResult<DevicePoll> {
        Err(AuthError::UnsupportedFlow {
            provider: self.provider(),
            flow: "device authorization",
        })
    }

    /// Server-side revocation on disconnect. No-op unless the adapter opts in.
    async fn revoke(&self, _credential: &Credential) -> AuthResult<()> {
        Ok(())
    }
}
