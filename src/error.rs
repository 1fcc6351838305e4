use crate::models::Provider;

/// Failures surfaced by the token lifecycle core.
///
/// Callers branch on the variant: `requires_login` errors mean "send the user
/// through the login flow again", `ProviderUnreachable` is the only transient one.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authorization state is missing, expired or already used")]
    InvalidOrExpiredState,
    #[error("provider rejected the authorization: {0}")]
    AuthExchangeFailed(String),
    #[error("provider unreachable: {0}")]
    ProviderUnreachable(String),
    #[error("refresh token is no longer valid; reauthorization required")]
    ReauthorizationRequired,
    #[error("no credential stored for this provider and visitor")]
    NotAuthenticated,
    #[error("device code expired before the user confirmed")]
    DeviceCodeExpired,
    #[error("user denied the device authorization")]
    AccessDenied,
    #[error("{provider} does not support the {flow} flow")]
    UnsupportedFlow { provider: Provider, flow: &'static str },
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider {0} is not configured")]
    ProviderNotConfigured(Provider),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl AuthError {
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidOrExpiredState
                | AuthError::ReauthorizationRequired
                | AuthError::NotAuthenticated
                | AuthError::DeviceCodeExpired
                | AuthError::AccessDenied
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::ProviderUnreachable(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(e: reqwest::Error) -> Self {
        // Never echo the URL: token endpoints may carry codes in query strings.
        AuthError::ProviderUnreachable(e.without_url().to_string())
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;
