//! Core library for music-provider-auth: per-visitor OAuth credentials for
//! Spotify, Tidal and YouTube Music, kept valid on demand.
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod manager;
pub mod models;
pub mod store;

pub use error::{AuthError, AuthResult};
pub use manager::{LifecyclePolicy, TokenLifecycleManager};
pub use models::{Credential, DeviceAuthSession, DevicePoll, Provider};
