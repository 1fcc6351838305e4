//! Keyed stores behind the lifecycle manager.
//!
//! `CredentialStore` holds completed credentials and must survive restarts, so
//! the only implementation is SQLite-backed. `ContextStore` holds short-lived
//! handshake state (PKCE verifiers, device sessions) and may live in memory.

use crate::clock::Clock;
use crate::db::{self, Pool};
use crate::models::{Credential, DeviceAuthSession, PkceContext, Provider};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Credentials not written for this many days are garbage-collected.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

pub trait CredentialStore: Send + Sync {
    /// Upsert; also renews the retention window.
    fn save(&self, provider: Provider, visitor_id: &str, credential: &Credential) -> Result<()>;
    fn get(&self, provider: Provider, visitor_id: &str) -> Result<Option<Credential>>;
    /// Idempotent.
    fn remove(&self, provider: Provider, visitor_id: &str) -> Result<()>;
    fn exists(&self, provider: Provider, visitor_id: &str) -> Result<bool> {
        Ok(self.get(provider, visitor_id)?.is_some())
    }
    /// Drop every credential past its retention window; returns how many went.
    fn purge_stale(&self) -> Result<usize>;
}

pub trait ContextStore: Send + Sync {
    /// Overwrites silently.
    fn put_pkce_context(&self, state: &str, context: &PkceContext, ttl: Duration) -> Result<()>;
    /// Atomic read-and-delete: a second call for the same state returns `None`.
    fn take_pkce_context(&self, state: &str) -> Result<Option<PkceContext>>;
    fn put_device_session(&self, session: &DeviceAuthSession, ttl: Duration) -> Result<()>;
    fn get_device_session(&self, device_code: &str) -> Result<Option<DeviceAuthSession>>;
    fn remove_device_session(&self, device_code: &str) -> Result<()>;
    /// Drop expired entries; returns how many were removed.
    fn purge_expired(&self) -> Result<usize>;
}

fn pkce_key(state: &str) -> String {
    format!("pkce:{}", state)
}

fn device_key(device_code: &str) -> String {
    format!("device:{}", device_code)
}

pub struct SqliteCredentialStore {
    pool: Pool,
    retention: Duration,
    clock: Arc<dyn Clock>,
}

impl SqliteCredentialStore {
    pub fn new(pool: Pool, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            retention,
            clock,
        }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn save(&self, provider: Provider, visitor_id: &str, credential: &Credential) -> Result<()> {
        let now = self.clock.now();
        let json = serde_json::to_string(credential)?;
        let conn = self.pool.get()?;
        // Writes double as the garbage-collection tick for inactive visitors.
        let purged = db::purge_stale_credentials(&conn, now.timestamp())?;
        if purged > 0 {
            debug!(purged, "dropped credentials past retention");
        }
        db::upsert_credential(
            &conn,
            provider.as_str(),
            visitor_id,
            &json,
            (now + self.retention).timestamp(),
            now.timestamp(),
        )
    }

    fn get(&self, provider: Provider, visitor_id: &str) -> Result<Option<Credential>> {
        let conn = self.pool.get()?;
        let Some((json, retain_until)) = db::load_credential(&conn, provider.as_str(), visitor_id)?
        else {
            return Ok(None);
        };
        if retain_until <= self.clock.now().timestamp() {
            debug!(%provider, visitor = visitor_id, "credential past retention; evicting");
            db::delete_credential(&conn, provider.as_str(), visitor_id)?;
            return Ok(None);
        }
        let credential: Credential = serde_json::from_str(&json)
            .with_context(|| format!("parse stored {} credential", provider))?;
        Ok(Some(credential))
    }

    fn remove(&self, provider: Provider, visitor_id: &str) -> Result<()> {
        let conn = self.pool.get()?;
        db::delete_credential(&conn, provider.as_str(), visitor_id)?;
        Ok(())
    }

    fn purge_stale(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        db::purge_stale_credentials(&conn, self.clock.now().timestamp())
    }
}

pub struct SqliteContextStore {
    pool: Pool,
    clock: Arc<dyn Clock>,
}

impl SqliteContextStore {
    pub fn new(pool: Pool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    fn put(&self, key: &str, kind: &str, payload: String, ttl: Duration) -> Result<()> {
        let now = self.clock.now().timestamp();
        let conn = self.pool.get()?;
        db::purge_expired_contexts(&conn, now)?;
        db::put_context(&conn, key, kind, &payload, now + ttl.num_seconds())
    }
}

impl ContextStore for SqliteContextStore {
    fn put_pkce_context(&self, state: &str, context: &PkceContext, ttl: Duration) -> Result<()> {
        self.put(&pkce_key(state), "pkce", serde_json::to_string(context)?, ttl)
    }

    fn take_pkce_context(&self, state: &str) -> Result<Option<PkceContext>> {
        let mut conn = self.pool.get()?;
        match db::take_context(&mut conn, &pkce_key(state), self.clock.now().timestamp())? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn put_device_session(&self, session: &DeviceAuthSession, ttl: Duration) -> Result<()> {
        self.put(
            &device_key(&session.device_code),
            "device",
            serde_json::to_string(session)?,
            ttl,
        )
    }

    fn get_device_session(&self, device_code: &str) -> Result<Option<DeviceAuthSession>> {
        let conn = self.pool.get()?;
        match db::get_context(&conn, &device_key(device_code), self.clock.now().timestamp())? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn remove_device_session(&self, device_code: &str) -> Result<()> {
        let conn = self.pool.get()?;
        db::delete_context(&conn, &device_key(device_code))
    }

    fn purge_expired(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        db::purge_expired_contexts(&conn, self.clock.now().timestamp())
    }
}

#[derive(Debug, Clone)]
enum ContextEntry {
    Pkce(PkceContext),
    Device(DeviceAuthSession),
}

/// Process-local context store. Handshake state only; a restart merely
/// forces the visitor to start the login again.
pub struct MemoryContextStore {
    entries: Mutex<HashMap<String, (DateTime<Utc>, ContextEntry)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryContextStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn insert(&self, key: String, entry: ContextEntry, ttl: Duration) {
        let now = self.clock.now();
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, (exp, _)| *exp > now);
        map.insert(key, (now + ttl, entry));
    }
}

impl ContextStore for MemoryContextStore {
    fn put_pkce_context(&self, state: &str, context: &PkceContext, ttl: Duration) -> Result<()> {
        self.insert(pkce_key(state), ContextEntry::Pkce(context.clone()), ttl);
        Ok(())
    }

    fn take_pkce_context(&self, state: &str) -> Result<Option<PkceContext>> {
        let now = self.clock.now();
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match map.remove(&pkce_key(state)) {
            Some((exp, ContextEntry::Pkce(ctx))) if exp > now => Ok(Some(ctx)),
            _ => Ok(None),
        }
    }

    fn put_device_session(&self, session: &DeviceAuthSession, ttl: Duration) -> Result<()> {
        self.insert(
            device_key(&session.device_code),
            ContextEntry::Device(session.clone()),
            ttl,
        );
        Ok(())
    }

    fn get_device_session(&self, device_code: &str) -> Result<Option<DeviceAuthSession>> {
        let now = self.clock.now();
        let map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&device_key(device_code)) {
            Some((exp, ContextEntry::Device(s))) if *exp > now => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    fn remove_device_session(&self, device_code: &str) -> Result<()> {
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&device_key(device_code));
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut map = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, (exp, _)| *exp > now);
        Ok(before - map.len())
    }
}
