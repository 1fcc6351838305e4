use anyhow::{Context, Result};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

pub type Pool = r2d2::Pool<SqliteConnectionManager>;

const SCHEMA: &str = include_str!("../db/schema.sql");

/// Open a pooled SQLite database, creating the file and schema if needed.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.busy_timeout(Duration::from_secs(5))?;
        c.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Ok(())
    });
    let pool = r2d2::Pool::builder()
        .max_size(8)
        .build(manager)
        .with_context(|| format!("opening database {}", path.display()))?;
    run_migrations(&*pool.get()?)?;
    Ok(pool)
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Upsert a credential row and push its retention deadline forward.
pub fn upsert_credential(
    conn: &Connection,
    provider: &str,
    visitor_id: &str,
    credential_json: &str,
    retain_until: i64,
    now: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO provider_credentials (provider, visitor_id, credential_json, retain_until, updated_at) VALUES (?1, ?2, ?3, ?4, ?5) ON CONFLICT(provider, visitor_id) DO UPDATE SET credential_json = excluded.credential_json, retain_until = excluded.retain_until, updated_at = excluded.updated_at",
        params![provider, visitor_id, credential_json, retain_until, now],
    )?;
    Ok(())
}

/// Load credential JSON with its retention deadline.
pub fn load_credential(
    conn: &Connection,
    provider: &str,
    visitor_id: &str,
) -> Result<Option<(String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT credential_json, retain_until FROM provider_credentials WHERE provider = ?1 AND visitor_id = ?2 LIMIT 1",
    )?;
    let row = stmt
        .query_row(params![provider, visitor_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .optional()?;
    Ok(row)
}

pub fn delete_credential(conn: &Connection, provider: &str, visitor_id: &str) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM provider_credentials WHERE provider = ?1 AND visitor_id = ?2",
        params![provider, visitor_id],
    )?;
    Ok(n)
}

/// Drop credentials whose retention window has passed. Returns rows removed.
pub fn purge_stale_credentials(conn: &Connection, now: i64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM provider_credentials WHERE retain_until <= ?1",
        params![now],
    )?;
    Ok(n)
}

pub fn put_context(
    conn: &Connection,
    key: &str,
    kind: &str,
    payload_json: &str,
    expires_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO auth_contexts (context_key, kind, payload_json, expires_at) VALUES (?1, ?2, ?3, ?4) ON CONFLICT(context_key) DO UPDATE SET kind = excluded.kind, payload_json = excluded.payload_json, expires_at = excluded.expires_at",
        params![key, kind, payload_json, expires_at],
    )?;
    Ok(())
}

/// Read a live (unexpired) context payload.
pub fn get_context(conn: &Connection, key: &str, now: i64) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT payload_json FROM auth_contexts WHERE context_key = ?1 AND expires_at > ?2 LIMIT 1",
    )?;
    let row = stmt
        .query_row(params![key, now], |r| r.get::<_, String>(0))
        .optional()?;
    Ok(row)
}

/// Atomically read and delete a context. Of several concurrent callers, only
/// one gets `Some`: the write lock is taken before the read.
pub fn take_context(conn: &mut Connection, key: &str, now: i64) -> Result<Option<String>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = {
        let mut stmt = tx.prepare(
            "SELECT payload_json, expires_at FROM auth_contexts WHERE context_key = ?1 LIMIT 1",
        )?;
        stmt.query_row(params![key], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })
        .optional()?
    };
    let removed = tx.execute(
        "DELETE FROM auth_contexts WHERE context_key = ?1",
        params![key],
    )?;
    tx.commit()?;
    match row {
        Some((payload, expires_at)) if removed == 1 && expires_at > now => Ok(Some(payload)),
        _ => Ok(None),
    }
}

pub fn delete_context(conn: &Connection, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM auth_contexts WHERE context_key = ?1",
        params![key],
    )?;
    Ok(())
}

pub fn purge_expired_contexts(conn: &Connection, now: i64) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM auth_contexts WHERE expires_at <= ?1",
        params![now],
    )?;
    Ok(n)
}
