use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio_rusqlite::Connection;

use crate::backend::{KvBackend, Result, StoreError, VersionGate, Versioned};

// ---------------------------------------------------------------------------
// SqliteKv
// ---------------------------------------------------------------------------

/// Durable SQLite-backed store.
///
/// Every gate check and the write it guards run inside a single immediate
/// transaction, so compare-and-swap holds even when several processes share
/// the same database file (lock quorum stores do).
pub struct SqliteKv {
    conn: Connection,
}

/// Raw row shape used inside connection closures.
struct RawEntry {
    value: String,
    version: u64,
    updated_at: String,
    expires_at: Option<String>,
}

impl SqliteKv {
    /// Open (or create) a store at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .await
            .map_err(unavailable)?;
        let kv = Self { conn };
        kv.init_schema().await?;
        Ok(kv)
    }

    /// Purely in-memory database (useful for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await.map_err(unavailable)?;
        let kv = Self { conn };
        kv.init_schema().await?;
        Ok(kv)
    }

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS kv (
                        key        TEXT PRIMARY KEY,
                        value      TEXT NOT NULL,
                        version    INTEGER NOT NULL,
                        updated_at TEXT NOT NULL,
                        expires_at TEXT
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(unavailable)
    }
}

fn unavailable(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn conflict(key: &str, found: Option<u64>) -> StoreError {
    StoreError::VersionConflict {
        key: key.to_string(),
        found,
    }
}

/// Parse a stored RFC 3339 expiry and report whether it has passed.
fn raw_is_expired(expires_at: &Option<String>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|at| at.with_timezone(&Utc) <= now)
            .unwrap_or(true),
        None => false,
    }
}

fn row_to_versioned(key: &str, raw: RawEntry) -> Result<Versioned> {
    let value: Value = serde_json::from_str(&raw.value)
        .map_err(|e| StoreError::Unavailable(format!("corrupt value under {key}: {e}")))?;
    let updated_at = DateTime::parse_from_rfc3339(&raw.updated_at)
        .map_err(|e| StoreError::Unavailable(format!("corrupt timestamp under {key}: {e}")))?
        .with_timezone(&Utc);
    let expires_at = match raw.expires_at {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| StoreError::Unavailable(format!("corrupt expiry under {key}: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    Ok(Versioned {
        value,
        version: raw.version,
        updated_at,
        expires_at,
    })
}

fn select_raw(
    conn: &rusqlite::Connection,
    key: &str,
) -> std::result::Result<Option<RawEntry>, rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT value, version, updated_at, expires_at FROM kv WHERE key = ?1")?;
    let mut rows = stmt.query(rusqlite::params![key])?;
    match rows.next()? {
        Some(row) => Ok(Some(RawEntry {
            value: row.get(0)?,
            version: row.get::<_, i64>(1)? as u64,
            updated_at: row.get(2)?,
            expires_at: row.get(3)?,
        })),
        None => Ok(None),
    }
}

#[async_trait]
impl KvBackend for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let key_owned = key.to_string();
        let raw = self
            .conn
            .call(move |conn| Ok(select_raw(conn, &key_owned)?))
            .await
            .map_err(unavailable)?;

        let now = Utc::now();
        match raw {
            Some(raw) if !raw_is_expired(&raw.expires_at, now) => {
                row_to_versioned(key, raw).map(Some)
            }
            _ => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        gate: VersionGate,
        ttl: Option<Duration>,
    ) -> Result<u64> {
        let key_owned = key.to_string();
        let json = value.to_string();
        let now = Utc::now();
        let updated_at = now.to_rfc3339();
        let expires_at = ttl.map(|d| (now + d).to_rfc3339());

        // Inner Err carries the live version found when the gate failed.
        let outcome: std::result::Result<u64, Option<u64>> = self
            .conn
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let raw = select_raw(&tx, &key_owned)?;
                let found = raw
                    .filter(|r| !raw_is_expired(&r.expires_at, now))
                    .map(|r| r.version);

                let allowed = match gate {
                    VersionGate::Any => true,
                    VersionGate::Absent => found.is_none(),
                    VersionGate::Exactly(expected) => found == Some(expected),
                };
                if !allowed {
                    return Ok(Err(found));
                }

                let next = found.map_or(1, |v| v + 1);
                tx.execute(
                    "INSERT INTO kv (key, value, version, updated_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(key) DO UPDATE SET
                        value=excluded.value, version=excluded.version,
                        updated_at=excluded.updated_at, expires_at=excluded.expires_at",
                    rusqlite::params![key_owned, json, next as i64, updated_at, expires_at],
                )?;
                tx.commit()?;
                Ok(Ok(next))
            })
            .await
            .map_err(unavailable)?;

        outcome.map_err(|found| conflict(key, found))
    }

    async fn delete(&self, key: &str, gate: VersionGate) -> Result<()> {
        let key_owned = key.to_string();
        let now = Utc::now();

        let outcome: std::result::Result<(), Option<u64>> = self
            .conn
            .call(move |conn| {
                let tx = conn
                    .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
                let raw = select_raw(&tx, &key_owned)?;
                let found = raw
                    .filter(|r| !raw_is_expired(&r.expires_at, now))
                    .map(|r| r.version);

                let allowed = match gate {
                    VersionGate::Any => true,
                    VersionGate::Absent => found.is_none(),
                    VersionGate::Exactly(expected) => found == Some(expected),
                };
                if !allowed {
                    return Ok(Err(found));
                }

                tx.execute("DELETE FROM kv WHERE key = ?1", rusqlite::params![key_owned])?;
                tx.commit()?;
                Ok(Ok(()))
            })
            .await
            .map_err(unavailable)?;

        outcome.map_err(|found| conflict(key, found))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let raws: Vec<(String, RawEntry)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, value, version, updated_at, expires_at FROM kv
                     WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
                )?;
                let mut rows = stmt.query(rusqlite::params![like])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((
                        row.get::<_, String>(0)?,
                        RawEntry {
                            value: row.get(1)?,
                            version: row.get::<_, i64>(2)? as u64,
                            updated_at: row.get(3)?,
                            expires_at: row.get(4)?,
                        },
                    ));
                }
                Ok(out)
            })
            .await
            .map_err(unavailable)?;

        let now = Utc::now();
        let mut out = Vec::with_capacity(raws.len());
        for (key, raw) in raws {
            if raw_is_expired(&raw.expires_at, now) {
                continue;
            }
            let entry = row_to_versioned(&key, raw)?;
            out.push((key, entry));
        }
        Ok(out)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let cutoff = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    rusqlite::params![cutoff],
                )?;
                Ok(n)
            })
            .await
            .map_err(unavailable)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrip_and_version_bump() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        assert_eq!(
            kv.put("a", json!({"n": 1}), VersionGate::Any, None)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            kv.put("a", json!({"n": 2}), VersionGate::Any, None)
                .await
                .unwrap(),
            2
        );

        let got = kv.get("a").await.unwrap().unwrap();
        assert_eq!(got.value, json!({"n": 2}));
        assert_eq!(got.version, 2);
    }

    #[tokio::test]
    async fn cas_conflicts_report_live_version() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.put("a", json!(1), VersionGate::Any, None).await.unwrap();

        let err = kv
            .put("a", json!(2), VersionGate::Exactly(7), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { found: Some(1), .. }
        ));
    }

    #[tokio::test]
    async fn expired_rows_read_as_absent() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.put("a", json!(1), VersionGate::Any, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(kv.get("a").await.unwrap().is_none());
        assert!(kv
            .put("a", json!(2), VersionGate::Absent, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");

        {
            let kv = SqliteKv::open(&path).await.unwrap();
            kv.put("tasks/1", json!({"p": 1}), VersionGate::Any, None)
                .await
                .unwrap();
        }

        let kv = SqliteKv::open(&path).await.unwrap();
        let got = kv.get("tasks/1").await.unwrap().unwrap();
        assert_eq!(got.value, json!({"p": 1}));
    }

    #[tokio::test]
    async fn create_only_single_winner_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");

        // Two separate connections to the same file, as two processes would
        // hold. Only one create-only put may win.
        let a = SqliteKv::open(&path).await.unwrap();
        let b = SqliteKv::open(&path).await.unwrap();

        let (ra, rb) = tokio::join!(
            a.put("locks/build", json!({"owner": "a"}), VersionGate::Absent, None),
            b.put("locks/build", json!({"owner": "b"}), VersionGate::Absent, None),
        );

        let wins = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1);
        let loss = if ra.is_err() { ra.unwrap_err() } else { rb.unwrap_err() };
        assert!(matches!(
            loss,
            StoreError::VersionConflict { found: Some(1), .. }
        ));
    }

    #[tokio::test]
    async fn scan_and_sweep() {
        let kv = SqliteKv::open_in_memory().await.unwrap();
        kv.put("tasks/a", json!(1), VersionGate::Any, None)
            .await
            .unwrap();
        kv.put(
            "tasks/b",
            json!(2),
            VersionGate::Any,
            Some(Duration::from_millis(5)),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let hits = kv.scan("tasks/").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "tasks/a");

        assert_eq!(kv.sweep_expired().await.unwrap(), 1);
    }
}
