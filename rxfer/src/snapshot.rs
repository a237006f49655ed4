//! Persistent record of what earlier sync runs already transferred
//!
//! One SQLite database per snapshot directory maps an item fingerprint to the source
//! modification time seen when the item was last confirmed identical at the destination. The
//! pool holds a single connection, so concurrent workers are serialized at this boundary.
//! Entries are never pruned.

use sha2::Digest;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::instrument;

const DATABASE_FILE: &str = "snapshot.db";

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("cannot create snapshot directory {path:?}: {source}")]
    Directory {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open snapshot store in {path:?}: {source}")]
    Open {
        path: std::path::PathBuf,
        #[source]
        source: sqlx::Error,
    },
    #[error("snapshot store {op} failed: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    #[instrument]
    pub async fn open(dir: &std::path::Path) -> Result<Self, SnapshotError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| SnapshotError::Directory {
                path: dir.to_path_buf(),
                source,
            })?;
        let options = SqliteConnectOptions::new()
            .filename(dir.join(DATABASE_FILE))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|source| SnapshotError::Open {
                path: dir.to_path_buf(),
                source,
            })?;
        let store = Self { pool };
        store.init().await?;
        tracing::debug!("opened snapshot store in {:?}", dir);
        Ok(store)
    }

    /// Store that lives only as long as the process
    pub async fn in_memory() -> Result<Self, SnapshotError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|source| SnapshotError::Open {
                path: std::path::PathBuf::from(":memory:"),
                source,
            })?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshot (
                key TEXT PRIMARY KEY,
                mtime INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|source| SnapshotError::Query {
            op: "create table",
            source,
        })?;
        Ok(())
    }

    /// Modification time recorded for `key`, if any
    pub async fn get(&self, key: &str) -> Result<Option<i64>, SnapshotError> {
        let row = sqlx::query("SELECT mtime FROM snapshot WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|source| SnapshotError::Query { op: "get", source })?;
        Ok(row.map(|row| row.get::<i64, _>(0)))
    }

    pub async fn put(&self, key: &str, mtime: i64) -> Result<(), SnapshotError> {
        sqlx::query(
            r#"
            INSERT INTO snapshot (key, mtime)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET mtime = excluded.mtime
            "#,
        )
        .bind(key)
        .bind(mtime)
        .execute(&self.pool)
        .await
        .map_err(|source| SnapshotError::Query { op: "put", source })?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Stable key for one source/destination pair
///
/// Local paths must be absolute so that the same file maps to the same key no matter which
/// working directory the tool was started from.
pub fn fingerprint(source: &str, destination: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"==>");
    hasher.update(destination.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn put_get_overwrite() -> anyhow::Result<()> {
        let store = SnapshotStore::in_memory().await?;
        assert_eq!(store.get("a").await?, None);
        store.put("a", 10).await?;
        assert_eq!(store.get("a").await?, Some(10));
        store.put("a", 20).await?;
        assert_eq!(store.get("a").await?, Some(20));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn survives_reopening() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let dir = tmp.path().join("snap");
        {
            let store = SnapshotStore::open(&dir).await?;
            store.put("k", 42).await?;
            store.close().await;
        }
        let store = SnapshotStore::open(&dir).await?;
        assert_eq!(store.get("k").await?, Some(42));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn concurrent_writers() -> anyhow::Result<()> {
        let store = SnapshotStore::in_memory().await?;
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.spawn(async move { store.put(&format!("key{i}"), i).await });
        }
        while let Some(res) = tasks.join_next().await {
            res??;
        }
        for i in 0..32 {
            assert_eq!(store.get(&format!("key{i}")).await?, Some(i));
        }
        Ok(())
    }

    #[test]
    fn fingerprints_are_stable_and_distinct() {
        let a = fingerprint("/data/a.txt", "s3://bkt/a.txt");
        assert_eq!(a, fingerprint("/data/a.txt", "s3://bkt/a.txt"));
        assert_ne!(a, fingerprint("/data/a.txt", "s3://bkt/b.txt"));
        assert_eq!(a.len(), 64);
    }
}
