//! Location store backend trait and the SQLite implementation.

use crate::cluster::MachineRecord;
use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    CheckpointRepo, ClusterRepo, EntryRepo, EntryUpdate, GlobalRepo, MemoizationRepo,
};
use async_trait::async_trait;
use quarry_core::{
    ContentHash, ContentHashListWithDeterminism, Fingerprint, MachineId, Selector, ShortHash,
    StrongFingerprint,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;

/// File name of a published SQLite checkpoint inside the checkpoint directory.
pub const CHECKPOINT_FILE_NAME: &str = "locations.db";

/// Combined backend trait for the location database.
#[async_trait]
pub trait LocationBackend:
    EntryRepo + MemoizationRepo + GlobalRepo + ClusterRepo + CheckpointRepo + Send + Sync
{
    /// Prepare the backend. Idempotent.
    async fn initialize(&self) -> MetadataResult<()>;

    /// Check backend connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Short name used in logs and `Unsupported` errors.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-backed location store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and verify its integrity.
    ///
    /// Returns [`MetadataError::Corruption`] when the file is not a readable
    /// SQLite database or fails `PRAGMA integrity_check`.
    pub async fn open(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // Single connection: SQLite serializes writers anyway, and
            // compare-exchange relies on it.
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(classify_open_error)?;

        let store = Self {
            pool,
            path: path.to_path_buf(),
        };
        store.check_integrity().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    async fn check_integrity(&self) -> MetadataResult<()> {
        let rows: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(&self.pool)
            .await
            .map_err(classify_open_error)?;
        match rows.as_slice() {
            [only] if only == "ok" => Ok(()),
            _ => Err(MetadataError::Corruption(format!(
                "{}: {}",
                self.path.display(),
                rows.join("; ")
            ))),
        }
    }

    /// Close the pool and delete the database together with its WAL/SHM files.
    pub async fn destroy(self) -> MetadataResult<()> {
        self.pool.close().await;
        remove_database_files(&self.path)
    }
}

/// Remove a database file and its `-wal`/`-shm` companions, ignoring missing files.
pub fn remove_database_files(path: &Path) -> MetadataResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_os_string();
        name.push(suffix);
        match std::fs::remove_file(PathBuf::from(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Map SQLite "not a database" / "malformed" failures to `Corruption`.
fn classify_open_error(err: sqlx::Error) -> MetadataError {
    if let sqlx::Error::Database(db) = &err {
        // SQLITE_CORRUPT = 11, SQLITE_NOTADB = 26
        let code = db.code();
        let message = db.message().to_ascii_lowercase();
        if matches!(code.as_deref(), Some("11") | Some("26"))
            || message.contains("not a database")
            || message.contains("malformed")
        {
            return MetadataError::Corruption(db.message().to_string());
        }
    }
    MetadataError::Database(err)
}

fn to_millis(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

fn selector_key(selector: &Selector) -> (String, Vec<u8>) {
    (
        selector.content_hash.to_string(),
        selector.output.clone().unwrap_or_default(),
    )
}

fn selector_from_columns(hash: &str, output: Vec<u8>) -> MetadataResult<Selector> {
    let content_hash: ContentHash = hash.parse()?;
    Ok(if output.is_empty() {
        Selector::new(content_hash)
    } else {
        Selector::with_output(content_hash, output)
    })
}

#[async_trait]
impl LocationBackend for SqliteStore {
    async fn initialize(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

// Repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use sqlx::Connection;

    #[async_trait]
    impl EntryRepo for SqliteStore {
        async fn get_entry(&self, hash: &ShortHash) -> MetadataResult<Option<Vec<u8>>> {
            let value: Option<Vec<u8>> =
                sqlx::query_scalar("SELECT entry FROM content_entries WHERE short_hash = ?")
                    .bind(hash.as_bytes().as_slice())
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(value)
        }

        async fn put_entry(&self, hash: &ShortHash, value: &[u8]) -> MetadataResult<()> {
            sqlx::query(
                "INSERT INTO content_entries (short_hash, entry) VALUES (?, ?)
                 ON CONFLICT(short_hash) DO UPDATE SET entry = excluded.entry",
            )
            .bind(hash.as_bytes().as_slice())
            .bind(value)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn delete_entry(&self, hash: &ShortHash) -> MetadataResult<()> {
            sqlx::query("DELETE FROM content_entries WHERE short_hash = ?")
                .bind(hash.as_bytes().as_slice())
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn write_batch(&self, batch: &[EntryUpdate]) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            for (hash, value) in batch {
                match value {
                    Some(value) => {
                        sqlx::query(
                            "INSERT INTO content_entries (short_hash, entry) VALUES (?, ?)
                             ON CONFLICT(short_hash) DO UPDATE SET entry = excluded.entry",
                        )
                        .bind(hash.as_bytes().as_slice())
                        .bind(value.as_slice())
                        .execute(&mut *tx)
                        .await?;
                    }
                    None => {
                        sqlx::query("DELETE FROM content_entries WHERE short_hash = ?")
                            .bind(hash.as_bytes().as_slice())
                            .execute(&mut *tx)
                            .await?;
                    }
                }
            }
            tx.commit().await?;
            Ok(())
        }

        async fn scan_entries(
            &self,
            start: &ShortHash,
            limit: usize,
        ) -> MetadataResult<Vec<(ShortHash, Vec<u8>)>> {
            let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
                "SELECT short_hash, entry FROM content_entries
                 WHERE short_hash >= ? ORDER BY short_hash ASC LIMIT ?",
            )
            .bind(start.as_bytes().as_slice())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|(key, value)| Ok((ShortHash::from_slice(&key)?, value)))
                .collect()
        }

        async fn count_entries(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_entries")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }
    }

    #[async_trait]
    impl MemoizationRepo for SqliteStore {
        async fn compare_exchange(
            &self,
            strong: &StrongFingerprint,
            expected: &ContentHashListWithDeterminism,
            replacement: &ContentHashListWithDeterminism,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let (selector_hash, selector_output) = selector_key(&strong.selector);
            let replacement_bytes = replacement.to_bytes()?;

            // The single pooled connection serializes every transaction, so
            // the read and the conditional write below cannot interleave with
            // another compare-exchange.
            let mut tx = self.pool.begin().await?;

            let current: Option<Vec<u8>> = sqlx::query_scalar(
                "SELECT value FROM metadata_records
                 WHERE weak_fingerprint = ? AND selector_hash = ? AND selector_output = ?",
            )
            .bind(strong.weak_fingerprint.as_bytes())
            .bind(&selector_hash)
            .bind(&selector_output)
            .fetch_optional(&mut *tx)
            .await?;

            // The whole record must match, determinism included.
            let matches = match &current {
                Some(bytes) => ContentHashListWithDeterminism::from_bytes(bytes)? == *expected,
                None => expected.is_missing(),
            };
            if !matches {
                tx.rollback().await?;
                return Ok(false);
            }

            sqlx::query(
                "INSERT INTO metadata_records
                   (weak_fingerprint, selector_hash, selector_output, value, last_access_ms)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(weak_fingerprint, selector_hash, selector_output)
                 DO UPDATE SET value = excluded.value, last_access_ms = excluded.last_access_ms",
            )
            .bind(strong.weak_fingerprint.as_bytes())
            .bind(&selector_hash)
            .bind(&selector_output)
            .bind(&replacement_bytes)
            .bind(to_millis(now))
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(true)
        }

        async fn get_content_hash_list(
            &self,
            strong: &StrongFingerprint,
            now: OffsetDateTime,
        ) -> MetadataResult<Option<ContentHashListWithDeterminism>> {
            let (selector_hash, selector_output) = selector_key(&strong.selector);
            let value: Option<Vec<u8>> = sqlx::query_scalar(
                "UPDATE metadata_records SET last_access_ms = MAX(last_access_ms, ?)
                 WHERE weak_fingerprint = ? AND selector_hash = ? AND selector_output = ?
                 RETURNING value",
            )
            .bind(to_millis(now))
            .bind(strong.weak_fingerprint.as_bytes())
            .bind(&selector_hash)
            .bind(&selector_output)
            .fetch_optional(&self.pool)
            .await?;

            value
                .map(|bytes| ContentHashListWithDeterminism::from_bytes(&bytes))
                .transpose()
                .map_err(Into::into)
        }

        async fn get_selectors(&self, weak: &Fingerprint) -> MetadataResult<Vec<Selector>> {
            let rows: Vec<(String, Vec<u8>)> = sqlx::query_as(
                "SELECT selector_hash, selector_output FROM metadata_records
                 WHERE weak_fingerprint = ? ORDER BY last_access_ms DESC",
            )
            .bind(weak.as_bytes())
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|(hash, output)| selector_from_columns(&hash, output))
                .collect()
        }

        async fn scan_strong_fingerprints(
            &self,
            offset: u64,
            limit: usize,
        ) -> MetadataResult<Vec<StrongFingerprint>> {
            let rows: Vec<(Vec<u8>, String, Vec<u8>)> = sqlx::query_as(
                "SELECT weak_fingerprint, selector_hash, selector_output FROM metadata_records
                 ORDER BY weak_fingerprint, selector_hash, selector_output LIMIT ? OFFSET ?",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

            rows.into_iter()
                .map(|(weak, hash, output)| {
                    Ok(StrongFingerprint::new(
                        Fingerprint::new(weak),
                        selector_from_columns(&hash, output)?,
                    ))
                })
                .collect()
        }

        async fn count_records(&self) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metadata_records")
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn delete_least_recently_used(
            &self,
            keep: u64,
            protect_after: OffsetDateTime,
        ) -> MetadataResult<u64> {
            let result = sqlx::query(
                "DELETE FROM metadata_records
                 WHERE last_access_ms < ?
                   AND rowid NOT IN (
                     SELECT rowid FROM metadata_records ORDER BY last_access_ms DESC LIMIT ?
                   )",
            )
            .bind(to_millis(protect_after))
            .bind(i64::try_from(keep).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl GlobalRepo for SqliteStore {
        async fn get_global(&self, key: &str) -> MetadataResult<Option<String>> {
            let value: Option<String> =
                sqlx::query_scalar("SELECT value FROM global_entries WHERE key = ?")
                    .bind(key)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(value)
        }

        async fn set_global(&self, key: &str, value: Option<&str>) -> MetadataResult<()> {
            match value {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO global_entries (key, value) VALUES (?, ?)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&self.pool)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM global_entries WHERE key = ?")
                        .bind(key)
                        .execute(&self.pool)
                        .await?;
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ClusterRepo for SqliteStore {
        async fn load_machines(&self) -> MetadataResult<Vec<MachineRecord>> {
            let rows: Vec<(i64, String)> =
                sqlx::query_as("SELECT machine_id, location FROM cluster_machines ORDER BY machine_id")
                    .fetch_all(&self.pool)
                    .await?;

            rows.into_iter()
                .map(|(id, location)| {
                    let id = u32::try_from(id).map_err(|_| {
                        MetadataError::Internal(format!("machine id {id} out of range"))
                    })?;
                    Ok(MachineRecord {
                        id: MachineId::new(id),
                        location: location.parse()?,
                    })
                })
                .collect()
        }

        async fn store_machines(&self, machines: &[MachineRecord]) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM cluster_machines")
                .execute(&mut *tx)
                .await?;
            for record in machines {
                sqlx::query("INSERT INTO cluster_machines (machine_id, location) VALUES (?, ?)")
                    .bind(i64::from(record.id.as_u32()))
                    .bind(record.location.to_string())
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        }
    }

    #[async_trait]
    impl CheckpointRepo for SqliteStore {
        async fn save_checkpoint(&self, directory: &Path) -> MetadataResult<()> {
            tokio::fs::create_dir_all(directory).await?;
            let target = directory.join(CHECKPOINT_FILE_NAME);
            let staging = directory.join(format!("{CHECKPOINT_FILE_NAME}.tmp"));
            remove_database_files(&staging)?;

            sqlx::query("VACUUM INTO ?")
                .bind(staging.to_string_lossy().into_owned())
                .execute(&self.pool)
                .await?;

            tokio::fs::rename(&staging, &target).await?;
            tracing::debug!(path = %target.display(), "sqlite checkpoint published");
            Ok(())
        }

        async fn restore_checkpoint(&self, directory: &Path) -> MetadataResult<()> {
            let source = directory.join(CHECKPOINT_FILE_NAME);
            if !tokio::fs::try_exists(&source).await? {
                return Err(MetadataError::NotFound(format!(
                    "checkpoint {}",
                    source.display()
                )));
            }

            let mut conn = self.pool.acquire().await?;
            sqlx::query("ATTACH DATABASE ? AS checkpoint")
                .bind(source.to_string_lossy().into_owned())
                .execute(&mut *conn)
                .await?;

            let result = async {
                let mut tx = conn.begin().await?;
                for table in CHECKPOINT_TABLES {
                    sqlx::query(&format!("DELETE FROM main.{table}"))
                        .execute(&mut *tx)
                        .await?;
                    sqlx::query(&format!(
                        "INSERT INTO main.{table} SELECT * FROM checkpoint.{table}"
                    ))
                    .execute(&mut *tx)
                    .await?;
                }
                tx.commit().await?;
                Ok::<(), MetadataError>(())
            }
            .await;

            sqlx::query("DETACH DATABASE checkpoint")
                .execute(&mut *conn)
                .await?;
            result
        }

        fn is_immutable(&self, path: &Path) -> bool {
            // Only published checkpoints are sealed. The live database shares
            // the file name but is written to constantly.
            if path.file_name().is_none_or(|name| name != CHECKPOINT_FILE_NAME) {
                return false;
            }
            match (std::fs::canonicalize(path), std::fs::canonicalize(&self.path)) {
                (Ok(candidate), Ok(live)) => candidate != live,
                _ => path != self.path,
            }
        }
    }
}

const CHECKPOINT_TABLES: [&str; 4] = [
    "content_entries",
    "metadata_records",
    "global_entries",
    "cluster_machines",
];

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS content_entries (
    short_hash BLOB PRIMARY KEY,
    entry BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metadata_records (
    weak_fingerprint BLOB NOT NULL,
    selector_hash TEXT NOT NULL,
    selector_output BLOB NOT NULL,
    value BLOB NOT NULL,
    last_access_ms INTEGER NOT NULL,
    PRIMARY KEY (weak_fingerprint, selector_hash, selector_output)
);
CREATE INDEX IF NOT EXISTS idx_metadata_records_last_access ON metadata_records(last_access_ms);

CREATE TABLE IF NOT EXISTS global_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cluster_machines (
    machine_id INTEGER PRIMARY KEY,
    location TEXT NOT NULL UNIQUE
);
"#;
