use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, SqlitePool, query};

use crate::model::EntryKey;

/// Catalog provides an interface to the catalog database (PostgreSQL or SQLite).
///
/// Entries live in `catalog_entries`; each entry may carry dependent
/// bookkeeping rows in `replication_obligations` that must be removed
/// together with the entry.
#[derive(Clone)]
pub enum Catalog {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl Catalog {
    /// Create a new Catalog client and initialize schema.
    pub async fn new(dsn: &str) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to catalog database with DSN: {dsn}");

        let catalog = if dsn.starts_with("sqlite:") {
            // Add mode=rwc to create database file if it doesn't exist
            let dsn_with_create = if dsn.contains('?') {
                if dsn.contains("mode=") {
                    dsn.to_string()
                } else {
                    format!("{dsn}&mode=rwc")
                }
            } else {
                format!("{dsn}?mode=rwc")
            };

            let pool = SqlitePool::connect(&dsn_with_create).await.map_err(|e| {
                log::error!("Failed to connect to SQLite database with DSN '{dsn_with_create}': {e}");
                e
            })?;
            Catalog::Sqlite(pool)
        } else {
            let pool = PgPool::connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                e
            })?;
            Catalog::Postgres(pool)
        };

        catalog.init().await.map_err(|e| {
            log::error!("Failed to initialize catalog schema: {e}");
            e
        })?;
        log::info!("Catalog schema initialized successfully");
        Ok(catalog)
    }

    /// Initialize catalog tables if they do not exist.
    async fn init(&self) -> Result<(), sqlx::Error> {
        match self {
            Catalog::Sqlite(pool) => {
                let create_entries = r#"
                CREATE TABLE IF NOT EXISTS catalog_entries (
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    expired_at TEXT NOT NULL,
                    PRIMARY KEY (scope, name)
                )"#;
                query(create_entries).execute(pool).await?;

                let create_obligations = r#"
                CREATE TABLE IF NOT EXISTS replication_obligations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    rse TEXT NOT NULL
                )"#;
                query(create_obligations).execute(pool).await?;
            }
            Catalog::Postgres(pool) => {
                let create_entries = r#"
                CREATE TABLE IF NOT EXISTS catalog_entries (
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    expired_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (scope, name)
                )"#;
                query(create_entries).execute(pool).await?;

                let create_obligations = r#"
                CREATE TABLE IF NOT EXISTS replication_obligations (
                    id BIGSERIAL PRIMARY KEY,
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    rse TEXT NOT NULL
                )"#;
                query(create_obligations).execute(pool).await?;
            }
        }

        Ok(())
    }

    /// Register a catalog entry with its expiry timestamp.
    pub async fn insert_entry(
        &self,
        key: &EntryKey,
        expired_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        match self {
            Catalog::Sqlite(pool) => {
                query("INSERT INTO catalog_entries (scope, name, expired_at) VALUES (?, ?, ?)")
                    .bind(&key.scope)
                    .bind(&key.name)
                    .bind(expired_at.to_rfc3339())
                    .execute(pool)
                    .await?;
            }
            Catalog::Postgres(pool) => {
                query("INSERT INTO catalog_entries (scope, name, expired_at) VALUES ($1, $2, $3)")
                    .bind(&key.scope)
                    .bind(&key.name)
                    .bind(expired_at)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Attach a replication obligation to an entry.
    pub async fn insert_obligation(&self, key: &EntryKey, rse: &str) -> Result<(), sqlx::Error> {
        match self {
            Catalog::Sqlite(pool) => {
                query("INSERT INTO replication_obligations (scope, name, rse) VALUES (?, ?, ?)")
                    .bind(&key.scope)
                    .bind(&key.name)
                    .bind(rse)
                    .execute(pool)
                    .await?;
            }
            Catalog::Postgres(pool) => {
                query("INSERT INTO replication_obligations (scope, name, rse) VALUES ($1, $2, $3)")
                    .bind(&key.scope)
                    .bind(&key.name)
                    .bind(rse)
                    .execute(pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// List entries whose retention has elapsed, restricted to one worker's
    /// partition shard.
    ///
    /// Each call is a fresh snapshot; no cursor is retained. For a fixed
    /// `total_workers` the shards cover all expired entries and are
    /// pairwise disjoint.
    pub async fn list_expired(
        &self,
        worker_number: usize,
        total_workers: usize,
        limit: usize,
    ) -> Result<Vec<EntryKey>, sqlx::Error> {
        match self {
            Catalog::Sqlite(pool) => {
                // SQLite has no server-side hash function, so partition
                // filtering happens client-side with a stable FNV-1a hash.
                let now = Utc::now().to_rfc3339();
                let rows = query(
                    "SELECT scope, name FROM catalog_entries WHERE expired_at <= ? ORDER BY expired_at, scope, name",
                )
                .bind(now)
                .fetch_all(pool)
                .await?;

                let keys = rows
                    .iter()
                    .map(|row| EntryKey::new(row.get::<String, _>("scope"), row.get::<String, _>("name")))
                    .filter(|key| shard_of(&key.name, total_workers) == worker_number)
                    .take(limit)
                    .collect();
                Ok(keys)
            }
            Catalog::Postgres(pool) => {
                let rows = query(
                    r#"
                    SELECT scope, name FROM catalog_entries
                    WHERE expired_at <= now()
                      AND mod(abs(hashtext(name)), $1) = $2
                    ORDER BY expired_at, scope, name
                    LIMIT $3
                    "#,
                )
                .bind(total_workers as i32)
                .bind(worker_number as i32)
                .bind(limit as i64)
                .fetch_all(pool)
                .await?;

                let keys = rows
                    .iter()
                    .map(|row| EntryKey::new(row.get::<String, _>("scope"), row.get::<String, _>("name")))
                    .collect();
                Ok(keys)
            }
        }
    }

    /// Remove a batch of entries together with their replication
    /// obligations, in one transaction.
    ///
    /// Returns the number of entries actually removed; entries already
    /// deleted by a concurrent worker simply do not count.
    pub async fn delete_cascade(&self, keys: &[EntryKey]) -> Result<u64, sqlx::Error> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut entries_removed = 0u64;
        match self {
            Catalog::Sqlite(pool) => {
                let mut tx = pool.begin().await?;
                for key in keys {
                    query("DELETE FROM replication_obligations WHERE scope = ? AND name = ?")
                        .bind(&key.scope)
                        .bind(&key.name)
                        .execute(&mut *tx)
                        .await?;
                    let result = query("DELETE FROM catalog_entries WHERE scope = ? AND name = ?")
                        .bind(&key.scope)
                        .bind(&key.name)
                        .execute(&mut *tx)
                        .await?;
                    entries_removed += result.rows_affected();
                }
                tx.commit().await?;
            }
            Catalog::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                for key in keys {
                    query("DELETE FROM replication_obligations WHERE scope = $1 AND name = $2")
                        .bind(&key.scope)
                        .bind(&key.name)
                        .execute(&mut *tx)
                        .await?;
                    let result =
                        query("DELETE FROM catalog_entries WHERE scope = $1 AND name = $2")
                            .bind(&key.scope)
                            .bind(&key.name)
                            .execute(&mut *tx)
                            .await?;
                    entries_removed += result.rows_affected();
                }
                tx.commit().await?;
            }
        }

        log::debug!("Removed {entries_removed} of {} entries", keys.len());
        Ok(entries_removed)
    }

    /// Count remaining catalog entries.
    pub async fn count_entries(&self) -> Result<i64, sqlx::Error> {
        let sql = "SELECT COUNT(*) AS n FROM catalog_entries";
        match self {
            Catalog::Sqlite(pool) => {
                let row = query(sql).fetch_one(pool).await?;
                Ok(row.get::<i64, _>("n"))
            }
            Catalog::Postgres(pool) => {
                let row = query(sql).fetch_one(pool).await?;
                Ok(row.get::<i64, _>("n"))
            }
        }
    }

    /// Count remaining replication obligations.
    pub async fn count_obligations(&self) -> Result<i64, sqlx::Error> {
        let sql = "SELECT COUNT(*) AS n FROM replication_obligations";
        match self {
            Catalog::Sqlite(pool) => {
                let row = query(sql).fetch_one(pool).await?;
                Ok(row.get::<i64, _>("n"))
            }
            Catalog::Postgres(pool) => {
                let row = query(sql).fetch_one(pool).await?;
                Ok(row.get::<i64, _>("n"))
            }
        }
    }
}

/// Stable shard assignment for a name (FNV-1a 64).
///
/// std's DefaultHasher is randomly seeded per process, which would break
/// partition coverage across a fleet; FNV is stable everywhere.
fn shard_of(name: &str, total_workers: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash % total_workers.max(1) as u64) as usize
}
