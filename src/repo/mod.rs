/// Persistent scan/timestamp cache over embedded SQLite
///
/// Lookups never fail the caller: storage errors are logged and reported as
/// a cache miss (or `false` for writes) so that a running scan or fetch keeps
/// going. Only the explicit maintenance operations (`clear_cache`, `stats`)
/// surface errors.
use crate::domain::{CacheEntry, CacheStats, MissingItem, SatellitePattern, ScanParams, ScanRecord, ScanResult};
use crate::errors::ApiResult;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CACHE_SCHEMA_VERSION: i64 = 1;

fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

fn from_epoch(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

type ScanRow = (i64, i64, i64, String, i64, i64, String, i64, i64, i64);
type EntryRow = (i64, String, Option<String>, bool, i64);

/// Scan memo and timestamp cache repository
#[derive(Clone)]
pub struct CacheRepo {
    pool: SqlitePool,
}

impl CacheRepo {
    /// Open (creating if needed) the cache database at `path` and bring its schema up to date
    pub async fn open(path: &Path) -> ApiResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        init_db(&pool).await?;
        info!(path = %path.display(), "Cache database opened");

        Ok(Self { pool })
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Timestamps marked found for `satellite` within `[start, end]`
    pub async fn get_timestamps(
        &self,
        satellite: SatellitePattern,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> BTreeSet<DateTime<Utc>> {
        let rows = sqlx::query_as::<_, (i64,)>(
            "SELECT timestamp FROM timestamps
             WHERE satellite = ? AND found = 1 AND timestamp BETWEEN ? AND ?
             ORDER BY timestamp",
        )
        .bind(satellite.short_name())
        .bind(to_epoch(start))
        .bind(to_epoch(end))
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows.into_iter().map(|(ts,)| from_epoch(ts)).collect(),
            Err(e) => {
                warn!(error = %e, %satellite, "Cache timestamp lookup failed, treating as miss");
                BTreeSet::new()
            }
        }
    }

    /// Full found entries for `satellite` within `[start, end]`
    pub async fn get_entries(
        &self,
        satellite: SatellitePattern,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CacheEntry> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT timestamp, satellite, file_path, found, last_checked FROM timestamps
             WHERE satellite = ? AND found = 1 AND timestamp BETWEEN ? AND ?
             ORDER BY timestamp",
        )
        .bind(satellite.short_name())
        .bind(to_epoch(start))
        .bind(to_epoch(end))
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|(ts, sat, file_path, found, last_checked)| {
                    Some(CacheEntry {
                        timestamp: from_epoch(ts),
                        satellite: sat.parse().ok()?,
                        file_path,
                        found,
                        last_checked: from_epoch(last_checked),
                    })
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, %satellite, "Cache entry lookup failed, treating as miss");
                Vec::new()
            }
        }
    }

    /// Upsert the lookup result for `(timestamp, satellite)`; false on storage failure
    pub async fn add_timestamp(
        &self,
        timestamp: DateTime<Utc>,
        satellite: SatellitePattern,
        file_path: Option<&str>,
        found: bool,
    ) -> bool {
        let result = sqlx::query(
            "INSERT INTO timestamps (timestamp, satellite, file_path, found, last_checked)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (timestamp, satellite) DO UPDATE
             SET file_path = excluded.file_path,
                 found = excluded.found,
                 last_checked = excluded.last_checked",
        )
        .bind(to_epoch(timestamp))
        .bind(satellite.short_name())
        .bind(file_path)
        .bind(found)
        .bind(to_epoch(Utc::now()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, %timestamp, %satellite, "Cache write failed");
                false
            }
        }
    }

    /// True only when a cached row exists with `found = true`
    pub async fn timestamp_exists(&self, timestamp: DateTime<Utc>, satellite: SatellitePattern) -> bool {
        let row = sqlx::query_as::<_, (bool,)>(
            "SELECT found FROM timestamps WHERE timestamp = ? AND satellite = ?",
        )
        .bind(to_epoch(timestamp))
        .bind(satellite.short_name())
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(row) => row.map(|(found,)| found).unwrap_or(false),
            Err(e) => {
                warn!(error = %e, %timestamp, "Cache existence check failed");
                false
            }
        }
    }

    /// Latest memoized scan for exactly these parameters
    pub async fn get_cached_scan(&self, params: &ScanParams) -> Option<ScanRecord> {
        match self.load_scan(params).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = ?e, "Scan memo lookup failed, treating as miss");
                None
            }
        }
    }

    async fn load_scan(&self, params: &ScanParams) -> ApiResult<Option<ScanRecord>> {
        let row = sqlx::query_as::<_, ScanRow>(
            "SELECT id, start_date, end_date, satellite, interval_minutes, resolved_interval,
                    base_dir, total_expected, total_found, scan_time
             FROM scans
             WHERE start_date = ? AND end_date = ? AND satellite = ?
               AND interval_minutes = ? AND base_dir = ? AND options_json = ?
             ORDER BY id DESC LIMIT 1",
        )
        .bind(to_epoch(params.start))
        .bind(to_epoch(params.end))
        .bind(params.satellite.short_name())
        .bind(params.interval_minutes)
        .bind(params.directory.to_string_lossy().to_string())
        .bind(params.options_json())
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, start, end, satellite, interval_minutes, resolved_interval, base_dir, total_expected, total_found, scan_time)) = row
        else {
            return Ok(None);
        };

        let missing = sqlx::query_as::<_, (i64, String)>(
            "SELECT timestamp, expected_filename FROM missing_timestamps
             WHERE scan_id = ? ORDER BY timestamp",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|(ts, expected_filename)| MissingItem {
            timestamp: from_epoch(ts),
            expected_filename,
        })
        .collect();

        Ok(Some(ScanRecord {
            id,
            start: from_epoch(start),
            end: from_epoch(end),
            satellite: satellite.parse()?,
            interval_minutes,
            resolved_interval,
            base_dir,
            total_expected,
            total_found,
            scan_time: from_epoch(scan_time),
            missing,
        }))
    }

    /// Memoize a finished scan, replacing any earlier record for the same parameters
    pub async fn store_scan_results(&self, params: &ScanParams, result: &ScanResult) -> bool {
        match self.save_scan(params, result).await {
            Ok(id) => {
                debug!(scan_id = id, missing = result.missing.len(), "Scan memo stored");
                true
            }
            Err(e) => {
                warn!(error = ?e, "Failed to store scan memo");
                false
            }
        }
    }

    async fn save_scan(&self, params: &ScanParams, result: &ScanResult) -> ApiResult<i64> {
        let base_dir = params.directory.to_string_lossy().to_string();
        let options_json = params.options_json();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM scans
             WHERE start_date = ? AND end_date = ? AND satellite = ?
               AND interval_minutes = ? AND base_dir = ? AND options_json = ?",
        )
        .bind(to_epoch(params.start))
        .bind(to_epoch(params.end))
        .bind(params.satellite.short_name())
        .bind(params.interval_minutes)
        .bind(&base_dir)
        .bind(&options_json)
        .execute(&mut *tx)
        .await?;

        let id = sqlx::query(
            "INSERT INTO scans (start_date, end_date, satellite, interval_minutes, resolved_interval,
                                base_dir, total_expected, total_found, scan_time, options_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(to_epoch(params.start))
        .bind(to_epoch(params.end))
        .bind(params.satellite.short_name())
        .bind(params.interval_minutes)
        .bind(result.interval_minutes)
        .bind(&base_dir)
        .bind(result.total_expected() as i64)
        .bind(result.existing.len() as i64)
        .bind(to_epoch(Utc::now()))
        .bind(&options_json)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        // Stay well under SQLite's bound-parameter limit
        for chunk in result.missing_items.chunks(300) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO missing_timestamps (scan_id, timestamp, expected_filename) ",
            );
            builder.push_values(chunk, |mut b, item| {
                b.push_bind(id)
                    .push_bind(to_epoch(item.timestamp))
                    .push_bind(item.expected_filename.clone());
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Delete every scan and timestamp row; explicit user action only
    pub async fn clear_cache(&self) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM missing_timestamps").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM scans").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM timestamps").execute(&mut *tx).await?;
        set_metadata(&mut *tx, "last_cleanup", &to_epoch(Utc::now()).to_string()).await?;
        tx.commit().await?;

        info!("Cache cleared");
        Ok(())
    }

    /// Diagnostic snapshot of the cache contents
    pub async fn stats(&self) -> ApiResult<CacheStats> {
        let (scan_count,) = sqlx::query_as::<_, (i64,)>("SELECT count(*) FROM scans")
            .fetch_one(&self.pool)
            .await?;
        let (timestamp_count, found_count) = sqlx::query_as::<_, (i64, Option<i64>)>(
            "SELECT count(*), sum(found) FROM timestamps",
        )
        .fetch_one(&self.pool)
        .await?;
        let (last_scan,) = sqlx::query_as::<_, (Option<i64>,)>("SELECT max(scan_time) FROM scans")
            .fetch_one(&self.pool)
            .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        let last_cleanup = get_metadata(&self.pool, "last_cleanup")
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .map(from_epoch);
        let schema_version = get_metadata(&self.pool, "schema_version")
            .await?
            .and_then(|v| v.parse::<i64>().ok());

        Ok(CacheStats {
            scan_count,
            timestamp_count,
            found_count: found_count.unwrap_or(0),
            db_size: page_count * page_size,
            last_scan: last_scan.map(from_epoch),
            last_cleanup,
            schema_version,
        })
    }
}

async fn get_metadata<'e, E>(executor: E, key: &str) -> ApiResult<Option<String>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, (String,)>("SELECT value FROM cache_metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|(v,)| v))
}

async fn set_metadata<'e, E>(executor: E, key: &str, value: &str) -> ApiResult<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO cache_metadata (key, value) VALUES (?, ?)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(())
}

/// Initialize cache tables, reinitializing them when the stored schema version differs
pub async fn init_db(pool: &SqlitePool) -> ApiResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS cache_metadata(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    let stored = get_metadata(pool, "schema_version")
        .await?
        .and_then(|v| v.parse::<i64>().ok());

    match stored {
        Some(v) if v == CACHE_SCHEMA_VERSION => {}
        Some(v) => {
            warn!(
                found = v,
                expected = CACHE_SCHEMA_VERSION,
                "Cache schema version mismatch, reinitializing"
            );
            for table in ["missing_timestamps", "scans", "timestamps"] {
                sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                    .execute(pool)
                    .await?;
            }
        }
        None => info!("Initializing new cache schema"),
    }

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS scans(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            start_date INTEGER NOT NULL,
            end_date INTEGER NOT NULL,
            satellite TEXT NOT NULL,
            interval_minutes INTEGER NOT NULL,
            resolved_interval INTEGER NOT NULL,
            base_dir TEXT NOT NULL,
            total_expected INTEGER NOT NULL,
            total_found INTEGER NOT NULL,
            scan_time INTEGER NOT NULL,
            options_json TEXT NOT NULL DEFAULT '{}'
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_scans_params
         ON scans(start_date, end_date, satellite, interval_minutes, base_dir)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS missing_timestamps(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scan_id INTEGER NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            timestamp INTEGER NOT NULL,
            expected_filename TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_missing_scan ON missing_timestamps(scan_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS timestamps(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp INTEGER NOT NULL,
            satellite TEXT NOT NULL,
            file_path TEXT,
            found INTEGER NOT NULL DEFAULT 0,
            last_checked INTEGER NOT NULL,
            UNIQUE(timestamp, satellite)
        )",
    )
    .execute(pool)
    .await?;

    set_metadata(pool, "schema_version", &CACHE_SCHEMA_VERSION.to_string()).await?;

    Ok(())
}
