//! Durable view/conversion statistics over SQLite.
//!
//! The increment path is a single `INSERT .. ON CONFLICT .. DO UPDATE`
//! statement, so concurrent trackers for the same (test, variant) pair can
//! never lose an increment to a read-then-write race.

#![allow(clippy::missing_errors_doc)]

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use abtrack_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, EventKind, StatsError, TestVariantCounter,
    TrackingEvent,
};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error, warn};

const STATS_MIGRATION_VERSION: i64 = 1;

const SCHEMA_STATS_V1: &str = r"
CREATE TABLE IF NOT EXISTS ab_test_stats (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  test_name TEXT NOT NULL,
  variant TEXT NOT NULL,
  views INTEGER NOT NULL DEFAULT 0 CHECK (views >= 0),
  conversions INTEGER NOT NULL DEFAULT 0 CHECK (conversions >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (test_name, variant)
);

CREATE INDEX IF NOT EXISTS idx_ab_test_stats_test
  ON ab_test_stats(test_name);
";

pub struct SqliteStatsStore {
    conn: Connection,
}

impl SqliteStatsStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_STATS_V1)
            .context("failed to apply stats schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STATS_MIGRATION_VERSION, now],
            )
            .context("failed to register stats schema migration")?;

        Ok(())
    }

    /// Counts one view for `(test_name, variant)`, creating the counter row
    /// at (1, 0) on first contact.
    ///
    /// # Errors
    /// [`StatsError::InvalidInput`] when either key trims to empty (no
    /// mutation happens); [`StatsError::StorageFailure`] when the write
    /// fails.
    pub fn record_view(&self, test_name: &str, variant: &str) -> Result<(), StatsError> {
        self.record(&TrackingEvent::view(test_name, variant))
    }

    /// Records one tracking event, dispatching on its kind.
    ///
    /// # Errors
    /// [`StatsError::InvalidInput`] when either key trims to empty (no
    /// mutation happens); [`StatsError::StorageFailure`] when the write
    /// fails.
    pub fn record(&self, event: &TrackingEvent) -> Result<(), StatsError> {
        let event = event.normalized()?;
        let now = format_rfc3339(now_utc())
            .map_err(|err| StatsError::StorageFailure(err.to_string()))?;

        // One atomic insert-or-increment; never a separate read then write.
        let sql = match event.kind {
            EventKind::View => {
                "INSERT INTO ab_test_stats(test_name, variant, views, conversions, created_at, updated_at)
                 VALUES (?1, ?2, 1, 0, ?3, ?3)
                 ON CONFLICT(test_name, variant) DO UPDATE SET
                   views = views + 1,
                   updated_at = excluded.updated_at"
            }
            EventKind::Conversion => {
                "INSERT INTO ab_test_stats(test_name, variant, views, conversions, created_at, updated_at)
                 VALUES (?1, ?2, 0, 1, ?3, ?3)
                 ON CONFLICT(test_name, variant) DO UPDATE SET
                   conversions = conversions + 1,
                   updated_at = excluded.updated_at"
            }
        };

        self.conn
            .execute(sql, params![event.test_name, event.variant, now])
            .map_err(|err| StatsError::StorageFailure(err.to_string()))?;

        debug!(
            test = %event.test_name,
            variant = %event.variant,
            kind = event.kind.as_str(),
            "recorded tracking event"
        );
        Ok(())
    }

    /// Counts one conversion for `(test_name, variant)`, creating the
    /// counter row at (0, 1) on first contact.
    ///
    /// # Errors
    /// See [`SqliteStatsStore::record`].
    pub fn record_conversion(&self, test_name: &str, variant: &str) -> Result<(), StatsError> {
        self.record(&TrackingEvent::conversion(test_name, variant))
    }

    /// All counters, ordered by `(test_name ASC, variant ASC)`.
    pub fn list_all(&self) -> Result<Vec<TestVariantCounter>> {
        let mut stmt = self.conn.prepare(
            "SELECT test_name, variant, views, conversions, created_at, updated_at
             FROM ab_test_stats
             ORDER BY test_name ASC, variant ASC",
        )?;

        let rows = stmt.query_map([], parse_counter_row)?;
        collect_rows(rows)
    }

    /// Counters for one test, ordered by `variant ASC`.
    pub fn list_for_test(&self, test_name: &str) -> Result<Vec<TestVariantCounter>> {
        let mut stmt = self.conn.prepare(
            "SELECT test_name, variant, views, conversions, created_at, updated_at
             FROM ab_test_stats
             WHERE test_name = ?1
             ORDER BY variant ASC",
        )?;

        let rows = stmt.query_map(params![test_name], parse_counter_row)?;
        collect_rows(rows)
    }

    /// The counter for one (test, variant) pair, if it exists.
    pub fn get_counter(
        &self,
        test_name: &str,
        variant: &str,
    ) -> Result<Option<TestVariantCounter>> {
        let mut stmt = self.conn.prepare(
            "SELECT test_name, variant, views, conversions, created_at, updated_at
             FROM ab_test_stats
             WHERE test_name = ?1 AND variant = ?2",
        )?;

        let row = stmt
            .query_row(params![test_name, variant], parse_counter_row)
            .optional()?;
        Ok(row)
    }
}

/// Drains a tracking-event channel into the store on a background thread.
///
/// The thread exits when every sender is dropped. Per-event failures are
/// logged and dropped so one bad event cannot stall the drain.
#[must_use]
pub fn spawn_recorder(path: PathBuf, receiver: Receiver<TrackingEvent>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let store = match SqliteStatsStore::open(&path) {
            Ok(store) => store,
            Err(err) => {
                error!(%err, "recorder failed to open stats store");
                return;
            }
        };
        if let Err(err) = store.migrate() {
            error!(%err, "recorder failed to migrate stats store");
            return;
        }

        while let Ok(event) = receiver.recv() {
            if let Err(err) = store.record(&event) {
                warn!(
                    test = %event.test_name,
                    variant = %event.variant,
                    %err,
                    "dropping tracking event"
                );
            }
        }
    })
}

fn parse_counter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestVariantCounter> {
    let views_i64: i64 = row.get(2)?;
    let conversions_i64: i64 = row.get(3)?;

    let views = u64::try_from(views_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid views count: {views_i64}"),
            )),
        )
    })?;

    let conversions = u64::try_from(conversions_i64).map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Integer,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid conversions count: {conversions_i64}"),
            )),
        )
    })?;

    let created_at = parse_rfc3339_utc(&row.get::<_, String>(4)?).map_err(to_sql_error)?;
    let updated_at = parse_rfc3339_utc(&row.get::<_, String>(5)?).map_err(to_sql_error)?;

    Ok(TestVariantCounter {
        test_name: row.get(0)?,
        variant: row.get(1)?,
        views,
        conversions,
        created_at,
        updated_at,
    })
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: StatsError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
