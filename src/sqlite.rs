use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::storage::{Prune, Store, MAX_COUNT};
use crate::window::{Boundary, Entry, HistoryLog, HistoryRecord, Rotation, Window, GLOBAL_KEY};
use crate::Config;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS all_time (
        url TEXT PRIMARY KEY NOT NULL,
        counter INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS last_30_days (
        url TEXT PRIMARY KEY NOT NULL,
        counter INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS current_day (
        url TEXT PRIMARY KEY NOT NULL,
        counter INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS previous_day (
        url TEXT PRIMARY KEY NOT NULL,
        counter INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS daily_log (
        period INTEGER PRIMARY KEY NOT NULL,
        value INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS monthly_log (
        period INTEGER PRIMARY KEY NOT NULL,
        value INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS bookkeeping (
        key TEXT PRIMARY KEY NOT NULL,
        value INTEGER NOT NULL
    );
";

/// A `Store` backed by a single SQLite database.
///
/// The connection sits behind an async mutex, so writes are serialized and
/// every multi-statement operation runs inside its own transaction. SQLite
/// calls block, so they run on tokio's blocking pool, never on a worker.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and its schema.
    pub fn open<P: AsRef<Path>>(path: P, cfg: &Config) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(cfg.busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        info!("opened counter store at {}, journal_mode: {}", path.display(), mode);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&mut conn.blocking_lock()))
            .await
            .map_err(|e| Error::Storage(format!("sqlite task failed, {}", e)))?
    }
}

#[inline]
fn to_count(value: i64) -> u64 {
    value.max(0) as u64
}

#[inline]
fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::Storage(format!("value {} out of range", value)))
}

fn bump(conn: &Connection, window: Window, url: &str) -> Result<u64> {
    let sql = format!(
        "INSERT INTO {} (url, counter) VALUES (?1, 1)
         ON CONFLICT(url) DO UPDATE SET counter = counter + 1 WHERE counter < ?2
         RETURNING counter",
        window.table()
    );
    let count: Option<i64> = conn
        .prepare_cached(&sql)?
        .query_row(params![url, MAX_COUNT as i64], |row| row.get(0))
        .optional()?;
    match count {
        Some(count) => Ok(to_count(count)),
        None => Err(Error::Overflow {
            window,
            url: url.to_owned(),
        }),
    }
}

fn apply_rotation(conn: &Connection, rotation: Rotation) -> Result<()> {
    match rotation {
        Rotation::Rotate { from, to } => {
            if from == to {
                return Ok(());
            }
            conn.execute(&format!("DELETE FROM {}", to.table()), [])?;
            conn.execute(
                &format!(
                    "INSERT INTO {} (url, counter) SELECT url, counter FROM {}",
                    to.table(),
                    from.table()
                ),
                [],
            )?;
            conn.execute(&format!("DELETE FROM {}", from.table()), [])?;
        }
        Rotation::Reset(window) => {
            conn.execute(&format!("DELETE FROM {}", window.table()), [])?;
        }
    }
    Ok(())
}

fn read_ordinal(conn: &Connection, boundary: Boundary) -> Result<Option<i64>> {
    let ordinal = conn
        .prepare_cached("SELECT value FROM bookkeeping WHERE key = ?1")?
        .query_row(params![boundary.key()], |row| row.get(0))
        .optional()?;
    Ok(ordinal)
}

#[async_trait]
impl Store for SqliteStore {
    async fn increment(&self, window: Window, url: &str) -> Result<u64> {
        let url = url.to_owned();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let count = bump(&tx, window, &url)?;
            if url != GLOBAL_KEY {
                bump(&tx, window, GLOBAL_KEY)?;
            }
            tx.commit()?;
            Ok(count)
        })
        .await
    }

    async fn count(&self, window: Window, url: &str) -> Result<Option<u64>> {
        let url = url.to_owned();
        self.with_conn(move |conn| {
            let count: Option<i64> = conn
                .prepare_cached(&format!(
                    "SELECT counter FROM {} WHERE url = ?1",
                    window.table()
                ))?
                .query_row(params![url], |row| row.get(0))
                .optional()?;
            Ok(count.map(to_count))
        })
        .await
    }

    async fn list(&self, window: Window) -> Result<Vec<Entry>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT url, counter FROM {} ORDER BY counter DESC, url ASC",
                window.table()
            ))?;
            let entries = stmt
                .query_map([], |row| {
                    Ok(Entry {
                        url: row.get(0)?,
                        count: to_count(row.get(1)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn reset(&self, window: Window) -> Result<()> {
        self.with_conn(move |conn| apply_rotation(conn, Rotation::Reset(window)))
            .await
    }

    async fn rotate(&self, from: Window, to: Window) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            apply_rotation(&tx, Rotation::Rotate { from, to })?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn prune(&self, window: Window, prune: &Prune) -> Result<usize> {
        let prune = prune.clone();
        self.with_conn(move |conn| {
            let removed = match prune {
                Prune::SingleVisits => conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE counter = 1 AND url <> ?1",
                        window.table()
                    ),
                    params![GLOBAL_KEY],
                )?,
                Prune::Containing(needle) if needle.is_empty() => 0,
                Prune::Containing(needle) => conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE instr(url, ?2) > 0 AND url <> ?1",
                        window.table()
                    ),
                    params![GLOBAL_KEY, needle],
                )?,
            };
            Ok(removed)
        })
        .await
    }

    async fn append_history(&self, log: HistoryLog, record: HistoryRecord) -> Result<bool> {
        let value = to_sql_int(record.value)?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} (period, value) VALUES (?1, ?2)",
                    log.table()
                ),
                params![record.period, value],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn history(&self, log: HistoryLog, limit: usize) -> Result<Vec<HistoryRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT period, value FROM {} ORDER BY period DESC LIMIT ?1",
                log.table()
            ))?;
            let records = stmt
                .query_map(params![limit], |row| {
                    Ok(HistoryRecord {
                        period: row.get(0)?,
                        value: to_count(row.get(1)?),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    async fn history_total(&self, log: HistoryLog, span: i64) -> Result<u64> {
        self.with_conn(move |conn| {
            let total: i64 = conn.query_row(
                &format!(
                    "SELECT COALESCE(SUM(value), 0) FROM {t}
                     WHERE period > (SELECT MAX(period) FROM {t}) - ?1",
                    t = log.table()
                ),
                params![span],
                |row| row.get(0),
            )?;
            Ok(to_count(total))
        })
        .await
    }

    async fn load_ordinal(&self, boundary: Boundary) -> Result<Option<i64>> {
        self.with_conn(move |conn| read_ordinal(conn, boundary)).await
    }

    async fn advance(&self, boundary: Boundary, expected: Option<i64>, ordinal: i64) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if read_ordinal(&tx, boundary)? != expected {
                return Err(Error::RolloverConflict(boundary));
            }
            apply_rotation(&tx, boundary.rotation())?;
            tx.execute(
                "INSERT INTO bookkeeping (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![boundary.key(), ordinal],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
