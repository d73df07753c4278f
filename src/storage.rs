use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::window::{Boundary, Entry, HistoryLog, HistoryRecord, Rotation, Window, GLOBAL_KEY};

/// Largest value a counter may reach. Matches the range of a SQLite INTEGER.
pub const MAX_COUNT: u64 = i64::MAX as u64;

/// Maintenance deletes. Neither variant ever removes the global key, and an
/// empty `Containing` needle matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prune {
    /// Rows that were hit exactly once.
    SingleVisits,
    /// Rows whose url contains the given substring.
    Containing(String),
}

impl Prune {
    #[inline]
    fn matches(&self, url: &str, count: u64) -> bool {
        if url == GLOBAL_KEY {
            return false;
        }
        match self {
            Prune::SingleVisits => count == 1,
            Prune::Containing(needle) => !needle.is_empty() && url.contains(needle.as_str()),
        }
    }
}

/// Persistent backing of the counting windows, the history logs and the
/// boundary bookkeeping.
///
/// Implementations must make `increment` atomic across the url row and the
/// global row of the window, and `advance` atomic across the rotation and the
/// ordinal update.
#[async_trait]
pub trait Store: Send + Sync {
    /// Adds one to `url` and to the global key of `window`, returning the new count of `url`.
    async fn increment(&self, window: Window, url: &str) -> Result<u64>;

    async fn count(&self, window: Window, url: &str) -> Result<Option<u64>>;

    /// Snapshot of a window ordered by count descending, then url ascending.
    async fn list(&self, window: Window) -> Result<Vec<Entry>>;

    async fn reset(&self, window: Window) -> Result<()>;

    /// Replaces the contents of `to` with those of `from` and empties `from`.
    async fn rotate(&self, from: Window, to: Window) -> Result<()>;

    /// Returns the number of deleted rows.
    async fn prune(&self, window: Window, prune: &Prune) -> Result<usize>;

    /// Returns `false` when the period was already recorded; the stored value is kept.
    async fn append_history(&self, log: HistoryLog, record: HistoryRecord) -> Result<bool>;

    /// Newest periods first.
    async fn history(&self, log: HistoryLog, limit: usize) -> Result<Vec<HistoryRecord>>;

    /// Sum of the records within `span` periods of the newest one.
    async fn history_total(&self, log: HistoryLog, span: i64) -> Result<u64>;

    async fn load_ordinal(&self, boundary: Boundary) -> Result<Option<i64>>;

    /// Applies `boundary.rotation()` and moves the stored ordinal from `expected`
    /// to `ordinal` in one step. Fails with `RolloverConflict` if the stored
    /// ordinal is no longer `expected`.
    async fn advance(&self, boundary: Boundary, expected: Option<i64>, ordinal: i64) -> Result<()>;
}

#[derive(Default)]
struct MemState {
    windows: HashMap<Window, HashMap<String, u64>>,
    logs: HashMap<HistoryLog, BTreeMap<i64, u64>>,
    ordinals: HashMap<Boundary, i64>,
}

impl MemState {
    fn rotate(&mut self, rotation: Rotation) {
        match rotation {
            Rotation::Rotate { from, to } => {
                if from == to {
                    return;
                }
                let rows = self.windows.remove(&from).unwrap_or_default();
                self.windows.insert(to, rows);
            }
            Rotation::Reset(window) => {
                self.windows.remove(&window);
            }
        }
    }
}

/// An in-memory `Store`. Everything lives behind one lock, so every write is
/// serialized and every read is a consistent snapshot.
pub struct MemStore {
    state: RwLock<MemState>,
    max_count: u64,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    #[inline]
    pub fn new() -> Self {
        Self::with_max_count(MAX_COUNT)
    }

    /// Creates a store whose counters saturate at `max_count`.
    #[inline]
    pub fn with_max_count(max_count: u64) -> Self {
        Self {
            state: RwLock::new(MemState::default()),
            max_count,
        }
    }
}

#[async_trait]
impl Store for MemStore {
    async fn increment(&self, window: Window, url: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let rows = state.windows.entry(window).or_default();
        let current = rows.get(url).copied().unwrap_or(0);
        let global = rows.get(GLOBAL_KEY).copied().unwrap_or(0);
        if current >= self.max_count || global >= self.max_count {
            return Err(Error::Overflow {
                window,
                url: url.to_owned(),
            });
        }
        rows.insert(GLOBAL_KEY.to_owned(), global + 1);
        if url == GLOBAL_KEY {
            return Ok(global + 1);
        }
        rows.insert(url.to_owned(), current + 1);
        Ok(current + 1)
    }

    async fn count(&self, window: Window, url: &str) -> Result<Option<u64>> {
        let state = self.state.read().await;
        Ok(state.windows.get(&window).and_then(|rows| rows.get(url)).copied())
    }

    async fn list(&self, window: Window) -> Result<Vec<Entry>> {
        let state = self.state.read().await;
        let mut entries = state
            .windows
            .get(&window)
            .map(|rows| {
                rows.iter()
                    .map(|(url, count)| Entry {
                        url: url.clone(),
                        count: *count,
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.url.cmp(&b.url)));
        Ok(entries)
    }

    async fn reset(&self, window: Window) -> Result<()> {
        self.state.write().await.rotate(Rotation::Reset(window));
        Ok(())
    }

    async fn rotate(&self, from: Window, to: Window) -> Result<()> {
        self.state.write().await.rotate(Rotation::Rotate { from, to });
        Ok(())
    }

    async fn prune(&self, window: Window, prune: &Prune) -> Result<usize> {
        let mut state = self.state.write().await;
        let Some(rows) = state.windows.get_mut(&window) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|url, count| !prune.matches(url, *count));
        Ok(before - rows.len())
    }

    async fn append_history(&self, log: HistoryLog, record: HistoryRecord) -> Result<bool> {
        let mut state = self.state.write().await;
        let records = state.logs.entry(log).or_default();
        if records.contains_key(&record.period) {
            return Ok(false);
        }
        records.insert(record.period, record.value);
        Ok(true)
    }

    async fn history(&self, log: HistoryLog, limit: usize) -> Result<Vec<HistoryRecord>> {
        let state = self.state.read().await;
        Ok(state
            .logs
            .get(&log)
            .map(|records| {
                records
                    .iter()
                    .rev()
                    .take(limit)
                    .map(|(period, value)| HistoryRecord {
                        period: *period,
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn history_total(&self, log: HistoryLog, span: i64) -> Result<u64> {
        let state = self.state.read().await;
        let Some(records) = state.logs.get(&log) else {
            return Ok(0);
        };
        let Some(newest) = records.keys().next_back().copied() else {
            return Ok(0);
        };
        let total = records
            .range(newest.saturating_sub(span).saturating_add(1)..)
            .fold(0u64, |acc, (_, value)| acc.saturating_add(*value));
        Ok(total)
    }

    async fn load_ordinal(&self, boundary: Boundary) -> Result<Option<i64>> {
        Ok(self.state.read().await.ordinals.get(&boundary).copied())
    }

    async fn advance(&self, boundary: Boundary, expected: Option<i64>, ordinal: i64) -> Result<()> {
        let mut state = self.state.write().await;
        if state.ordinals.get(&boundary).copied() != expected {
            return Err(Error::RolloverConflict(boundary));
        }
        state.rotate(boundary.rotation());
        state.ordinals.insert(boundary, ordinal);
        Ok(())
    }
}
