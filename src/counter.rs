use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::fanout::{Counts, Fanout, SubscriberId, Subscription};
use crate::rollover::{BoundaryState, RolloverManager};
use crate::storage::{Prune, Store};
use crate::window::{Boundary, Entry, HistoryLog, HistoryRecord, Window, GLOBAL_KEY};
use crate::Config;

static ACTIVE_RECORD_HITS: AtomicIsize = AtomicIsize::new(0);
static ACTIVE_QUERIES: AtomicIsize = AtomicIsize::new(0);

pub fn active_record_hits() -> isize {
    ACTIVE_RECORD_HITS.load(Ordering::SeqCst)
}

pub fn active_queries() -> isize {
    ACTIVE_QUERIES.load(Ordering::SeqCst)
}

macro_rules! track {
    ($gauge:expr) => {
        $gauge.fetch_add(1, Ordering::SeqCst);
        scopeguard::defer! {
            $gauge.fetch_sub(1, Ordering::SeqCst);
        }
    };
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub active_record_hits: isize,
    pub active_queries: isize,
    pub subscribers: usize,
    pub published: u64,
    pub dropped: u64,
    pub day_ordinal: Option<i64>,
    pub month_ordinal: Option<i64>,
}

/// The entry point of the engine: records hits, serves window and history
/// reads, and feeds subscribers.
///
/// A hit increments `AllTime`, `Last30Days` and `CurrentDay` one after the
/// other. If a later window fails, the earlier increments stay committed:
/// counts are an approximate metric, not a ledger, and the failure is
/// reported as `Error::Record` naming the window that failed.
///
/// Increments and their publish happen under one commit lock, so every
/// subscriber sees hits in the order they were committed.
pub struct Counter<S: Store> {
    store: Arc<S>,
    rollover: Arc<RolloverManager<S>>,
    fanout: Fanout,
    commit: Arc<Mutex<()>>,
    cfg: Arc<Config>,
}

impl<S: Store> Clone for Counter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            rollover: self.rollover.clone(),
            fanout: self.fanout.clone(),
            commit: self.commit.clone(),
            cfg: self.cfg.clone(),
        }
    }
}

impl<S: Store + 'static> Counter<S> {
    pub fn new(store: S, cfg: Config) -> Self {
        Self::with_clock(store, cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(store: S, cfg: Config, clock: Arc<dyn Clock>) -> Self {
        let store = Arc::new(store);
        let rollover = Arc::new(RolloverManager::new(store.clone(), clock));
        let fanout = Fanout::new(cfg.subscriber_buffer);
        Self {
            store,
            rollover,
            fanout,
            commit: Arc::new(Mutex::new(())),
            cfg: Arc::new(cfg),
        }
    }

    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Brings both boundaries up to date, re-running the check when another
    /// writer advanced a boundary underneath it. Gives up with
    /// `Error::Storage` after `rollover_retries` conflicts.
    pub async fn catch_up(&self) -> Result<Vec<Boundary>> {
        let mut conflicts = 0;
        loop {
            match self.rollover.catch_up_all().await {
                Err(Error::RolloverConflict(boundary)) => {
                    conflicts += 1;
                    if conflicts > self.cfg.rollover_retries {
                        return Err(Error::Storage(format!(
                            "{} rollover still conflicting after {} retries",
                            boundary, self.cfg.rollover_retries
                        )));
                    }
                    warn!(
                        "{} rollover conflict, retrying {}/{}",
                        boundary, conflicts, self.cfg.rollover_retries
                    );
                }
                other => return other,
            }
        }
    }

    /// Records one hit for `url` in every active window and returns the new
    /// per-window counts of `url`.
    pub async fn record_hit(&self, url: &str) -> Result<Counts> {
        track!(ACTIVE_RECORD_HITS);
        self.catch_up().await?;

        let url = if url.is_empty() {
            self.cfg.unknown_key.as_str()
        } else {
            url
        };

        let _commit = self.commit.lock().await;
        let mut counts = Counts::new();
        for window in Window::ACTIVE {
            let count = {
                let _gate = self.rollover.gates.shared(window).await;
                self.store.increment(window, url).await
            };
            match count {
                Ok(count) => {
                    counts.insert(window, count);
                }
                Err(e) => {
                    error!(
                        "record hit failed, window: {}, url: {}, committed: {:?}, {:?}",
                        window, url, counts, e
                    );
                    return Err(Error::Record {
                        window,
                        source: e.boxed(),
                    });
                }
            }
        }
        debug!("hit {}, counts: {:?}", url, counts);

        self.fanout.publish(url, &counts);
        Ok(counts)
    }

    /// Every row of `window`, the global key included, by count descending.
    pub async fn query_window(&self, window: Window) -> Result<Vec<Entry>> {
        track!(ACTIVE_QUERIES);
        self.catch_up().await?;
        self.store.list(window).await
    }

    /// The newest `limit` records of `log`.
    pub async fn query_history(&self, log: HistoryLog, limit: usize) -> Result<Vec<HistoryRecord>> {
        track!(ACTIVE_QUERIES);
        self.catch_up().await?;
        self.store.history(log, limit).await
    }

    /// Total hits recorded in `window` since its last reset.
    pub async fn global_count(&self, window: Window) -> Result<u64> {
        track!(ACTIVE_QUERIES);
        self.catch_up().await?;
        Ok(self.store.count(window, GLOBAL_KEY).await?.unwrap_or(0))
    }

    /// Sum of the archived daily totals over the last `trailing_days` days.
    pub async fn trailing_total(&self) -> Result<u64> {
        track!(ACTIVE_QUERIES);
        self.catch_up().await?;
        self.store
            .history_total(HistoryLog::Daily, self.cfg.trailing_days)
            .await
    }

    /// Deletes matching rows from `window`; the global key is never removed.
    /// Counted as a query by the status gauges.
    pub async fn prune(&self, window: Window, prune: &Prune) -> Result<usize> {
        track!(ACTIVE_QUERIES);
        self.catch_up().await?;
        let removed = {
            let _gate = self.rollover.gates.shared(window).await;
            self.store.prune(window, prune).await?
        };
        if removed > 0 {
            warn!("pruned {} rows from {}, filter: {:?}", removed, window, prune);
        }
        Ok(removed)
    }

    #[inline]
    pub fn subscribe(&self) -> Subscription {
        self.fanout.subscribe()
    }

    #[inline]
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.fanout.unsubscribe(id)
    }

    pub async fn boundary_state(&self) -> Result<BoundaryState> {
        self.rollover.state().await
    }

    pub async fn status(&self) -> Result<Status> {
        let state = self.rollover.state().await?;
        Ok(Status {
            active_record_hits: active_record_hits(),
            active_queries: active_queries(),
            subscribers: self.fanout.subscribers(),
            published: self.fanout.published(),
            dropped: self.fanout.dropped(),
            day_ordinal: state.current_day_index,
            month_ordinal: state.current_month_index,
        })
    }
}
