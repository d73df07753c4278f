//! Day and month boundary detection with archive-then-rotate.
//!
//! Each boundary type has its own mutex, held for the whole
//! read-check-transition sequence, so two racing callers can never both
//! archive the same period. Window gates give a rollover exclusive access to
//! the windows it rotates while increments on other windows keep flowing.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::clock::Clock;
use crate::error::Result;
use crate::storage::Store;
use crate::window::{Boundary, HistoryRecord, Window, GLOBAL_KEY};

/// Persisted ordinals as of the last completed rollover check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundaryState {
    pub current_day_index: Option<i64>,
    pub current_month_index: Option<i64>,
}

/// One reader/writer gate per window. Increments hold the read side,
/// rollovers hold the write side of the windows they rotate.
#[derive(Default)]
pub(crate) struct WindowGates {
    all_time: RwLock<()>,
    last_30_days: RwLock<()>,
    current_day: RwLock<()>,
    previous_day: RwLock<()>,
}

impl WindowGates {
    #[inline]
    fn gate(&self, window: Window) -> &RwLock<()> {
        match window {
            Window::AllTime => &self.all_time,
            Window::Last30Days => &self.last_30_days,
            Window::CurrentDay => &self.current_day,
            Window::PreviousDay => &self.previous_day,
        }
    }

    #[inline]
    pub(crate) async fn shared(&self, window: Window) -> RwLockReadGuard<'_, ()> {
        self.gate(window).read().await
    }

    /// Locks `windows` exclusively, always in `Window` order.
    async fn exclusive(&self, windows: &[Window]) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut windows = windows.to_vec();
        windows.sort();
        let mut guards = Vec::with_capacity(windows.len());
        for window in windows {
            guards.push(self.gate(window).write().await);
        }
        guards
    }
}

pub struct RolloverManager<S: Store> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    day: Mutex<()>,
    month: Mutex<()>,
    pub(crate) gates: WindowGates,
}

impl<S: Store + 'static> RolloverManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            day: Mutex::new(()),
            month: Mutex::new(()),
            gates: WindowGates::default(),
        }
    }

    #[inline]
    fn lock(&self, boundary: Boundary) -> &Mutex<()> {
        match boundary {
            Boundary::Day => &self.day,
            Boundary::Month => &self.month,
        }
    }

    pub async fn state(&self) -> Result<BoundaryState> {
        Ok(BoundaryState {
            current_day_index: self.store.load_ordinal(Boundary::Day).await?,
            current_month_index: self.store.load_ordinal(Boundary::Month).await?,
        })
    }

    /// Brings every boundary up to date. Returns the boundaries that rolled over.
    pub async fn catch_up_all(&self) -> Result<Vec<Boundary>> {
        let mut rolled = Vec::new();
        for boundary in Boundary::ALL {
            if self.catch_up(boundary).await? {
                rolled.push(boundary);
            }
        }
        Ok(rolled)
    }

    /// Performs the rollover for `boundary` if the clock has moved past the
    /// stored period. Returns `false` when there was nothing to do.
    ///
    /// The history append happens before the rotation and is insert-once, so a
    /// rollover interrupted between the two resumes on the next call without
    /// archiving the period twice.
    pub async fn catch_up(&self, boundary: Boundary) -> Result<bool> {
        let _serialized = self.lock(boundary).lock().await;

        let stored = self.store.load_ordinal(boundary).await?;
        let current = boundary.ordinal(self.clock.now());
        match stored {
            Some(stored) if stored == current => return Ok(false),
            Some(stored) if stored > current => {
                warn!(
                    "clock is behind the stored {} ordinal, stored: {}, now: {}, skipping rollover",
                    boundary, stored, current
                );
                return Ok(false);
            }
            _ => {}
        }

        let _exclusive = self.gates.exclusive(boundary.windows()).await;

        let outgoing = self
            .store
            .count(boundary.outgoing(), GLOBAL_KEY)
            .await?
            .unwrap_or(0);
        if let Some(period) = stored {
            let appended = self
                .store
                .append_history(
                    boundary.log(),
                    HistoryRecord {
                        period,
                        value: outgoing,
                    },
                )
                .await?;
            if !appended {
                warn!(
                    "{} log already holds period {}, resuming interrupted rollover",
                    boundary.log(),
                    period
                );
            }
        }
        self.store.advance(boundary, stored, current).await?;

        info!(
            "{} rollover, from: {:?}, to: {}, archived total: {}",
            boundary, stored, current, outgoing
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemStore;
    use crate::window::HistoryLog;
    use chrono::{Duration, TimeZone, Utc};

    fn manager(clock: Arc<ManualClock>) -> (Arc<MemStore>, RolloverManager<MemStore>) {
        let store = Arc::new(MemStore::new());
        let rollover = RolloverManager::new(store.clone(), clock);
        (store, rollover)
    }

    #[tokio::test]
    async fn first_check_records_ordinals_without_history() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let (store, rollover) = manager(clock.clone());
        store.increment(Window::CurrentDay, "/a").await.unwrap();

        let rolled = rollover.catch_up_all().await.unwrap();
        assert_eq!(rolled, vec![Boundary::Day, Boundary::Month]);
        assert!(store.history(HistoryLog::Daily, 10).await.unwrap().is_empty());
        assert!(store.history(HistoryLog::Monthly, 10).await.unwrap().is_empty());
        assert_eq!(
            rollover.state().await.unwrap(),
            BoundaryState {
                current_day_index: Some(19783),
                current_month_index: Some(2024 * 12 + 2),
            }
        );
    }

    #[tokio::test]
    async fn second_check_is_a_no_op() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let (store, rollover) = manager(clock.clone());
        rollover.catch_up_all().await.unwrap();
        store.increment(Window::CurrentDay, "/a").await.unwrap();

        assert!(rollover.catch_up_all().await.unwrap().is_empty());
        assert_eq!(store.count(Window::CurrentDay, "/a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn day_boundary_archives_and_rotates() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap(),
        ));
        let (store, rollover) = manager(clock.clone());
        rollover.catch_up_all().await.unwrap();
        for _ in 0..3 {
            store.increment(Window::CurrentDay, "/a").await.unwrap();
        }
        store.increment(Window::Last30Days, "/a").await.unwrap();

        clock.advance(Duration::hours(2));
        assert_eq!(rollover.catch_up_all().await.unwrap(), vec![Boundary::Day]);
        assert_eq!(
            store.history(HistoryLog::Daily, 10).await.unwrap(),
            vec![HistoryRecord { period: 19783, value: 3 }]
        );
        assert_eq!(store.count(Window::PreviousDay, GLOBAL_KEY).await.unwrap(), Some(3));
        assert!(store.list(Window::CurrentDay).await.unwrap().is_empty());
        // Same month: the trailing window is untouched.
        assert_eq!(store.count(Window::Last30Days, "/a").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn clock_regression_changes_nothing() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap(),
        ));
        let (store, rollover) = manager(clock.clone());
        rollover.catch_up_all().await.unwrap();
        store.increment(Window::CurrentDay, "/a").await.unwrap();

        clock.set(Utc.with_ymd_and_hms(2024, 2, 29, 1, 0, 0).unwrap());
        assert!(rollover.catch_up_all().await.unwrap().is_empty());
        assert_eq!(store.count(Window::CurrentDay, "/a").await.unwrap(), Some(1));
        assert_eq!(
            store.load_ordinal(Boundary::Day).await.unwrap(),
            Some(19784)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_callers_roll_once() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap(),
        ));
        let (store, rollover) = manager(clock.clone());
        rollover.catch_up_all().await.unwrap();
        store.increment(Window::CurrentDay, "/a").await.unwrap();
        clock.advance(Duration::hours(2));

        let rollover = Arc::new(rollover);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let rollover = rollover.clone();
            handles.push(tokio::spawn(async move {
                rollover.catch_up(Boundary::Day).await.unwrap()
            }));
        }
        let mut rolled = 0;
        for handle in handles {
            if handle.await.unwrap() {
                rolled += 1;
            }
        }
        assert_eq!(rolled, 1);
        assert_eq!(store.history(HistoryLog::Daily, 10).await.unwrap().len(), 1);
        assert_eq!(store.count(Window::PreviousDay, "/a").await.unwrap(), Some(1));
    }
}
