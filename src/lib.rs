use std::time::Duration;

pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::counter::{active_queries, active_record_hits, Counter, Status};
pub use crate::error::{Error, Result};
pub use crate::fanout::{Counts, Fanout, HitEvent, SubscriberId, Subscription};
pub use crate::rollover::{BoundaryState, RolloverManager};
pub use crate::sqlite::SqliteStore;
pub use crate::storage::{MemStore, Prune, Store, MAX_COUNT};
pub use crate::window::{Boundary, Entry, HistoryLog, HistoryRecord, Rotation, Window, GLOBAL_KEY};

mod clock;
mod counter;
mod error;
mod fanout;
mod rollover;
mod sqlite;
mod storage;
mod window;

#[derive(Clone, Debug)]
pub struct Config {
    //Per-subscriber queue depth, events past it are dropped for that subscriber
    pub subscriber_buffer: usize,
    //Conflicting rollovers re-run this many times before a hit fails
    pub rollover_retries: usize,
    //Key recorded for a hit with an empty url
    pub unknown_key: String,
    //Days summed by `Counter::trailing_total`
    pub trailing_days: i64,
    pub busy_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
            rollover_retries: 3,
            unknown_key: "unknown".into(),
            trailing_days: 30,
            busy_timeout: Duration::from_secs(5),
        }
    }
}
