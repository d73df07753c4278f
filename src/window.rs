//! Closed identifiers for counting windows, history logs and rollover boundaries.
//!
//! Every table the stores touch is selected through these enums, never through
//! a runtime string, so a window name coming from a dashboard query has to be
//! parsed into a [`Window`] before it can reach storage.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Sentinel key holding the total of all increments applied to a window.
pub const GLOBAL_KEY: &str = "global-counter";

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Window {
    AllTime,
    Last30Days,
    CurrentDay,
    PreviousDay,
}

impl Window {
    pub const ALL: [Window; 4] = [
        Window::AllTime,
        Window::Last30Days,
        Window::CurrentDay,
        Window::PreviousDay,
    ];

    /// Windows that receive increments. `PreviousDay` is only ever filled by rotation.
    pub const ACTIVE: [Window; 3] = [Window::AllTime, Window::Last30Days, Window::CurrentDay];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Window::AllTime => "AllTime",
            Window::Last30Days => "Last30Days",
            Window::CurrentDay => "CurrentDay",
            Window::PreviousDay => "PreviousDay",
        }
    }

    #[inline]
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Window::AllTime => "all_time",
            Window::Last30Days => "last_30_days",
            Window::CurrentDay => "current_day",
            Window::PreviousDay => "previous_day",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Window {
    type Err = Error;

    /// Accepts the variant name, the table name, and the legacy dashboard names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AllTime" | "all_time" | "Analytics" => Ok(Window::AllTime),
            "Last30Days" | "last_30_days" | "Last30" => Ok(Window::Last30Days),
            "CurrentDay" | "current_day" | "LastDay" => Ok(Window::CurrentDay),
            "PreviousDay" | "previous_day" | "YesterdayLog" => Ok(Window::PreviousDay),
            _ => Err(Error::UnknownWindow(s.to_owned())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HistoryLog {
    Daily,
    Monthly,
}

impl HistoryLog {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryLog::Daily => "Daily",
            HistoryLog::Monthly => "Monthly",
        }
    }

    #[inline]
    pub(crate) fn table(&self) -> &'static str {
        match self {
            HistoryLog::Daily => "daily_log",
            HistoryLog::Monthly => "monthly_log",
        }
    }
}

impl fmt::Display for HistoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryLog {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Daily" | "daily_log" | "DayCountLog" => Ok(HistoryLog::Daily),
            "Monthly" | "monthly_log" | "MonthCountLog" => Ok(HistoryLog::Monthly),
            _ => Err(Error::UnknownLog(s.to_owned())),
        }
    }
}

/// What a boundary crossing does to the windows it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// Replace `to` with the contents of `from`, then empty `from`.
    Rotate { from: Window, to: Window },
    /// Empty the window outright.
    Reset(Window),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Boundary {
    Day,
    Month,
}

impl Boundary {
    pub const ALL: [Boundary; 2] = [Boundary::Day, Boundary::Month];

    /// Ordinal of the period containing `now`: days since the epoch, or `year * 12 + month0`.
    #[inline]
    pub fn ordinal(&self, now: DateTime<Utc>) -> i64 {
        match self {
            Boundary::Day => now.timestamp().div_euclid(SECONDS_PER_DAY),
            Boundary::Month => i64::from(now.year()) * 12 + i64::from(now.month0()),
        }
    }

    /// Window whose global counter is archived when this boundary is crossed.
    #[inline]
    pub fn outgoing(&self) -> Window {
        match self {
            Boundary::Day => Window::CurrentDay,
            Boundary::Month => Window::Last30Days,
        }
    }

    #[inline]
    pub fn log(&self) -> HistoryLog {
        match self {
            Boundary::Day => HistoryLog::Daily,
            Boundary::Month => HistoryLog::Monthly,
        }
    }

    #[inline]
    pub fn rotation(&self) -> Rotation {
        match self {
            Boundary::Day => Rotation::Rotate {
                from: Window::CurrentDay,
                to: Window::PreviousDay,
            },
            Boundary::Month => Rotation::Reset(Window::Last30Days),
        }
    }

    /// Windows a rollover of this boundary needs exclusive access to.
    #[inline]
    pub fn windows(&self) -> &'static [Window] {
        match self {
            Boundary::Day => &[Window::CurrentDay, Window::PreviousDay],
            Boundary::Month => &[Window::Last30Days],
        }
    }

    /// Key of the bookkeeping row holding this boundary's ordinal.
    #[inline]
    pub(crate) fn key(&self) -> &'static str {
        match self {
            Boundary::Day => "currentDayIndex",
            Boundary::Month => "currentMonthIndex",
        }
    }
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::Day => f.write_str("day"),
            Boundary::Month => f.write_str("month"),
        }
    }
}

/// One row of a window.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub url: String,
    pub count: u64,
}

impl Entry {
    #[inline]
    pub fn is_global(&self) -> bool {
        self.url == GLOBAL_KEY
    }
}

/// Archived total of one day or month.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRecord {
    pub period: i64,
    pub value: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_ordinal_is_days_since_epoch() {
        let t = Utc.with_ymd_and_hms(1970, 1, 2, 0, 0, 0).unwrap();
        assert_eq!(Boundary::Day.ordinal(t), 1);
        let t = Utc.with_ymd_and_hms(2024, 3, 1, 23, 59, 59).unwrap();
        assert_eq!(Boundary::Day.ordinal(t), 19783);
        let t = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        assert_eq!(Boundary::Day.ordinal(t), 19784);
    }

    #[test]
    fn month_ordinal_is_contiguous_across_years() {
        let dec = Utc.with_ymd_and_hms(2023, 12, 31, 12, 0, 0).unwrap();
        let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(Boundary::Month.ordinal(dec), 2023 * 12 + 11);
        assert_eq!(Boundary::Month.ordinal(jan), Boundary::Month.ordinal(dec) + 1);
    }

    #[test]
    fn parse_window_names_and_aliases() {
        for w in Window::ALL {
            assert_eq!(w.as_str().parse::<Window>().unwrap(), w);
            assert_eq!(w.table().parse::<Window>().unwrap(), w);
        }
        assert_eq!("Analytics".parse::<Window>().unwrap(), Window::AllTime);
        assert_eq!("YesterdayLog".parse::<Window>().unwrap(), Window::PreviousDay);
        assert!(matches!(
            "Analytics; DROP TABLE x".parse::<Window>(),
            Err(Error::UnknownWindow(_))
        ));
        assert_eq!("DayCountLog".parse::<HistoryLog>().unwrap(), HistoryLog::Daily);
        assert!("Weekly".parse::<HistoryLog>().is_err());
    }

    #[test]
    fn boundaries_own_disjoint_windows() {
        assert_eq!(Boundary::Day.outgoing(), Window::CurrentDay);
        assert_eq!(Boundary::Month.rotation(), Rotation::Reset(Window::Last30Days));
        for w in Boundary::Day.windows() {
            assert!(!Boundary::Month.windows().contains(w));
        }
    }
}
