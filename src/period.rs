use crate::config::BillingPeriod;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Inclusive window: both `start` and `end` belong to the period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodBounds {
    pub fn length(&self) -> Duration {
        self.end - self.start + Duration::seconds(1)
    }

    /// The window of the same length that ends one second before this one.
    pub fn previous(&self) -> PeriodBounds {
        PeriodBounds {
            start: self.start - self.length(),
            end: self.start - Duration::seconds(1),
        }
    }

    /// Whole days since `start`, counting the current partial day.
    pub fn days_elapsed(&self, now: DateTime<Utc>) -> i64 {
        ((now - self.start).num_days() + 1).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingWindow {
    pub current: PeriodBounds,
    pub previous: PeriodBounds,
}

/// First instant of `date` in `tz`. If midnight falls in a DST gap the day
/// starts at the first local hour that exists.
fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::default());
    (0..=2)
        .find_map(|h| {
            tz.from_local_datetime(&(midnight + Duration::hours(h)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.day0()))
}

/// Current and previous billing periods containing `now`, with calendar
/// boundaries evaluated in `tz`.
pub fn resolve(now: DateTime<Utc>, period: BillingPeriod, tz: Tz) -> BillingWindow {
    let today = now.with_timezone(&tz).date_naive();

    let (start_day, next_start_day) = match period {
        BillingPeriod::Monthly => {
            let first = first_of_month(today);
            // 31 days past the 1st always lands inside the following month.
            (first, first_of_month(first + Duration::days(31)))
        }
        BillingPeriod::Weekly => {
            let monday = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
            (monday, monday + Duration::days(7))
        }
        BillingPeriod::Daily => (today, today + Duration::days(1)),
    };

    let start = start_of_day(start_day, tz);
    let end = start_of_day(next_start_day, tz) - Duration::seconds(1);
    let current = PeriodBounds { start, end };

    BillingWindow {
        current,
        previous: current.previous(),
    }
}
