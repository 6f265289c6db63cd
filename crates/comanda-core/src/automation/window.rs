//! Execution window and tenant-local calendar helpers

use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Timelike, Utc};
use comanda_storage::models::AutomationRule;

/// Local hours and ISO weekdays a rule may send in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionWindow {
    /// First allowed hour (inclusive)
    pub start_hour: u32,
    /// Last allowed hour (inclusive)
    pub end_hour: u32,
    /// ISO weekdays, 1 = Monday .. 7 = Sunday
    pub days: Vec<u32>,
}

impl ExecutionWindow {
    pub fn from_rule(rule: &AutomationRule) -> Self {
        Self {
            start_hour: clamp_hour(rule.execution_hours_start),
            end_hour: clamp_hour(rule.execution_hours_end),
            days: rule
                .execution_days_of_week
                .iter()
                .filter_map(|d| u32::try_from(*d).ok())
                .filter(|d| (1..=7).contains(d))
                .collect(),
        }
    }

    pub fn contains_hour(&self, hour: u32) -> bool {
        hour >= self.start_hour && hour <= self.end_hour
    }

    pub fn allows_weekday(&self, iso_weekday: u32) -> bool {
        self.days.contains(&iso_weekday)
    }

    /// Move a candidate send time into the window.
    ///
    /// Before the start hour the time is reset to the start hour of the same
    /// day; after the end hour, to the start hour of the next day. A
    /// disallowed weekday then advances day by day (at most a week) and
    /// resets to the start hour.
    pub fn adjust(&self, at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        let mut local = at.with_timezone(&offset);

        let hour = local.hour();
        if hour < self.start_hour || hour > self.end_hour {
            let mut date = local.date_naive();
            if hour > self.end_hour {
                date = date.succ_opt().unwrap_or(date);
            }
            local = self.at_start(date, offset).unwrap_or(local);
        }

        if !self.allows_weekday(local.weekday().number_from_monday()) {
            let mut date = local.date_naive();
            for _ in 0..7 {
                date = date.succ_opt().unwrap_or(date);
                if self.allows_weekday(date.weekday().number_from_monday()) {
                    break;
                }
            }
            local = self.at_start(date, offset).unwrap_or(local);
        }

        local.with_timezone(&Utc)
    }

    fn at_start(&self, date: NaiveDate, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
        date.and_hms_opt(self.start_hour, 0, 0)?
            .and_local_timezone(offset)
            .single()
    }
}

fn clamp_hour(hour: i32) -> u32 {
    u32::try_from(hour.clamp(0, 23)).unwrap_or(0)
}

/// UTC bounds `[start, end)` of the tenant-local calendar day containing `now`
pub fn local_day_bounds(now: DateTime<Utc>, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local = now.with_timezone(&offset);
    let start = local
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(offset).single())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or(now);
    (start, start + Duration::days(1))
}

/// Tenant-local calendar days between `since` and `now`
pub fn calendar_days_between(
    since: DateTime<Utc>,
    now: DateTime<Utc>,
    offset: FixedOffset,
) -> i64 {
    let from = since.with_timezone(&offset).date_naive();
    let to = now.with_timezone(&offset).date_naive();
    (to - from).num_days()
}
