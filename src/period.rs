//! Billing-cycle boundary calculation.
//!
//! Pure functions over `chrono::DateTime<Utc>` — no I/O, no fallible path.
//! The distilled spec allows for inputs "not representable as UTC
//! instants" to fail; with `chrono::DateTime<Utc>` every value that exists
//! is already representable, so `cycle` is infallible here.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodKind {
    Daily,
    Monthly,
    Forever,
}

/// A bounded or unbounded interval over which a usage counter accumulates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub kind: PeriodKind,
}

impl Period {
    /// Deterministic storage-identity key derived from `kind` and `start`.
    pub fn key(&self) -> String {
        match self.kind {
            PeriodKind::Daily => format!("daily:{}", self.start.format("%Y-%m-%d")),
            PeriodKind::Monthly => format!("monthly:{}", self.start.format("%Y-%m-%d")),
            PeriodKind::Forever => "forever".to_string(),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && self.end.map(|e| instant < e).unwrap_or(true)
    }
}

/// Compute the current `Period` for a user's subscription `start` and
/// `kind`, as observed at `now`.
pub fn cycle(start: DateTime<Utc>, now: DateTime<Utc>, kind: PeriodKind) -> Period {
    match kind {
        PeriodKind::Daily => {
            let floor = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
            Period {
                start: floor,
                end: Some(floor + chrono::Duration::days(1)),
                kind,
            }
        }
        PeriodKind::Monthly => monthly_cycle(start, now),
        PeriodKind::Forever => Period {
            start,
            end: None,
            kind,
        },
    }
}

/// Anniversary-based monthly cycle. The cycle day-of-month is
/// `min(start.day(), last_day_of_that_month)`, carrying `start`'s
/// time-of-day. The end-of-month edge (e.g. `start` on the 31st) clamps to
/// whatever the current month's length is.
fn monthly_cycle(start: DateTime<Utc>, now: DateTime<Utc>) -> Period {
    let anchor_day = start.day();
    let time = start.time();

    // Candidate cycle start in `now`'s year/month.
    let mut cur_year = now.year();
    let mut cur_month = now.month();
    let mut candidate = month_anniversary(cur_year, cur_month, anchor_day, time);

    if candidate > now {
        // Anniversary this month hasn't happened yet — the current cycle
        // began last month.
        let (py, pm) = prev_month(cur_year, cur_month);
        cur_year = py;
        cur_month = pm;
        candidate = month_anniversary(cur_year, cur_month, anchor_day, time);
    }

    let (ny, nm) = next_month(cur_year, cur_month);
    let end = month_anniversary(ny, nm, anchor_day, time);

    Period {
        start: candidate,
        end: Some(end),
        kind: PeriodKind::Monthly,
    }
}

fn month_anniversary(year: i32, month: u32, day: u32, time: chrono::NaiveTime) -> DateTime<Utc> {
    let clamped_day = day.min(days_in_month(year, month));
    let date = chrono::NaiveDate::from_ymd_opt(year, month, clamped_day)
        .expect("clamped day is always valid for its month");
    Utc.from_utc_datetime(
        &date
            .and_hms_nano_opt(time.hour(), time.minute(), time.second(), time.nanosecond())
            .expect("time-of-day components come from a valid NaiveTime"),
    )
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (ny, nm) = next_month(year, month);
    let first_of_next = chrono::NaiveDate::from_ymd_opt(ny, nm, 1).unwrap();
    let first_of_this = chrono::NaiveDate::from_ymd_opt(year, month, 1).unwrap();
    (first_of_next - first_of_this).num_days() as u32
}

fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

fn prev_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, 0).unwrap()
    }

    #[test]
    fn daily_floors_to_midnight_utc() {
        let now = dt(2026, 3, 15, 14, 30);
        let p = cycle(now, now, PeriodKind::Daily);
        assert_eq!(p.start, dt(2026, 3, 15, 0, 0));
        assert_eq!(p.end, Some(dt(2026, 3, 16, 0, 0)));
        assert_eq!(p.key(), "daily:2026-03-15");
    }

    #[test]
    fn monthly_anniversary_mid_cycle() {
        let start = dt(2026, 1, 10, 9, 0);
        let now = dt(2026, 3, 15, 12, 0);
        let p = cycle(start, now, PeriodKind::Monthly);
        assert_eq!(p.start, dt(2026, 3, 10, 9, 0));
        assert_eq!(p.end, Some(dt(2026, 4, 10, 9, 0)));
    }

    #[test]
    fn monthly_anniversary_before_this_months_day() {
        let start = dt(2026, 1, 20, 9, 0);
        let now = dt(2026, 3, 5, 12, 0);
        // anniversary this month (Mar 20) is in the future — cycle started Feb 20.
        let p = cycle(start, now, PeriodKind::Monthly);
        assert_eq!(p.start, dt(2026, 2, 20, 9, 0));
        assert_eq!(p.end, Some(dt(2026, 3, 20, 9, 0)));
    }

    #[test]
    fn monthly_end_of_month_clamp() {
        // subscription started Jan 31 — February has no 31st, clamp to 28/29.
        let start = dt(2026, 1, 31, 0, 0);
        let now = dt(2026, 2, 15, 0, 0);
        let p = cycle(start, now, PeriodKind::Monthly);
        assert_eq!(p.start, dt(2026, 1, 31, 0, 0));
        // 2026 is not a leap year.
        assert_eq!(p.end, Some(dt(2026, 2, 28, 0, 0)));
    }

    #[test]
    fn monthly_end_of_month_clamp_crossing_into_31_day_month() {
        let start = dt(2026, 1, 31, 0, 0);
        let now = dt(2026, 2, 28, 0, 0);
        let p = cycle(start, now, PeriodKind::Monthly);
        assert_eq!(p.start, dt(2026, 1, 31, 0, 0));
        assert_eq!(p.end, Some(dt(2026, 2, 28, 0, 0)));

        let now2 = dt(2026, 3, 1, 0, 0);
        let p2 = cycle(start, now2, PeriodKind::Monthly);
        assert_eq!(p2.start, dt(2026, 2, 28, 0, 0));
        assert_eq!(p2.end, Some(dt(2026, 3, 31, 0, 0)));
    }

    #[test]
    fn forever_uses_subscription_start_and_has_no_end() {
        let start = dt(2025, 6, 1, 0, 0);
        let now = dt(2026, 3, 15, 0, 0);
        let p = cycle(start, now, PeriodKind::Forever);
        assert_eq!(p.start, start);
        assert_eq!(p.end, None);
        assert_eq!(p.key(), "forever");
    }

    #[test]
    fn period_contains_respects_bounds() {
        let p = Period {
            start: dt(2026, 3, 1, 0, 0),
            end: Some(dt(2026, 4, 1, 0, 0)),
            kind: PeriodKind::Monthly,
        };
        assert!(p.contains(dt(2026, 3, 1, 0, 0)));
        assert!(p.contains(dt(2026, 3, 31, 23, 59)));
        assert!(!p.contains(dt(2026, 4, 1, 0, 0)));
        assert!(!p.contains(dt(2026, 2, 28, 23, 59)));
    }
}
