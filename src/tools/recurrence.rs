//! Computes `Schedule.next_fire_at` from a `Recurrence` and a base time.
//!
//! `next_fire_at` is computed deterministically from
//! `(recurrence, last_fire_at ?? created_at)`. All computation happens in
//! UTC - local time only matters at presentation, which lives in the CLI,
//! not here.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use crate::catalog::models::{IntervalKind, Recurrence};

pub fn compute_next_fire_at(recurrence: &Recurrence, base: DateTime<Utc>) -> DateTime<Utc> {
    let value = recurrence.value.max(1);
    match recurrence.kind {
        IntervalKind::Hourly => {
            let mut next = base
                .date_naive()
                .and_hms_opt(base.hour(), recurrence.anchor.minute.min(59), 0)
                .expect("valid time");
            let mut next = Utc.from_utc_datetime(&next);
            while next <= base {
                next += Duration::hours(value as i64);
            }
            next
        }
        IntervalKind::Daily => advance_to_anchor(base, Duration::days(value as i64), recurrence),
        IntervalKind::Weekly => advance_to_anchor(base, Duration::weeks(value as i64), recurrence),
        IntervalKind::Monthly => {
            let mut next = next_anchor_on_day(base, recurrence);
            while next <= base {
                next = add_months(next, value);
            }
            next
        }
    }
}

fn advance_to_anchor(base: DateTime<Utc>, step: Duration, recurrence: &Recurrence) -> DateTime<Utc> {
    let anchored_today = base
        .date_naive()
        .and_hms_opt(recurrence.anchor.hour.min(23), recurrence.anchor.minute.min(59), 0)
        .expect("valid time");
    let mut next = Utc.from_utc_datetime(&anchored_today);
    if next <= base {
        next += step;
    }
    next
}

fn next_anchor_on_day(base: DateTime<Utc>, recurrence: &Recurrence) -> DateTime<Utc> {
    let naive = base
        .date_naive()
        .and_hms_opt(recurrence.anchor.hour.min(23), recurrence.anchor.minute.min(59), 0)
        .expect("valid time");
    Utc.from_utc_datetime(&naive)
}

fn add_months(t: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let total_months = (t.year() as i32) * 12 + (t.month0() as i32) + months as i32;
    let year = total_months.div_euclid(12);
    let month0 = total_months.rem_euclid(12) as u32;
    let last_day = days_in_month(year, month0 + 1);
    let day = t.day().min(last_day);
    let naive = chrono::NaiveDate::from_ymd_opt(year, month0 + 1, day)
        .expect("valid date")
        .and_hms_opt(t.hour(), t.minute(), 0)
        .expect("valid time");
    Utc.from_utc_datetime(&naive)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    chrono::NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid date")
        .signed_duration_since(chrono::NaiveDate::from_ymd_opt(year, month, 1).expect("valid date"))
        .num_days() as u32
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::models::AnchorTime;

    fn recurrence(kind: IntervalKind, value: u32, hour: u32, minute: u32) -> Recurrence {
        Recurrence {
            kind,
            value,
            anchor: AnchorTime { hour, minute },
        }
    }

    #[test]
    fn daily_next_fire_is_strictly_future() {
        let base = Utc.with_ymd_and_hms(2026, 7, 30, 23, 0, 0).unwrap();
        let r = recurrence(IntervalKind::Daily, 1, 2, 0);
        let next = compute_next_fire_at(&r, base);
        assert!(next > base);
        assert_eq!(next.hour(), 2);
        assert_eq!(next.day(), 31);
    }

    #[test]
    fn monthly_clamps_short_months() {
        let base = Utc.with_ymd_and_hms(2026, 1, 31, 3, 0, 0).unwrap();
        let r = recurrence(IntervalKind::Monthly, 1, 3, 0);
        let next = compute_next_fire_at(&r, base);
        assert_eq!(next.month(), 2);
        assert_eq!(next.day(), 28);
    }

    #[test]
    fn hourly_advances_by_n_hours() {
        let base = Utc.with_ymd_and_hms(2026, 7, 30, 10, 15, 0).unwrap();
        let r = recurrence(IntervalKind::Hourly, 3, 0, 0);
        let next = compute_next_fire_at(&r, base);
        assert!(next > base);
        assert_eq!(next.minute(), 0);
    }
}
