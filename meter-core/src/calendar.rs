//! Business-calendar arithmetic. Hour buckets are UTC; days and months are
//! evaluated in the business timezone.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Start of the UTC hour containing `ts`.
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let truncated = secs - secs.rem_euclid(3600);
    DateTime::from_timestamp(truncated, 0).unwrap_or(ts)
}

/// First hour bucket starting at or after `ts`.
///
/// A bucket that straddles a local midnight (offsets that are not whole hours)
/// belongs to the day it starts in; daily rollups and the recent usage scan
/// both split days with this rule.
pub fn hour_ceil(ts: DateTime<Utc>) -> DateTime<Utc> {
    let bucket = hour_bucket(ts);
    if bucket < ts {
        bucket + Duration::hours(1)
    } else {
        bucket
    }
}

pub fn local_date(tz: Tz, ts: DateTime<Utc>) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// The instant `date` begins in `tz`.
///
/// Days that skip midnight for a DST change begin at the first valid local time.
pub fn start_of_day(tz: Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    for offset_minutes in [0i64, 30, 60, 90, 120] {
        let local = midnight + Duration::minutes(offset_minutes);
        match tz.from_local_datetime(&local) {
            LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            LocalResult::None => continue,
        }
    }
    midnight.and_utc()
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month before the one containing `date`.
pub fn previous_month_start(date: NaiveDate) -> NaiveDate {
    let first = month_start(date);
    first
        .pred_opt()
        .map(month_start)
        .unwrap_or(first)
}

/// Exclusive day bound covering `ts`: the local date of `ts`, plus one unless
/// `ts` is exactly the start of that day.
pub fn day_ceil(tz: Tz, ts: DateTime<Utc>) -> NaiveDate {
    let date = local_date(tz, ts);
    if start_of_day(tz, date) == ts {
        date
    } else {
        date.succ_opt().unwrap_or(date)
    }
}

pub fn is_hour_start(ts: DateTime<Utc>) -> bool {
    ts.minute() == 0 && ts.second() == 0 && ts.nanosecond() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hour_bucket() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 20, 12, 34, 56).unwrap();
        let bucket = hour_bucket(ts);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2025, 1, 20, 12, 0, 0).unwrap());
        assert!(is_hour_start(bucket));
    }

    #[test]
    fn test_hour_ceil_at_half_hour_midnight() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        let start = start_of_day(tz, NaiveDate::from_ymd_opt(2025, 1, 19).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 1, 18, 18, 30, 0).unwrap());
        assert_eq!(hour_ceil(start), Utc.with_ymd_and_hms(2025, 1, 18, 19, 0, 0).unwrap());
        let aligned = Utc.with_ymd_and_hms(2025, 1, 18, 19, 0, 0).unwrap();
        assert_eq!(hour_ceil(aligned), aligned);
    }

    #[test]
    fn test_start_of_day_in_business_timezone() {
        let tz: Tz = "Asia/Shanghai".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 1, 20).unwrap();
        assert_eq!(
            start_of_day(tz, date),
            Utc.with_ymd_and_hms(2025, 1, 19, 16, 0, 0).unwrap()
        );
        // 2025-01-19T17:00Z is already the 20th in Shanghai
        let ts = Utc.with_ymd_and_hms(2025, 1, 19, 17, 0, 0).unwrap();
        assert_eq!(local_date(tz, ts), date);
        assert_eq!(day_ceil(tz, start_of_day(tz, date)), date);
        assert_eq!(day_ceil(tz, ts), date.succ_opt().unwrap());
    }

    #[test]
    fn test_dst_gap_at_midnight() {
        // Santiago skips 00:00-01:00 when DST starts
        let tz: Tz = "America/Santiago".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 9, 8).unwrap();
        let start = start_of_day(tz, date);
        assert_eq!(local_date(tz, start), date);
    }

    #[test]
    fn test_previous_month_start() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(
            previous_month_start(date),
            NaiveDate::from_ymd_opt(2024, 12, 1).unwrap()
        );
    }
}
