//! Cron-style timing for schedules.
//!
//! A schedule fires at a fixed `HH:mm` (UTC) every day, on one weekday, or
//! on one day of the month. Months without that day are skipped, as cron
//! does.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use std::fmt;

use crate::metadata::{BackupSchedule, Frequency};
use crate::{BackstopError, Result};

/// Period on which a schedule repeats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Daily,
    /// 0 = Sunday ... 6 = Saturday
    Weekly(u8),
    /// 1..=31
    Monthly(u8),
}

/// Validated timing of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSpec {
    pub time: NaiveTime,
    pub cadence: Cadence,
}

impl CronSpec {
    pub fn new(
        frequency: Frequency,
        time: &str,
        day_of_week: Option<u8>,
        day_of_month: Option<u8>,
    ) -> Result<Self> {
        let time = parse_time(time)?;
        let cadence = match frequency {
            Frequency::Daily => Cadence::Daily,
            Frequency::Weekly => match day_of_week {
                Some(day) if day <= 6 => Cadence::Weekly(day),
                Some(day) => {
                    return Err(BackstopError::validation(format!(
                        "dayOfWeek must be 0-6, got {day}"
                    )))
                }
                None => {
                    return Err(BackstopError::validation(
                        "dayOfWeek is required for WEEKLY schedules",
                    ))
                }
            },
            Frequency::Monthly => match day_of_month {
                Some(day) if (1..=31).contains(&day) => Cadence::Monthly(day),
                Some(day) => {
                    return Err(BackstopError::validation(format!(
                        "dayOfMonth must be 1-31, got {day}"
                    )))
                }
                None => {
                    return Err(BackstopError::validation(
                        "dayOfMonth is required for MONTHLY schedules",
                    ))
                }
            },
        };
        Ok(Self { time, cadence })
    }

    pub fn from_schedule(schedule: &BackupSchedule) -> Result<Self> {
        Self::new(
            schedule.frequency,
            &schedule.time,
            schedule.day_of_week,
            schedule.day_of_month,
        )
    }

    /// Five-field cron expression, e.g. `30 2 * * 3`
    pub fn expression(&self) -> String {
        let (minute, hour) = (self.time.minute(), self.time.hour());
        match self.cadence {
            Cadence::Daily => format!("{minute} {hour} * * *"),
            Cadence::Weekly(day) => format!("{minute} {hour} * * {day}"),
            Cadence::Monthly(day) => format!("{minute} {hour} {day} * *"),
        }
    }

    /// First firing strictly after `now`
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive();
        match self.cadence {
            Cadence::Daily => {
                let candidate = self.at(today);
                if candidate > now {
                    candidate
                } else {
                    self.at(today + Duration::days(1))
                }
            }
            Cadence::Weekly(day) => {
                let current = today.weekday().num_days_from_sunday() as i64;
                let ahead = (i64::from(day) - current).rem_euclid(7);
                let candidate = self.at(today + Duration::days(ahead));
                if candidate > now {
                    candidate
                } else {
                    self.at(today + Duration::days(ahead + 7))
                }
            }
            Cadence::Monthly(day) => {
                let (mut year, mut month) = (today.year(), today.month());
                // Every day 1..=31 occurs at least once in any 12 months
                for _ in 0..=12 {
                    if let Some(date) = NaiveDate::from_ymd_opt(year, month, u32::from(day)) {
                        let candidate = self.at(date);
                        if candidate > now {
                            return candidate;
                        }
                    }
                    (year, month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                }
                // Unreachable for validated days; fall back to a month out
                now + Duration::days(31)
            }
        }
    }

    fn at(&self, date: NaiveDate) -> DateTime<Utc> {
        Utc.from_utc_datetime(&date.and_time(self.time))
    }
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

/// Parse `HH:mm` within 00:00-23:59
pub fn parse_time(value: &str) -> Result<NaiveTime> {
    let invalid = || BackstopError::validation(format!("time must be HH:mm, got '{value}'"));
    let (hour, minute) = value.trim().split_once(':').ok_or_else(invalid)?;
    if hour.len() != 2 || minute.len() != 2 {
        return Err(invalid());
    }
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Next run of `schedule` strictly after `now`
pub fn calculate_next_run(schedule: &BackupSchedule, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    Ok(CronSpec::from_schedule(schedule)?.next_after(now))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("02:00").unwrap(), NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert_eq!(parse_time("23:59").unwrap(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        for bad in ["24:00", "2:00", "12:60", "noon", "12-30", ""] {
            assert!(parse_time(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_cadence_validation() {
        assert!(CronSpec::new(Frequency::Weekly, "02:00", None, None).is_err());
        assert!(CronSpec::new(Frequency::Weekly, "02:00", Some(7), None).is_err());
        assert!(CronSpec::new(Frequency::Monthly, "02:00", None, Some(0)).is_err());
        assert!(CronSpec::new(Frequency::Monthly, "02:00", None, Some(32)).is_err());
        assert!(CronSpec::new(Frequency::Daily, "02:00", None, None).is_ok());
    }

    #[test]
    fn test_expressions() {
        let daily = CronSpec::new(Frequency::Daily, "02:30", None, None).unwrap();
        assert_eq!(daily.expression(), "30 2 * * *");
        let weekly = CronSpec::new(Frequency::Weekly, "14:05", Some(3), None).unwrap();
        assert_eq!(weekly.expression(), "5 14 * * 3");
        let monthly = CronSpec::new(Frequency::Monthly, "00:00", None, Some(15)).unwrap();
        assert_eq!(monthly.expression(), "0 0 15 * *");
    }

    #[test]
    fn test_daily_rolls_to_tomorrow_once_passed() {
        let spec = CronSpec::new(Frequency::Daily, "02:00", None, None).unwrap();
        assert_eq!(spec.next_after(at(2024, 3, 5, 1, 0)), at(2024, 3, 5, 2, 0));
        assert_eq!(spec.next_after(at(2024, 3, 5, 2, 0)), at(2024, 3, 6, 2, 0));
        assert_eq!(spec.next_after(at(2024, 12, 31, 3, 0)), at(2025, 1, 1, 2, 0));
    }

    #[test]
    fn test_weekly_same_day_after_time_goes_to_next_week() {
        // 2024-03-06 is a Wednesday
        let spec = CronSpec::new(Frequency::Weekly, "02:00", Some(3), None).unwrap();
        assert_eq!(spec.next_after(at(2024, 3, 6, 3, 0)), at(2024, 3, 13, 2, 0));
        assert_eq!(spec.next_after(at(2024, 3, 6, 1, 0)), at(2024, 3, 6, 2, 0));
        // From Saturday to the following Wednesday
        assert_eq!(spec.next_after(at(2024, 3, 9, 12, 0)), at(2024, 3, 13, 2, 0));
    }

    #[test]
    fn test_monthly_skips_short_months() {
        let spec = CronSpec::new(Frequency::Monthly, "04:00", None, Some(31)).unwrap();
        assert_eq!(spec.next_after(at(2024, 1, 31, 5, 0)), at(2024, 3, 31, 4, 0));
        let mid = CronSpec::new(Frequency::Monthly, "04:00", None, Some(15)).unwrap();
        assert_eq!(mid.next_after(at(2024, 12, 20, 0, 0)), at(2025, 1, 15, 4, 0));
    }

    #[test]
    fn test_next_run_is_always_in_the_future() {
        let specs = [
            CronSpec::new(Frequency::Daily, "00:00", None, None).unwrap(),
            CronSpec::new(Frequency::Weekly, "23:59", Some(0), None).unwrap(),
            CronSpec::new(Frequency::Monthly, "12:00", None, Some(29)).unwrap(),
        ];
        let start = at(2023, 1, 1, 0, 0);
        for hours in (0..24 * 400).step_by(7) {
            let now = start + Duration::hours(hours);
            for spec in &specs {
                assert!(spec.next_after(now) > now);
            }
        }
    }
}
