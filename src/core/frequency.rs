//! Named frequencies that compose into cron rules.
//!
//! A [`Frequency`] starts as `* * * * *` and each method rewrites one or more
//! fields, so calls chain:
//!
//! ```rust
//! use tickwork::RecurrenceRule;
//!
//! let report = RecurrenceRule::frequency().weekdays().at("4:30 pm").unwrap();
//! assert_eq!(report.expression(), "30 16 * * 1-5");
//!
//! let sweep = RecurrenceRule::frequency().every_fifteen_minutes().between_hours(9, 17);
//! assert_eq!(sweep.expression(), "*/15 9-17 * * *");
//! assert!(sweep.build().is_ok());
//! ```
//!
//! Field values are checked when the rule is built.

use chrono::Weekday;
use std::fmt;

use super::schedule::{RecurrenceRule, ScheduleError};

/// Builder for a 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frequency {
    minute: String,
    hour: String,
    day: String,
    month: String,
    weekday: String,
}

impl Default for Frequency {
    fn default() -> Self {
        Self::new()
    }
}

impl Frequency {
    /// Every minute.
    pub fn new() -> Self {
        Self {
            minute: "*".into(),
            hour: "*".into(),
            day: "*".into(),
            month: "*".into(),
            weekday: "*".into(),
        }
    }

    pub fn expression(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.minute, self.hour, self.day, self.month, self.weekday
        )
    }

    /// Build a cron rule evaluated in UTC.
    pub fn build(&self) -> Result<RecurrenceRule, ScheduleError> {
        RecurrenceRule::cron(&self.expression())
    }

    /// Build a cron rule evaluated in `timezone`.
    pub fn build_in(&self, timezone: &str) -> Result<RecurrenceRule, ScheduleError> {
        RecurrenceRule::cron_in(&self.expression(), timezone)
    }

    /// Run at a time of day, written `16:08`, `4:08 pm` or `4pm`.
    pub fn at(mut self, time: &str) -> Result<Self, ScheduleError> {
        let (hour, minute) = parse_time(time)?;
        self.hour = hour.to_string();
        self.minute = minute.to_string();
        Ok(self)
    }

    pub fn every_minute(mut self) -> Self {
        self.minute = "*".into();
        self
    }

    /// Every `n` minutes, counted from the top of the hour.
    pub fn every_minutes(mut self, n: u32) -> Self {
        self.minute = format!("*/{}", n);
        self
    }

    pub fn every_five_minutes(self) -> Self {
        self.every_minutes(5)
    }

    pub fn every_fifteen_minutes(self) -> Self {
        self.every_minutes(15)
    }

    pub fn every_thirty_minutes(self) -> Self {
        self.every_minutes(30)
    }

    pub fn minutes(mut self, minutes: &[u32]) -> Self {
        self.minute = join(minutes);
        self
    }

    pub fn between_minutes(mut self, from: u32, to: u32) -> Self {
        self.minute = format!("{}-{}", from, to);
        self
    }

    /// At the top of every hour.
    pub fn hourly(self) -> Self {
        self.hourly_at(0)
    }

    /// At `minute` past every hour.
    pub fn hourly_at(mut self, minute: u32) -> Self {
        self.minute = minute.to_string();
        self.hour = "*".into();
        self
    }

    /// At the top of every `n`th hour.
    pub fn every_hours(mut self, n: u32) -> Self {
        self.minute = "0".into();
        self.hour = if n == 1 { "*".into() } else { format!("*/{}", n) };
        self
    }

    pub fn hours(mut self, hours: &[u32]) -> Self {
        self.hour = join(hours);
        self
    }

    pub fn between_hours(mut self, from: u32, to: u32) -> Self {
        self.hour = format!("{}-{}", from, to);
        self
    }

    /// At midnight every day.
    pub fn daily(mut self) -> Self {
        self.midnight();
        self
    }

    /// Restrict to days of the week.
    pub fn days(mut self, days: &[Weekday]) -> Self {
        let days: Vec<u32> = days.iter().map(|d| d.num_days_from_sunday()).collect();
        self.weekday = join(&days);
        self
    }

    pub fn sundays(self) -> Self {
        self.on(Weekday::Sun)
    }

    pub fn mondays(self) -> Self {
        self.on(Weekday::Mon)
    }

    pub fn tuesdays(self) -> Self {
        self.on(Weekday::Tue)
    }

    pub fn wednesdays(self) -> Self {
        self.on(Weekday::Wed)
    }

    pub fn thursdays(self) -> Self {
        self.on(Weekday::Thu)
    }

    pub fn fridays(self) -> Self {
        self.on(Weekday::Fri)
    }

    pub fn saturdays(self) -> Self {
        self.on(Weekday::Sat)
    }

    /// At midnight Monday through Friday.
    pub fn weekdays(mut self) -> Self {
        self.midnight();
        self.weekday = "1-5".into();
        self
    }

    /// At midnight on Saturday and Sunday.
    pub fn weekends(mut self) -> Self {
        self.midnight();
        self.weekday = "0,6".into();
        self
    }

    /// At midnight on the first of the month.
    pub fn monthly(mut self) -> Self {
        self.midnight();
        self.day = "1".into();
        self
    }

    pub fn days_of_month(mut self, days: &[u32]) -> Self {
        self.day = join(days);
        self
    }

    pub fn months(mut self, months: &[u32]) -> Self {
        self.month = join(months);
        self
    }

    /// At midnight on January, April, July and October 1st.
    pub fn quarterly(mut self) -> Self {
        self.midnight();
        self.day = "1".into();
        self.month = "*/3".into();
        self
    }

    /// At midnight on January 1st.
    pub fn yearly(mut self) -> Self {
        self.midnight();
        self.day = "1".into();
        self.month = "1".into();
        self
    }

    /// At midnight on one day of the week.
    fn on(mut self, day: Weekday) -> Self {
        self.midnight();
        self.weekday = day.num_days_from_sunday().to_string();
        self
    }

    fn midnight(&mut self) {
        self.minute = "0".into();
        self.hour = "0".into();
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}

fn join(values: &[u32]) -> String {
    values
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse `HH:MM` (24-hour) or `H[:MM] am|pm` into hour and minute.
fn parse_time(time: &str) -> Result<(u32, u32), ScheduleError> {
    let invalid = || ScheduleError::InvalidTime(time.to_string());
    let lower = time.trim().to_ascii_lowercase();

    let (clock, pm) = if let Some(clock) = lower.strip_suffix("am") {
        (clock.trim_end(), Some(false))
    } else if let Some(clock) = lower.strip_suffix("pm") {
        (clock.trim_end(), Some(true))
    } else {
        (lower.as_str(), None)
    };

    let (hour, minute) = match clock.split_once(':') {
        Some((h, m)) if m.len() == 2 => (h, m),
        None if pm.is_some() => (clock, "00"),
        _ => return Err(invalid()),
    };
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    if minute > 59 {
        return Err(invalid());
    }

    let hour = match pm {
        None if hour < 24 => hour,
        Some(pm) if (1..=12).contains(&hour) => hour % 12 + if pm { 12 } else { 0 },
        _ => return Err(invalid()),
    };
    Ok((hour, minute))
}
