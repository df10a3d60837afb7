//! Cron expression parsing and evaluation.
//!
//! An expression is parsed once into six bit sets (second, minute, hour,
//! day of month, month, day of week). Finding the next occurrence is a pure
//! walk over calendar fields that skips whole months, days, hours and minutes
//! at a time, so evaluation cost stays bounded and independent of how often
//! the expression fires.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, LocalResult, NaiveDate, NaiveDateTime,
    TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How many years ahead the evaluator searches before giving up.
///
/// Leap-day expressions restricted to a weekday can need up to 28 years.
const SEARCH_YEARS: i32 = 30;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Hour set of an expression that runs in every hour of the day.
const EVERY_HOUR: FieldSet = FieldSet((1 << 24) - 1);

/// Errors produced while parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// Wrong number of whitespace-separated fields.
    #[error("expected 5 or 6 fields, got {0}")]
    FieldCount(usize),

    /// A single field could not be parsed.
    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// Bit set of allowed values for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    /// Smallest allowed value that is `>= from`.
    fn next_from(self, from: u32) -> Option<u32> {
        if from >= 64 {
            return None;
        }
        let masked = self.0 & (u64::MAX << from);
        (masked != 0).then(|| masked.trailing_zeros())
    }
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_offset: u32,
    allows_any_marker: bool,
}

const SECONDS: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: &[],
    name_offset: 0,
    allows_any_marker: false,
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_offset: 0,
    allows_any_marker: false,
};
const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_offset: 0,
    allows_any_marker: false,
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    name_offset: 0,
    allows_any_marker: true,
};
const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    name_offset: 1,
    allows_any_marker: false,
};
// 7 is accepted as an alias for Sunday and folded into 0 after parsing.
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: DAY_NAMES,
    name_offset: 0,
    allows_any_marker: true,
};

impl FieldSpec {
    fn error(&self, value: &str, reason: impl Into<String>) -> CronError {
        CronError::InvalidField {
            field: self.name,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    fn value(&self, field: &str, token: &str) -> Result<u32, CronError> {
        let value = match token.parse::<u32>() {
            Ok(v) => v,
            Err(_) => self
                .names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(token))
                .map(|idx| idx as u32 + self.name_offset)
                .ok_or_else(|| self.error(field, format!("unrecognised value '{}'", token)))?,
        };
        if value < self.min || value > self.max {
            return Err(self.error(
                field,
                format!("{} is outside {}-{}", value, self.min, self.max),
            ));
        }
        Ok(value)
    }

    /// Parse one field. The flag is false when the field starts with `*` or
    /// `?`, which matters for the day-of-month / day-of-week OR rule.
    fn parse(&self, field: &str) -> Result<(FieldSet, bool), CronError> {
        let mut bits = 0u64;

        for item in field.split(',') {
            if item.is_empty() {
                return Err(self.error(field, "empty list item"));
            }

            let (range, step) = match item.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| self.error(field, format!("invalid step '{}'", step)))?;
                    if step == 0 {
                        return Err(self.error(field, "step must be positive"));
                    }
                    (range, Some(step))
                }
                None => (item, None),
            };

            let (lo, hi) = if range == "*" || range == "?" {
                if range == "?" && !self.allows_any_marker {
                    return Err(self.error(field, "'?' is only allowed in day fields"));
                }
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                (self.value(field, a)?, self.value(field, b)?)
            } else {
                let v = self.value(field, range)?;
                if step.is_some() { (v, self.max) } else { (v, v) }
            };

            if lo > hi {
                return Err(self.error(field, format!("range {}-{} is reversed", lo, hi)));
            }

            for v in (lo..=hi).step_by(step.unwrap_or(1) as usize) {
                bits |= 1u64 << v;
            }
        }

        let restricted = !(field.starts_with('*') || field.starts_with('?'));
        Ok((FieldSet(bits), restricted))
    }
}

/// A parsed cron expression.
///
/// Accepts the classic five fields (`minute hour day month weekday`) or six
/// fields with a leading seconds column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    /// Parse an expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (seconds, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(CronError::FieldCount(n)),
        };

        let (seconds, _) = SECONDS.parse(seconds)?;
        let (minutes, _) = MINUTES.parse(rest[0])?;
        let (hours, _) = HOURS.parse(rest[1])?;
        let (days_of_month, dom_restricted) = DAYS_OF_MONTH.parse(rest[2])?;
        let (months, _) = MONTHS.parse(rest[3])?;
        let (mut days_of_week, dow_restricted) = DAYS_OF_WEEK.parse(rest[4])?;

        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 & !(1u64 << 7)) | 1);
        }

        Ok(Self {
            source: fields.join(" "),
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted,
            dow_restricted,
        })
    }

    /// The normalised source text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Smallest instant strictly after `after` that matches, evaluated in `tz`.
    ///
    /// Returns `None` if nothing matches within the search horizon, which is
    /// how unsatisfiable expressions such as `0 0 30 2 *` are reported.
    ///
    /// When clocks fall back, expressions that run every hour also fire in
    /// the repeated hour. Expressions pinned to specific hours fire once.
    pub fn next_after(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        self.next_in_repeated_hour(after, tz)
            .or_else(|| self.walk_forward(after, tz))
    }

    /// Match within the rest of a fall-back overlap when `after` sits in its
    /// first pass.
    ///
    /// The second pass repeats wall-clock times the forward walk has already
    /// gone by, so the instants up to the second copy of `after` are scanned
    /// directly in UTC.
    fn next_in_repeated_hour(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        if self.hours != EVERY_HOUR {
            return None;
        }

        let local = after.with_timezone(tz).naive_local();
        let LocalResult::Ambiguous(earliest, latest) = tz.from_local_datetime(&local) else {
            return None;
        };
        if earliest.with_timezone(&Utc) != after {
            return None;
        }
        let latest = latest.with_timezone(&Utc);

        let mut candidate = after.with_nanosecond(0)? + ChronoDuration::seconds(1);
        while candidate <= latest {
            if self.matches(candidate.with_timezone(tz).naive_local()) {
                return Some(candidate);
            }
            candidate += ChronoDuration::seconds(1);
        }
        None
    }

    /// Walk calendar fields forward in local time from `after`.
    fn walk_forward(&self, after: DateTime<Utc>, tz: &Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(tz).naive_local();
        let mut t = local
            .with_nanosecond(0)?
            .checked_add_signed(ChronoDuration::seconds(1))?;
        let horizon = t.year() + SEARCH_YEARS;

        loop {
            if t.year() > horizon {
                return None;
            }

            if !self.months.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }

            if !self.day_matches(t.date()) {
                t = start_of_next_day(t)?;
                continue;
            }

            if !self.hours.contains(t.hour()) {
                t = match self.hours.next_from(t.hour() + 1) {
                    Some(h) => t.date().and_hms_opt(h, 0, 0)?,
                    None => start_of_next_day(t)?,
                };
                continue;
            }

            if !self.minutes.contains(t.minute()) {
                t = match self.minutes.next_from(t.minute() + 1) {
                    Some(m) => t.date().and_hms_opt(t.hour(), m, 0)?,
                    None => start_of_next_hour(t)?,
                };
                continue;
            }

            if !self.seconds.contains(t.second()) {
                t = match self.seconds.next_from(t.second() + 1) {
                    Some(s) => t.date().and_hms_opt(t.hour(), t.minute(), s)?,
                    None => start_of_next_minute(t)?,
                };
                continue;
            }

            let resolved = match tz.from_local_datetime(&t) {
                LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
                LocalResult::Ambiguous(earliest, latest) => {
                    let earliest = earliest.with_timezone(&Utc);
                    if earliest > after {
                        Some(earliest)
                    } else {
                        Some(latest.with_timezone(&Utc))
                    }
                }
                // Local time falls in a DST gap.
                LocalResult::None => None,
            };

            if let Some(candidate) = resolved {
                if candidate > after {
                    return Some(candidate);
                }
            }

            t = t.checked_add_signed(ChronoDuration::seconds(1))?;
        }
    }

    fn matches(&self, t: NaiveDateTime) -> bool {
        self.months.contains(t.month())
            && self.day_matches(t.date())
            && self.hours.contains(t.hour())
            && self.minutes.contains(t.minute())
            && self.seconds.contains(t.second())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn start_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn start_of_next_day(t: NaiveDateTime) -> Option<NaiveDateTime> {
    t.date().succ_opt()?.and_hms_opt(0, 0, 0)
}

fn start_of_next_hour(t: NaiveDateTime) -> Option<NaiveDateTime> {
    if t.hour() == 23 {
        start_of_next_day(t)
    } else {
        t.date().and_hms_opt(t.hour() + 1, 0, 0)
    }
}

fn start_of_next_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    if t.minute() == 59 {
        start_of_next_hour(t)
    } else {
        t.date().and_hms_opt(t.hour(), t.minute() + 1, 0)
    }
}
