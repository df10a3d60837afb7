//! Recurrence rules and next occurrence calculation.
//!
//! A [`RecurrenceRule`] is a pure value. It can be a fixed interval (with
//! optional wall-clock alignment), a cron expression in a timezone, or a
//! one-shot instant. [`RecurrenceRule::next_run`] never fails: exhausted or
//! unsatisfiable rules yield `None`. Malformed input is rejected when the
//! rule is built.
//!
//! Supported expression syntax:
//! - Standard 5-field cron: `minute hour day month weekday`
//! - Extended 6-field cron: `second minute hour day month weekday`
//! - Shortcuts: `@yearly`, `@monthly`, `@weekly`, `@daily`, `@hourly`
//! - Intervals: `@every 5m`, `@every 1h30m`
//! - One-shot: `@once 2024-06-01T09:00:00Z`

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::cron::{CronError, CronExpr};
use super::frequency::Frequency;

/// Errors that can occur when building a recurrence rule.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),

    /// Unknown `@` shortcut.
    #[error("unknown shortcut: {0}")]
    UnknownShortcut(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Invalid one-shot instant.
    #[error("invalid instant: {0}")]
    InvalidInstant(String),

    /// Invalid time of day.
    #[error("invalid time of day: {0}")]
    InvalidTime(String),
}

/// When a job should run.
#[derive(Debug, Clone, PartialEq)]
pub enum RecurrenceRule {
    /// Every `every`, optionally truncated to a multiple of `align` since the epoch.
    Interval {
        every: Duration,
        align: Option<Duration>,
    },
    /// Cron expression evaluated in `timezone`.
    Cron { expr: CronExpr, timezone: Tz },
    /// Exactly once, at `at`.
    Once { at: DateTime<Utc> },
}

impl RecurrenceRule {
    /// Parse an expression, evaluating cron rules in UTC.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        Self::parse_in(expression, "UTC")
    }

    /// Parse an expression with a timezone for cron rules.
    pub fn parse_in(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;

        let trimmed = expression.trim();
        if trimmed.starts_with('@') {
            return Self::parse_shortcut(trimmed, tz);
        }

        Ok(Self::Cron {
            expr: CronExpr::parse(trimmed)?,
            timezone: tz,
        })
    }

    fn parse_shortcut(expression: &str, tz: Tz) -> Result<Self, ScheduleError> {
        let lower = expression.to_lowercase();
        let cron = match lower.as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * SUN",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            s if s.starts_with("@every ") => {
                return Self::parse_every(&expression["@every ".len()..]);
            }
            s if s.starts_with("@once ") => {
                let raw = expression["@once ".len()..].trim();
                let at = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| ScheduleError::InvalidInstant(format!("{}: {}", raw, e)))?;
                return Ok(Self::once(at.with_timezone(&Utc)));
            }
            _ => return Err(ScheduleError::UnknownShortcut(expression.to_string())),
        };

        Ok(Self::Cron {
            expr: CronExpr::parse(cron)?,
            timezone: tz,
        })
    }

    /// `@every <dur>` with an optional trailing `align <dur>`.
    fn parse_every(rest: &str) -> Result<Self, ScheduleError> {
        let mut parts = rest.split_whitespace();
        let every = parts
            .next()
            .ok_or_else(|| ScheduleError::InvalidInterval(rest.to_string()))
            .and_then(parse_duration)?;

        let align = match (parts.next(), parts.next()) {
            (None, _) => None,
            (Some("align"), Some(raw)) => Some(parse_duration(raw)?),
            _ => return Err(ScheduleError::InvalidInterval(rest.to_string())),
        };

        if parts.next().is_some() {
            return Err(ScheduleError::InvalidInterval(rest.to_string()));
        }

        let rule = Self::Interval { every, align };
        rule.validate()?;
        Ok(rule)
    }

    /// Fixed interval without alignment.
    pub fn every(interval: Duration) -> Self {
        Self::Interval {
            every: interval,
            align: None,
        }
    }

    /// Fixed interval whose occurrences land on multiples of `align`.
    pub fn aligned(interval: Duration, align: Duration) -> Self {
        Self::Interval {
            every: interval,
            align: Some(align),
        }
    }

    /// Cron expression in UTC.
    pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
        Self::cron_in(expression, "UTC")
    }

    /// Cron expression in a named timezone.
    pub fn cron_in(expression: &str, timezone: &str) -> Result<Self, ScheduleError> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;
        Ok(Self::Cron {
            expr: CronExpr::parse(expression)?,
            timezone: tz,
        })
    }

    /// One-shot rule.
    pub fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    /// Start a cron rule from named frequencies, like
    /// `RecurrenceRule::frequency().weekdays().at("08:30")?.build()`.
    pub fn frequency() -> Frequency {
        Frequency::new()
    }

    /// Check values that the variant constructors cannot enforce.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if let Self::Interval { every, align } = self {
            if every.is_zero() {
                return Err(ScheduleError::InvalidInterval(
                    "interval must be positive".into(),
                ));
            }
            chrono::Duration::from_std(*every).map_err(|_| {
                ScheduleError::InvalidInterval(format!("interval {:?} is too large", every))
            })?;
            if let Some(align) = align {
                if align.as_millis() == 0 {
                    return Err(ScheduleError::InvalidInterval(
                        "alignment must be at least one millisecond".into(),
                    ));
                }
                if i64::try_from(align.as_millis()).is_err() {
                    return Err(ScheduleError::InvalidInterval(format!(
                        "alignment {:?} is too large",
                        align
                    )));
                }
            }
        }
        Ok(())
    }

    /// The next occurrence strictly after `after`, or `None` if there is none.
    pub fn next_run(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = match self {
            Self::Interval { every, align } => {
                let step = chrono::Duration::from_std(*every).ok()?;
                let candidate = after.checked_add_signed(step)?;
                match align {
                    None => candidate,
                    Some(align) => align_after(candidate, *align, after)?,
                }
            }
            Self::Cron { expr, timezone } => expr.next_after(after, timezone)?,
            Self::Once { at } => *at,
        };

        (next > after).then_some(next)
    }

    /// The next `n` occurrences after `after`.
    pub fn next_n_after(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut results = Vec::with_capacity(n);
        let mut current = after;
        while results.len() < n {
            match self.next_run(current) {
                Some(next) => {
                    results.push(next);
                    current = next;
                }
                None => break,
            }
        }
        results
    }

    /// Whether the rule can fire more than once.
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }
}

/// Truncate `candidate` to a multiple of `align`, bumping forward until it
/// is strictly after `after`.
fn align_after(
    candidate: DateTime<Utc>,
    align: Duration,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let align_ms = i64::try_from(align.as_millis()).ok().filter(|ms| *ms > 0)?;
    let ms = candidate.timestamp_millis();
    let mut aligned = DateTime::from_timestamp_millis(ms - ms.rem_euclid(align_ms))?;
    while aligned <= after {
        aligned = aligned.checked_add_signed(chrono::Duration::milliseconds(align_ms))?;
    }
    Some(aligned)
}

/// Parse a duration string like "5m", "1h", "1h30m", "30s".
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let mut total_secs: u64 = 0;
    let mut current_num = String::new();

    for c in s.trim().chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }

        let num: u64 = current_num.parse().map_err(|_| invalid())?;
        current_num.clear();

        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };
        total_secs = num
            .checked_mul(unit)
            .and_then(|secs| total_secs.checked_add(secs))
            .ok_or_else(invalid)?;
    }

    // Trailing digits without a unit.
    if !current_num.is_empty() || total_secs == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total_secs))
}

/// Render a whole-second duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    let mut secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    out
}

impl fmt::Display for RecurrenceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { every, align: None } => write!(f, "@every {}", format_duration(*every)),
            Self::Interval {
                every,
                align: Some(align),
            } => write!(
                f,
                "@every {} align {}",
                format_duration(*every),
                format_duration(*align)
            ),
            Self::Cron { expr, timezone } if *timezone == Tz::UTC => write!(f, "{}", expr),
            Self::Cron { expr, timezone } => write!(f, "{} ({})", expr, timezone),
            Self::Once { at } => write!(f, "@once {}", at.to_rfc3339()),
        }
    }
}
