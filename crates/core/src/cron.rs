//! Cron schedules in the standard five-field format.
//!
//! Job intervals are written as `minute hour day-of-month month day-of-week`
//! or as one of the `@hourly`-style descriptors. The underlying `cron` crate
//! expects a leading seconds field and numbers weekdays from 1 (Sunday), so
//! expressions are normalised before parsing.

use std::str::FromStr;

use crate::error::{ModelError, Result};
use crate::Time;

/// A parsed cron schedule.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a five-field expression or descriptor.
    pub fn parse(expression: &str) -> Result<Self> {
        let normalised = normalise(expression)?;
        let schedule = cron::Schedule::from_str(&normalised).map_err(|e| ModelError::InvalidCron {
            expr: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    /// The expression as written by the user.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next(&self, after: Time) -> Result<Time> {
        self.schedule
            .after(&after)
            .next()
            .ok_or_else(|| ModelError::ScheduleExhausted(self.expression.clone()))
    }

    /// Fire times in `[start, end)`.
    pub fn fires_between(&self, start: Time, end: Time) -> Vec<Time> {
        let from = start - chrono::Duration::seconds(1);
        self.schedule
            .after(&from)
            .take_while(|run| *run < end)
            .collect()
    }
}

impl FromStr for CronSchedule {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn normalise(expression: &str) -> Result<String> {
    let trimmed = expression.trim();
    let invalid = |reason: &str| ModelError::InvalidCron {
        expr: expression.to_string(),
        reason: reason.to_string(),
    };

    if let Some(descriptor) = trimmed.strip_prefix('@') {
        return match descriptor {
            "yearly" | "annually" => Ok("@yearly".to_string()),
            "monthly" => Ok("@monthly".to_string()),
            "weekly" => Ok("@weekly".to_string()),
            "daily" | "midnight" => Ok("@daily".to_string()),
            "hourly" => Ok("@hourly".to_string()),
            _ => Err(invalid("unsupported descriptor")),
        };
    }

    let fields: Vec<&str> = trimmed.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid("expected exactly 5 fields"));
    }
    let weekday = shift_weekdays(fields[4]).ok_or_else(|| invalid("bad day-of-week field"))?;
    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], weekday
    ))
}

/// Map standard weekday numbers (0 or 7 = Sunday) onto the 1-based numbering.
fn shift_weekdays(field: &str) -> Option<String> {
    let shift = |token: &str| -> Option<String> {
        match token.parse::<u32>() {
            Ok(n) if n <= 7 => Some(((n % 7) + 1).to_string()),
            Ok(_) => None,
            Err(_) => Some(token.to_string()),
        }
    };

    let items = field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let range = match range.split_once('-') {
                // a range ending on Sunday (7) wraps past Saturday
                Some((lo, "7")) if step.is_none() => match shift(lo)?.as_str() {
                    "1" => "1-7".to_string(),
                    lo => format!("{lo}-7,1"),
                },
                Some((lo, hi)) => format!("{}-{}", shift(lo)?, shift(hi)?),
                None => shift(range)?,
            };
            Some(match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            })
        })
        .collect::<Option<Vec<_>>>()?;
    Some(items.join(","))
}
