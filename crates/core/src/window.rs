//! Task windows: the interval of input data a run reads.
//!
//! Two window flavours exist. [`WindowV1`] is the legacy format where months
//! are approximated as 30 days except when truncating to a month.
//! [`WindowV2`] accepts calendar months (`"<N>M[<rest>]"`) and aligns weeks to
//! Monday. Both evaluate a scheduled instant into a [`TimeRange`].

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveTime, Timelike};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::duration::parse_duration;
use crate::error::{ModelError, Result};
use crate::Time;

const V1_TRUNCATE_OPTIONS: [&str; 5] = ["h", "d", "w", "m", "M"];
const V2_TRUNCATE_OPTIONS: [&str; 4] = ["h", "d", "w", "M"];
const DAYS_PER_V1_MONTH: i64 = 30;

/// Half-open interval `[start, end)` covered by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start
    pub start: Time,
    /// Exclusive end
    pub end: Time,
}

impl TimeRange {
    /// Length of the interval.
    pub fn size(&self) -> Duration {
        self.end - self.start
    }
}

/// A task window in either format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WindowSpec", into = "WindowSpec")]
pub enum Window {
    /// Legacy window
    V1(WindowV1),
    /// Calendar-aware window
    V2(WindowV2),
}

impl Window {
    /// Version tag of this window.
    pub fn version(&self) -> u8 {
        match self {
            Window::V1(_) => 1,
            Window::V2(_) => 2,
        }
    }

    /// Validate size, offset and truncation unit.
    pub fn validate(&self) -> Result<()> {
        match self {
            Window::V1(w) => w.validate(),
            Window::V2(w) => w.validate(),
        }
    }

    /// Evaluate the window for a scheduled instant.
    pub fn get_time_range(&self, schedule_time: Time) -> Result<TimeRange> {
        match self {
            Window::V1(w) => w.get_time_range(schedule_time),
            Window::V2(w) => w.get_time_range(schedule_time),
        }
    }

    /// Configured size string.
    pub fn size(&self) -> &str {
        match self {
            Window::V1(w) => &w.size,
            Window::V2(w) => &w.size,
        }
    }

    /// Configured offset string.
    pub fn offset(&self) -> &str {
        match self {
            Window::V1(w) => &w.offset,
            Window::V2(w) => &w.offset,
        }
    }

    /// Configured truncation unit.
    pub fn truncate_to(&self) -> &str {
        match self {
            Window::V1(w) => &w.truncate_to,
            Window::V2(w) => &w.truncate_to,
        }
    }
}

impl Default for Window {
    fn default() -> Self {
        Window::V2(WindowV2 {
            size: "24h".to_string(),
            offset: String::new(),
            truncate_to: "d".to_string(),
        })
    }
}

/// Serialized shape of a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WindowSpec {
    #[serde(default = "default_window_version")]
    version: u8,
    #[serde(default)]
    size: String,
    #[serde(default)]
    offset: String,
    #[serde(default)]
    truncate_to: String,
}

fn default_window_version() -> u8 {
    2
}

impl TryFrom<WindowSpec> for Window {
    type Error = String;

    fn try_from(spec: WindowSpec) -> std::result::Result<Self, Self::Error> {
        match spec.version {
            1 => Ok(Window::V1(WindowV1 {
                size: spec.size,
                offset: spec.offset,
                truncate_to: spec.truncate_to,
            })),
            2 => Ok(Window::V2(WindowV2 {
                size: spec.size,
                offset: spec.offset,
                truncate_to: spec.truncate_to,
            })),
            other => Err(format!("unsupported window version {other}")),
        }
    }
}

impl From<Window> for WindowSpec {
    fn from(window: Window) -> Self {
        let version = window.version();
        let (size, offset, truncate_to) = match window {
            Window::V1(w) => (w.size, w.offset, w.truncate_to),
            Window::V2(w) => (w.size, w.offset, w.truncate_to),
        };
        Self {
            version,
            size,
            offset,
            truncate_to,
        }
    }
}

/// Legacy window.
///
/// An empty truncation unit means `d`, an empty size means `24h` and an empty
/// offset means no shift. Month tokens (`"2M"`) count as 30 days each, except
/// when truncating to a month, where size and offset are whole months.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowV1 {
    /// Window size
    pub size: String,
    /// Shift applied to the window end
    pub offset: String,
    /// Truncation unit
    pub truncate_to: String,
}

impl WindowV1 {
    /// Validate the window.
    pub fn validate(&self) -> Result<()> {
        let unit = self.truncate_unit();
        if !V1_TRUNCATE_OPTIONS.contains(&unit) {
            return Err(ModelError::InvalidWindow(format!(
                "invalid truncate_to \"{unit}\", provide one of: {V1_TRUNCATE_OPTIONS:?}"
            )));
        }
        if self.size_duration()? < Duration::zero() {
            return Err(ModelError::InvalidWindow(format!(
                "size cannot be negative: {}",
                self.size
            )));
        }
        self.offset_duration()?;
        Ok(())
    }

    /// Evaluate the window for a scheduled instant.
    pub fn get_time_range(&self, schedule_time: Time) -> Result<TimeRange> {
        self.validate()?;
        let size = self.size_duration()?;
        let offset = self.offset_duration()?;

        match self.truncate_unit() {
            "m" | "M" => {
                let next_month = add_months(first_of_month(schedule_time)?, 1)?;
                let (offset_months, offset_rest) = split_v1_months(offset)?;
                let end = shift(add_months(next_month, offset_months)?, offset_rest)?;
                let (size_months, size_rest) = split_v1_months(size)?;
                let start = shift(add_months(end, -size_months)?, -size_rest)?;
                Ok(TimeRange { start, end })
            }
            "h" => {
                let end = shift(truncate_to_hour(schedule_time), offset)?;
                Ok(TimeRange { start: shift(end, -size)?, end })
            }
            "w" => {
                // next Sunday boundary; a Sunday rolls over to the following one
                let days = 7 - i64::from(schedule_time.weekday().num_days_from_sunday());
                let end = shift(truncate_to_day(schedule_time + Duration::days(days)), offset)?;
                Ok(TimeRange { start: shift(end, -size)?, end })
            }
            _ => {
                let end = shift(truncate_to_day(schedule_time), offset)?;
                Ok(TimeRange { start: shift(end, -size)?, end })
            }
        }
    }

    fn truncate_unit(&self) -> &str {
        if self.truncate_to.is_empty() {
            "d"
        } else {
            &self.truncate_to
        }
    }

    fn size_duration(&self) -> Result<Duration> {
        if self.size.is_empty() {
            return Ok(Duration::hours(24));
        }
        parse_v1_duration(&self.size)
    }

    fn offset_duration(&self) -> Result<Duration> {
        if self.offset.is_empty() {
            return Ok(Duration::zero());
        }
        parse_v1_duration(&self.offset)
    }
}

static V1_MONTH_TOKEN: OnceLock<Regex> = OnceLock::new();

fn v1_month_token() -> Result<&'static Regex> {
    if let Some(re) = V1_MONTH_TOKEN.get() {
        return Ok(re);
    }
    let re = Regex::new(r"(\+|-)?([0-9]+)(M)").map_err(|e| ModelError::InvalidWindow(e.to_string()))?;
    Ok(V1_MONTH_TOKEN.get_or_init(|| re))
}

/// Parse a legacy duration where `<N>M` means N times 30 days.
fn parse_v1_duration(input: &str) -> Result<Duration> {
    let invalid = || ModelError::InvalidWindow(format!("failed to parse task window duration \"{input}\""));
    let month_token = v1_month_token()?;

    let mut total = Duration::zero();
    let mut rest = input.to_string();
    if let Some(caps) = month_token.captures(input) {
        let months: i64 = caps[2].parse().map_err(|_| invalid())?;
        let days = months.checked_mul(DAYS_PER_V1_MONTH).ok_or_else(invalid)?;
        let span = Duration::try_days(days).ok_or_else(invalid)?;
        total = match caps.get(1).map(|m| m.as_str()) {
            Some("-") => -span,
            _ => span,
        };
        rest = month_token.replace(input, "").into_owned();
    }
    if !rest.is_empty() {
        let parsed = parse_duration(&rest).map_err(|_| invalid())?;
        total = total.checked_add(&parsed).ok_or_else(invalid)?;
    }
    Ok(total)
}

fn split_v1_months(duration: Duration) -> Result<(i32, Duration)> {
    let months = duration.num_days() / DAYS_PER_V1_MONTH;
    let whole = Duration::try_days(months * DAYS_PER_V1_MONTH)
        .ok_or_else(|| ModelError::InvalidWindow(format!("window of {} days is out of range", duration.num_days())))?;
    let months = i32::try_from(months)
        .map_err(|_| ModelError::InvalidWindow(format!("window of {months} months is out of range")))?;
    Ok((months, duration - whole))
}

/// Calendar-aware window.
///
/// Sizes and offsets may be written as `"<N>M[<rest>]"`: N calendar months
/// plus an optional Go duration that shares the sign of N. Weeks start on
/// Monday, months on the first day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowV2 {
    /// Window size
    pub size: String,
    /// Shift applied to the window end
    pub offset: String,
    /// Truncation unit
    pub truncate_to: String,
}

impl WindowV2 {
    /// Validate the window.
    pub fn validate(&self) -> Result<()> {
        self.validate_truncate_to()
            .map_err(|e| ModelError::InvalidWindow(format!("error validating truncate_to: {e}")))?;
        self.validate_offset()
            .map_err(|e| ModelError::InvalidWindow(format!("error validating offset: {e}")))?;
        self.validate_size()
            .map_err(|e| ModelError::InvalidWindow(format!("error validating size: {e}")))?;
        Ok(())
    }

    /// Evaluate the window for a scheduled instant.
    pub fn get_time_range(&self, schedule_time: Time) -> Result<TimeRange> {
        self.validate()?;
        let truncated = self.truncate(schedule_time)?;

        let end = if self.offset.is_empty() {
            truncated
        } else {
            let (months, rest) = months_and_duration(&self.offset)?;
            add_months(shift(truncated, rest)?, months)?
        };

        let start = if self.size.is_empty() {
            end
        } else {
            let (months, rest) = months_and_duration(&self.size)?;
            add_months(shift(end, -rest)?, -months)?
        };

        Ok(TimeRange { start, end })
    }

    fn validate_truncate_to(&self) -> std::result::Result<(), String> {
        if self.truncate_to.is_empty() || V2_TRUNCATE_OPTIONS.contains(&self.truncate_to.as_str()) {
            return Ok(());
        }
        Err(format!(
            "invalid option provided, provide one of: {V2_TRUNCATE_OPTIONS:?}"
        ))
    }

    fn validate_offset(&self) -> std::result::Result<(), String> {
        if self.offset.is_empty() {
            return Ok(());
        }
        months_and_duration(&self.offset).map(|_| ()).map_err(|e| e.to_string())
    }

    fn validate_size(&self) -> std::result::Result<(), String> {
        if self.size.is_empty() {
            return Ok(());
        }
        if self.size.starts_with('-') {
            return Err("size cannot be negative".to_string());
        }
        let (months, rest) = months_and_duration(&self.size).map_err(|e| e.to_string())?;
        if months < 0 || rest < Duration::zero() {
            return Err("size cannot be negative".to_string());
        }
        Ok(())
    }

    fn truncate(&self, schedule_time: Time) -> Result<Time> {
        Ok(match self.truncate_to.as_str() {
            "h" => truncate_to_hour(schedule_time),
            "d" => truncate_to_day(schedule_time),
            "w" => {
                let since_monday = i64::from(schedule_time.weekday().num_days_from_monday());
                truncate_to_day(schedule_time) - Duration::days(since_monday)
            }
            "M" => first_of_month(schedule_time)?,
            _ => schedule_time,
        })
    }
}

/// Split `"<N>M[<rest>]"` into N and the remaining duration.
fn months_and_duration(input: &str) -> Result<(i32, Duration)> {
    let Some((months, rest)) = input.split_once('M') else {
        return Ok((0, parse_duration(input)?));
    };
    let months: i32 = months
        .parse()
        .map_err(|_| ModelError::InvalidDuration(input.to_string()))?;
    if rest.is_empty() {
        return Ok((months, Duration::zero()));
    }
    let rest = parse_duration(rest)?;
    if months < 0 {
        return Ok((months, -rest));
    }
    Ok((months, rest))
}

fn truncate_to_hour(t: Time) -> Time {
    t.date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
        + Duration::hours(i64::from(t.hour()))
}

fn truncate_to_day(t: Time) -> Time {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

fn first_of_month(t: Time) -> Result<Time> {
    NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
        .ok_or_else(|| ModelError::InvalidWindow(format!("no first day of month for {t}")))
}

fn shift(t: Time, by: Duration) -> Result<Time> {
    t.checked_add_signed(by)
        .ok_or_else(|| ModelError::InvalidWindow(format!("window bound out of range at {t}")))
}

/// Add (or subtract, when negative) calendar months, clamping to month end.
pub(crate) fn add_months(t: Time, months: i32) -> Result<Time> {
    let shifted = if months >= 0 {
        t.checked_add_months(Months::new(months.unsigned_abs()))
    } else {
        t.checked_sub_months(Months::new(months.unsigned_abs()))
    };
    shifted.ok_or_else(|| ModelError::InvalidWindow(format!("month arithmetic overflow at {t}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(y: i32, m: u32, d: u32, h: u32) -> Time {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn v1(size: &str, offset: &str, truncate_to: &str) -> Window {
        Window::V1(WindowV1 {
            size: size.into(),
            offset: offset.into(),
            truncate_to: truncate_to.into(),
        })
    }

    fn v2(size: &str, offset: &str, truncate_to: &str) -> Window {
        Window::V2(WindowV2 {
            size: size.into(),
            offset: offset.into(),
            truncate_to: truncate_to.into(),
        })
    }

    #[test]
    fn test_v1_daily_window_with_offset() {
        let range = v1("48h", "24h", "d").get_time_range(at(2022, 7, 5, 2)).unwrap();
        assert_eq!(range.start, at(2022, 7, 4, 0));
        assert_eq!(range.end, at(2022, 7, 6, 0));
    }

    #[test]
    fn test_v1_defaults_to_one_day_truncated_to_day() {
        let range = v1("", "", "").get_time_range(at(2022, 7, 5, 2)).unwrap();
        assert_eq!(range.start, at(2022, 7, 4, 0));
        assert_eq!(range.end, at(2022, 7, 5, 0));
    }

    #[test]
    fn test_v1_hourly_window() {
        let range = v1("2h", "", "h")
            .get_time_range(Utc.with_ymd_and_hms(2022, 7, 5, 10, 45, 0).unwrap())
            .unwrap();
        assert_eq!(range.start, at(2022, 7, 5, 8));
        assert_eq!(range.end, at(2022, 7, 5, 10));
    }

    #[test]
    fn test_v1_week_aligns_to_next_sunday() {
        // 2022-07-06 is a Wednesday
        let range = v1("168h", "", "w").get_time_range(at(2022, 7, 6, 2)).unwrap();
        assert_eq!(range.end, at(2022, 7, 10, 0));
        assert_eq!(range.start, at(2022, 7, 3, 0));
    }

    #[test]
    fn test_v1_month_tokens_are_thirty_days_when_not_monthly() {
        let range = v1("2M", "", "d").get_time_range(at(2022, 7, 5, 2)).unwrap();
        assert_eq!(range.size(), Duration::days(60));
    }

    #[test]
    fn test_v1_monthly_window_uses_whole_months() {
        let range = v1("1M", "", "M").get_time_range(at(2022, 7, 15, 2)).unwrap();
        assert_eq!(range.start, at(2022, 7, 1, 0));
        assert_eq!(range.end, at(2022, 8, 1, 0));

        let range = v1("2M", "-1M", "m").get_time_range(at(2022, 7, 15, 2)).unwrap();
        assert_eq!(range.end, at(2022, 7, 1, 0));
        assert_eq!(range.start, at(2022, 5, 1, 0));
    }

    #[test]
    fn test_v1_rejects_unknown_truncate_and_negative_size() {
        assert!(v1("24h", "", "y").validate().is_err());
        assert!(v1("-24h", "", "d").validate().is_err());
        assert!(v1("abc", "", "d").validate().is_err());
    }

    #[test]
    fn test_v1_out_of_range_sizes_are_errors() {
        let err = v1("9999999999999M", "", "d").validate().unwrap_err();
        assert!(err.to_string().contains("9999999999999M"));
        assert!(v1("99999999999999999999M", "", "d").validate().is_err());

        let window = v1("9999999M", "", "M");
        assert!(window.validate().is_ok());
        assert!(window.get_time_range(at(2022, 7, 15, 2)).is_err());
        assert!(v1("9999999M", "", "d").get_time_range(at(2022, 7, 15, 2)).is_err());
    }

    #[test]
    fn test_v2_week_aligns_to_monday() {
        let range = v2("168h", "", "w").get_time_range(at(2022, 7, 6, 2)).unwrap();
        assert_eq!(range.end, at(2022, 7, 4, 0));
        assert_eq!(range.start, at(2022, 6, 27, 0));
    }

    #[test]
    fn test_v2_calendar_months() {
        let range = v2("1M", "", "M").get_time_range(at(2022, 3, 5, 2)).unwrap();
        assert_eq!(range.start, at(2022, 2, 1, 0));
        assert_eq!(range.end, at(2022, 3, 1, 0));
    }

    #[test]
    fn test_v2_negative_offset_shares_sign() {
        let range = v2("24h", "-1M1h", "d").get_time_range(at(2022, 3, 5, 2)).unwrap();
        assert_eq!(range.end, at(2022, 2, 4, 23));
        assert_eq!(range.start, at(2022, 2, 3, 23));
    }

    #[test]
    fn test_v2_without_truncation_keeps_schedule_time() {
        let t = Utc.with_ymd_and_hms(2022, 3, 5, 2, 30, 0).unwrap();
        let range = v2("1h", "", "").get_time_range(t).unwrap();
        assert_eq!(range.end, t);
        assert_eq!(range.start, t - Duration::hours(1));
    }

    #[test]
    fn test_v2_validation_messages() {
        let err = v2("-1h", "", "d").validate().unwrap_err();
        assert!(err.to_string().starts_with("error validating size"));

        let err = v2("1h", "xx", "d").validate().unwrap_err();
        assert!(err.to_string().starts_with("error validating offset"));

        let err = v2("1h", "", "m").validate().unwrap_err();
        assert!(err.to_string().starts_with("error validating truncate_to"));
    }

    #[test]
    fn test_start_never_after_end() {
        let windows = [
            v1("", "", ""),
            v1("1M", "1M", "M"),
            v1("0", "-24h", "w"),
            v2("", "", ""),
            v2("1M2h", "-1M", "M"),
            v2("72h", "48h", "w"),
        ];
        let mut t = at(2021, 12, 25, 0);
        for _ in 0..90 {
            for window in &windows {
                let range = window.get_time_range(t).unwrap();
                assert!(range.start <= range.end, "{window:?} at {t}");
            }
            t = t + Duration::hours(13);
        }
    }

    #[test]
    fn test_window_deserializes_with_version_tag() {
        let window: Window = serde_json::from_str(
            r#"{"version": 1, "size": "48h", "offset": "0", "truncate_to": "d"}"#,
        )
        .unwrap();
        assert_eq!(window.version(), 1);
        assert_eq!(window.size(), "48h");

        let window: Window = serde_json::from_str(r#"{"size": "1M", "truncate_to": "M"}"#).unwrap();
        assert_eq!(window.version(), 2);

        assert!(serde_json::from_str::<Window>(r#"{"version": 3}"#).is_err());
    }
}
