//! Go-style duration strings (`"72h"`, `"1h30m"`, `"-15m"`, `"500ms"`).
//!
//! Windows and configuration files express lengths of time in this format.

use chrono::Duration;

use crate::error::{ModelError, Result};

const NANOS_PER_UNIT: &[(&str, i128)] = &[
    ("ns", 1),
    ("us", 1_000),
    ("µs", 1_000),
    ("μs", 1_000),
    ("ms", 1_000_000),
    ("s", 1_000_000_000),
    ("m", 60 * 1_000_000_000),
    ("h", 3_600 * 1_000_000_000),
];

/// Parse a Go-style duration string.
///
/// Accepts an optional sign followed by one or more `<number><unit>` pairs,
/// where the number may carry a fraction. A bare `"0"` is also accepted.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || ModelError::InvalidDuration(input.to_string());

    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Ok(Duration::zero());
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total: i128 = 0;
    while !rest.is_empty() {
        let int_len = rest.bytes().take_while(u8::is_ascii_digit).count();
        let int_part = &rest[..int_len];
        rest = &rest[int_len..];

        let mut frac_part = "";
        if let Some(after_dot) = rest.strip_prefix('.') {
            let frac_len = after_dot.bytes().take_while(u8::is_ascii_digit).count();
            frac_part = &after_dot[..frac_len];
            rest = &after_dot[frac_len..];
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let unit_len = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let scale = NANOS_PER_UNIT
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, nanos)| *nanos)
            .ok_or_else(invalid)?;

        let whole: i128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        total = total
            .checked_add(whole.checked_mul(scale).ok_or_else(invalid)?)
            .ok_or_else(invalid)?;

        if !frac_part.is_empty() {
            let digits = frac_part.len().min(18) as u32;
            let frac: i128 = frac_part[..digits as usize].parse().map_err(|_| invalid())?;
            total += frac * scale / 10i128.pow(digits);
        }
    }

    if negative {
        total = -total;
    }
    let nanos = i64::try_from(total).map_err(|_| invalid())?;
    Ok(Duration::nanoseconds(nanos))
}

/// Render a duration the way Go prints it (`"72h0m0s"`, `"1m30s"`, `"0s"`).
pub fn format_duration(duration: Duration) -> String {
    if duration.is_zero() {
        return "0s".to_string();
    }

    let sign = if duration < Duration::zero() { "-" } else { "" };
    let abs = duration.abs();
    let total_nanos = abs.num_nanoseconds().unwrap_or(i64::MAX);

    if total_nanos < 1_000_000_000 {
        return if total_nanos % 1_000_000 == 0 {
            format!("{sign}{}ms", total_nanos / 1_000_000)
        } else {
            format!("{sign}{total_nanos}ns")
        };
    }

    let hours = abs.num_hours();
    let minutes = abs.num_minutes() % 60;
    let seconds = abs.num_seconds() % 60;
    let sub_nanos = total_nanos % 1_000_000_000;
    let secs = if sub_nanos == 0 {
        format!("{seconds}s")
    } else {
        let frac = format!("{sub_nanos:09}");
        format!("{seconds}.{}s", frac.trim_end_matches('0'))
    };

    if hours > 0 {
        format!("{sign}{hours}h{minutes}m{secs}")
    } else if minutes > 0 {
        format!("{sign}{minutes}m{secs}")
    } else {
        format!("{sign}{secs}")
    }
}

/// Serde helpers for `std::time::Duration` fields written as Go-style strings.
pub mod serde_go {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    /// Serialize a duration as a Go-style string.
    pub fn serialize<S: Serializer>(
        value: &std::time::Duration,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let duration = chrono::Duration::from_std(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&super::format_duration(duration))
    }

    /// Deserialize a duration from a Go-style string.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<std::time::Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let parsed = super::parse_duration(&raw).map_err(D::Error::custom)?;
        parsed.to_std().map_err(D::Error::custom)
    }
}
