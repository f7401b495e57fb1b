//! Human-friendly duration parsing for config and rule files.
//!
//! Accepts the compact forms used throughout the YAML surface: `500ms`,
//! `30s`, `5m`, `2h`, `7d`, and combinations such as `1h30m`.

use std::time::Duration;

/// Parse a duration string such as `30s`, `5m` or `1h30m`.
pub fn parse(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    let mut matched_any = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }

        let mut unit = String::from(c);
        // "ms" is the only two-letter unit
        if c == 'm' && chars.peek() == Some(&'s') {
            chars.next();
            unit.push('s');
        }

        let value: f64 = num
            .parse()
            .map_err(|_| format!("invalid duration {:?}", input))?;
        num.clear();

        let unit_nanos: u64 = match unit.as_str() {
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "d" => 86_400 * 1_000_000_000,
            _ => return Err(format!("unknown duration unit {:?} in {:?}", unit, input)),
        };

        total += Duration::from_nanos((value * unit_nanos as f64) as u64);
        matched_any = true;
    }

    if !num.is_empty() || !matched_any {
        return Err(format!("duration {:?} missing unit", input));
    }
    Ok(total)
}

/// Render a duration in the same compact form `parse` accepts.
pub fn format(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    if secs % 86_400 == 0 {
        format!("{}d", secs / 86_400)
    } else if secs % 3_600 == 0 {
        format!("{}h", secs / 3_600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for required duration fields.
pub mod serde_dur {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional duration fields.
pub mod serde_opt_dur {
    use super::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, ser: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => ser.serialize_some(&format(*d)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Option<Duration>, D::Error> {
        let s: Option<String> = Option::deserialize(de)?;
        match s {
            Some(s) => parse(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
