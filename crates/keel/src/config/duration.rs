//! Duration strings in the `1h30m`, `5s`, `250ms` notation.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serializer};
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::ConfigError;

static RE_COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|h|m|s)").unwrap());

/// Parses a duration such as `3m`, `90s`, `1h30m` or `250ms`. A bare
/// number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    let invalid = |reason: &str| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: reason.to_string(),
    };
    if trimmed.is_empty() {
        return Err(invalid("empty duration"));
    }
    if let Ok(secs) = trimmed.parse::<f64>() {
        if secs < 0.0 {
            return Err(invalid("negative duration"));
        }
        return Ok(Duration::from_secs_f64(secs));
    }

    let mut total = 0.0f64;
    let mut consumed = 0;
    for caps in RE_COMPONENT.captures_iter(trimmed) {
        let (Some(whole), Some(num), Some(unit)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        if whole.start() != consumed {
            return Err(invalid("unexpected characters"));
        }
        consumed = whole.end();
        let n: f64 = num
            .as_str()
            .parse()
            .map_err(|_| invalid("invalid number"))?;
        total += match unit.as_str() {
            "h" => n * 3600.0,
            "m" => n * 60.0,
            "s" => n,
            _ => n / 1000.0,
        };
    }
    if consumed != trimmed.len() || consumed == 0 {
        return Err(invalid("expected a number followed by h, m, s or ms"));
    }
    Ok(Duration::from_secs_f64(total))
}

/// Formats a duration in the same notation, using the largest exact units.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let mut secs = duration.as_secs();
    let mut out = String::new();
    for (unit, size) in [("h", 3600), ("m", 60)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    if secs > 0 {
        out.push_str(&format!("{}s", secs));
    }
    out
}

/// Serde adapter for `Duration` fields written as duration strings.
pub mod serde_string {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(f64),
        }
        match Raw::deserialize(d)? {
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
            Raw::Seconds(n) if n >= 0.0 => Ok(Duration::from_secs_f64(n)),
            Raw::Seconds(_) => Err(serde::de::Error::custom("negative duration")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m30s").unwrap(), Duration::from_secs(150));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("five seconds").is_err());
        assert!(parse_duration("5s later").is_err());
        assert!(parse_duration("-3").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for raw in ["5s", "3m", "1h30m", "250ms", "1h5s"] {
            assert_eq!(format_duration(parse_duration(raw).unwrap()), raw);
        }
    }
}
