//! Duration strings as used in policy specs ("250ms", "5s", "1m", "1h", "1.5s")

use std::time::Duration;

use crate::{Error, Result};

/// Parse a duration string with a single unit suffix
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| Error::validation(format!("duration {input:?} has no unit")))?;
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| Error::validation(format!("invalid duration {input:?}")))?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => {
            return Err(Error::validation(format!(
                "invalid duration unit {unit:?} in {input:?}, expected one of ms, s, m, h"
            )))
        }
    };
    Ok(Duration::from_secs_f64(secs))
}
