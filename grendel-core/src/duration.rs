//! Human-readable duration grammar used by archive retention settings.
//!
//! A duration is a whitespace-insensitive sum of `<int><unit>` terms where
//! the unit is one of `ms`, `s`, `m`, `h`, `d`, `w`. `"1h 30m"` and
//! `"1h30m"` both parse to 5 400 000 ms.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("empty duration string")]
    Empty,

    #[error("invalid duration unit `{0}`")]
    InvalidUnit(String),

    #[error("invalid duration number `{0}`")]
    InvalidNumber(String),
}

/// Parse a duration expression to milliseconds.
pub fn parse_millis(input: &str) -> Result<u64, DurationError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(DurationError::Empty);
    }

    let mut total: u64 = 0;
    let mut rest = compact.as_str();

    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(DurationError::InvalidNumber(rest.to_string()));
        }

        let (num_str, after_num) = rest.split_at(digits_end);
        let value: u64 = num_str
            .parse()
            .map_err(|_| DurationError::InvalidNumber(num_str.to_string()))?;

        let unit_end = after_num
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(after_num.len());
        let (unit, after_unit) = after_num.split_at(unit_end);

        let factor = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            other => return Err(DurationError::InvalidUnit(other.to_string())),
        };

        total = total.saturating_add(value.saturating_mul(factor));
        rest = after_unit;
    }

    Ok(total)
}

/// Parse a duration expression to a [`std::time::Duration`].
pub fn parse(input: &str) -> Result<Duration, DurationError> {
    parse_millis(input).map(Duration::from_millis)
}
