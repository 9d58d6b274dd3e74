//! ISO-8601 duration/date/cycle parsing for `TimerDefinition::expression`
//! (§3, §4.4). Deliberately narrow: the subset BPMN timers actually use
//! (`PnDTnHnMnS`, an RFC-3339 instant, or `Rn/<duration>`), not the full
//! ISO-8601 grammar.

use chrono::{DateTime, Duration, Utc};

use crate::error::TimerError;

/// Parse a duration like `PT30S`, `P1D`, or `P1DT12H`.
pub fn parse_duration(expr: &str) -> Result<Duration, TimerError> {
    let bytes = expr.as_bytes();
    if bytes.first() != Some(&b'P') {
        return Err(TimerError::InvalidDuration(expr.to_string()));
    }

    let mut total = Duration::zero();
    let mut in_time_section = false;
    let mut num = String::new();

    for &b in &bytes[1..] {
        let c = b as char;
        match c {
            'T' => in_time_section = true,
            '0'..='9' => num.push(c),
            'Y' | 'M' | 'W' | 'D' | 'H' | 'S' => {
                let n: i64 = num
                    .parse()
                    .map_err(|_| TimerError::InvalidDuration(expr.to_string()))?;
                num.clear();
                total = total
                    + match (c, in_time_section) {
                        ('Y', _) => Duration::days(n * 365),
                        ('M', false) => Duration::days(n * 30),
                        ('W', _) => Duration::weeks(n),
                        ('D', _) => Duration::days(n),
                        ('H', true) => Duration::hours(n),
                        ('M', true) => Duration::minutes(n),
                        ('S', true) => Duration::seconds(n),
                        _ => return Err(TimerError::InvalidDuration(expr.to_string())),
                    };
            }
            _ => return Err(TimerError::InvalidDuration(expr.to_string())),
        }
    }

    if !num.is_empty() {
        return Err(TimerError::InvalidDuration(expr.to_string()));
    }
    Ok(total)
}

/// Parse an RFC-3339 instant, as used by `DATE` timers.
pub fn parse_date(expr: &str) -> Result<DateTime<Utc>, TimerError> {
    DateTime::parse_from_rfc3339(expr)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimerError::InvalidDuration(expr.to_string()))
}

/// Parse a repeating-interval expression like `R5/PT30S` (5 repeats) or
/// `R/PT30S` (unbounded). Returns `(remaining_iterations, interval)`.
pub fn parse_cycle(expr: &str) -> Result<(Option<u32>, Duration), TimerError> {
    let rest = expr
        .strip_prefix('R')
        .ok_or_else(|| TimerError::InvalidDuration(expr.to_string()))?;
    let (count_part, duration_part) = rest
        .split_once('/')
        .ok_or_else(|| TimerError::InvalidDuration(expr.to_string()))?;

    let remaining = if count_part.is_empty() {
        None
    } else {
        Some(
            count_part
                .parse::<u32>()
                .map_err(|_| TimerError::InvalidDuration(expr.to_string()))?,
        )
    };
    let interval = parse_duration(duration_part)?;
    Ok((remaining, interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_seconds() {
        assert_eq!(parse_duration("PT30S").unwrap(), Duration::seconds(30));
    }

    #[test]
    fn parses_combined_date_and_time_fields() {
        assert_eq!(parse_duration("P1DT12H").unwrap(), Duration::hours(36));
    }

    #[test]
    fn rejects_expressions_missing_the_p_prefix() {
        assert!(parse_duration("30S").is_err());
    }

    #[test]
    fn parses_bounded_cycle() {
        let (remaining, interval) = parse_cycle("R5/PT30S").unwrap();
        assert_eq!(remaining, Some(5));
        assert_eq!(interval, Duration::seconds(30));
    }

    #[test]
    fn parses_unbounded_cycle() {
        let (remaining, interval) = parse_cycle("R/PT1H").unwrap();
        assert_eq!(remaining, None);
        assert_eq!(interval, Duration::hours(1));
    }

    #[test]
    fn parses_rfc3339_date() {
        let dt = parse_date("2026-01-01T00:00:00Z").unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-01-01T00:00:00+00:00");
    }
}
