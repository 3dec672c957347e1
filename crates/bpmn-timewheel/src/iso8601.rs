//! Hand-written recursive-descent parsing for the three ISO-8601 forms a
//! BPMN timer expression can carry: `duration` (`PnYnMnDTnHnMnS`), `date`
//! (a date-time), and `cycle` (`R<n>?/<duration>`). Narrow, fully-specified
//! grammar — not worth a dependency.

use chrono::{DateTime, Duration, Utc};

use crate::error::TimerError;

/// Calendar approximation used by the duration grammar: a year is 365
/// days and a month is 30 days. BPMN timer durations are elapsed-time
/// offsets, not calendar arithmetic, so this tracks what engines in this
/// space actually do rather than pulling in a full calendar library.
const SECONDS_PER_YEAR: i64 = 365 * 24 * 3600;
const SECONDS_PER_MONTH: i64 = 30 * 24 * 3600;
const SECONDS_PER_DAY: i64 = 24 * 3600;
const SECONDS_PER_HOUR: i64 = 3600;
const SECONDS_PER_MINUTE: i64 = 60;

fn invalid(kind: &'static str, expression: &str, reason: &'static str) -> TimerError {
    TimerError::InvalidExpression {
        kind,
        expression: expression.to_string(),
        reason,
    }
}

/// Parse `PnYnMnDTnHnMnS` (any component may be absent; at least one must
/// be present). Returns the elapsed duration in seconds.
pub fn parse_duration(expression: &str) -> Result<Duration, TimerError> {
    let mut chars = expression.chars().peekable();
    if chars.next() != Some('P') {
        return Err(invalid("duration", expression, "must start with 'P'"));
    }

    let mut total_secs: i64 = 0;
    let mut saw_component = false;
    let mut in_time_section = false;

    loop {
        match chars.peek() {
            None => break,
            Some('T') => {
                chars.next();
                in_time_section = true;
            }
            Some(_) => {
                let (amount, designator) = read_number_then_designator(&mut chars, expression)?;
                saw_component = true;
                let unit_secs = match (in_time_section, designator) {
                    (false, 'Y') => SECONDS_PER_YEAR,
                    (false, 'M') => SECONDS_PER_MONTH,
                    (false, 'D') => SECONDS_PER_DAY,
                    (false, 'W') => SECONDS_PER_DAY * 7,
                    (true, 'H') => SECONDS_PER_HOUR,
                    (true, 'M') => SECONDS_PER_MINUTE,
                    (true, 'S') => 1,
                    _ => return Err(invalid("duration", expression, "unknown component designator")),
                };
                total_secs = total_secs
                    .checked_add(amount.checked_mul(unit_secs).ok_or_else(|| {
                        invalid("duration", expression, "component overflows i64 seconds")
                    })?)
                    .ok_or_else(|| invalid("duration", expression, "total duration overflows i64 seconds"))?;
            }
        }
    }

    if !saw_component {
        return Err(invalid("duration", expression, "no duration components present"));
    }
    Ok(Duration::seconds(total_secs))
}

/// Read a run of ASCII digits followed by exactly one designator letter,
/// e.g. `"12D"` -> `(12, 'D')`.
fn read_number_then_designator(
    chars: &mut std::iter::Peekable<std::str::Chars>,
    expression: &str,
) -> Result<(i64, char), TimerError> {
    let mut digits = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            digits.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if digits.is_empty() {
        return Err(invalid("duration", expression, "expected digits before a designator"));
    }
    let designator = chars
        .next()
        .ok_or_else(|| invalid("duration", expression, "expected a designator after digits"))?;
    let amount: i64 = digits
        .parse()
        .map_err(|_| invalid("duration", expression, "component amount does not fit in i64"))?;
    Ok((amount, designator))
}

/// Parse an ISO-8601 date-time (RFC 3339 form, e.g.
/// `2026-07-26T12:00:00Z`) into a UTC instant.
pub fn parse_date(expression: &str) -> Result<DateTime<Utc>, TimerError> {
    DateTime::parse_from_rfc3339(expression)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| invalid("date", expression, "not a valid RFC 3339 date-time"))
}

/// Parse `R<n>?/<duration>` — `R/` (or `R<n>/`) followed by a duration.
/// Returns `(total_fire_count, interval)`, i.e. `R3/...` fires exactly 3
/// times total; callers seed their own remaining-repeats counter from
/// this minus the firing already accounted for. `None` means the
/// unbounded `R/` form.
pub fn parse_cycle(expression: &str) -> Result<(Option<u32>, Duration), TimerError> {
    if !expression.starts_with('R') {
        return Err(invalid("cycle", expression, "must start with 'R'"));
    }
    let rest = &expression[1..];
    let slash = rest
        .find('/')
        .ok_or_else(|| invalid("cycle", expression, "missing '/' separating repeat count from duration"))?;

    let (count_str, remainder) = rest.split_at(slash);
    let duration_str = &remainder[1..];

    let repeats = if count_str.is_empty() {
        None
    } else {
        Some(
            count_str
                .parse::<u32>()
                .map_err(|_| invalid("cycle", expression, "repeat count is not a valid u32"))?,
        )
    };

    let interval = parse_duration(duration_str)?;
    Ok((repeats, interval))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_duration() {
        assert_eq!(parse_duration("PT1H30M").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("P1D").unwrap(), Duration::days(1));
        assert_eq!(parse_duration("PT30S").unwrap(), Duration::seconds(30));
    }

    #[test]
    fn parses_combined_date_and_time_components() {
        let duration = parse_duration("P1DT2H3M4S").unwrap();
        assert_eq!(duration, Duration::days(1) + Duration::hours(2) + Duration::minutes(3) + Duration::seconds(4));
    }

    #[test]
    fn rejects_duration_missing_p_prefix() {
        assert!(parse_duration("1H30M").is_err());
    }

    #[test]
    fn rejects_duration_with_no_components() {
        assert!(parse_duration("P").is_err());
        assert!(parse_duration("PT").is_err());
    }

    #[test]
    fn parses_rfc3339_date() {
        let parsed = parse_date("2026-07-26T12:00:00Z").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-07-26T12:00:00+00:00");
    }

    #[test]
    fn rejects_malformed_date() {
        assert!(parse_date("not-a-date").is_err());
    }

    #[test]
    fn parses_bounded_cycle() {
        let (repeats, interval) = parse_cycle("R3/PT1H").unwrap();
        assert_eq!(repeats, Some(3));
        assert_eq!(interval, Duration::hours(1));
    }

    #[test]
    fn parses_unbounded_cycle() {
        let (repeats, interval) = parse_cycle("R/PT5M").unwrap();
        assert_eq!(repeats, None);
        assert_eq!(interval, Duration::minutes(5));
    }

    #[test]
    fn rejects_cycle_without_slash() {
        assert!(parse_cycle("R3PT1H").is_err());
    }
}
