//! Human duration strings ("90", "90s", "30m", "1h30m") to whole seconds.

use crate::error::{RecorderError, RecorderResult};

/// Parse a duration string into seconds.
///
/// Bare numbers are seconds. Units `s`, `m` and `h` are case-insensitive and
/// may be chained (`1h30m`). An empty string means "no limit" and parses to 0.
/// Negative values and unknown units are rejected.
pub fn parse_duration_secs(input: &str) -> RecorderResult<u64> {
    let text = input.trim();
    if text.is_empty() {
        return Ok(0);
    }
    if text.starts_with('-') {
        return Err(RecorderError::config(format!(
            "duration must not be negative: {text:?}"
        )));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    let mut saw_unit = false;

    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let multiplier = match ch.to_ascii_lowercase() {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            _ => {
                return Err(RecorderError::config(format!(
                    "invalid duration {text:?}: unexpected {ch:?}"
                )))
            }
        };
        if digits.is_empty() {
            return Err(RecorderError::config(format!(
                "invalid duration {text:?}: unit without a number"
            )));
        }
        total = parse_component(&digits, text)?
            .checked_mul(multiplier)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| RecorderError::config(format!("duration too large: {text:?}")))?;
        digits.clear();
        saw_unit = true;
    }

    if !digits.is_empty() {
        if saw_unit {
            // "1h30" is ambiguous; require a unit on every component after the first.
            return Err(RecorderError::config(format!(
                "invalid duration {text:?}: trailing number without a unit"
            )));
        }
        total = parse_component(&digits, text)?;
    }

    Ok(total)
}

fn parse_component(digits: &str, original: &str) -> RecorderResult<u64> {
    digits
        .parse::<u64>()
        .map_err(|_| RecorderError::config(format!("invalid duration {original:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_values() {
        assert_eq!(parse_duration_secs("0").unwrap(), 0);
        assert_eq!(parse_duration_secs("30").unwrap(), 30);
        assert_eq!(parse_duration_secs("3600").unwrap(), 3600);
        assert_eq!(parse_duration_secs("90s").unwrap(), 90);
        assert_eq!(parse_duration_secs("90S").unwrap(), 90);
        assert_eq!(parse_duration_secs("1m").unwrap(), 60);
        assert_eq!(parse_duration_secs("30M").unwrap(), 1800);
        assert_eq!(parse_duration_secs("2h").unwrap(), 7200);
        assert_eq!(parse_duration_secs("2H").unwrap(), 7200);
        assert_eq!(parse_duration_secs(" 1h30m ").unwrap(), 5400);
    }

    #[test]
    fn empty_means_disabled() {
        assert_eq!(parse_duration_secs("").unwrap(), 0);
        assert_eq!(parse_duration_secs("   ").unwrap(), 0);
    }

    #[test]
    fn rejects_negative_and_garbage() {
        let overflowing = ["5124095576030432h", "18446744073709551615s1s"];
        let garbage = ["-1", "-30", "-30s", "invalid", "30x", "abc", "m", "1h30"];
        for bad in garbage.into_iter().chain(overflowing) {
            let err = parse_duration_secs(bad).unwrap_err();
            assert!(
                matches!(err, RecorderError::Config { .. }),
                "{bad:?} should be a config error, got {err:?}"
            );
        }
    }
}
