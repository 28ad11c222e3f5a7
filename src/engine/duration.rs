//! Requested-duration parsing for the wire format.
//!
//! Accepts ISO-8601 durations limited to days and time components
//! (`PT30M`, `P1DT2H`) and the short forms `Ns`, `Nm` and `Nh`.

use chrono::Duration;
use once_cell::sync::Lazy;
use regex::Regex;

use super::error::ElevationError;

static ISO_8601: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$").ok()
});

static SHORT_FORM: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^(\d+)([smh])$").ok());

/// Parse a requested elevation duration.
///
/// # Errors
/// Returns `ElevationError::Validation` for unrecognised or zero durations.
pub fn parse_duration(value: &str) -> Result<Duration, ElevationError> {
    let value = value.trim();
    let invalid = || ElevationError::Validation(format!("invalid duration: {value:?}"));

    let seconds = if let Some(captures) = SHORT_FORM.as_ref().and_then(|re| re.captures(value)) {
        let amount = number(captures.get(1).map(|m| m.as_str()))?;
        let unit = match captures.get(2).map(|m| m.as_str()) {
            Some("s") => 1,
            Some("m") => 60,
            Some("h") => 3600,
            _ => return Err(invalid()),
        };
        amount.checked_mul(unit).ok_or_else(invalid)?
    } else if let Some(captures) = ISO_8601.as_ref().and_then(|re| re.captures(value)) {
        if value == "P" || value.ends_with('T') {
            return Err(invalid());
        }
        let days = number(captures.get(1).map(|m| m.as_str()))?;
        let hours = number(captures.get(2).map(|m| m.as_str()))?;
        let minutes = number(captures.get(3).map(|m| m.as_str()))?;
        let secs = number(captures.get(4).map(|m| m.as_str()))?;
        days.checked_mul(86_400)
            .and_then(|total| total.checked_add(hours.checked_mul(3600)?))
            .and_then(|total| total.checked_add(minutes.checked_mul(60)?))
            .and_then(|total| total.checked_add(secs))
            .ok_or_else(invalid)?
    } else {
        return Err(invalid());
    };

    if seconds <= 0 {
        return Err(ElevationError::Validation(
            "duration must be positive".to_string(),
        ));
    }
    Duration::try_seconds(seconds).ok_or_else(invalid)
}

fn number(value: Option<&str>) -> Result<i64, ElevationError> {
    value.map_or(Ok(0), |digits| {
        digits
            .parse::<i64>()
            .map_err(|_| ElevationError::Validation(format!("duration out of range: {digits}")))
    })
}
