// Date and time support for the $now/$millis/$fromMillis/$toMillis
// builtins. The timestamp itself comes from the per-evaluation supplement
// so repeated calls within one evaluation agree.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};

use crate::evaluator::EvaluatorError;

/// Parse an ISO 8601 timestamp. Date-only forms are accepted as midnight
/// UTC.
pub fn parse_iso8601(s: &str) -> Result<DateTime<Utc>, EvaluatorError> {
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&midnight));
        }
    }
    Err(EvaluatorError::InvalidTimestamp {
        value: s.to_string(),
    })
}

/// Format a datetime as ISO 8601 with millisecond precision, e.g.
/// `2017-05-15T15:12:59.152Z`.
pub fn format_iso8601(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Millisecond epoch timestamp to ISO 8601.
pub fn millis_to_iso8601(millis: i64) -> Result<String, EvaluatorError> {
    match Utc.timestamp_millis_opt(millis) {
        chrono::LocalResult::Single(dt) => Ok(format_iso8601(&dt)),
        _ => Err(EvaluatorError::InvalidTimestamp {
            value: millis.to_string(),
        }),
    }
}

/// ISO 8601 timestamp to millisecond epoch.
pub fn iso8601_to_millis(s: &str) -> Result<i64, EvaluatorError> {
    Ok(parse_iso8601(s)?.timestamp_millis())
}
