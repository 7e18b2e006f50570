use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::error::{PipelineError, Result};

/// Parses a UTC time string (`%Y%m%d%H`, `%Y-%m-%d-%H%M%S`, ...) into Unix seconds.
///
/// Fields the format omits default to zero, so `%Y%m%d%H` and `%Y%m%d` both parse.
pub fn time_string_to_unix(text: &str, format: &str) -> Result<i64> {
    let naive = NaiveDateTime::parse_from_str(text, format)
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(&format!("{text}00"), &format!("{format}%M")).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .ok_or_else(|| {
            PipelineError::Configuration(format!("cannot parse time \"{text}\" with format \"{format}\""))
        })?;
    Ok(naive.and_utc().timestamp())
}

/// Formats Unix seconds as a UTC time string.
pub fn time_unix_to_string(unix_seconds: i64, format: &str) -> Result<String> {
    DateTime::<Utc>::from_timestamp(unix_seconds, 0)
        .map(|time| time.format(format).to_string())
        .ok_or_else(|| PipelineError::Configuration(format!("timestamp {unix_seconds} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_initialization_times() {
        assert_eq!(time_string_to_unix("2006100912", "%Y%m%d%H").unwrap(), 1_160_395_200);
        assert_eq!(time_string_to_unix("19700102", "%Y%m%d").unwrap(), 86_400);
        assert_eq!(time_string_to_unix("1970-01-01-000130", "%Y-%m-%d-%H%M%S").unwrap(), 90);
        assert!(time_string_to_unix("20061309", "%Y%m%d").is_err());
    }

    #[test]
    fn formats_back() {
        assert_eq!(time_unix_to_string(1_160_395_200, "%Y-%m-%d-%H%M%S").unwrap(), "2006-10-09-120000");
    }
}
