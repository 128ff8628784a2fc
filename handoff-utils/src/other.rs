//! Module containing some utility functions that didn't fit anywhere else.

use std::time::Duration;

use time::{format_description, OffsetDateTime};

/// Produces a timestamp `String` of the current time in YYYY-MM-DD_HH-mm-SS format.
pub fn get_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_description::parse("[year]-[month]-[day]_[hour]-[minute]-[second]")
        .ok()
        .and_then(|fmt| now.format(&fmt).ok())
        .unwrap_or_else(|| now.unix_timestamp().to_string())
}

/// Produces the time of day in HH:mm:SS format, used to prefix operator messages.
pub fn get_time_of_day() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_description::parse("[hour]:[minute]:[second]")
        .ok()
        .and_then(|fmt| now.format(&fmt).ok())
        .unwrap_or_default()
}

/// Render a duration as seconds with millisecond resolution, e.g. `"3.042"`.
pub fn secs_str(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_timestamp_shape() {
        let ts = get_timestamp();
        // e.g. 2024-05-01_12-30-59
        assert_eq!(ts.len(), 19);
        assert_eq!(&ts[10..11], "_");
        assert!(!ts.contains(':'));
    }

    #[test]
    fn test_secs_str() {
        assert_eq!(secs_str(Duration::from_millis(3042)), "3.042");
        assert_eq!(secs_str(Duration::ZERO), "0.000");
    }
}
