//! Module that allows to (de-)serialize a `Duration` as a floating point number of seconds.
//!
//! Example:
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct Timeouts {
//!     #[serde(with = "handoff_utils::serde::duration_secs")]
//!     readiness: Duration,
//! }
//! ```

use std::time::Duration;

use serde::{de::Error, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(|e| D::Error::custom(format!("{secs}: {e}")))
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        d: Duration,
    }

    #[test]
    fn test_parse_fractional_seconds() {
        let w: Wrapper = serde_json::from_str(r#"{"d": 1.5}"#).unwrap();
        assert_eq!(w.d, Duration::from_millis(1500));
    }

    #[test]
    fn test_reject_negative() {
        assert!(serde_json::from_str::<Wrapper>(r#"{"d": -3.0}"#).is_err());
    }

    #[test]
    fn test_write_seconds() {
        let s = serde_json::to_string(&Wrapper { d: Duration::from_secs(3) }).unwrap();
        assert_eq!(s, r#"{"d":3.0}"#);
    }
}
