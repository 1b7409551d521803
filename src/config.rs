use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with a command that completed with RECOVERED ERROR.
///
/// ATA PASS-THROUGH with CK_COND set reports "ATA pass-through information
/// available" this way on every successful command, which is why `Accept`
/// is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveredErrorPolicy {
    /// Hand the response data to the caller.
    #[default]
    Accept,
    /// Treat the command as failed.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Per-command timeout.
    #[serde(with = "millis", rename = "timeout_ms")]
    pub timeout: Duration,
    pub recovered_errors: RecoveredErrorPolicy,
    /// Retry a failed IDENTIFY DEVICE as IDENTIFY PACKET DEVICE.
    pub atapi_fallback: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(3000),
            recovered_errors: RecoveredErrorPolicy::default(),
            atapi_fallback: true,
        }
    }
}

impl Options {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_recovered_errors(mut self, policy: RecoveredErrorPolicy) -> Self {
        self.recovered_errors = policy;
        self
    }

    pub fn with_atapi_fallback(mut self, enabled: bool) -> Self {
        self.atapi_fallback = enabled;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert_eq!(options.timeout, Duration::from_secs(3));
        assert_eq!(options.recovered_errors, RecoveredErrorPolicy::Accept);
        assert!(options.atapi_fallback);
    }

    #[test]
    fn json_round_trip() {
        let options = Options::default()
            .with_timeout(Duration::from_millis(250))
            .with_recovered_errors(RecoveredErrorPolicy::Reject);
        let json = serde_json::to_string(&options).unwrap();
        assert_eq!(
            json,
            r#"{"timeout_ms":250,"recovered_errors":"reject","atapi_fallback":true}"#
        );
        assert_eq!(serde_json::from_str::<Options>(&json).unwrap(), options);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let options: Options = serde_json::from_str(r#"{"atapi_fallback":false}"#).unwrap();
        assert_eq!(options.timeout, Duration::from_secs(3));
        assert!(!options.atapi_fallback);
    }
}
