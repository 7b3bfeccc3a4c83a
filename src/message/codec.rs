//! Wire codec for refresh messages
//!
//! Wire shape (JSON object, camelCase):
//!
//! ```json
//! { "userId": 123, "requestedAt": "2025-12-12T10:30:00Z", "retryCount": 0 }
//! ```
//!
//! Decoding validates field presence and types up front and yields either a
//! complete `RefreshMessage` or a `MalformedMessageError`; there is no
//! partially-populated intermediate.

use super::RefreshMessage;
use crate::error::MalformedMessageError;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Accepted layout for timestamps that carry no offset (taken as UTC)
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Codec bound to a retry ceiling
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_retries: u32,
}

impl MessageCodec {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decode and validate a raw payload
    pub fn decode(&self, raw: &[u8]) -> Result<RefreshMessage, MalformedMessageError> {
        decode(raw, self.max_retries)
    }

    /// Encode a message into its wire form
    pub fn encode(&self, message: &RefreshMessage) -> serde_json::Result<String> {
        serde_json::to_string(message)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Decode and validate a raw payload against the given retry ceiling
pub fn decode(raw: &[u8], max_retries: u32) -> Result<RefreshMessage, MalformedMessageError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| MalformedMessageError::InvalidJson(e.to_string()))?;

    let obj = match value {
        Value::Object(obj) => obj,
        other => return Err(MalformedMessageError::NotAnObject(json_type(&other))),
    };

    let user_id = match obj.get("userId") {
        None => return Err(MalformedMessageError::MissingField("userId")),
        Some(v) => positive_integer("userId", v)?,
    };

    let requested_at = match obj.get("requestedAt") {
        None => return Err(MalformedMessageError::MissingField("requestedAt")),
        Some(v) => timestamp("requestedAt", v)?,
    };

    let retry_count = match obj.get("retryCount") {
        None => 0,
        Some(v) => retry_count(v)?,
    };
    if retry_count > max_retries {
        return Err(MalformedMessageError::RetryCountOutOfRange {
            retry_count,
            max_retries,
        });
    }

    let last_attempt_at = match obj.get("lastAttemptAt") {
        None | Some(Value::Null) => None,
        Some(v) => Some(timestamp("lastAttemptAt", v)?),
    };

    Ok(RefreshMessage {
        user_id,
        requested_at,
        retry_count,
        last_attempt_at,
    })
}

fn positive_integer(field: &'static str, v: &Value) -> Result<u64, MalformedMessageError> {
    match v.as_u64() {
        Some(0) => Err(MalformedMessageError::InvalidField {
            field,
            reason: "must be a positive integer, got 0".into(),
        }),
        Some(n) => Ok(n),
        None => Err(MalformedMessageError::InvalidField {
            field,
            reason: format!("must be a positive integer, got {}", describe(v)),
        }),
    }
}

fn retry_count(v: &Value) -> Result<u32, MalformedMessageError> {
    let n = v.as_u64().ok_or_else(|| MalformedMessageError::InvalidField {
        field: "retryCount",
        reason: format!("must be a non-negative integer, got {}", describe(v)),
    })?;
    u32::try_from(n).map_err(|_| MalformedMessageError::InvalidField {
        field: "retryCount",
        reason: format!("{} is out of range", n),
    })
}

fn timestamp(field: &'static str, v: &Value) -> Result<DateTime<Utc>, MalformedMessageError> {
    let s = v.as_str().ok_or_else(|| MalformedMessageError::InvalidField {
        field,
        reason: format!("must be an ISO-8601 timestamp string, got {}", describe(v)),
    })?;

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, NAIVE_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| MalformedMessageError::InvalidField {
            field,
            reason: format!("'{}' is not an ISO-8601 timestamp: {}", s, e),
        })
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(v: &Value) -> String {
    match v {
        Value::Number(n) => n.to_string(),
        other => json_type(other).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE: &[u8] = br#"{"userId":123,"requestedAt":"2025-12-12T10:30:00Z","retryCount":0}"#;

    #[test]
    fn test_decode_sample() {
        let msg = decode(SAMPLE, 3).unwrap();
        assert_eq!(msg.user_id, 123);
        assert_eq!(
            msg.requested_at,
            Utc.with_ymd_and_hms(2025, 12, 12, 10, 30, 0).unwrap()
        );
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.last_attempt_at, None);
    }

    #[test]
    fn test_decode_is_idempotent() {
        assert_eq!(decode(SAMPLE, 3).unwrap(), decode(SAMPLE, 3).unwrap());
    }

    #[test]
    fn test_retry_count_defaults_to_zero() {
        let msg = decode(br#"{"userId":7,"requestedAt":"2025-01-01T00:00:00Z"}"#, 3).unwrap();
        assert_eq!(msg.retry_count, 0);
    }

    #[test]
    fn test_missing_user_id() {
        let err = decode(br#"{"requestedAt":"2025-12-12T10:30:00Z"}"#, 3).unwrap_err();
        assert_eq!(err, MalformedMessageError::MissingField("userId"));
    }

    #[test]
    fn test_missing_requested_at() {
        let err = decode(br#"{"userId":1}"#, 3).unwrap_err();
        assert_eq!(err, MalformedMessageError::MissingField("requestedAt"));
    }

    #[test]
    fn test_user_id_must_be_positive_integer() {
        for payload in [
            r#"{"userId":0,"requestedAt":"2025-01-01T00:00:00Z"}"#,
            r#"{"userId":-4,"requestedAt":"2025-01-01T00:00:00Z"}"#,
            r#"{"userId":1.5,"requestedAt":"2025-01-01T00:00:00Z"}"#,
            r#"{"userId":"12","requestedAt":"2025-01-01T00:00:00Z"}"#,
            r#"{"userId":null,"requestedAt":"2025-01-01T00:00:00Z"}"#,
        ] {
            let err = decode(payload.as_bytes(), 3).unwrap_err();
            assert!(
                matches!(err, MalformedMessageError::InvalidField { field: "userId", .. }),
                "{} -> {:?}",
                payload,
                err
            );
        }
    }

    #[test]
    fn test_bad_timestamp() {
        let err = decode(br#"{"userId":1,"requestedAt":"yesterday"}"#, 3).unwrap_err();
        assert!(matches!(
            err,
            MalformedMessageError::InvalidField { field: "requestedAt", .. }
        ));
    }

    #[test]
    fn test_naive_timestamp_is_utc() {
        let msg = decode(br#"{"userId":1,"requestedAt":"2025-12-12T10:30:00.250"}"#, 3).unwrap();
        assert_eq!(msg.requested_at.timestamp_millis() % 1000, 250);
    }

    #[test]
    fn test_retry_count_above_ceiling_is_rejected() {
        let err = decode(
            br#"{"userId":1,"requestedAt":"2025-01-01T00:00:00Z","retryCount":4}"#,
            3,
        )
        .unwrap_err();
        assert_eq!(
            err,
            MalformedMessageError::RetryCountOutOfRange {
                retry_count: 4,
                max_retries: 3
            }
        );
    }

    #[test]
    fn test_negative_retry_count_is_rejected() {
        let err = decode(
            br#"{"userId":1,"requestedAt":"2025-01-01T00:00:00Z","retryCount":-1}"#,
            3,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            MalformedMessageError::InvalidField { field: "retryCount", .. }
        ));
    }

    #[test]
    fn test_not_json_and_not_object() {
        assert!(matches!(
            decode(b"not json", 3).unwrap_err(),
            MalformedMessageError::InvalidJson(_)
        ));
        assert_eq!(
            decode(b"[1,2]", 3).unwrap_err(),
            MalformedMessageError::NotAnObject("array")
        );
    }

    #[test]
    fn test_encode_matches_wire_shape() {
        let codec = MessageCodec::new(3);
        let msg = decode(SAMPLE, 3).unwrap();
        let encoded: Value = serde_json::from_str(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(
            encoded,
            serde_json::json!({ "userId": 123, "requestedAt": "2025-12-12T10:30:00Z", "retryCount": 0 })
        );
    }

    #[test]
    fn test_encode_writes_utc_with_z_suffix() {
        let codec = MessageCodec::new(3);
        let at = Utc.with_ymd_and_hms(2025, 12, 12, 11, 0, 0).unwrap();
        let encoded = codec.encode(&decode(SAMPLE, 3).unwrap().next_attempt(at)).unwrap();
        assert!(encoded.contains(r#""requestedAt":"2025-12-12T10:30:00Z""#), "{}", encoded);
        assert!(encoded.contains(r#""lastAttemptAt":"2025-12-12T11:00:00Z""#), "{}", encoded);
    }

    #[test]
    fn test_encode_keeps_last_attempt() {
        let codec = MessageCodec::new(3);
        let at = Utc.with_ymd_and_hms(2025, 12, 12, 11, 0, 0).unwrap();
        let next = decode(SAMPLE, 3).unwrap().next_attempt(at);
        let decoded = codec.decode(codec.encode(&next).unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, next);
    }
}
