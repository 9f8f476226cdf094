//! Result Envelope
//!
//! Uniform `{success, ...fields, duration}` shape returned by every operation.
//! Failures are data: transport errors, daemon errors, bad JSON and failed
//! preconditions all land in [`Failure`].

use crate::pool::DaemonResponse;
use reqwest::StatusCode;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;

/// Where a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// DNS, refused connection, timeout
    Transport,
    /// Non-2xx from the daemon
    Daemon,
    /// Body was not what we expected
    MalformedResponse,
    /// Rejected before contacting the daemon
    Precondition,
    /// Scheduler or task failure
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    #[serde(skip)]
    pub kind: FailureKind,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

impl Failure {
    pub fn transport(err: impl fmt::Display) -> Self {
        Self {
            kind: FailureKind::Transport,
            error: "Request failed".to_string(),
            details: None,
            exception: Some(err.to_string()),
        }
    }

    /// Daemon answered with a non-2xx status
    pub fn status(operation: &str, response: &DaemonResponse) -> Self {
        Self::daemon(operation, response.status, response.text())
    }

    pub fn daemon(operation: &str, status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Daemon,
            error: format!("{} failed with status {}", operation, status.as_u16()),
            details: Some(body.into()),
            exception: None,
        }
    }

    pub fn invalid_json(raw: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::MalformedResponse,
            error: "Invalid JSON response".to_string(),
            details: Some(raw.into()),
            exception: None,
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Precondition,
            error: message.into(),
            details: None,
            exception: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            error: message.into(),
            details: None,
            exception: None,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(exception) = &self.exception {
            write!(f, ": {}", exception)?;
        }
        Ok(())
    }
}

/// Outcome of one operation plus how long it took
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub outcome: Result<T, Failure>,
    pub duration: Duration,
}

impl<T> Envelope<T> {
    pub fn success(value: T, duration: Duration) -> Self {
        Self {
            outcome: Ok(value),
            duration,
        }
    }

    pub fn failure(failure: Failure, duration: Duration) -> Self {
        Self {
            outcome: Err(failure),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn into_value(self) -> Option<T> {
        self.outcome.ok()
    }

    pub fn failure_ref(&self) -> Option<&Failure> {
        self.outcome.as_ref().err()
    }

    pub fn error(&self) -> Option<&str> {
        self.failure_ref().map(|f| f.error.as_str())
    }

    pub fn into_result(self) -> Result<T, Failure> {
        self.outcome
    }
}

impl<T: Serialize> Envelope<T> {
    /// Flatten into the wire shape. Non-object payloads go under `result`.
    pub fn to_json(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("success".into(), Value::Bool(self.is_success()));

        let body = match &self.outcome {
            Ok(value) => serde_json::to_value(value),
            Err(failure) => serde_json::to_value(failure),
        };
        match body {
            Ok(Value::Object(fields)) => doc.extend(fields),
            Ok(Value::Null) => {}
            Ok(other) => {
                doc.insert("result".into(), other);
            }
            Err(e) => {
                doc.insert("serialization_error".into(), Value::String(e.to_string()));
            }
        }

        doc.insert("duration".into(), Value::from(self.duration.as_secs_f64()));
        Value::Object(doc)
    }
}

impl<T: Serialize> Serialize for Envelope<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Serde adapter: bytes as standard base64 text
pub mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|text| STANDARD.decode(text.as_bytes()).map_err(de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Found {
        cid: String,
        size: u64,
    }

    #[test]
    fn test_success_flattens_fields() {
        let env = Envelope::success(
            Found {
                cid: "bafy".into(),
                size: 12,
            },
            Duration::from_millis(1500),
        );
        let doc = env.to_json();
        assert_eq!(doc["success"], json!(true));
        assert_eq!(doc["cid"], json!("bafy"));
        assert_eq!(doc["size"], json!(12));
        assert_eq!(doc["duration"], json!(1.5));
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys.first().map(|k| k.as_str()), Some("success"));
        assert_eq!(keys.last().map(|k| k.as_str()), Some("duration"));
    }

    #[test]
    fn test_failure_shape() {
        let env: Envelope<Found> =
            Envelope::failure(Failure::invalid_json("<html>"), Duration::from_millis(10));
        let doc = env.to_json();
        assert_eq!(doc["success"], json!(false));
        assert_eq!(doc["error"], json!("Invalid JSON response"));
        assert_eq!(doc["details"], json!("<html>"));
        assert!(doc.get("exception").is_none());
        assert!(doc.get("kind").is_none());
    }

    #[test]
    fn test_transport_failure_carries_exception() {
        let failure = Failure::transport("connection refused");
        assert_eq!(failure.kind, FailureKind::Transport);
        assert_eq!(failure.exception.as_deref(), Some("connection refused"));
        assert_eq!(failure.to_string(), "Request failed: connection refused");
    }

    #[test]
    fn test_scalar_payload_goes_under_result() {
        let env = Envelope::success(vec![1, 2, 3], Duration::ZERO);
        assert_eq!(env.to_json()["result"], json!([1, 2, 3]));
    }
}
