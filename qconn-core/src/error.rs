use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    TypeError,
    CapRevoked,
    ConnectionClosed,
    PermissionDenied,
    Canceled,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::TypeError => "type_error",
            ErrorCode::CapRevoked => "cap_revoked",
            ErrorCode::ConnectionClosed => "connection_closed",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::Canceled => "canceled",
            ErrorCode::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

/// Error carried by rejected promises, on both sides of a connection.
///
/// Application handlers return these; the connection serializes them into
/// `reject` messages so the caller's promise rejects with an equal error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<RpcError>>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: None,
            cause: None,
        }
    }

    pub fn with_data(code: ErrorCode, message: impl Into<String>, data: Value) -> Self {
        RpcError {
            code,
            message: message.into(),
            data: Some(data),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: RpcError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeError, message)
    }

    pub fn cap_revoked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::CapRevoked, message)
    }

    /// The rejection every outstanding promise receives when its connection
    /// ends; `reason` is whatever the channel reported when it closed.
    pub fn connection_closed(reason: Option<RpcError>) -> Self {
        let err = Self::new(
            ErrorCode::ConnectionClosed,
            "Can't resolve promise because connection closed",
        );
        match reason {
            Some(reason) => err.with_cause(reason),
            None => err,
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Canceled, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn is_revocation(&self) -> bool {
        self.code == ErrorCode::CapRevoked
    }

    pub fn is_connection_closed(&self) -> bool {
        self.code == ErrorCode::ConnectionClosed
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::bad_request(format!("JSON error: {}", err))
    }
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::internal(format!("IO error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_error_creation() {
        let err = RpcError::new(ErrorCode::BadRequest, "Invalid input");
        assert_eq!(err.code, ErrorCode::BadRequest);
        assert_eq!(err.message, "Invalid input");
        assert_eq!(err.data, None);
        assert_eq!(err.cause, None);
    }

    #[test]
    fn test_error_with_data() {
        let data = serde_json::json!({"field": "value"});
        let err = RpcError::with_data(ErrorCode::Internal, "Server error", data.clone());
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.data, Some(data));
    }

    #[test]
    fn test_connection_closed_carries_cause() {
        let reason = RpcError::internal("socket reset");
        let err = RpcError::connection_closed(Some(reason.clone()));
        assert!(err.is_connection_closed());
        assert_eq!(err.cause.as_deref(), Some(&reason));

        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("internal: socket reset"));

        let bare = RpcError::connection_closed(None);
        assert!(bare.cause.is_none());
    }

    #[test]
    fn test_revocation_is_distinct_from_closure() {
        let revoked = RpcError::cap_revoked("evicted");
        assert!(revoked.is_revocation());
        assert!(!revoked.is_connection_closed());
    }

    #[test]
    fn test_error_serialization() {
        let err = RpcError::connection_closed(Some(RpcError::internal("gone")));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "connection_closed");
        assert_eq!(json["cause"]["code"], "internal");
        assert!(json.get("data").is_none());

        let deserialized: RpcError = serde_json::from_value(json).unwrap();
        assert_eq!(err, deserialized);
    }

    #[test]
    fn test_error_display() {
        let err = RpcError::type_error("not a function");
        assert_eq!(format!("{}", err), "type_error: not a function");
    }
}
