//! Error types for signkit operations.
//!
//! Two layers live here:
//!
//! - [`SignkitError`] is what local callers see from every fallible operation.
//! - [`SdkError`] is the protocol catalogue carried inside JSON-RPC error
//!   responses exchanged with the peer.

use crate::jsonrpc::JsonRpcError;

/// Error codes for FFI and mobile integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SignkitErrorCode {
    /// Malformed or unauthorized parameters
    ValidationFailed = 1000,
    /// Unknown topic, id, proposal or key
    NoMatchingKey = 2000,
    /// Record exists under a different topic
    MismatchedTopic = 2001,
    /// Target TTL elapsed
    Expired = 3000,
    /// Pending proposal expired before approval
    ProposalExpired = 3001,
    /// Envelope encryption failed
    Encoding = 4000,
    /// Envelope decryption failed
    Decoding = 4001,
    /// Relay publish failed
    PublishFailed = 5000,
    /// Transport/network layer error
    Transport = 5001,
    /// No response within TTL
    Timeout = 5002,
    /// Malformed pairing URI
    InvalidUri = 6000,
    /// Peer answered with an error response
    Rejected = 7000,
    /// Storage error
    Storage = 8000,
    /// Serialization error
    Serialization = 8001,
    /// Internal/unexpected error
    Internal = 9999,
}

/// Comprehensive error type for signkit operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SignkitError {
    /// Parameters failed validation before any I/O took place.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Unknown topic, id, proposal or key.
    #[error("no matching key. {resource_type}: {identifier}")]
    NoMatchingKey {
        /// Kind of resource (e.g. "session", "proposal", "keychain")
        resource_type: String,
        /// Resource identifier
        identifier: String,
    },

    /// A record exists for the id but under another topic.
    #[error("mismatched topic for id {id}: expected {expected}, got {actual}")]
    MismatchedTopic {
        /// JSON-RPC id
        id: u64,
        /// Topic the record belongs to
        expected: String,
        /// Topic the caller asked about
        actual: String,
    },

    /// The target's TTL elapsed.
    #[error("expired. {resource_type}: {identifier}")]
    Expired {
        /// Kind of resource
        resource_type: String,
        /// Resource identifier
        identifier: String,
    },

    /// The pending proposal expired before the peer settled it.
    #[error("Proposal expired")]
    ProposalExpired,

    /// Envelope could not be built.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Envelope could not be opened.
    #[error("decoding error: {0}")]
    Decoding(String),

    /// The relay refused or failed a publish.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Transport/network layer error.
    #[error("transport error: {0}")]
    Transport(String),

    /// No response arrived within the allowed window.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// Pairing URI could not be parsed.
    #[error("invalid uri: {0}")]
    InvalidUri(String),

    /// The peer answered with a JSON-RPC error.
    #[error("{message}")]
    Rejected {
        /// Protocol error code
        code: i64,
        /// Human-readable reason supplied by the peer
        message: String,
    },

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SignkitError {
    /// Get the error code for FFI/mobile integration.
    pub fn code(&self) -> SignkitErrorCode {
        match self {
            Self::ValidationFailed(_) => SignkitErrorCode::ValidationFailed,
            Self::NoMatchingKey { .. } => SignkitErrorCode::NoMatchingKey,
            Self::MismatchedTopic { .. } => SignkitErrorCode::MismatchedTopic,
            Self::Expired { .. } => SignkitErrorCode::Expired,
            Self::ProposalExpired => SignkitErrorCode::ProposalExpired,
            Self::Encoding(_) => SignkitErrorCode::Encoding,
            Self::Decoding(_) => SignkitErrorCode::Decoding,
            Self::PublishFailed(_) => SignkitErrorCode::PublishFailed,
            Self::Transport(_) => SignkitErrorCode::Transport,
            Self::Timeout { .. } => SignkitErrorCode::Timeout,
            Self::InvalidUri(_) => SignkitErrorCode::InvalidUri,
            Self::Rejected { .. } => SignkitErrorCode::Rejected,
            Self::Storage(_) => SignkitErrorCode::Storage,
            Self::Serialization(_) => SignkitErrorCode::Serialization,
            Self::Internal(_) => SignkitErrorCode::Internal,
        }
    }

    /// Returns true if this error is potentially recoverable by retrying.
    ///
    /// Crypto failures are never retryable: an envelope that failed to open
    /// will fail the same way next time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PublishFailed(_) | Self::Transport(_) | Self::Timeout { .. } | Self::Storage(_)
        )
    }

    /// Create a no matching key error.
    pub fn no_matching_key(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NoMatchingKey {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
        }
    }

    /// Create an expired error.
    pub fn expired(resource_type: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::Expired {
            resource_type: resource_type.into(),
            identifier: identifier.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a validation error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailed(reason.into())
    }

    /// Convert into the JSON-RPC error sent to a peer.
    ///
    /// Local-only failures are reported to the peer as their closest protocol
    /// counterpart so no internal detail leaks over the wire.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::Rejected { code, message } => JsonRpcError::new(*code, message.clone()),
            Self::NoMatchingKey { .. } => SdkError::NoMatchingKey.with_context(&self.to_string()),
            Self::Expired { .. } | Self::ProposalExpired => {
                SdkError::Expired.with_context(&self.to_string())
            }
            other => SdkError::InvalidMethod.with_context(&other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SignkitError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SignkitError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<JsonRpcError> for SignkitError {
    fn from(err: JsonRpcError) -> Self {
        Self::Rejected {
            code: err.code,
            message: err.message,
        }
    }
}

/// Protocol error catalogue used in JSON-RPC error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdkError {
    NoMatchingKey,
    Expired,
    InvalidMethod,
    InvalidEvent,
    InvalidUpdateRequest,
    InvalidExtendRequest,
    InvalidSessionSettleRequest,
    UnauthorizedMethod,
    UnauthorizedEvent,
    UnauthorizedUpdateRequest,
    UnauthorizedExtendRequest,
    UserRejected,
    UnsupportedChains,
    UnsupportedMethods,
    UnsupportedEvents,
    UnsupportedAccounts,
    UnsupportedNamespaceKey,
    UserDisconnected,
    SessionSettlementFailed,
    WcMethodUnsupported,
}

impl SdkError {
    pub fn code(&self) -> i64 {
        match self {
            Self::NoMatchingKey => 2,
            Self::Expired => 8,
            Self::InvalidMethod => 1001,
            Self::InvalidEvent => 1002,
            Self::InvalidUpdateRequest => 1003,
            Self::InvalidExtendRequest => 1004,
            Self::InvalidSessionSettleRequest => 1005,
            Self::UnauthorizedMethod => 3001,
            Self::UnauthorizedEvent => 3002,
            Self::UnauthorizedUpdateRequest => 3003,
            Self::UnauthorizedExtendRequest => 3004,
            Self::UserRejected => 5000,
            Self::UnsupportedChains => 5100,
            Self::UnsupportedMethods => 5101,
            Self::UnsupportedEvents => 5102,
            Self::UnsupportedAccounts => 5103,
            Self::UnsupportedNamespaceKey => 5104,
            Self::UserDisconnected => 6000,
            Self::SessionSettlementFailed => 7000,
            Self::WcMethodUnsupported => 10001,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::NoMatchingKey => "No matching key.",
            Self::Expired => "Expired.",
            Self::InvalidMethod => "Invalid method.",
            Self::InvalidEvent => "Invalid event.",
            Self::InvalidUpdateRequest => "Invalid update request.",
            Self::InvalidExtendRequest => "Invalid extend request.",
            Self::InvalidSessionSettleRequest => "Invalid session settle request.",
            Self::UnauthorizedMethod => "Unauthorized method.",
            Self::UnauthorizedEvent => "Unauthorized event.",
            Self::UnauthorizedUpdateRequest => "Unauthorized update request.",
            Self::UnauthorizedExtendRequest => "Unauthorized extend request.",
            Self::UserRejected => "User rejected.",
            Self::UnsupportedChains => "Unsupported chains.",
            Self::UnsupportedMethods => "Unsupported methods.",
            Self::UnsupportedEvents => "Unsupported events.",
            Self::UnsupportedAccounts => "Unsupported accounts.",
            Self::UnsupportedNamespaceKey => "Unsupported namespace key.",
            Self::UserDisconnected => "User disconnected.",
            Self::SessionSettlementFailed => "Session settlement failed.",
            Self::WcMethodUnsupported => "Unsupported wc_ method.",
        }
    }

    /// The bare error object.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError::new(self.code(), self.message())
    }

    /// The error object with extra context appended to the message.
    pub fn with_context(&self, context: &str) -> JsonRpcError {
        JsonRpcError::new(self.code(), format!("{} {}", self.message(), context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SignkitError::timeout("wc_sessionPing", std::time::Duration::from_secs(30));
        assert_eq!(err.code(), SignkitErrorCode::Timeout);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("30000ms"));

        let err = SignkitError::Decoding("bad tag".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rejected_displays_peer_message() {
        let err: SignkitError = SdkError::UserRejected.to_rpc_error().into();
        assert_eq!(err.to_string(), "User rejected.");
        assert_eq!(err.code(), SignkitErrorCode::Rejected);
    }

    #[test]
    fn test_helper_constructors() {
        let err = SignkitError::no_matching_key("session", "abc");
        assert_eq!(err.code(), SignkitErrorCode::NoMatchingKey);
        assert_eq!(err.to_rpc_error().code, 2);

        let err = SignkitError::expired("proposal", "1");
        assert_eq!(err.to_rpc_error().code, 8);
    }
}
