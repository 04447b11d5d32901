//! Error types for queue operations and the transport built on top of them.

use chrono::Duration;
use thiserror::Error;

/// Error raised by a queue client capability
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or lease token no longer valid: {lease_token}")]
    MessageNotFound { lease_token: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::ProviderError { .. } => true,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }
}

/// Errors while converting between transport messages and queue payloads
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Payload is not a valid message envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Error surfaced by the transport to the message bus
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error(
        "This transport is a one-way client and cannot receive messages; \
         create it with an input queue to receive"
    )]
    OneWayClient,

    #[error("Could not send message with ID {message_id} to '{destination}': {source}")]
    SendFailed {
        message_id: String,
        destination: String,
        #[source]
        source: QueueError,
    },

    #[error("Could not delete message with ID {message_id} and lease token {lease_token}: {source}")]
    DeleteFailed {
        message_id: String,
        lease_token: String,
        #[source]
        source: QueueError,
    },

    #[error("Could not purge queue '{queue_name}': {source}")]
    PurgeFailed {
        queue_name: String,
        #[source]
        source: QueueError,
    },

    #[error("Could not create queue '{queue_name}': {source}")]
    CreateFailed {
        queue_name: String,
        #[source]
        source: QueueError,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl TransportError {
    /// Check if error is transient and the operation may succeed when retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SendFailed { source, .. }
            | Self::DeleteFailed { source, .. }
            | Self::PurgeFailed { source, .. }
            | Self::CreateFailed { source, .. }
            | Self::Queue(source) => source.is_transient(),
            Self::Cancelled => true,
            Self::Configuration(_) | Self::OneWayClient | Self::Codec(_) => false,
        }
    }
}

impl From<ValidationError> for TransportError {
    fn from(err: ValidationError) -> Self {
        Self::Configuration(ConfigurationError::Validation(err))
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
