//! Error types for turbine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Staging error: {0}")]
    Staging(#[from] StagingError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required metadata key: {0}")]
    MissingMetadata(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task envelope validation and codec errors.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Empty local path")]
    EmptyPath,

    #[error("Local path must be relative: {0}")]
    AbsolutePath(String),

    #[error("Local path escapes the working directory: {0}")]
    Traversal(String),

    #[error("Invalid object URI {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Malformed envelope payload: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Broker and queue client errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Topic {0} not found")]
    TopicNotFound(String),

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(String),

    #[error("Topic {topic} still has subscription {subscription} attached")]
    TopicInUse { topic: String, subscription: String },

    #[error("Lease {ack_id} is unknown or already released")]
    UnknownLease { ack_id: String },

    #[error("Lease {ack_id} expired before it was settled")]
    LeaseExpired { ack_id: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Envelope codec error: {0}")]
    Codec(#[from] EnvelopeError),
}

impl QueueError {
    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// The broker could not be reached, even after retrying. The call's
    /// outcome is unknown, not refused.
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RetriesExhausted { .. })
    }
}

/// Object staging errors.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Invalid envelope path: {0}")]
    Path(#[from] EnvelopeError),

    #[error("Object {uri} not found")]
    ObjectNotFound { uri: String },

    #[error("No object store registered for scheme {0}")]
    UnsupportedScheme(String),

    #[error("Transfer of {uri} timed out after {timeout:?}")]
    Timeout { uri: String, timeout: Duration },

    #[error("Transfer of {uri} failed: {reason}")]
    Transfer { uri: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Script execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn script: {0}")]
    Spawn(std::io::Error),

    #[error("Script timed out after {0:?}")]
    Timeout(Duration),

    #[error("Script wait failed: {0}")]
    Wait(std::io::Error),
}

/// Compute fleet and provisioning errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Instance template {0} already exists")]
    TemplateExists(String),

    #[error("Instance template {0} not found")]
    TemplateNotFound(String),

    #[error("Instance group {0} already exists")]
    GroupExists(String),

    #[error("Instance group {0} not found")]
    GroupNotFound(String),

    #[error("Instance {instance} is not a member of group {group}")]
    UnknownInstance { group: String, instance: String },

    #[error("Fleet {group} still has {count} live instance(s); call stop() first")]
    LiveWorkers { group: String, count: usize },

    #[error("Invalid fleet request: {0}")]
    InvalidRequest(String),

    #[error("Control plane error: {0}")]
    ControlPlane(String),
}

/// Result type alias for turbine.
pub type Result<T> = std::result::Result<T, Error>;
