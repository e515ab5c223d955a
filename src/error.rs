//! Error types for the Message DB client.

use thiserror::Error;

/// Result type alias for Message DB operations
pub type Result<T> = std::result::Result<T, MessageDbError>;

/// Errors produced by the client, subscriptions and the consumer-group
/// coordinator.
///
/// `UnexpectedStreamVersion` is the optimistic-concurrency signal: the stream
/// moved between reading its version and writing against it. Inside the
/// coordinator it is routine (a lost race) and is dropped; direct callers of
/// [`Client::write_message`](crate::Client::write_message) should treat it as
/// "reload and retry if still relevant".
#[derive(Error, Debug)]
pub enum MessageDbError {
    /// The stream was not at the expected version when writing a message
    #[error("unexpected stream version when writing message")]
    UnexpectedStreamVersion,

    /// Proposed message is missing its type
    #[error("proposed message must include a type")]
    MissingType,

    /// Proposed message carries no data
    #[error("proposed message must include data")]
    MissingData,

    /// Stream identifier category is blank
    #[error("stream category cannot be blank")]
    MissingCategory,

    /// Stream identifier category contains the reserved separator
    #[error("stream category cannot contain the stream name separator (-)")]
    InvalidCategory,

    /// Stream identifier ID is blank
    #[error("stream ID cannot be blank")]
    MissingStreamId,

    /// A stream name could not be split into category and ID
    #[error("malformed stream name: {0}")]
    MalformedStreamName(String),

    /// Read options are out of range
    #[error("invalid read options: {0}")]
    InvalidOptions(String),

    /// A coordination-stream message carries a type the projection does not
    /// recognize
    #[error("unknown consumer group event type: {0}")]
    UnknownEventType(String),

    /// Driver-level failure talking to the store
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// JSON encoding or decoding failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
