//! Messages, proposed messages and stream identifiers.
//!
//! A Message DB stream name is `category-id`. Categories may not contain the
//! separator; IDs may, so parsing splits on the first occurrence only.

use crate::error::{MessageDbError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Expected version for a stream that must not yet exist.
pub const NO_STREAM_VERSION: i64 = -1;

/// Expected version that disables the optimistic-concurrency check.
pub const ANY_VERSION: i64 = -2;

/// Character separating the category from the ID in a stream name.
pub const STREAM_NAME_SEPARATOR: char = '-';

/// The two components of a Message DB stream name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamIdentifier {
    /// Stream category; must not contain the separator
    pub category: String,
    /// Stream ID within the category
    pub id: String,
}

impl StreamIdentifier {
    /// Create a stream identifier from its components.
    ///
    /// Validation happens at the operation boundary, not here, so invalid
    /// identifiers can be constructed but not used.
    pub fn new(category: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            id: id.into(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.category.is_empty() {
            return Err(MessageDbError::MissingCategory);
        }
        if self.category.contains(STREAM_NAME_SEPARATOR) {
            return Err(MessageDbError::InvalidCategory);
        }
        if self.id.is_empty() {
            return Err(MessageDbError::MissingStreamId);
        }
        Ok(())
    }
}

impl fmt::Display for StreamIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.category, STREAM_NAME_SEPARATOR, self.id)
    }
}

impl FromStr for StreamIdentifier {
    type Err = MessageDbError;

    fn from_str(s: &str) -> Result<Self> {
        let (category, id) = s
            .split_once(STREAM_NAME_SEPARATOR)
            .ok_or_else(|| MessageDbError::MalformedStreamName(s.to_string()))?;
        if category.is_empty() || id.is_empty() {
            return Err(MessageDbError::MalformedStreamName(s.to_string()));
        }
        Ok(Self::new(category, id))
    }
}

/// A message read back from Message DB.
///
/// `data` and `metadata` stay opaque JSON until the caller asks for a
/// concrete type via [`Message::unmarshal_data`] or
/// [`Message::unmarshal_metadata`].
#[derive(Debug, Clone)]
pub struct Message {
    /// Message ID assigned at write time
    pub id: String,
    /// Stream the message belongs to
    pub stream: StreamIdentifier,
    /// Message type
    pub message_type: String,
    /// Per-stream version, starting at 0
    pub version: i64,
    /// Store-wide strictly increasing position
    pub global_position: i64,
    /// Store-assigned write time
    pub timestamp: DateTime<Utc>,
    data: Option<String>,
    metadata: Option<String>,
}

impl Message {
    pub(crate) fn new(
        id: String,
        stream: StreamIdentifier,
        message_type: String,
        version: i64,
        global_position: i64,
        timestamp: DateTime<Utc>,
        data: Option<String>,
        metadata: Option<String>,
    ) -> Self {
        Self {
            id,
            stream,
            message_type,
            version,
            global_position,
            timestamp,
            data,
            metadata,
        }
    }

    /// Deserialize the message data into the caller's type.
    pub fn unmarshal_data<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.data.as_deref().unwrap_or("null"))?)
    }

    /// Deserialize the message metadata into the caller's type.
    pub fn unmarshal_metadata<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(
            self.metadata.as_deref().unwrap_or("null"),
        )?)
    }
}

/// A message proposed for writing.
#[derive(Debug, Clone)]
pub struct ProposedMessage {
    /// Message ID; must be unique store-wide
    pub id: Uuid,
    /// Message type
    pub message_type: String,
    /// Message payload as JSON; required
    pub data: serde_json::Value,
    /// Optional metadata as JSON
    pub metadata: Option<serde_json::Value>,
}

impl ProposedMessage {
    /// Propose a message with a fresh v4 ID and the given payload.
    pub fn new<D: Serialize>(message_type: impl Into<String>, data: &D) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            data: serde_json::to_value(data)?,
            metadata: None,
        })
    }

    /// Attach metadata to the proposal.
    pub fn with_metadata<M: Serialize>(mut self, metadata: &M) -> Result<Self> {
        self.metadata = Some(serde_json::to_value(metadata)?);
        Ok(self)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.message_type.is_empty() {
            return Err(MessageDbError::MissingType);
        }
        if self.data.is_null() {
            return Err(MessageDbError::MissingData);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_identifier_round_trip() {
        let si = StreamIdentifier::new("account", "1234");
        let parsed: StreamIdentifier = si.to_string().parse().unwrap();
        assert_eq!(parsed, si);
    }

    #[test]
    fn test_stream_identifier_id_may_contain_separator() {
        let parsed: StreamIdentifier = "account-1234-5678".parse().unwrap();
        assert_eq!(parsed.category, "account");
        assert_eq!(parsed.id, "1234-5678");
        assert_eq!(parsed.to_string(), "account-1234-5678");
    }

    #[test]
    fn test_stream_identifier_validation() {
        assert!(matches!(
            StreamIdentifier::new("", "1").validate(),
            Err(MessageDbError::MissingCategory)
        ));
        assert!(matches!(
            StreamIdentifier::new("a-b", "1").validate(),
            Err(MessageDbError::InvalidCategory)
        ));
        assert!(matches!(
            StreamIdentifier::new("a", "").validate(),
            Err(MessageDbError::MissingStreamId)
        ));
        assert!(StreamIdentifier::new("a", "1").validate().is_ok());
    }

    #[test]
    fn test_malformed_stream_names() {
        assert!("plain".parse::<StreamIdentifier>().is_err());
        assert!("-id".parse::<StreamIdentifier>().is_err());
        assert!("category-".parse::<StreamIdentifier>().is_err());
    }

    #[test]
    fn test_proposed_message_validation() {
        let msg = ProposedMessage::new("Opened", &serde_json::json!({"owner": "a"})).unwrap();
        assert!(msg.validate().is_ok());

        let mut untyped = msg.clone();
        untyped.message_type = String::new();
        assert!(matches!(
            untyped.validate(),
            Err(MessageDbError::MissingType)
        ));

        let mut empty = msg;
        empty.data = serde_json::Value::Null;
        assert!(matches!(empty.validate(), Err(MessageDbError::MissingData)));
    }

    #[test]
    fn test_unmarshal_data_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Payload {
            owner: String,
            amount: i64,
        }

        let payload = Payload {
            owner: "a".into(),
            amount: 42,
        };
        let msg = Message::new(
            Uuid::new_v4().to_string(),
            StreamIdentifier::new("account", "1"),
            "Opened".into(),
            0,
            1,
            Utc::now(),
            Some(serde_json::to_string(&payload).unwrap()),
            None,
        );

        assert_eq!(msg.unmarshal_data::<Payload>().unwrap(), payload);
        assert!(msg.unmarshal_metadata::<Payload>().is_err());
    }
}
