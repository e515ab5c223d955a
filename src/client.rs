//! The Message DB client.
//!
//! Wraps a connected [`tokio_postgres::Client`] and exposes the five store
//! procedures: OCC writes, stream and category reads, last-message and
//! stream-version queries. Connection opening and pooling are the caller's
//! concern; the client itself is cheap to clone and safe to share.

use crate::error::{MessageDbError, Result};
use crate::message::{
    Message, ProposedMessage, StreamIdentifier, ANY_VERSION, NO_STREAM_VERSION,
    STREAM_NAME_SEPARATOR,
};
use crate::options::{GetCategoryOptions, GetStreamOptions};
use crate::polling::{ConstantPolling, PollingFactory, DEFAULT_POLLING_INTERVAL};
use std::sync::Arc;
use tokio_postgres::Row;

/// Metadata key a component uses to tag an outbound message with its origin
/// stream; category reads can filter on it.
pub const CORRELATION_KEY: &str = "correlationStreamName";

// Procedure call texts. Argument order is part of the wire contract.
const WRITE_MESSAGE_SQL: &str = "SELECT write_message($1, $2, $3, $4, $5, $6)";
const GET_STREAM_MESSAGES_SQL: &str = "SELECT * FROM get_stream_messages($1, $2, $3, $4)";
const GET_CATEGORY_MESSAGES_SQL: &str =
    "SELECT * FROM get_category_messages($1, $2, $3, $4, $5, $6, $7)";
const GET_LAST_STREAM_MESSAGE_SQL: &str = "SELECT * FROM get_last_stream_message($1)";
const GET_STREAM_VERSION_SQL: &str = "SELECT * FROM stream_version($1)";

/// Message DB client.
///
/// ```no_run
/// # async fn example() -> messagedb::Result<()> {
/// use std::sync::Arc;
/// use tokio_postgres::NoTls;
///
/// let (pg, connection) =
///     tokio_postgres::connect("host=localhost user=message_store", NoTls).await?;
/// tokio::spawn(connection);
///
/// let client = messagedb::Client::new(Arc::new(pg));
/// let version = client
///     .get_stream_version(&messagedb::StreamIdentifier::new("account", "123"))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    db: Arc<tokio_postgres::Client>,
    pub(crate) polling: PollingFactory,
}

impl Client {
    /// Create a client over an established connection, with the default
    /// constant 100ms polling strategy for subscriptions.
    pub fn new(db: Arc<tokio_postgres::Client>) -> Self {
        Self {
            db,
            polling: ConstantPolling::factory(DEFAULT_POLLING_INTERVAL),
        }
    }

    /// Replace the default polling strategy used by subscriptions that do
    /// not specify their own.
    pub fn with_polling(mut self, factory: PollingFactory) -> Self {
        self.polling = factory;
        self
    }

    /// Write the proposed message to the specified stream.
    ///
    /// `expected_version` is the optimistic-concurrency check:
    /// [`NO_STREAM_VERSION`] requires the stream not to exist yet,
    /// [`ANY_VERSION`] skips the check, and any non-negative value requires
    /// the stream to currently sit at exactly that version. A failed check
    /// returns [`MessageDbError::UnexpectedStreamVersion`].
    ///
    /// Returns the version the message was written at.
    pub async fn write_message(
        &self,
        stream: &StreamIdentifier,
        message: &ProposedMessage,
        expected_version: i64,
    ) -> Result<i64> {
        stream.validate()?;
        message.validate()?;

        let data = serde_json::to_string(&message.data)?;
        let metadata = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        // ANY_VERSION travels as NULL to skip the store's OCC check.
        let expected = if expected_version == ANY_VERSION {
            None
        } else {
            Some(expected_version)
        };

        let row = self
            .db
            .query_one(
                WRITE_MESSAGE_SQL,
                &[
                    &message.id.to_string(),
                    &stream.to_string(),
                    &message.message_type,
                    &data,
                    &metadata,
                    &expected,
                ],
            )
            .await
            .map_err(map_write_error)?;

        Ok(row.try_get(0)?)
    }

    /// Read messages from an individual stream in ascending version order.
    pub async fn get_stream_messages(
        &self,
        stream: &StreamIdentifier,
        options: &GetStreamOptions,
    ) -> Result<Vec<Message>> {
        stream.validate()?;
        options.validate()?;

        let rows = self
            .db
            .query(
                GET_STREAM_MESSAGES_SQL,
                &[
                    &stream.to_string(),
                    &options.version,
                    &options.effective_batch_size(),
                    &options.condition,
                ],
            )
            .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Read messages from a category in ascending global position order,
    /// optionally filtered by correlation and partitioned across a consumer
    /// group.
    pub async fn get_category_messages(
        &self,
        category: &str,
        options: &GetCategoryOptions,
    ) -> Result<Vec<Message>> {
        validate_category(category)?;
        options.validate()?;

        let (member, size) = options.consumer_group_params();
        let rows = self
            .db
            .query(
                GET_CATEGORY_MESSAGES_SQL,
                &[
                    &category,
                    &options.position,
                    &options.effective_batch_size(),
                    &options.correlation,
                    &member,
                    &size,
                    &options.condition,
                ],
            )
            .await?;

        rows.iter().map(message_from_row).collect()
    }

    /// Return the last message of the stream, or `None` when the stream is
    /// empty.
    pub async fn get_last_stream_message(
        &self,
        stream: &StreamIdentifier,
    ) -> Result<Option<Message>> {
        stream.validate()?;

        let rows = self
            .db
            .query(GET_LAST_STREAM_MESSAGE_SQL, &[&stream.to_string()])
            .await?;

        rows.first().map(message_from_row).transpose()
    }

    /// Return the current version of the stream, or [`NO_STREAM_VERSION`]
    /// when it does not exist.
    pub async fn get_stream_version(&self, stream: &StreamIdentifier) -> Result<i64> {
        stream.validate()?;

        let row = self
            .db
            .query_one(GET_STREAM_VERSION_SQL, &[&stream.to_string()])
            .await?;

        let version: Option<i64> = row.try_get(0)?;
        Ok(version.unwrap_or(NO_STREAM_VERSION))
    }
}

pub(crate) fn validate_category(category: &str) -> Result<()> {
    if category.is_empty() {
        return Err(MessageDbError::MissingCategory);
    }
    if category.contains(STREAM_NAME_SEPARATOR) {
        return Err(MessageDbError::InvalidCategory);
    }
    Ok(())
}

/// The store reports a failed OCC check as a raised exception whose text
/// contains "Wrong expected version".
fn map_write_error(err: tokio_postgres::Error) -> MessageDbError {
    let wrong_version = err
        .as_db_error()
        .is_some_and(|db| db.message().contains("Wrong expected version"));
    if wrong_version {
        MessageDbError::UnexpectedStreamVersion
    } else {
        MessageDbError::Database(err)
    }
}

/// Decode one `messages` row: (id, stream_name, type, position,
/// global_position, data, metadata, time).
fn message_from_row(row: &Row) -> Result<Message> {
    let id: String = row.try_get(0)?;
    let stream_name: String = row.try_get(1)?;
    let message_type: String = row.try_get(2)?;
    let version: i64 = row.try_get(3)?;
    let global_position: i64 = row.try_get(4)?;
    let data: Option<String> = row.try_get(5)?;
    let metadata: Option<String> = row.try_get(6)?;
    let time: chrono::NaiveDateTime = row.try_get(7)?;

    Ok(Message::new(
        id,
        stream_name.parse()?,
        message_type,
        version,
        global_position,
        time.and_utc(),
        data,
        metadata,
    ))
}
