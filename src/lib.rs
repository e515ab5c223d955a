#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # messagedb
//!
//! Async client for [Message DB], the PostgreSQL-backed message store, with
//! event-sourcing primitives on top:
//!
//! - **Optimistic-concurrency writes**: append to a stream only when it sits
//!   at the version you expect
//! - **Batched reads**: streams in version order, categories in global
//!   position order, with correlation filtering and consumer-group
//!   partitioning
//! - **Live subscriptions**: long-lived polling tasks with liveness
//!   tracking and pluggable, adaptive polling strategies
//! - **Decentralized consumer groups**: leader election, membership,
//!   partition assignment and work carry-over, coordinated entirely through
//!   the store itself with no broker and no lock service
//!
//! [Message DB]: https://github.com/message-db/message-db
//!
//! ## Writing and reading
//!
//! ```no_run
//! use messagedb::{Client, GetStreamOptions, ProposedMessage, StreamIdentifier, NO_STREAM_VERSION};
//! use std::sync::Arc;
//! use tokio_postgres::NoTls;
//!
//! #[tokio::main]
//! async fn main() -> messagedb::Result<()> {
//!     let (pg, connection) =
//!         tokio_postgres::connect("host=localhost user=message_store", NoTls).await?;
//!     tokio::spawn(connection);
//!     let client = Client::new(Arc::new(pg));
//!
//!     let stream = StreamIdentifier::new("account", "123");
//!     let deposited = ProposedMessage::new("Deposited", &serde_json::json!({"amount": 100}))?;
//!     let version = client.write_message(&stream, &deposited, NO_STREAM_VERSION).await?;
//!     assert_eq!(version, 0);
//!
//!     for message in client.get_stream_messages(&stream, &GetStreamOptions::new()).await? {
//!         println!("{} v{}", message.message_type, message.version);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Subscribing
//!
//! ```no_run
//! # async fn example(client: messagedb::Client) -> messagedb::Result<()> {
//! use messagedb::GetCategoryOptions;
//! use tokio_util::sync::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let handle = client.subscribe_to_category(
//!     token.clone(),
//!     "account",
//!     |message| println!("{} @ {}", message.message_type, message.global_position),
//!     |live| println!("live: {live}"),
//!     |err| if let Some(err) = err { eprintln!("dropped: {err}") },
//!     GetCategoryOptions::new(),
//! )?;
//!
//! token.cancel();
//! # handle.await.ok();
//! # Ok(())
//! # }
//! ```
//!
//! Consumer groups live in the [`consumer`] module.

mod client;
mod error;
mod message;
mod options;
mod polling;
mod subscription;

pub mod consumer;

pub use client::{Client, CORRELATION_KEY};
pub use error::{MessageDbError, Result};
pub use message::{
    Message, ProposedMessage, StreamIdentifier, ANY_VERSION, NO_STREAM_VERSION,
    STREAM_NAME_SEPARATOR,
};
pub use options::{GetCategoryOptions, GetStreamOptions};
pub use polling::{
    ConstantPolling, DynamicPolling, ExpBackoffPolling, PollingFactory, PollingStrategy,
    DEFAULT_POLLING_INTERVAL,
};
