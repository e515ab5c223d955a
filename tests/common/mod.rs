//! Shared fixtures for integration tests.
//!
//! These tests exercise a live Message DB instance and are skipped unless
//! `MESSAGE_DB_URL` points at one, e.g.:
//!
//! ```text
//! MESSAGE_DB_URL="host=localhost user=message_store password=... \
//!     options=-csearch_path=message_store,public" cargo test
//! ```
//!
//! The consumer-group tests assume a dedicated, near-empty store: milestones
//! cover absolute global-position ranges, so a store with a long history
//! takes many milestone cycles before dispatch reaches fresh messages.

#![allow(dead_code)]

use messagedb::{Client, ProposedMessage, StreamIdentifier, ANY_VERSION};
use std::sync::Arc;
use tokio_postgres::NoTls;
use uuid::Uuid;

/// Connect to the store named by `MESSAGE_DB_URL`, or `None` to skip the
/// test when no store is available.
pub async fn connect() -> Option<Client> {
    let url = std::env::var("MESSAGE_DB_URL").ok()?;
    let (pg, connection) = tokio_postgres::connect(&url, NoTls)
        .await
        .expect("connecting to message db");
    tokio::spawn(connection);
    Some(Client::new(Arc::new(pg)))
}

/// A category name unique to this test run; never contains the stream name
/// separator.
pub fn unique_category(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

/// Write `count` plain test messages to the stream, in order.
pub async fn populate(client: &Client, stream: &StreamIdentifier, count: usize) {
    for n in 0..count {
        let message = ProposedMessage::new("TestEvent", &serde_json::json!({ "n": n }))
            .expect("building message");
        client
            .write_message(stream, &message, ANY_VERSION)
            .await
            .expect("populating stream");
    }
}
