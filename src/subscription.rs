//! Live-tailing subscriptions.
//!
//! A subscription is a long-lived tokio task that repeatedly reads a batch
//! from its cursor, hands each message to the caller's handler in order, and
//! then sleeps for however long its polling strategy dictates. A read that
//! comes back shorter than the batch size means the subscription has caught
//! up with the tail ("live"); a full batch means it has fallen behind again.
//! Both transitions are reported through the liveness handler.
//!
//! A subscription ends in exactly one of two ways, and the dropped handler
//! fires exactly once either way: the token is cancelled (`None`) or a read
//! fails (`Some(error)`).

use crate::client::{validate_category, Client};
use crate::error::{MessageDbError, Result};
use crate::message::{Message, StreamIdentifier};
use crate::options::{GetCategoryOptions, GetStreamOptions};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

impl Client {
    /// Subscribe to a stream, passing messages to `on_message` in ascending
    /// version order.
    ///
    /// `on_liveness` receives `true` once the subscription catches up with
    /// the tail and `false` if it later falls behind. `on_dropped` fires
    /// exactly once when the subscription stops: with `None` after
    /// cancellation, or with the terminating error.
    pub fn subscribe_to_stream<M, L, D>(
        &self,
        token: CancellationToken,
        stream: &StreamIdentifier,
        on_message: M,
        on_liveness: L,
        on_dropped: D,
        options: GetStreamOptions,
    ) -> Result<JoinHandle<()>>
    where
        M: FnMut(Message) + Send + 'static,
        L: FnMut(bool) + Send + 'static,
        D: FnOnce(Option<MessageDbError>) + Send + 'static,
    {
        stream.validate()?;
        options.validate()?;

        let client = self.clone();
        let stream = stream.clone();
        Ok(tokio::spawn(async move {
            let outcome = stream_loop(client, &token, stream, options, on_message, on_liveness)
                .await;
            on_dropped(outcome.err());
        }))
    }

    /// Subscribe to a category, passing messages to `on_message` in
    /// ascending global position order.
    ///
    /// Liveness and dropped semantics match
    /// [`subscribe_to_stream`](Client::subscribe_to_stream).
    pub fn subscribe_to_category<M, L, D>(
        &self,
        token: CancellationToken,
        category: &str,
        on_message: M,
        on_liveness: L,
        on_dropped: D,
        options: GetCategoryOptions,
    ) -> Result<JoinHandle<()>>
    where
        M: FnMut(Message) + Send + 'static,
        L: FnMut(bool) + Send + 'static,
        D: FnOnce(Option<MessageDbError>) + Send + 'static,
    {
        validate_category(category)?;
        options.validate()?;

        let client = self.clone();
        let category = category.to_string();
        Ok(tokio::spawn(async move {
            let outcome =
                category_loop(client, &token, category, options, on_message, on_liveness).await;
            on_dropped(outcome.err());
        }))
    }
}

/// Poll loop for a stream subscription. Returns `Ok(())` on cancellation.
async fn stream_loop<M, L>(
    client: Client,
    token: &CancellationToken,
    stream: StreamIdentifier,
    mut options: GetStreamOptions,
    mut on_message: M,
    mut on_liveness: L,
) -> Result<()>
where
    M: FnMut(Message),
    L: FnMut(bool),
{
    let factory = options
        .polling
        .take()
        .unwrap_or_else(|| client.polling.clone());
    let mut polling = crate::polling::mint(&factory);
    let batch_size = options.effective_batch_size();
    let mut live = false;

    loop {
        let messages = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = client.get_stream_messages(&stream, &options) => read?,
        };

        let retrieved = messages.len() as i64;
        for message in messages {
            options.version = message.version + 1;
            on_message(message);
        }

        if retrieved < batch_size && !live {
            live = true;
            debug!(stream = %stream, "subscription caught up");
            on_liveness(live);
        } else if retrieved == batch_size && live {
            live = false;
            debug!(stream = %stream, "subscription fell behind");
            on_liveness(live);
        }

        let delay = polling.next_delay(retrieved, batch_size);
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Poll loop for a category subscription. Returns `Ok(())` on cancellation.
async fn category_loop<M, L>(
    client: Client,
    token: &CancellationToken,
    category: String,
    mut options: GetCategoryOptions,
    mut on_message: M,
    mut on_liveness: L,
) -> Result<()>
where
    M: FnMut(Message),
    L: FnMut(bool),
{
    let factory = options
        .polling
        .take()
        .unwrap_or_else(|| client.polling.clone());
    let mut polling = crate::polling::mint(&factory);
    let batch_size = options.effective_batch_size();
    let mut live = false;

    loop {
        let messages = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = client.get_category_messages(&category, &options) => read?,
        };

        let retrieved = messages.len() as i64;
        for message in messages {
            options.position = message.global_position + 1;
            on_message(message);
        }

        if retrieved < batch_size && !live {
            live = true;
            debug!(category = %category, "subscription caught up");
            on_liveness(live);
        } else if retrieved == batch_size && live {
            live = false;
            debug!(category = %category, "subscription fell behind");
            on_liveness(live);
        }

        let delay = polling.next_delay(retrieved, batch_size);
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
