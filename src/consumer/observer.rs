//! Read-only observation of a consumer group.

use crate::consumer::coordinator::GroupClient;
use crate::consumer::events::GroupEvent;
use crate::consumer::state::GroupState;
use crate::consumer::GROUP_CATEGORY;
use crate::error::{MessageDbError, Result};
use crate::message::{Message, StreamIdentifier};
use crate::options::GetStreamOptions;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

impl GroupClient {
    /// Build the group's state by tailing its coordination stream, calling
    /// `handler` with the projection, the event just applied, and whether
    /// the observation has caught up with the stream. Never writes.
    pub fn observe_group<H>(
        &self,
        token: CancellationToken,
        group: &str,
        mut handler: H,
    ) -> Result<JoinHandle<()>>
    where
        H: FnMut(&GroupState, &GroupEvent, bool) + Send + 'static,
    {
        let stream = StreamIdentifier::new(GROUP_CATEGORY, group);
        stream.validate()?;

        // The observation's state, shared between the subscription's
        // message and liveness callbacks. Both run on the subscription
        // task, so the lock is never contended.
        struct Observation {
            state: GroupState,
            live: bool,
        }
        let observation = Arc::new(Mutex::new(Observation {
            state: GroupState::new(group, ""),
            live: false,
        }));

        let on_message = {
            let observation = Arc::clone(&observation);
            move |message: Message| {
                let mut obs = observation.lock();
                let live = obs.live;
                if let Some(event) = obs.state.apply_message(&message) {
                    handler(&obs.state, &event, live);
                }
            }
        };

        let on_liveness = {
            let observation = Arc::clone(&observation);
            move |live: bool| {
                observation.lock().live = live;
            }
        };

        let group_name = group.to_string();
        let on_dropped = move |err: Option<MessageDbError>| {
            if let Some(err) = err {
                warn!(group = %group_name, error = %err, "group observation dropped");
            }
        };

        self.client.subscribe_to_stream(
            token,
            &stream,
            on_message,
            on_liveness,
            on_dropped,
            GetStreamOptions::new(),
        )
    }
}
