//! Coordination events.
//!
//! Everything a consumer group agrees on travels as one of three event
//! shapes through the group's coordination stream. Applying them in stream
//! order is the only way group state is ever built, so `apply` must stay
//! deterministic: same prefix, same state, on every consumer.

use crate::consumer::state::{ConsumerState, GroupState, Milestone};
use crate::error::{MessageDbError, Result};
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type for [`LeaderDeclared`].
pub const LEADER_DECLARED_EVENT_TYPE: &str = "LeaderDeclared";
/// Event type for [`ConsumerCheckedIn`].
pub const CONSUMER_CHECKED_IN_EVENT_TYPE: &str = "ConsumerCheckedIn";
/// Event type for [`MilestoneStarted`].
pub const MILESTONE_STARTED_EVENT_TYPE: &str = "MilestoneStarted";

/// A consumer declares itself leader until `until`. The incumbent may extend
/// its lease by declaring again before expiry; anyone else may take over
/// once the lease lapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderDeclared {
    pub group_name: String,
    pub consumer_id: String,
    pub until: DateTime<Utc>,
}

/// Periodic progress report from one consumer. A check-in with
/// `milestone_complete` set moves the consumer into the idle set, making it
/// eligible for the next milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerCheckedIn {
    pub group_name: String,
    pub consumer_state: ConsumerState,
}

/// The leader opens the next milestone. Every consumer resets its local
/// state from the milestone's assignments when it observes this event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneStarted {
    pub group_name: String,
    pub milestone: Milestone,
}

/// The closed set of coordination events.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupEvent {
    LeaderDeclared(LeaderDeclared),
    ConsumerCheckedIn(ConsumerCheckedIn),
    MilestoneStarted(MilestoneStarted),
}

impl GroupEvent {
    /// The message type this event is written under.
    pub fn event_type(&self) -> &'static str {
        match self {
            GroupEvent::LeaderDeclared(_) => LEADER_DECLARED_EVENT_TYPE,
            GroupEvent::ConsumerCheckedIn(_) => CONSUMER_CHECKED_IN_EVENT_TYPE,
            GroupEvent::MilestoneStarted(_) => MILESTONE_STARTED_EVENT_TYPE,
        }
    }

    /// Decode a coordination-stream message, dispatching on its type.
    pub fn from_message(message: &Message) -> Result<Self> {
        match message.message_type.as_str() {
            LEADER_DECLARED_EVENT_TYPE => {
                Ok(GroupEvent::LeaderDeclared(message.unmarshal_data()?))
            }
            CONSUMER_CHECKED_IN_EVENT_TYPE => {
                Ok(GroupEvent::ConsumerCheckedIn(message.unmarshal_data()?))
            }
            MILESTONE_STARTED_EVENT_TYPE => {
                Ok(GroupEvent::MilestoneStarted(message.unmarshal_data()?))
            }
            other => Err(MessageDbError::UnknownEventType(other.to_string())),
        }
    }

    /// The event's JSON payload as written to the store.
    pub fn to_data(&self) -> Result<serde_json::Value> {
        Ok(match self {
            GroupEvent::LeaderDeclared(e) => serde_json::to_value(e)?,
            GroupEvent::ConsumerCheckedIn(e) => serde_json::to_value(e)?,
            GroupEvent::MilestoneStarted(e) => serde_json::to_value(e)?,
        })
    }

    /// Fold this event into the group state.
    ///
    /// `version` and `global_position` come from the carrying message and
    /// always advance the projection's cursor and high-water mark.
    pub fn apply(&self, state: &mut GroupState, version: i64, global_position: i64) {
        state.version = version;
        state.high_water_mark = global_position;

        match self {
            GroupEvent::LeaderDeclared(e) => {
                state.leader = e.consumer_id.clone();
                state.leader_expires = e.until;
            }
            GroupEvent::ConsumerCheckedIn(e) => {
                let cs = e.consumer_state.clone();
                let id = cs.consumer_id.clone();
                if cs.milestone_complete {
                    state.active_consumers.remove(&id);
                    state.idle_consumers.insert(id, cs);
                } else {
                    state.idle_consumers.remove(&id);
                    state.active_consumers.insert(id, cs);
                }
            }
            GroupEvent::MilestoneStarted(e) => {
                state.current_milestone = Some(e.milestone.clone());
            }
        }
    }
}
