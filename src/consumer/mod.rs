//! Decentralized consumer groups over the event store.
//!
//! A consumer group splits a category across its members with no broker and
//! no lock service: members coordinate entirely through an ordered stream
//! of coordination events and the store's optimistic-concurrency check.
//! Every member folds that stream into the same [`GroupState`]; a leased
//! leader carves the category's global-position range into bounded
//! [`Milestone`]s and partitions each one over the members who are ready
//! for work. Work a member leaves unfinished is carried into the next
//! milestone as debt, and its new owner drains that debt before starting
//! on its own range.
//!
//! ```no_run
//! # async fn example(client: messagedb::Client) -> messagedb::Result<()> {
//! use messagedb::consumer::GroupClient;
//! use tokio_util::sync::CancellationToken;
//!
//! let group = GroupClient::new(client);
//! let token = CancellationToken::new();
//!
//! group
//!     .join_group(token, "reports", "invoice", "consumer-1", |message| {
//!         println!("{} @ {}", message.message_type, message.global_position);
//!     })
//!     .await
//! # }
//! ```

mod coordinator;
mod events;
mod observer;
mod state;

pub use coordinator::{GroupClient, GroupConfig};
pub use events::{
    ConsumerCheckedIn, GroupEvent, LeaderDeclared, MilestoneStarted,
    CONSUMER_CHECKED_IN_EVENT_TYPE, LEADER_DECLARED_EVENT_TYPE, MILESTONE_STARTED_EVENT_TYPE,
};
pub use state::{ConsumerState, DebtState, GroupState, Milestone, PartitionDebt};

/// Category holding every group's coordination stream.
pub const GROUP_CATEGORY: &str = "_group";
