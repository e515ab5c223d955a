//! The consumer-group coordinator.
//!
//! There is no broker: every consumer runs this same state machine against
//! the group's coordination stream, and the stream's optimistic-concurrency
//! check is the only arbiter. A consumer periodically pulls the stream
//! forward and checks in with its progress; the consumer holding the
//! leadership lease additionally opens milestones. Writes that lose the
//! version race are simply dropped; the winning event arrives through the
//! next state update and everyone converges on it.
//!
//! The whole machine runs on one task: four timers plus a handful of
//! "do this now" couplings, exactly one branch per tick, no shared mutable
//! state and no locks.

use crate::consumer::events::{ConsumerCheckedIn, GroupEvent, LeaderDeclared, MilestoneStarted};
use crate::consumer::state::{ConsumerState, GroupState};
use crate::consumer::GROUP_CATEGORY;
use crate::error::{MessageDbError, Result};
use crate::message::{Message, ProposedMessage, StreamIdentifier, NO_STREAM_VERSION};
use crate::options::{GetCategoryOptions, GetStreamOptions};
use crate::polling::{DynamicPolling, PollingStrategy};
use crate::Client;
use chrono::Utc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Coordination events pulled per state update; a shorter batch means the
/// projection has caught up.
const COORDINATION_BATCH_SIZE: i64 = 100;

/// Domain messages pulled per dispatch read.
const DISPATCH_BATCH_SIZE: i64 = 100;

/// How long a declared leadership lease lasts.
const LEADER_LEASE_SECS: i64 = 5;

/// A leader renews once its lease has less than this left.
const LEADER_RENEWAL_MARGIN_SECS: i64 = 1;

/// Delay before the very first check-in, giving the initial state update a
/// head start.
const FIRST_CHECK_IN_DELAY: Duration = Duration::from_millis(100);

/// Timing configuration for the coordinator loop.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    update_state_period: Duration,
    check_in_period: Duration,
    manage_group_period: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            update_state_period: Duration::from_secs(1),
            check_in_period: Duration::from_secs(1),
            manage_group_period: Duration::from_secs(1),
        }
    }
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// How often the coordination stream is pulled forward.
    pub fn update_state_period(mut self, period: Duration) -> Self {
        self.update_state_period = period;
        self
    }

    /// How often the consumer publishes its progress. The check-in promise
    /// written into each event is this period plus 10% leeway.
    pub fn check_in_period(mut self, period: Duration) -> Self {
        self.check_in_period = period;
        self
    }

    /// How often leader decisions are evaluated.
    pub fn manage_group_period(mut self, period: Duration) -> Self {
        self.manage_group_period = period;
        self
    }
}

/// Client for joining and observing consumer groups.
pub struct GroupClient {
    pub(crate) client: Client,
    config: GroupConfig,
}

/// The four tick sources of the coordinator loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tick {
    UpdateState,
    CheckIn,
    ManageGroup,
    ReadMessages,
}

/// Earliest armed deadline and the tick it belongs to.
fn next_deadline(
    update_at: Instant,
    check_in_at: Instant,
    manage_at: Option<Instant>,
    read_at: Option<Instant>,
) -> (Tick, Instant) {
    let mut next = (Tick::UpdateState, update_at);
    if check_in_at < next.1 {
        next = (Tick::CheckIn, check_in_at);
    }
    if let Some(at) = manage_at {
        if at < next.1 {
            next = (Tick::ManageGroup, at);
        }
    }
    if let Some(at) = read_at {
        if at < next.1 {
            next = (Tick::ReadMessages, at);
        }
    }
    next
}

impl GroupClient {
    /// Create a group client with default timing.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            config: GroupConfig::default(),
        }
    }

    /// Create a group client with custom timing.
    pub fn with_config(client: Client, config: GroupConfig) -> Self {
        Self { client, config }
    }

    /// Join a consumer group and process the group's share of `category`
    /// through `handle_message`.
    ///
    /// Runs until the token is cancelled (returning `Ok(())`) or an
    /// unrecoverable store error occurs. Delivery is at-least-once: the
    /// unfinished range of a consumer that dies mid-milestone is carried
    /// into the next milestone as debt and replayed from that consumer's
    /// last published position, so handlers must tolerate duplicates.
    /// Host clocks must agree to well under the 5s leadership lease;
    /// larger skew can produce overlapping leaders.
    pub async fn join_group<H>(
        &self,
        token: CancellationToken,
        group: &str,
        category: &str,
        consumer_id: &str,
        mut handle_message: H,
    ) -> Result<()>
    where
        H: FnMut(Message) + Send,
    {
        crate::client::validate_category(category)?;
        let coordination_stream = StreamIdentifier::new(GROUP_CATEGORY, group);
        coordination_stream.validate()?;
        if consumer_id.is_empty() {
            return Err(MessageDbError::InvalidOptions(
                "consumer ID cannot be blank".into(),
            ));
        }

        let mut gs = GroupState::new(group, category);
        let mut cs = ConsumerState::new(consumer_id);
        let mut dispatch_polling = DynamicPolling::new(
            0.5,
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );

        // Periodic timers. Group management and dispatch stay unarmed until
        // the state catches up / a milestone assigns work.
        let mut update_at = Instant::now();
        let mut check_in_at = Instant::now() + FIRST_CHECK_IN_DELAY;
        let mut manage_at: Option<Instant> = None;
        let mut read_at: Option<Instant> = None;

        // Do-now signals set by the post-tick couplings.
        let mut update_now = false;
        let mut check_in_now = false;
        let mut manage_now = false;

        // Whether the projection was caught up as of the last state update.
        let mut live = false;

        info!(group = %group, consumer = %consumer_id, category = %category, "joining consumer group");

        loop {
            let tick = if update_now {
                update_now = false;
                Tick::UpdateState
            } else if check_in_now {
                check_in_now = false;
                Tick::CheckIn
            } else if manage_now {
                manage_now = false;
                Tick::ManageGroup
            } else {
                let (tick, deadline) = next_deadline(update_at, check_in_at, manage_at, read_at);
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = sleep_until(deadline) => tick,
                }
            };

            let mut updated = false;
            let mut saw_milestone = false;
            let mut checked_in = false;
            let mut managed_group = false;
            let mut end_reached = false;

            match tick {
                Tick::UpdateState => {
                    (updated, saw_milestone, live) = tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        outcome = self.update_state(&mut gs) => outcome?,
                    };
                    update_at = Instant::now() + self.config.update_state_period;
                }
                Tick::CheckIn => {
                    checked_in = tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        outcome = self.check_in(&gs, &mut cs) => outcome?,
                    };
                    check_in_at = Instant::now() + self.config.check_in_period;
                }
                Tick::ManageGroup => {
                    // Leader decisions need a current view of the group.
                    if live {
                        managed_group = tokio::select! {
                            _ = token.cancelled() => return Ok(()),
                            outcome = self.manage_group(&gs, &cs) => outcome?,
                        };
                    }
                    manage_at = Some(Instant::now() + self.config.manage_group_period);
                }
                Tick::ReadMessages => {
                    let delay;
                    (delay, end_reached) = tokio::select! {
                        _ = token.cancelled() => return Ok(()),
                        outcome = self.read_messages(
                            &gs,
                            &mut cs,
                            &mut handle_message,
                            &mut dispatch_polling,
                        ) => outcome?,
                    };
                    read_at = delay.map(|d| Instant::now() + d);
                }
            }

            // Post-tick couplings; the first match wins. The manage coupling
            // fires only off a state-update tick: anything else could spin
            // on a lost write race without ever advancing the projection.
            if live && managed_group {
                // our own write changed the stream; pick it up immediately
                update_now = true;
            } else if checked_in {
                update_now = true;
            } else if live
                && tick == Tick::UpdateState
                && (updated || gs.version == NO_STREAM_VERSION)
            {
                manage_now = true;
                if saw_milestone {
                    if let Some(milestone) = &gs.current_milestone {
                        cs = milestone.initial_state_for(consumer_id);
                        read_at = Some(Instant::now());
                        check_in_now = true;
                    }
                }
            } else if end_reached {
                // publish the completed milestone without waiting a period
                check_in_now = true;
            }
        }
    }

    /// Pull the coordination stream forward into the projection.
    ///
    /// Returns `(updated, saw_milestone_started, live)`.
    async fn update_state(&self, gs: &mut GroupState) -> Result<(bool, bool, bool)> {
        let stream = StreamIdentifier::new(GROUP_CATEGORY, &gs.name);
        let options = GetStreamOptions::new()
            .from_version(gs.version + 1)
            .batch_size(COORDINATION_BATCH_SIZE);

        let messages = self.client.get_stream_messages(&stream, &options).await?;
        if messages.is_empty() {
            return Ok((false, false, true));
        }

        let retrieved = messages.len() as i64;
        let mut saw_milestone = false;
        for message in &messages {
            if let Some(GroupEvent::MilestoneStarted(_)) = gs.apply_message(message) {
                saw_milestone = true;
            }
        }

        Ok((true, saw_milestone, retrieved != COORDINATION_BATCH_SIZE))
    }

    /// Publish this consumer's progress, promising the next check-in within
    /// the period plus 10% leeway.
    async fn check_in(&self, gs: &GroupState, cs: &mut ConsumerState) -> Result<bool> {
        cs.checked_in = Utc::now();
        cs.next_check_in = cs.checked_in + check_in_leeway(self.config.check_in_period);

        let event = GroupEvent::ConsumerCheckedIn(ConsumerCheckedIn {
            group_name: gs.name.clone(),
            consumer_state: cs.clone(),
        });
        self.write_event(gs, &event).await
    }

    /// Leader decisions: claim or renew the lease, and open the next
    /// milestone once the group is ready for one.
    async fn manage_group(&self, gs: &GroupState, cs: &ConsumerState) -> Result<bool> {
        let now = Utc::now();
        let no_leader = now > gs.leader_expires;
        let my_lease_expiring = gs.leader == cs.consumer_id
            && gs.leader_expires < now + chrono::Duration::seconds(LEADER_RENEWAL_MARGIN_SECS);

        if no_leader || my_lease_expiring {
            let event = GroupEvent::LeaderDeclared(LeaderDeclared {
                group_name: gs.name.clone(),
                consumer_id: cs.consumer_id.clone(),
                until: now + chrono::Duration::seconds(LEADER_LEASE_SECS),
            });
            return self.write_event(gs, &event).await;
        }

        if gs.leader != cs.consumer_id {
            return Ok(false);
        }

        if gs.ready_for_next_milestone(now) {
            let milestone = gs.next_milestone(now);
            info!(
                group = %gs.name,
                milestone = milestone.id,
                from = milestone.from,
                end = milestone.end,
                consumers = milestone.partitions.len(),
                "starting milestone"
            );
            let event = GroupEvent::MilestoneStarted(MilestoneStarted {
                group_name: gs.name.clone(),
                milestone,
            });
            return self.write_event(gs, &event).await;
        }

        Ok(false)
    }

    /// Dispatch this consumer's share of the current milestone: first any
    /// debt ranges carried from earlier milestones, then its own partition.
    ///
    /// Each tick issues one read. A debt read is scoped to the hash slot the
    /// debt was accrued under, so the new owner sees exactly the streams the
    /// departed consumer would have; a message at or past the range's end
    /// marks the debt cleared. The milestone itself completes only through
    /// the main-partition read, by which point every debt has cleared.
    ///
    /// Returns the delay before the next read (`None` parks dispatch until
    /// the next milestone) and whether the milestone's end was reached.
    async fn read_messages<H>(
        &self,
        gs: &GroupState,
        cs: &mut ConsumerState,
        handle_message: &mut H,
        polling: &mut dyn PollingStrategy,
    ) -> Result<(Option<Duration>, bool)>
    where
        H: FnMut(Message),
    {
        let Some(milestone) = &gs.current_milestone else {
            return Ok((None, false));
        };
        if cs.milestone_complete {
            return Ok((None, false));
        }

        if let Some(debt) = cs.debt.iter_mut().find(|debt| !debt.cleared) {
            let options = GetCategoryOptions::new()
                .from_position(debt.current_position + 1)
                .batch_size(DISPATCH_BATCH_SIZE)
                .consumer_group(debt.partition, debt.group_size);

            let messages = self
                .client
                .get_category_messages(&gs.category, &options)
                .await?;

            let retrieved = messages.len() as i64;
            for message in messages {
                if message.global_position >= debt.end {
                    debt.cleared = true;
                    debug!(
                        group = %gs.name,
                        consumer = %cs.consumer_id,
                        partition = debt.partition,
                        end = debt.end,
                        "cleared carried debt"
                    );
                    // move on to the next debt, or the main range, right away
                    return Ok((Some(Duration::ZERO), false));
                }
                debt.current_position = message.global_position;
                handle_message(message);
            }

            let delay = polling.next_delay(retrieved, DISPATCH_BATCH_SIZE);
            return Ok((Some(delay), false));
        }

        let Some(partition) = milestone.partitions.get(&cs.consumer_id).copied() else {
            return Ok((None, false));
        };

        let options = GetCategoryOptions::new()
            .from_position(cs.current_position + 1)
            .batch_size(DISPATCH_BATCH_SIZE)
            .consumer_group(partition, milestone.partitions.len() as i64);

        let messages = self
            .client
            .get_category_messages(&gs.category, &options)
            .await?;

        let retrieved = messages.len() as i64;
        for message in messages {
            if message.global_position >= milestone.end {
                cs.milestone_complete = true;
                return Ok((None, true));
            }
            cs.current_position = message.global_position;
            handle_message(message);
        }

        let delay = polling.next_delay(retrieved, DISPATCH_BATCH_SIZE);
        Ok((Some(delay), false))
    }

    /// Write a coordination event OCC'd against the projection's version.
    ///
    /// A lost race is not an error: the state moved underneath us, the next
    /// state update reconciles, and the caller simply reports "not written".
    async fn write_event(&self, gs: &GroupState, event: &GroupEvent) -> Result<bool> {
        let stream = StreamIdentifier::new(GROUP_CATEGORY, &gs.name);
        let proposed = ProposedMessage {
            id: Uuid::new_v4(),
            message_type: event.event_type().to_string(),
            data: event.to_data()?,
            metadata: None,
        };

        match self.client.write_message(&stream, &proposed, gs.version).await {
            Ok(_) => Ok(true),
            Err(MessageDbError::UnexpectedStreamVersion) => {
                debug!(
                    group = %gs.name,
                    event = %event.event_type(),
                    version = gs.version,
                    "lost coordination write race"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

fn check_in_leeway(period: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds((period.as_millis() as f64 * 1.1) as i64)
}
