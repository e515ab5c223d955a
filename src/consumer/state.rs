//! Consumer group state.
//!
//! `GroupState` is a pure left-fold of the group's coordination stream: any
//! two consumers that apply the same prefix of that stream hold identical
//! projections, which is what lets the group coordinate through the store
//! alone. Everything here is plain data and pure computation; the I/O lives
//! in the coordinator.

use crate::consumer::events::GroupEvent;
use crate::message::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Global-position span covered by each milestone.
pub(crate) const MILESTONE_SPAN: i64 = 100;

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// A sub-range of an earlier milestone that a departed consumer left
/// unfinished, reassigned to a survivor.
///
/// `group_size` and `partition` pin the consistent-hash slot the range was
/// originally read with, so the new owner reads exactly the streams the old
/// one would have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDebt {
    /// Size of the consumer group the debt was accrued under
    pub group_size: i64,
    /// Hash slot within that group
    pub partition: i64,
    /// Inclusive global position the debt starts at
    pub from: i64,
    /// Exclusive global position the debt ends before
    pub end: i64,
}

/// A [`PartitionDebt`] being worked off, with the owner's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtState {
    /// Size of the consumer group the debt was accrued under
    pub group_size: i64,
    /// Hash slot within that group
    pub partition: i64,
    /// Inclusive global position the debt starts at
    pub from: i64,
    /// Exclusive global position the debt ends before
    pub end: i64,
    /// Last global position processed within the range
    pub current_position: i64,
    /// Whether the range has been fully processed
    pub cleared: bool,
}

impl From<&PartitionDebt> for DebtState {
    fn from(debt: &PartitionDebt) -> Self {
        Self {
            group_size: debt.group_size,
            partition: debt.partition,
            from: debt.from,
            end: debt.end,
            current_position: debt.from - 1,
            cleared: false,
        }
    }
}

/// A bounded global-position range `[from, end)` that one generation of
/// consumers is collectively responsible for, with their partition
/// assignments and any debt carried over from earlier generations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    /// Milestone sequence number; consecutive milestones increase by 1
    pub id: i64,
    /// Inclusive global position the milestone starts at
    pub from: i64,
    /// Exclusive global position the milestone ends before
    pub end: i64,
    /// Consumer id → zero-based hash slot within a group of
    /// `partitions.len()`
    pub partitions: HashMap<String, i64>,
    /// Consumer id → debt ranges assigned for this milestone
    pub debt: HashMap<String, Vec<PartitionDebt>>,
}

impl Milestone {
    /// The state a consumer resets to when this milestone starts.
    ///
    /// A consumer that holds no partition (it joined after the leader took
    /// the membership snapshot) starts complete: it idles through this
    /// milestone and is picked up by the next one.
    pub fn initial_state_for(&self, consumer_id: &str) -> ConsumerState {
        ConsumerState {
            consumer_id: consumer_id.to_string(),
            milestone_id: self.id,
            current_position: self.from - 1,
            milestone_complete: !self.partitions.contains_key(consumer_id),
            debt: self
                .debt
                .get(consumer_id)
                .map(|debts| debts.iter().map(DebtState::from).collect())
                .unwrap_or_default(),
            checked_in: epoch(),
            next_check_in: epoch(),
        }
    }
}

/// One consumer's progress, as shared with the group via check-ins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerState {
    /// Unique id of the consumer
    pub consumer_id: String,
    /// Milestone the consumer is working against
    pub milestone_id: i64,
    /// Last global position processed in the consumer's partition
    pub current_position: i64,
    /// Whether the consumer has exhausted its partition of the milestone
    pub milestone_complete: bool,
    /// Debt ranges assigned to this consumer
    pub debt: Vec<DebtState>,
    /// When the consumer last checked in
    pub checked_in: DateTime<Utc>,
    /// When the consumer promises to check in next; a consumer past this
    /// time is presumed dead
    pub next_check_in: DateTime<Utc>,
}

impl ConsumerState {
    /// Fresh state for a consumer that has not yet seen a milestone. It
    /// starts complete, i.e. idle and ready for the next milestone.
    pub fn new(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            milestone_id: 0,
            current_position: 0,
            milestone_complete: true,
            debt: Vec::new(),
            checked_in: epoch(),
            next_check_in: epoch(),
        }
    }
}

/// Projection of a consumer group's coordination stream.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupState {
    /// Version of the last coordination event applied; -1 before any
    pub version: i64,
    /// Group name
    pub name: String,
    /// Domain category the group consumes
    pub category: String,
    /// Consumer id of the current leader; empty when leadership is unheld
    pub leader: String,
    /// Time after which leadership is unheld
    pub leader_expires: DateTime<Utc>,
    /// Milestone currently being worked, if any
    pub current_milestone: Option<Milestone>,
    /// Global position of the most recent coordination event applied
    pub high_water_mark: i64,
    /// Consumers still working their partition of the current milestone
    pub active_consumers: HashMap<String, ConsumerState>,
    /// Consumers done with (or waiting out) the current milestone
    pub idle_consumers: HashMap<String, ConsumerState>,
}

impl GroupState {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            version: crate::message::NO_STREAM_VERSION,
            name: name.into(),
            category: category.into(),
            leader: String::new(),
            leader_expires: epoch(),
            current_milestone: None,
            high_water_mark: 0,
            active_consumers: HashMap::new(),
            idle_consumers: HashMap::new(),
        }
    }

    /// Fold one coordination-stream message into the state.
    ///
    /// A message that fails to decode (unknown type, malformed payload) is
    /// logged and skipped, but still advances the version cursor and
    /// high-water mark; the projection must never stall on one event.
    pub fn apply_message(&mut self, message: &Message) -> Option<GroupEvent> {
        match GroupEvent::from_message(message) {
            Ok(event) => {
                event.apply(self, message.version, message.global_position);
                Some(event)
            }
            Err(err) => {
                warn!(
                    group = %self.name,
                    message_type = %message.message_type,
                    error = %err,
                    "skipping undecodable coordination event"
                );
                self.version = message.version;
                self.high_water_mark = message.global_position;
                None
            }
        }
    }

    /// Idle consumers whose check-in promise has not lapsed, sorted for
    /// deterministic slot assignment.
    pub(crate) fn alive_idlers(&self, now: DateTime<Utc>) -> Vec<&str> {
        let mut idlers: Vec<&str> = self
            .idle_consumers
            .values()
            .filter(|cs| cs.next_check_in > now)
            .map(|cs| cs.consumer_id.as_str())
            .collect();
        idlers.sort_unstable();
        idlers
    }

    /// True when every active consumer has missed its check-in promise.
    pub(crate) fn active_consumers_expired(&self, now: DateTime<Utc>) -> bool {
        self.active_consumers
            .values()
            .all(|cs| cs.next_check_in < now)
    }

    /// True when the current milestone's end has been passed by the
    /// coordination stream itself, or no milestone has started yet.
    pub(crate) fn milestone_exhausted(&self) -> bool {
        self.current_milestone
            .as_ref()
            .map_or(true, |m| self.high_water_mark >= m.end)
    }

    /// Whether the group is ready for the leader to start the next
    /// milestone: at least one idler is waiting for work, no active consumer
    /// is still alive, and the current milestone's range is exhausted.
    pub(crate) fn ready_for_next_milestone(&self, now: DateTime<Utc>) -> bool {
        !self.alive_idlers(now).is_empty()
            && (self.active_consumers.is_empty() || self.active_consumers_expired(now))
            && self.milestone_exhausted()
    }

    /// Compute the milestone that follows the current one: the next 100
    /// global positions, partitioned over the alive idle consumers, with
    /// the unfinished ranges of still-active consumers carried over as
    /// debt.
    pub(crate) fn next_milestone(&self, now: DateTime<Utc>) -> Milestone {
        let current = self.current_milestone.as_ref();

        let (id, from) = match current {
            Some(m) => (m.id + 1, m.end),
            None => (1, 0),
        };
        let mut next = Milestone {
            id,
            from,
            end: from + MILESTONE_SPAN,
            partitions: HashMap::new(),
            debt: HashMap::new(),
        };

        let idlers = self.alive_idlers(now);
        for (idx, consumer_id) in idlers.iter().enumerate() {
            next.partitions.insert(consumer_id.to_string(), idx as i64);
        }

        // Capture unfinished work from consumers that never completed the
        // current milestone. Without a current milestone there is nothing
        // owed.
        let mut debts = Vec::new();
        if let Some(current) = current {
            let mut actives: Vec<&ConsumerState> = self.active_consumers.values().collect();
            actives.sort_unstable_by(|a, b| a.consumer_id.cmp(&b.consumer_id));

            for cs in actives {
                debts.push(PartitionDebt {
                    group_size: current.partitions.len() as i64,
                    partition: current.partitions.get(&cs.consumer_id).copied().unwrap_or(0),
                    from: cs.current_position + 1,
                    end: current.end,
                });
                for debt in &cs.debt {
                    if debt.cleared {
                        continue;
                    }
                    debts.push(PartitionDebt {
                        group_size: debt.group_size,
                        partition: debt.partition,
                        from: debt.current_position + 1,
                        end: debt.end,
                    });
                }
            }
        }

        for (idx, debt) in debts
            .into_iter()
            .filter(|debt| debt.from < debt.end)
            .enumerate()
        {
            let owner = idlers[idx % idlers.len()];
            next.debt.entry(owner.to_string()).or_default().push(debt);
        }

        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn idle(consumer_id: &str, now: DateTime<Utc>) -> ConsumerState {
        ConsumerState {
            next_check_in: now + Duration::seconds(1),
            checked_in: now,
            ..ConsumerState::new(consumer_id)
        }
    }

    fn active(consumer_id: &str, position: i64, now: DateTime<Utc>) -> ConsumerState {
        ConsumerState {
            milestone_complete: false,
            current_position: position,
            next_check_in: now + Duration::seconds(1),
            checked_in: now,
            ..ConsumerState::new(consumer_id)
        }
    }

    #[test]
    fn test_first_milestone_is_debt_free() {
        let now = Utc::now();
        let mut gs = GroupState::new("g", "cat");
        gs.idle_consumers.insert("c2".into(), idle("c2", now));
        gs.idle_consumers.insert("c1".into(), idle("c1", now));
        // a stale consumer state must not be assigned a slot
        gs.idle_consumers
            .insert("dead".into(), ConsumerState::new("dead"));

        let next = gs.next_milestone(now);
        assert_eq!(next.id, 1);
        assert_eq!(next.from, 0);
        assert_eq!(next.end, 100);
        assert_eq!(next.partitions.len(), 2);
        assert_eq!(next.partitions["c1"], 0);
        assert_eq!(next.partitions["c2"], 1);
        assert!(next.debt.is_empty());
    }

    #[test]
    fn test_milestone_chaining() {
        let now = Utc::now();
        let mut gs = GroupState::new("g", "cat");
        gs.idle_consumers.insert("c1".into(), idle("c1", now));
        gs.current_milestone = Some(Milestone {
            id: 4,
            from: 300,
            end: 400,
            partitions: HashMap::from([("c1".into(), 0)]),
            debt: HashMap::new(),
        });

        let next = gs.next_milestone(now);
        assert_eq!(next.id, 5);
        assert_eq!(next.from, 400);
        assert_eq!(next.end, 500);
    }

    #[test]
    fn test_debt_capture_from_active_consumers() {
        let now = Utc::now();
        let mut gs = GroupState::new("g", "cat");
        gs.current_milestone = Some(Milestone {
            id: 1,
            from: 0,
            end: 100,
            partitions: HashMap::from([("a".into(), 0), ("b".into(), 1)]),
            debt: HashMap::new(),
        });

        let mut lagging = active("a", 41, now);
        lagging.debt.push(DebtState {
            group_size: 3,
            partition: 2,
            from: 10,
            end: 50,
            current_position: 19,
            cleared: false,
        });
        lagging.debt.push(DebtState {
            group_size: 3,
            partition: 1,
            from: 10,
            end: 50,
            current_position: 49,
            cleared: true,
        });
        gs.active_consumers.insert("a".into(), lagging);
        gs.idle_consumers.insert("x".into(), idle("x", now));
        gs.idle_consumers.insert("y".into(), idle("y", now));

        let next = gs.next_milestone(now);

        // main-range debt plus the uncleared carried debt, round-robined
        // over the two idlers; the cleared debt is dropped
        let x_debt = &next.debt["x"];
        let y_debt = &next.debt["y"];
        assert_eq!(x_debt.len() + y_debt.len(), 2);
        assert_eq!(
            x_debt[0],
            PartitionDebt {
                group_size: 2,
                partition: 0,
                from: 42,
                end: 100,
            }
        );
        assert_eq!(
            y_debt[0],
            PartitionDebt {
                group_size: 3,
                partition: 2,
                from: 20,
                end: 50,
            }
        );
    }

    #[test]
    fn test_finished_range_is_not_carried() {
        let now = Utc::now();
        let mut gs = GroupState::new("g", "cat");
        gs.current_milestone = Some(Milestone {
            id: 1,
            from: 0,
            end: 100,
            partitions: HashMap::from([("a".into(), 0)]),
            debt: HashMap::new(),
        });
        // finished its range but never checked in complete
        gs.active_consumers.insert("a".into(), active("a", 99, now));
        gs.idle_consumers.insert("x".into(), idle("x", now));

        let next = gs.next_milestone(now);
        assert!(next.debt.is_empty());
    }

    #[test]
    fn test_ready_for_next_milestone() {
        let now = Utc::now();
        let mut gs = GroupState::new("g", "cat");
        assert!(!gs.ready_for_next_milestone(now), "no idlers yet");

        gs.idle_consumers.insert("c1".into(), idle("c1", now));
        assert!(
            gs.ready_for_next_milestone(now),
            "idler present, no milestone running"
        );

        gs.current_milestone = Some(Milestone {
            id: 1,
            from: 0,
            end: 100,
            partitions: HashMap::from([("c1".into(), 0)]),
            debt: HashMap::new(),
        });
        gs.high_water_mark = 50;
        assert!(
            !gs.ready_for_next_milestone(now),
            "milestone range not exhausted"
        );

        gs.high_water_mark = 100;
        assert!(gs.ready_for_next_milestone(now));

        gs.active_consumers.insert("a".into(), active("a", 10, now));
        assert!(!gs.ready_for_next_milestone(now), "active consumer alive");

        gs.active_consumers.get_mut("a").unwrap().next_check_in = now - Duration::seconds(1);
        assert!(
            gs.ready_for_next_milestone(now),
            "active consumer expired"
        );
    }

    #[test]
    fn test_initial_state_for_assigned_consumer() {
        let milestone = Milestone {
            id: 3,
            from: 200,
            end: 300,
            partitions: HashMap::from([("c1".into(), 0)]),
            debt: HashMap::from([(
                "c1".into(),
                vec![PartitionDebt {
                    group_size: 2,
                    partition: 1,
                    from: 150,
                    end: 200,
                }],
            )]),
        };

        let cs = milestone.initial_state_for("c1");
        assert_eq!(cs.milestone_id, 3);
        assert_eq!(cs.current_position, 199);
        assert!(!cs.milestone_complete);
        assert_eq!(cs.debt.len(), 1);
        assert_eq!(cs.debt[0].current_position, 149);
        assert!(!cs.debt[0].cleared);
    }

    #[test]
    fn test_undecodable_event_advances_cursor() {
        let mut gs = GroupState::new("g", "cat");

        let unknown = Message::new(
            "id".into(),
            crate::message::StreamIdentifier::new("_group", "g"),
            "SomethingNew".into(),
            0,
            7,
            Utc::now(),
            Some("{}".into()),
            None,
        );
        assert!(gs.apply_message(&unknown).is_none());
        assert_eq!(gs.version, 0);
        assert_eq!(gs.high_water_mark, 7);

        let garbled = Message::new(
            "id".into(),
            crate::message::StreamIdentifier::new("_group", "g"),
            "LeaderDeclared".into(),
            1,
            9,
            Utc::now(),
            Some("not json".into()),
            None,
        );
        assert!(gs.apply_message(&garbled).is_none());
        assert_eq!(gs.version, 1);
        assert_eq!(gs.high_water_mark, 9);
        assert!(gs.leader.is_empty());
    }

    #[test]
    fn test_initial_state_for_late_joiner_waits() {
        let milestone = Milestone {
            id: 3,
            from: 200,
            end: 300,
            partitions: HashMap::from([("c1".into(), 0)]),
            debt: HashMap::new(),
        };

        // not in the membership snapshot: idles until the next milestone
        let cs = milestone.initial_state_for("c2");
        assert!(cs.milestone_complete);
        assert!(cs.debt.is_empty());
    }
}
