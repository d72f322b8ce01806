//! Consumer group coordination for the embedded broker.
//!
//! A command/response state machine: [`GroupDomainState::apply`] takes a
//! [`GroupCommand`] and the current time and returns a [`GroupResponse`].
//! It never blocks and owns no clock, so it is easy to drive from tests.
//!
//! # Generations
//!
//! Every membership change (a new member, a leave, an expiry, a change of
//! subscription) bumps the group generation and discards the current
//! assignment. A known member rejoining with unchanged subscriptions does not
//! bump it, so members catching up after a rebalance converge instead of
//! triggering each other. The assignment for a generation is computed by the
//! first member to sync, using range assignment over the sorted member ids.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::broker::{GroupDescription, GroupState};
use crate::constants::MAX_EXPIRATIONS_PER_GROUP;
use crate::types::{GenerationId, Offset, TopicPartition};

/// A member of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub member_id: String,
    pub client_id: String,
    pub topics: Vec<String>,
    pub session_timeout_ms: u64,
    pub last_heartbeat_ms: u64,
}

/// Coordinator-side state of one group.
#[derive(Debug, Clone)]
pub struct ConsumerGroupInfo {
    pub group_id: String,
    pub generation: i32,
    pub state: GroupState,
    pub leader_id: Option<String>,
    pub members: BTreeMap<String, MemberInfo>,
    /// Assignment for the current generation, once computed.
    pub assignments: Option<BTreeMap<String, Vec<TopicPartition>>>,
}

impl ConsumerGroupInfo {
    fn new(group_id: String) -> Self {
        Self {
            group_id,
            generation: 0,
            state: GroupState::Empty,
            leader_id: None,
            members: BTreeMap::new(),
            assignments: None,
        }
    }

    /// Increment the generation, wrapping from `i32::MAX` to 1.
    pub fn increment_generation(&mut self) {
        self.generation = if self.generation == i32::MAX {
            tracing::warn!(
                group_id = %self.group_id,
                "Consumer group generation wrapped from i32::MAX to 1"
            );
            1
        } else {
            self.generation + 1
        };
    }

    /// Start a new generation after a membership change.
    fn begin_rebalance(&mut self) {
        self.assignments = None;
        if self.members.is_empty() {
            self.leader_id = None;
            self.state = GroupState::Empty;
        } else {
            self.increment_generation();
            self.state = GroupState::PreparingRebalance;
        }
    }

    fn remove_member(&mut self, member_id: &str) -> bool {
        if self.members.remove(member_id).is_none() {
            return false;
        }
        if self.leader_id.as_deref() == Some(member_id) {
            self.leader_id = self.members.keys().next().cloned();
        }
        true
    }

    /// Topics any member subscribes to.
    pub fn subscribed_topics(&self) -> BTreeSet<String> {
        self.members
            .values()
            .flat_map(|m| m.topics.iter().cloned())
            .collect()
    }

    fn describe(&self) -> GroupDescription {
        GroupDescription {
            group_id: self.group_id.clone(),
            state: self.state,
            generation: GenerationId(self.generation),
            leader_id: self.leader_id.clone(),
            members: self.members.keys().cloned().collect(),
        }
    }
}

/// Range assignment.
///
/// For each topic, the subscribed members are sorted and each receives a
/// contiguous range of partitions; the first `partitions % members` members
/// get one extra.
pub fn range_assign(
    members: &BTreeMap<String, MemberInfo>,
    partition_counts: &HashMap<String, i32>,
) -> BTreeMap<String, Vec<TopicPartition>> {
    let mut assignments: BTreeMap<String, Vec<TopicPartition>> = members
        .keys()
        .map(|id| (id.clone(), Vec::new()))
        .collect();

    let topics: BTreeSet<&String> = members.values().flat_map(|m| m.topics.iter()).collect();

    for topic in topics {
        let partitions = partition_counts.get(topic).copied().unwrap_or(0);
        let subscribed: Vec<&String> = members
            .iter()
            .filter(|(_, m)| m.topics.contains(topic))
            .map(|(id, _)| id)
            .collect();

        if subscribed.is_empty() || partitions <= 0 {
            continue;
        }

        let per_member = partitions / subscribed.len() as i32;
        let extra = partitions % subscribed.len() as i32;

        let mut next = 0;
        for (i, member_id) in subscribed.into_iter().enumerate() {
            let count = per_member + i32::from((i as i32) < extra);
            if let Some(assignment) = assignments.get_mut(member_id) {
                for _ in 0..count {
                    assignment.push(TopicPartition::new(topic.clone(), next));
                    next += 1;
                }
            }
        }
    }

    assignments
}

/// Commands understood by the group state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupCommand {
    JoinGroup {
        group_id: String,
        member_id: String,
        client_id: String,
        topics: Vec<String>,
        session_timeout_ms: u64,
    },
    SyncGroup {
        group_id: String,
        member_id: String,
        generation: i32,
        /// Partition counts for the group's subscribed topics.
        partition_counts: HashMap<String, i32>,
    },
    Heartbeat {
        group_id: String,
        member_id: String,
        generation: i32,
    },
    LeaveGroup {
        group_id: String,
        member_id: String,
    },
    /// Remove members whose session lapsed.
    ExpireMembers,
    CommitOffset {
        group_id: String,
        member_id: String,
        generation: i32,
        partition: TopicPartition,
        offset: Offset,
    },
}

/// Responses from the group state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupResponse {
    Joined {
        member_id: String,
        generation: i32,
        leader_id: String,
        member_count: usize,
    },
    Assignment(Vec<TopicPartition>),
    HeartbeatAck,
    LeftGroup,
    MembersExpired {
        expired: Vec<(String, String)>,
    },
    OffsetCommitted,
    InvalidGroupId,
    UnknownMember {
        group_id: String,
        member_id: String,
    },
    IllegalGeneration {
        group_id: String,
        expected: i32,
        actual: i32,
    },
    RebalanceInProgress {
        group_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedOffsetInfo {
    pub offset: Offset,
    pub commit_timestamp_ms: u64,
}

/// All groups and their committed offsets.
#[derive(Debug, Default)]
pub struct GroupDomainState {
    groups: HashMap<String, ConsumerGroupInfo>,
    offsets: HashMap<(String, TopicPartition), CommittedOffsetInfo>,
}

impl GroupDomainState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `cmd` at time `now_ms`.
    pub fn apply(&mut self, cmd: GroupCommand, now_ms: u64) -> GroupResponse {
        match cmd {
            GroupCommand::JoinGroup {
                group_id,
                member_id,
                client_id,
                topics,
                session_timeout_ms,
            } => {
                if group_id.trim().is_empty() {
                    return GroupResponse::InvalidGroupId;
                }

                let group = self
                    .groups
                    .entry(group_id.clone())
                    .or_insert_with(|| ConsumerGroupInfo::new(group_id));

                let mut topics = topics;
                topics.sort();
                topics.dedup();

                let changed = match group.members.get_mut(&member_id) {
                    Some(member) => {
                        member.last_heartbeat_ms = now_ms;
                        member.session_timeout_ms = session_timeout_ms;
                        let changed = member.topics != topics;
                        member.topics = topics;
                        changed
                    }
                    None => {
                        let member_id = if member_id.is_empty() {
                            format!("{}-{}", client_id, uuid::Uuid::new_v4())
                        } else {
                            member_id
                        };
                        group.members.insert(
                            member_id.clone(),
                            MemberInfo {
                                member_id: member_id.clone(),
                                client_id,
                                topics,
                                session_timeout_ms,
                                last_heartbeat_ms: now_ms,
                            },
                        );
                        if group.leader_id.is_none() {
                            group.leader_id = Some(member_id.clone());
                        }
                        tracing::debug!(
                            group_id = %group.group_id,
                            member_id = %member_id,
                            "Member joined group"
                        );
                        return Self::joined_after_change(group, member_id);
                    }
                };

                if changed {
                    group.begin_rebalance();
                }

                GroupResponse::Joined {
                    member_id,
                    generation: group.generation,
                    leader_id: group.leader_id.clone().unwrap_or_default(),
                    member_count: group.members.len(),
                }
            }

            GroupCommand::SyncGroup {
                group_id,
                member_id,
                generation,
                partition_counts,
            } => {
                let Some(group) = self.groups.get_mut(&group_id) else {
                    return GroupResponse::UnknownMember {
                        group_id,
                        member_id,
                    };
                };

                let Some(member) = group.members.get_mut(&member_id) else {
                    return GroupResponse::UnknownMember {
                        group_id,
                        member_id,
                    };
                };
                member.last_heartbeat_ms = now_ms;

                if group.generation != generation {
                    return GroupResponse::IllegalGeneration {
                        group_id,
                        expected: group.generation,
                        actual: generation,
                    };
                }

                if group.assignments.is_none() {
                    let computed = range_assign(&group.members, &partition_counts);
                    tracing::debug!(
                        group_id = %group.group_id,
                        generation = group.generation,
                        members = group.members.len(),
                        "Computed group assignment"
                    );
                    group.assignments = Some(computed);
                    group.state = GroupState::Stable;
                }

                let assignment = group
                    .assignments
                    .as_ref()
                    .and_then(|a| a.get(&member_id).cloned())
                    .unwrap_or_default();

                GroupResponse::Assignment(assignment)
            }

            GroupCommand::Heartbeat {
                group_id,
                member_id,
                generation,
            } => {
                let Some(group) = self.groups.get_mut(&group_id) else {
                    return GroupResponse::UnknownMember {
                        group_id,
                        member_id,
                    };
                };

                let Some(member) = group.members.get_mut(&member_id) else {
                    return GroupResponse::UnknownMember {
                        group_id,
                        member_id,
                    };
                };
                member.last_heartbeat_ms = now_ms;

                if group.generation != generation {
                    return if group.state == GroupState::PreparingRebalance {
                        GroupResponse::RebalanceInProgress { group_id }
                    } else {
                        GroupResponse::IllegalGeneration {
                            group_id,
                            expected: group.generation,
                            actual: generation,
                        }
                    };
                }

                GroupResponse::HeartbeatAck
            }

            GroupCommand::LeaveGroup {
                group_id,
                member_id,
            } => {
                let Some(group) = self.groups.get_mut(&group_id) else {
                    return GroupResponse::UnknownMember {
                        group_id,
                        member_id,
                    };
                };

                if !group.remove_member(&member_id) {
                    return GroupResponse::UnknownMember {
                        group_id,
                        member_id,
                    };
                }

                tracing::debug!(group_id = %group_id, member_id = %member_id, "Member left group");
                group.begin_rebalance();
                GroupResponse::LeftGroup
            }

            GroupCommand::ExpireMembers => {
                let mut expired = Vec::new();

                for group in self.groups.values_mut() {
                    let mut lapsed: Vec<String> = group
                        .members
                        .values()
                        .filter(|m| now_ms.saturating_sub(m.last_heartbeat_ms) > m.session_timeout_ms)
                        .map(|m| m.member_id.clone())
                        .collect();

                    lapsed.truncate(MAX_EXPIRATIONS_PER_GROUP);
                    if lapsed.is_empty() {
                        continue;
                    }

                    for member_id in lapsed {
                        group.remove_member(&member_id);
                        tracing::info!(
                            group_id = %group.group_id,
                            member_id = %member_id,
                            "Expired consumer group member"
                        );
                        expired.push((group.group_id.clone(), member_id));
                    }
                    group.begin_rebalance();
                }

                GroupResponse::MembersExpired { expired }
            }

            GroupCommand::CommitOffset {
                group_id,
                member_id,
                generation,
                partition,
                offset,
            } => {
                if group_id.trim().is_empty() {
                    return GroupResponse::InvalidGroupId;
                }

                // Commits without membership are accepted only while nobody
                // owns the group.
                let standalone = member_id.is_empty() && generation < 0;
                match self.groups.get(&group_id) {
                    Some(group) if standalone && !group.members.is_empty() => {
                        return GroupResponse::UnknownMember {
                            group_id,
                            member_id,
                        };
                    }
                    Some(group) if !standalone => {
                        if !group.members.contains_key(&member_id) {
                            return GroupResponse::UnknownMember {
                                group_id,
                                member_id,
                            };
                        }
                        if group.generation != generation {
                            return GroupResponse::IllegalGeneration {
                                group_id,
                                expected: group.generation,
                                actual: generation,
                            };
                        }
                    }
                    None if !standalone => {
                        return GroupResponse::UnknownMember {
                            group_id,
                            member_id,
                        };
                    }
                    _ => {}
                }

                self.offsets.insert(
                    (group_id, partition),
                    CommittedOffsetInfo {
                        offset,
                        commit_timestamp_ms: now_ms,
                    },
                );
                GroupResponse::OffsetCommitted
            }
        }
    }

    fn joined_after_change(group: &mut ConsumerGroupInfo, member_id: String) -> GroupResponse {
        group.begin_rebalance();
        GroupResponse::Joined {
            member_id,
            generation: group.generation,
            leader_id: group.leader_id.clone().unwrap_or_default(),
            member_count: group.members.len(),
        }
    }

    pub fn get_group(&self, group_id: &str) -> Option<&ConsumerGroupInfo> {
        self.groups.get(group_id)
    }

    pub fn describe(&self, group_id: &str) -> Option<GroupDescription> {
        self.groups.get(group_id).map(ConsumerGroupInfo::describe)
    }

    pub fn get_offset(&self, group_id: &str, partition: &TopicPartition) -> Option<Offset> {
        self.offsets
            .get(&(group_id.to_string(), partition.clone()))
            .map(|info| info.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(state: &mut GroupDomainState, member_id: &str, now: u64) -> (String, i32) {
        match state.apply(
            GroupCommand::JoinGroup {
                group_id: "g".to_string(),
                member_id: member_id.to_string(),
                client_id: "client".to_string(),
                topics: vec!["t".to_string()],
                session_timeout_ms: 1000,
            },
            now,
        ) {
            GroupResponse::Joined {
                member_id,
                generation,
                ..
            } => (member_id, generation),
            other => panic!("Expected Joined, got {:?}", other),
        }
    }

    fn sync(state: &mut GroupDomainState, member_id: &str, generation: i32) -> GroupResponse {
        state.apply(
            GroupCommand::SyncGroup {
                group_id: "g".to_string(),
                member_id: member_id.to_string(),
                generation,
                partition_counts: HashMap::from([("t".to_string(), 3)]),
            },
            0,
        )
    }

    fn heartbeat(state: &mut GroupDomainState, member_id: &str, generation: i32, now: u64) -> GroupResponse {
        state.apply(
            GroupCommand::Heartbeat {
                group_id: "g".to_string(),
                member_id: member_id.to_string(),
                generation,
            },
            now,
        )
    }

    #[test]
    fn test_first_join_generates_member_id() {
        let mut state = GroupDomainState::new();
        let (member, generation) = join(&mut state, "", 0);
        assert!(member.starts_with("client-"));
        assert_eq!(generation, 1);
        let group = state.get_group("g").unwrap();
        assert_eq!(group.leader_id.as_deref(), Some(member.as_str()));
        assert_eq!(group.state, GroupState::PreparingRebalance);
    }

    #[test]
    fn test_single_member_gets_all_partitions() {
        let mut state = GroupDomainState::new();
        let (member, generation) = join(&mut state, "", 0);
        match sync(&mut state, &member, generation) {
            GroupResponse::Assignment(partitions) => assert_eq!(partitions.len(), 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(state.get_group("g").unwrap().state, GroupState::Stable);
    }

    #[test]
    fn test_rejoin_does_not_bump_generation() {
        let mut state = GroupDomainState::new();
        let (member, generation) = join(&mut state, "", 0);
        let (_, again) = join(&mut state, &member, 10);
        assert_eq!(generation, again);
    }

    #[test]
    fn test_second_member_triggers_rebalance() {
        let mut state = GroupDomainState::new();
        let (a, gen1) = join(&mut state, "a", 0);
        assert!(matches!(sync(&mut state, &a, gen1), GroupResponse::Assignment(_)));

        let (b, gen2) = join(&mut state, "b", 0);
        assert_eq!(gen2, gen1 + 1);

        assert!(matches!(
            heartbeat(&mut state, &a, gen1, 1),
            GroupResponse::RebalanceInProgress { .. }
        ));

        let (_, a_gen) = join(&mut state, &a, 2);
        assert_eq!(a_gen, gen2);

        let a_parts = match sync(&mut state, &a, a_gen) {
            GroupResponse::Assignment(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        let b_parts = match sync(&mut state, &b, gen2) {
            GroupResponse::Assignment(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(a_parts.len(), 2);
        assert_eq!(b_parts.len(), 1);
        assert!(a_parts.iter().all(|p| !b_parts.contains(p)));
    }

    #[test]
    fn test_stale_sync_is_illegal_generation() {
        let mut state = GroupDomainState::new();
        let (a, gen1) = join(&mut state, "a", 0);
        join(&mut state, "b", 0);
        assert!(matches!(
            sync(&mut state, &a, gen1),
            GroupResponse::IllegalGeneration { .. }
        ));
    }

    #[test]
    fn test_unknown_member_heartbeat() {
        let mut state = GroupDomainState::new();
        join(&mut state, "a", 0);
        assert!(matches!(
            heartbeat(&mut state, "ghost", 1, 0),
            GroupResponse::UnknownMember { .. }
        ));
    }

    #[test]
    fn test_leave_bumps_generation_and_empties() {
        let mut state = GroupDomainState::new();
        join(&mut state, "a", 0);
        let (_, generation) = join(&mut state, "b", 0);
        state.apply(
            GroupCommand::LeaveGroup {
                group_id: "g".to_string(),
                member_id: "b".to_string(),
            },
            0,
        );
        let group = state.get_group("g").unwrap();
        assert_eq!(group.generation, generation + 1);
        assert_eq!(group.leader_id.as_deref(), Some("a"));

        state.apply(
            GroupCommand::LeaveGroup {
                group_id: "g".to_string(),
                member_id: "a".to_string(),
            },
            0,
        );
        let group = state.get_group("g").unwrap();
        assert_eq!(group.state, GroupState::Empty);
        assert!(group.leader_id.is_none());
    }

    #[test]
    fn test_expire_members() {
        let mut state = GroupDomainState::new();
        join(&mut state, "a", 0);
        let (_, generation) = join(&mut state, "b", 0);
        heartbeat(&mut state, "b", generation, 900);

        match state.apply(GroupCommand::ExpireMembers, 1500) {
            GroupResponse::MembersExpired { expired } => {
                assert_eq!(expired, vec![("g".to_string(), "a".to_string())]);
            }
            other => panic!("unexpected {:?}", other),
        }
        let group = state.get_group("g").unwrap();
        assert_eq!(group.members.len(), 1);
        assert_eq!(group.generation, generation + 1);
    }

    #[test]
    fn test_commit_requires_current_generation() {
        let mut state = GroupDomainState::new();
        let (a, generation) = join(&mut state, "a", 0);
        let tp = TopicPartition::new("t", 0);

        let stale = state.apply(
            GroupCommand::CommitOffset {
                group_id: "g".to_string(),
                member_id: a.clone(),
                generation: generation - 1,
                partition: tp.clone(),
                offset: Offset(5),
            },
            0,
        );
        assert!(matches!(stale, GroupResponse::IllegalGeneration { .. }));

        let ok = state.apply(
            GroupCommand::CommitOffset {
                group_id: "g".to_string(),
                member_id: a,
                generation,
                partition: tp.clone(),
                offset: Offset(11),
            },
            0,
        );
        assert_eq!(ok, GroupResponse::OffsetCommitted);
        assert_eq!(state.get_offset("g", &tp), Some(Offset(11)));
    }

    #[test]
    fn test_standalone_commit_only_for_empty_group() {
        let mut state = GroupDomainState::new();
        let tp = TopicPartition::new("t", 1);
        let commit = |state: &mut GroupDomainState| {
            state.apply(
                GroupCommand::CommitOffset {
                    group_id: "g".to_string(),
                    member_id: String::new(),
                    generation: -1,
                    partition: tp.clone(),
                    offset: Offset(3),
                },
                0,
            )
        };
        assert_eq!(commit(&mut state), GroupResponse::OffsetCommitted);
        join(&mut state, "a", 0);
        assert!(matches!(commit(&mut state), GroupResponse::UnknownMember { .. }));
    }

    #[test]
    fn test_range_assign_five_over_three() {
        let members: BTreeMap<String, MemberInfo> = ["m1", "m2", "m3"]
            .into_iter()
            .map(|id| {
                (
                    id.to_string(),
                    MemberInfo {
                        member_id: id.to_string(),
                        client_id: "c".to_string(),
                        topics: vec!["t".to_string()],
                        session_timeout_ms: 1000,
                        last_heartbeat_ms: 0,
                    },
                )
            })
            .collect();
        let assignments = range_assign(&members, &HashMap::from([("t".to_string(), 5)]));
        let sizes: Vec<usize> = assignments.values().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(assignments["m3"], vec![TopicPartition::new("t", 4)]);
    }

    #[test]
    fn test_generation_wraps() {
        let mut group = ConsumerGroupInfo::new("g".to_string());
        group.generation = i32::MAX;
        group.increment_generation();
        assert_eq!(group.generation, 1);
    }
}
