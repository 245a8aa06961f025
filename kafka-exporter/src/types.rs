use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::PartialFetchWarning;

/// A Kafka topic-partition pair, used as the join key between group
/// offsets and partition watermarks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartitionId {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartitionId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub id: i32,
    pub address: String,
    /// Partitions this broker currently leads.
    pub leads: BTreeSet<TopicPartitionId>,
    /// False when the broker did not answer its watermark batch.
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartition {
    pub id: TopicPartitionId,
    /// Leader broker id, -1 when the partition is leaderless.
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub in_sync_replicas: Vec<i32>,
    /// None when the leader could not be reached during the fetch.
    pub high_watermark: Option<i64>,
    pub oldest_offset: Option<i64>,
}

impl TopicPartition {
    pub fn is_under_replicated(&self) -> bool {
        self.in_sync_replicas.len() < self.replicas.len()
    }

    /// The preferred leader is the first replica in the assignment.
    pub fn leader_is_preferred(&self) -> bool {
        self.leader >= 0 && self.replicas.first() == Some(&self.leader)
    }
}

/// Lifecycle state of a consumer group as reported by the group coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupState {
    Stable,
    Rebalancing,
    Dead,
    Unknown,
}

impl GroupState {
    /// Maps the coordinator's state string. `Empty` groups have no rebalance
    /// in flight, so they count as stable.
    pub fn from_coordinator(state: &str) -> Self {
        match state {
            "Stable" | "Empty" => GroupState::Stable,
            "PreparingRebalance" | "CompletingRebalance" | "AwaitingSync" => {
                GroupState::Rebalancing
            }
            "Dead" => GroupState::Dead,
            _ => GroupState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Stable => "stable",
            GroupState::Rebalancing => "rebalancing",
            GroupState::Dead => "dead",
            GroupState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMember {
    pub id: String,
    pub client_id: String,
    pub host: String,
    pub assignment: Vec<TopicPartitionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerGroup {
    pub id: String,
    pub state: GroupState,
    pub members: Vec<GroupMember>,
    /// Committed offset per partition; None when the coordinator has no
    /// commit for that partition.
    pub offsets: BTreeMap<TopicPartitionId, Option<i64>>,
}

impl ConsumerGroup {
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn has_valid_offsets(&self) -> bool {
        self.offsets.values().any(|offset| offset.is_some())
    }

    /// Topics this group consumes: anything with a committed offset plus
    /// anything assigned to one of its members.
    pub fn consumed_topics(&self) -> BTreeSet<&str> {
        let committed = self
            .offsets
            .iter()
            .filter(|(_, offset)| offset.is_some())
            .map(|(tp, _)| tp.topic.as_str());
        let assigned = self
            .members
            .iter()
            .flat_map(|m| m.assignment.iter().map(|tp| tp.topic.as_str()));
        committed.chain(assigned).collect()
    }

    /// Partitions with a resolvable committed offset.
    pub fn committed_offsets(&self) -> impl Iterator<Item = (&TopicPartitionId, i64)> {
        self.offsets
            .iter()
            .filter_map(|(tp, offset)| offset.map(|o| (tp, o)))
    }
}

/// Everything known about the cluster at one point in time. Published
/// behind an `Arc` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSnapshot {
    pub brokers: Vec<BrokerMetadata>,
    pub partitions: BTreeMap<TopicPartitionId, TopicPartition>,
    pub groups: Vec<ConsumerGroup>,
    pub fetched_at: DateTime<Utc>,
    pub warnings: Vec<PartialFetchWarning>,
}

impl ClusterSnapshot {
    pub fn high_watermark(&self, tp: &TopicPartitionId) -> Option<i64> {
        self.partitions.get(tp).and_then(|p| p.high_watermark)
    }

    pub fn reachable_brokers(&self) -> usize {
        self.brokers.iter().filter(|b| b.reachable).count()
    }

    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Lag of one group on one partition, computed against a single snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagRecord {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub committed_offset: i64,
    pub high_watermark: i64,
    pub lag: i64,
    pub fetched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(offsets: &[(&str, i32, Option<i64>)], assigned: &[(&str, i32)]) -> ConsumerGroup {
        ConsumerGroup {
            id: "g".to_string(),
            state: GroupState::Stable,
            members: vec![GroupMember {
                id: "m-1".to_string(),
                client_id: "c".to_string(),
                host: "/10.0.0.1".to_string(),
                assignment: assigned
                    .iter()
                    .map(|(t, p)| TopicPartitionId::new(*t, *p))
                    .collect(),
            }],
            offsets: offsets
                .iter()
                .map(|(t, p, o)| (TopicPartitionId::new(*t, *p), *o))
                .collect(),
        }
    }

    #[test]
    fn consumed_topics_ignore_missing_commits() {
        let g = group(
            &[("orders", 0, Some(4)), ("payments", 0, None)],
            &[("audit", 1)],
        );
        let topics: Vec<_> = g.consumed_topics().into_iter().collect();
        assert_eq!(topics, vec!["audit", "orders"]);
        assert!(g.has_valid_offsets());
    }

    #[test]
    fn no_valid_offsets_when_all_missing() {
        let g = group(&[("orders", 0, None)], &[]);
        assert!(!g.has_valid_offsets());
        assert_eq!(g.committed_offsets().count(), 0);
    }

    #[test]
    fn coordinator_states() {
        assert_eq!(GroupState::from_coordinator("Stable"), GroupState::Stable);
        assert_eq!(GroupState::from_coordinator("Empty"), GroupState::Stable);
        assert_eq!(
            GroupState::from_coordinator("PreparingRebalance"),
            GroupState::Rebalancing
        );
        assert_eq!(
            GroupState::from_coordinator("CompletingRebalance"),
            GroupState::Rebalancing
        );
        assert_eq!(GroupState::from_coordinator("Dead"), GroupState::Dead);
        assert_eq!(GroupState::from_coordinator("???"), GroupState::Unknown);
    }

    #[test]
    fn preferred_leader_and_replication() {
        let p = TopicPartition {
            id: TopicPartitionId::new("orders", 0),
            leader: 2,
            replicas: vec![1, 2, 3],
            in_sync_replicas: vec![2, 3],
            high_watermark: Some(10),
            oldest_offset: Some(0),
        };
        assert!(!p.leader_is_preferred());
        assert!(p.is_under_replicated());
    }
}
