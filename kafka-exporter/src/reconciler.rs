//! Joins group commits against partition watermarks.

use tracing::debug;

use crate::filter::FilterSet;
use crate::types::{ClusterSnapshot, ConsumerGroup, LagRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoMembers,
    NoValidOffsets,
}

/// Why an otherwise accepted group is left out when empty groups are skipped.
/// Always None when the feature is disabled.
pub fn skip_reason(group: &ConsumerGroup, skip_empty_groups: bool) -> Option<SkipReason> {
    if !skip_empty_groups {
        return None;
    }
    if group.member_count() == 0 {
        return Some(SkipReason::NoMembers);
    }
    if !group.has_valid_offsets() {
        return Some(SkipReason::NoValidOffsets);
    }
    None
}

pub fn should_skip(group: &ConsumerGroup, skip_empty_groups: bool) -> bool {
    skip_reason(group, skip_empty_groups).is_some()
}

/// Groups that pass both the group filters and the empty-group policy.
pub fn exported_groups<'a>(
    snapshot: &'a ClusterSnapshot,
    filters: &'a FilterSet,
    skip_empty_groups: bool,
) -> impl Iterator<Item = &'a ConsumerGroup> + 'a {
    snapshot.groups.iter().filter(move |group| {
        if !filters.decide_group(group).is_include() {
            debug!(group = %group.id, "consumer group filtered out");
            return false;
        }
        if let Some(reason) = skip_reason(group, skip_empty_groups) {
            debug!(group = %group.id, ?reason, "skipping empty consumer group");
            return false;
        }
        true
    })
}

/// Lag for every exported group on every partition it has a commit for.
///
/// Pairs whose topic is filtered out, or whose partition has no known high
/// watermark in this snapshot, are omitted rather than reported as zero.
pub fn reconcile(
    snapshot: &ClusterSnapshot,
    filters: &FilterSet,
    skip_empty_groups: bool,
) -> Vec<LagRecord> {
    exported_groups(snapshot, filters, skip_empty_groups)
        .flat_map(|group| lag_for_group(snapshot, filters, group))
        .collect()
}

fn lag_for_group<'a>(
    snapshot: &'a ClusterSnapshot,
    filters: &'a FilterSet,
    group: &'a ConsumerGroup,
) -> impl Iterator<Item = LagRecord> + 'a {
    group
        .committed_offsets()
        .filter(move |(tp, _)| filters.accepts_topic(&tp.topic))
        .filter_map(move |(tp, committed)| {
            let high_watermark = snapshot.high_watermark(tp)?;
            Some(LagRecord {
                group: group.id.clone(),
                topic: tp.topic.clone(),
                partition: tp.partition,
                committed_offset: committed,
                high_watermark,
                lag: (high_watermark - committed).max(0),
                fetched_at: snapshot.fetched_at,
            })
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use test_case::test_case;

    use super::*;
    use crate::filter::{FilterPatterns, FilterSet};
    use crate::types::{GroupMember, GroupState, TopicPartition, TopicPartitionId};

    fn member(id: &str) -> GroupMember {
        GroupMember {
            id: id.to_string(),
            client_id: "client".to_string(),
            host: "/10.0.0.1".to_string(),
            assignment: Vec::new(),
        }
    }

    fn group(id: &str, members: usize, offsets: &[(&str, i32, Option<i64>)]) -> ConsumerGroup {
        ConsumerGroup {
            id: id.to_string(),
            state: GroupState::Stable,
            members: (0..members).map(|i| member(&format!("{id}-{i}"))).collect(),
            offsets: offsets
                .iter()
                .map(|(t, p, o)| (TopicPartitionId::new(*t, *p), *o))
                .collect(),
        }
    }

    fn partition(topic: &str, id: i32, high_watermark: Option<i64>) -> TopicPartition {
        TopicPartition {
            id: TopicPartitionId::new(topic, id),
            leader: 1,
            replicas: vec![1],
            in_sync_replicas: vec![1],
            high_watermark,
            oldest_offset: high_watermark.map(|_| 0),
        }
    }

    fn snapshot(partitions: Vec<TopicPartition>, groups: Vec<ConsumerGroup>) -> ClusterSnapshot {
        ClusterSnapshot {
            brokers: Vec::new(),
            partitions: partitions
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect::<BTreeMap<_, _>>(),
            groups,
            fetched_at: Utc::now(),
            warnings: Vec::new(),
        }
    }

    fn filters(patterns: FilterPatterns) -> FilterSet {
        FilterSet::compile(&patterns).unwrap()
    }

    #[test_case(true, 0, false, true; "skip empty group when enabled")]
    #[test_case(false, 0, false, false; "do not skip empty group when disabled")]
    #[test_case(true, 2, true, false; "do not skip group with members")]
    #[test_case(true, 1, false, true; "skip group with no valid offsets")]
    #[test_case(true, 1, true, false; "do not skip group with valid offsets")]
    #[test_case(false, 1, false, false; "disabled ignores missing offsets")]
    fn skip_empty_groups(enabled: bool, members: usize, valid_offsets: bool, expected: bool) {
        let offset = if valid_offsets { Some(10) } else { None };
        let g = group("g", members, &[("orders", 0, offset)]);
        assert_eq!(should_skip(&g, enabled), expected);
    }

    #[test]
    fn skip_reasons_are_ordered() {
        let g = group("g", 0, &[]);
        assert_eq!(skip_reason(&g, true), Some(SkipReason::NoMembers));
        let g = group("g", 1, &[("orders", 0, None)]);
        assert_eq!(skip_reason(&g, true), Some(SkipReason::NoValidOffsets));
    }

    #[test]
    fn computes_lag_against_high_watermark() {
        let snap = snapshot(
            vec![partition("orders", 0, Some(100)), partition("orders", 1, Some(50))],
            vec![group("shipping", 1, &[("orders", 0, Some(90)), ("orders", 1, Some(50))])],
        );

        let mut records = reconcile(&snap, &FilterSet::default(), false);
        records.sort_by_key(|r| r.partition);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lag, 10);
        assert_eq!(records[0].committed_offset, 90);
        assert_eq!(records[0].high_watermark, 100);
        assert_eq!(records[1].lag, 0);
    }

    #[test]
    fn lag_is_clamped_at_zero() {
        // Commit ahead of a stale watermark
        let snap = snapshot(
            vec![partition("orders", 0, Some(100))],
            vec![group("g", 1, &[("orders", 0, Some(120))])],
        );
        let records = reconcile(&snap, &FilterSet::default(), false);
        assert_eq!(records[0].lag, 0);
    }

    #[test]
    fn missing_watermark_and_unknown_partition_are_dropped() {
        let snap = snapshot(
            vec![partition("orders", 0, None), partition("orders", 1, Some(5))],
            vec![group(
                "g",
                1,
                &[
                    ("orders", 0, Some(1)),
                    ("orders", 1, Some(2)),
                    ("deleted", 0, Some(3)),
                    ("orders", 2, None),
                ],
            )],
        );
        let records = reconcile(&snap, &FilterSet::default(), false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].partition, 1);
        assert_eq!(records[0].lag, 3);
    }

    #[test]
    fn topic_filter_drops_only_the_pair() {
        let snap = snapshot(
            vec![partition("orders", 0, Some(10)), partition("audit", 0, Some(10))],
            vec![group("g", 1, &[("orders", 0, Some(1)), ("audit", 0, Some(1))])],
        );
        let f = filters(FilterPatterns {
            topic_exclude: "^audit$".to_string(),
            ..Default::default()
        });
        let records = reconcile(&snap, &f, false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "orders");
    }

    #[test]
    fn group_topic_exclude_rejects_whole_group() {
        let snap = snapshot(
            vec![
                partition("orders", 0, Some(10)),
                partition("__consumer_offsets", 0, Some(10)),
            ],
            vec![group(
                "g",
                1,
                &[("orders", 0, Some(1)), ("__consumer_offsets", 0, Some(1))],
            )],
        );
        let f = filters(FilterPatterns {
            group_topic_exclude: "^__.*".to_string(),
            ..Default::default()
        });
        assert!(reconcile(&snap, &f, false).is_empty());
    }

    #[test]
    fn group_id_filter_applies() {
        let snap = snapshot(
            vec![partition("orders", 0, Some(10))],
            vec![
                group("prod-shipping", 1, &[("orders", 0, Some(1))]),
                group("dev-shipping", 1, &[("orders", 0, Some(1))]),
            ],
        );
        let f = filters(FilterPatterns {
            group_filter: "^prod-".to_string(),
            ..Default::default()
        });
        let records = reconcile(&snap, &f, false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].group, "prod-shipping");
    }

    #[test]
    fn skipped_groups_emit_nothing() {
        let snap = snapshot(
            vec![partition("orders", 0, Some(10))],
            vec![group("idle", 0, &[("orders", 0, Some(1))])],
        );
        assert_eq!(reconcile(&snap, &FilterSet::default(), false).len(), 1);
        assert!(reconcile(&snap, &FilterSet::default(), true).is_empty());
    }

    #[test]
    fn records_share_the_snapshot_timestamp() {
        let snap = snapshot(
            vec![partition("orders", 0, Some(10)), partition("orders", 1, Some(10))],
            vec![
                group("a", 1, &[("orders", 0, Some(1))]),
                group("b", 1, &[("orders", 1, Some(1))]),
            ],
        );
        let records = reconcile(&snap, &FilterSet::default(), false);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.fetched_at == snap.fetched_at));
    }
}
