use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::client::{ClusterClient, ClusterMetadata, GroupDescription};
use crate::error::{ClientError, FetchError, PartialFetchWarning};
use crate::metrics_consts::{FETCHES, FETCH_DURATION_MS, FETCH_WARNINGS};
use crate::types::{
    BrokerMetadata, ClusterSnapshot, ConsumerGroup, GroupState, TopicPartition, TopicPartitionId,
};

/// Maximum number of groups whose offsets are queried at the same time.
const GROUP_FETCH_CONCURRENCY: usize = 8;

/// Builds a [`ClusterSnapshot`] from the cluster client.
///
/// A fetch walks the topology, then the per-broker watermark batches, then
/// the consumer groups, all under one overall deadline. Brokers that fail or
/// run out of time only degrade the snapshot; the fetch fails when no broker
/// answered at all.
pub struct SnapshotFetcher {
    client: Arc<dyn ClusterClient>,
    deadline: Duration,
}

fn remaining(deadline_at: Instant) -> Duration {
    deadline_at.saturating_duration_since(Instant::now())
}

fn client_failure(e: ClientError, deadline: Duration) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(deadline)
    } else {
        FetchError::Unavailable(e.to_string())
    }
}

impl SnapshotFetcher {
    pub fn new(client: Arc<dyn ClusterClient>, deadline: Duration) -> Self {
        Self { client, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn fetch(&self) -> Result<ClusterSnapshot, FetchError> {
        let started = Instant::now();
        let result = self.fetch_until(started + self.deadline).await;

        histogram!(FETCH_DURATION_MS).record(started.elapsed().as_millis() as f64);
        let outcome = match &result {
            Ok(snapshot) if snapshot.is_partial() => "partial",
            Ok(_) => "success",
            Err(FetchError::Timeout(_)) => "timeout",
            Err(FetchError::Unavailable(_)) => "unavailable",
        };
        counter!(FETCHES, "outcome" => outcome).increment(1);

        if let Ok(snapshot) = &result {
            for warning in &snapshot.warnings {
                counter!(FETCH_WARNINGS, "kind" => warning.kind()).increment(1);
            }
            info!(
                brokers = snapshot.brokers.len(),
                partitions = snapshot.partitions.len(),
                groups = snapshot.groups.len(),
                warnings = snapshot.warnings.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "cluster snapshot fetched"
            );
        }
        result
    }

    async fn fetch_until(&self, deadline_at: Instant) -> Result<ClusterSnapshot, FetchError> {
        let metadata = self.fetch_metadata(deadline_at).await?;
        let mut warnings = Vec::new();

        let (mut partitions, by_leader) = layout_partitions(&metadata, &mut warnings);
        let unreachable = self
            .resolve_watermarks(&mut partitions, by_leader, deadline_at, &mut warnings)
            .await?;

        let brokers = metadata
            .brokers
            .iter()
            .map(|b| BrokerMetadata {
                id: b.id,
                address: b.address(),
                leads: partitions
                    .values()
                    .filter(|p| p.leader == b.id)
                    .map(|p| p.id.clone())
                    .collect(),
                reachable: !unreachable.contains_key(&b.id),
            })
            .collect();
        warnings.extend(
            unreachable
                .into_iter()
                .map(|(broker, reason)| PartialFetchWarning::BrokerUnreachable { broker, reason }),
        );

        let groups = self
            .fetch_groups(&partitions, deadline_at, &mut warnings)
            .await;

        Ok(ClusterSnapshot {
            brokers,
            partitions,
            groups,
            fetched_at: Utc::now(),
            warnings,
        })
    }

    async fn fetch_metadata(&self, deadline_at: Instant) -> Result<ClusterMetadata, FetchError> {
        match timeout_at(deadline_at, self.client.fetch_metadata(remaining(deadline_at))).await {
            Ok(Ok(metadata)) => Ok(metadata),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to fetch cluster metadata");
                Err(client_failure(e, self.deadline))
            }
            Err(_) => {
                warn!(deadline = ?self.deadline, "cluster metadata fetch timed out");
                Err(FetchError::Timeout(self.deadline))
            }
        }
    }

    /// Fills in watermarks, one batch per leader broker, all batches in
    /// parallel. Returns the brokers that did not answer, with the reason.
    /// Partitions a broker left out of its answer are recorded as warnings.
    async fn resolve_watermarks(
        &self,
        partitions: &mut BTreeMap<TopicPartitionId, TopicPartition>,
        by_leader: BTreeMap<i32, Vec<TopicPartitionId>>,
        deadline_at: Instant,
        warnings: &mut Vec<PartialFetchWarning>,
    ) -> Result<BTreeMap<i32, String>, FetchError> {
        let batches = by_leader.into_iter().map(|(broker, batch)| {
            let client = Arc::clone(&self.client);
            async move {
                let result = timeout_at(
                    deadline_at,
                    client.fetch_watermarks(broker, batch.clone(), remaining(deadline_at)),
                )
                .await;
                (broker, batch, result)
            }
        });

        let mut answered = 0;
        let mut timed_out = 0;
        let mut unreachable = BTreeMap::new();
        for (broker, requested, result) in join_all(batches).await {
            match result {
                Ok(Ok(watermarks)) => {
                    answered += 1;
                    let mut resolved = BTreeSet::new();
                    for (tp, wm) in watermarks {
                        // The broker may report partitions we did not ask about
                        if let Some(partition) = partitions.get_mut(&tp) {
                            partition.high_watermark = Some(wm.high);
                            partition.oldest_offset = Some(wm.low);
                            resolved.insert(tp);
                        }
                    }
                    for tp in requested.into_iter().filter(|tp| !resolved.contains(tp)) {
                        warn!(broker, partition = %tp, "broker did not report watermarks for partition");
                        warnings.push(PartialFetchWarning::PartitionUnavailable {
                            topic: tp.topic,
                            partition: tp.partition,
                        });
                    }
                }
                Ok(Err(e)) => {
                    if e.is_timeout() {
                        timed_out += 1;
                    }
                    warn!(broker, error = %e, "failed to fetch watermarks from broker");
                    unreachable.insert(broker, e.to_string());
                }
                Err(_) => {
                    timed_out += 1;
                    warn!(broker, "watermark fetch exceeded the deadline");
                    unreachable.insert(broker, "deadline exceeded".to_string());
                }
            }
        }

        if answered == 0 && !unreachable.is_empty() {
            if timed_out == unreachable.len() {
                return Err(FetchError::Timeout(self.deadline));
            }
            let reasons: Vec<String> = unreachable
                .iter()
                .map(|(broker, reason)| format!("broker {broker}: {reason}"))
                .collect();
            return Err(FetchError::Unavailable(reasons.join("; ")));
        }

        Ok(unreachable)
    }

    async fn fetch_groups(
        &self,
        partitions: &BTreeMap<TopicPartitionId, TopicPartition>,
        deadline_at: Instant,
        warnings: &mut Vec<PartialFetchWarning>,
    ) -> Vec<ConsumerGroup> {
        let descriptions =
            match timeout_at(deadline_at, self.client.list_groups(remaining(deadline_at))).await {
                Ok(Ok(descriptions)) => descriptions,
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to list consumer groups");
                    warnings.push(PartialFetchWarning::GroupListingFailed {
                        reason: e.to_string(),
                    });
                    return Vec::new();
                }
                Err(_) => {
                    warn!("consumer group listing exceeded the deadline");
                    warnings.push(PartialFetchWarning::GroupListingFailed {
                        reason: "deadline exceeded".to_string(),
                    });
                    return Vec::new();
                }
            };

        let known: Vec<TopicPartitionId> = partitions.keys().cloned().collect();
        let mut described: Vec<(ConsumerGroup, Option<PartialFetchWarning>)> =
            stream::iter(descriptions)
                .map(|description| self.describe_group(description, known.clone(), deadline_at))
                .buffer_unordered(GROUP_FETCH_CONCURRENCY)
                .collect()
                .await;

        described.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));
        described
            .into_iter()
            .map(|(group, warning)| {
                warnings.extend(warning);
                group
            })
            .collect()
    }

    async fn describe_group(
        &self,
        description: GroupDescription,
        partitions: Vec<TopicPartitionId>,
        deadline_at: Instant,
    ) -> (ConsumerGroup, Option<PartialFetchWarning>) {
        let fetched = timeout_at(
            deadline_at,
            self.client.fetch_committed_offsets(
                &description.id,
                partitions,
                remaining(deadline_at),
            ),
        )
        .await;

        let (offsets, warning) = match fetched {
            Ok(Ok(offsets)) => (offsets, None),
            Ok(Err(e)) => (BTreeMap::new(), Some(e.to_string())),
            Err(_) => (BTreeMap::new(), Some("deadline exceeded".to_string())),
        };
        let warning = warning.map(|reason| {
            warn!(group = %description.id, %reason, "failed to fetch committed offsets");
            PartialFetchWarning::GroupOffsetsFailed {
                group: description.id.clone(),
                reason,
            }
        });

        debug!(
            group = %description.id,
            state = %description.state,
            members = description.members.len(),
            offsets = offsets.len(),
            "described consumer group"
        );
        let group = ConsumerGroup {
            state: GroupState::from_coordinator(&description.state),
            id: description.id,
            members: description.members,
            offsets,
        };
        (group, warning)
    }
}

type PartitionLayout = (
    BTreeMap<TopicPartitionId, TopicPartition>,
    BTreeMap<i32, Vec<TopicPartitionId>>,
);

/// Every known partition, with watermarks still unresolved, plus the
/// partitions grouped by leader broker.
fn layout_partitions(
    metadata: &ClusterMetadata,
    warnings: &mut Vec<PartialFetchWarning>,
) -> PartitionLayout {
    let mut partitions = BTreeMap::new();
    let mut by_leader: BTreeMap<i32, Vec<TopicPartitionId>> = BTreeMap::new();

    for topic in &metadata.topics {
        for p in &topic.partitions {
            let id = TopicPartitionId::new(topic.name.clone(), p.id);
            if p.leader < 0 {
                warnings.push(PartialFetchWarning::PartitionLeaderless {
                    topic: topic.name.clone(),
                    partition: p.id,
                });
            } else {
                by_leader.entry(p.leader).or_default().push(id.clone());
            }
            partitions.insert(
                id.clone(),
                TopicPartition {
                    id,
                    leader: p.leader,
                    replicas: p.replicas.clone(),
                    in_sync_replicas: p.in_sync_replicas.clone(),
                    high_watermark: None,
                    oldest_offset: None,
                },
            );
        }
    }

    (partitions, by_leader)
}
