//! In-memory cluster used by unit and integration tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{
    BrokerInfo, ClusterClient, ClusterMetadata, GroupDescription, PartitionInfo, TopicInfo,
    Watermarks,
};
use crate::error::ClientError;
use crate::types::{GroupMember, TopicPartitionId};

#[derive(Default)]
struct FakeState {
    metadata: ClusterMetadata,
    watermarks: HashMap<TopicPartitionId, Watermarks>,
    groups: Vec<GroupDescription>,
    commits: HashMap<String, BTreeMap<TopicPartitionId, i64>>,
    failed_brokers: HashSet<i32>,
    broker_delays: HashMap<i32, Duration>,
    failed_group_offsets: HashSet<String>,
    metadata_latency: Duration,
    fail_metadata: bool,
}

/// A scriptable [`ClusterClient`]: brokers can be failed or slowed down,
/// and every call is counted.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
    metadata_calls: AtomicUsize,
    watermark_calls: AtomicUsize,
    group_list_calls: AtomicUsize,
    closed: AtomicBool,
}

pub fn member(id: &str, assignment: &[(&str, i32)]) -> GroupMember {
    GroupMember {
        id: id.to_string(),
        client_id: format!("{id}-client"),
        host: "/10.0.0.1".to_string(),
        assignment: assignment
            .iter()
            .map(|(topic, partition)| TopicPartitionId::new(*topic, *partition))
            .collect(),
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two brokers, three topics and three groups:
    /// - `billing`: one member on payments/0, lag 5
    /// - `shipping`: two members on orders/0 and orders/1, lag 10 and 0
    /// - `idle`: no members and no commits
    pub fn sample() -> Self {
        let cluster = Self::new();
        cluster.add_broker(1, "kafka-1");
        cluster.add_broker(2, "kafka-2");

        cluster.add_partition("orders", 0, 1, &[1, 2], &[1, 2], 0, 100);
        cluster.add_partition("orders", 1, 2, &[2, 1], &[2], 10, 80);
        cluster.add_partition("payments", 0, 1, &[1, 2], &[1, 2], 0, 50);
        cluster.add_partition("__consumer_offsets", 0, 2, &[2, 1], &[2, 1], 0, 10);

        cluster.add_group("billing", "Stable", vec![member("billing-1", &[("payments", 0)])]);
        cluster.commit("billing", "payments", 0, 45);

        cluster.add_group(
            "shipping",
            "Stable",
            vec![
                member("shipping-1", &[("orders", 0)]),
                member("shipping-2", &[("orders", 1)]),
            ],
        );
        cluster.commit("shipping", "orders", 0, 90);
        cluster.commit("shipping", "orders", 1, 80);

        cluster.add_group("idle", "Empty", Vec::new());
        cluster
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_broker(&self, id: i32, host: &str) {
        self.state().metadata.brokers.push(BrokerInfo {
            id,
            host: host.to_string(),
            port: 9092,
        });
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_partition(
        &self,
        topic: &str,
        partition: i32,
        leader: i32,
        replicas: &[i32],
        in_sync_replicas: &[i32],
        low: i64,
        high: i64,
    ) {
        let mut state = self.state();
        let info = PartitionInfo {
            id: partition,
            leader,
            replicas: replicas.to_vec(),
            in_sync_replicas: in_sync_replicas.to_vec(),
        };
        match state.metadata.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(info),
            None => state.metadata.topics.push(TopicInfo {
                name: topic.to_string(),
                partitions: vec![info],
            }),
        }
        state
            .watermarks
            .insert(TopicPartitionId::new(topic, partition), Watermarks { low, high });
    }

    pub fn add_group(&self, id: &str, state: &str, members: Vec<GroupMember>) {
        self.state().groups.push(GroupDescription {
            id: id.to_string(),
            state: state.to_string(),
            members,
        });
    }

    pub fn commit(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.state()
            .commits
            .entry(group.to_string())
            .or_default()
            .insert(TopicPartitionId::new(topic, partition), offset);
    }

    pub fn set_high_watermark(&self, topic: &str, partition: i32, high: i64) {
        if let Some(wm) = self
            .state()
            .watermarks
            .get_mut(&TopicPartitionId::new(topic, partition))
        {
            wm.high = high;
        }
    }

    /// The partition's leader answers its batch but leaves this partition out.
    pub fn drop_watermark(&self, topic: &str, partition: i32) {
        self.state()
            .watermarks
            .remove(&TopicPartitionId::new(topic, partition));
    }

    pub fn set_leader(&self, topic: &str, partition: i32, leader: i32) {
        let mut state = self.state();
        let found = state
            .metadata
            .topics
            .iter_mut()
            .filter(|t| t.name == topic)
            .flat_map(|t| t.partitions.iter_mut())
            .find(|p| p.id == partition);
        if let Some(p) = found {
            p.leader = leader;
        }
    }

    pub fn fail_broker(&self, id: i32) {
        self.state().failed_brokers.insert(id);
    }

    pub fn restore_broker(&self, id: i32) {
        self.state().failed_brokers.remove(&id);
    }

    pub fn delay_broker(&self, id: i32, delay: Duration) {
        self.state().broker_delays.insert(id, delay);
    }

    pub fn fail_metadata(&self, fail: bool) {
        self.state().fail_metadata = fail;
    }

    pub fn fail_group_offsets(&self, group: &str) {
        self.state().failed_group_offsets.insert(group.to_string());
    }

    pub fn set_metadata_latency(&self, latency: Duration) {
        self.state().metadata_latency = latency;
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn watermark_calls(&self) -> usize {
        self.watermark_calls.load(Ordering::SeqCst)
    }

    pub fn group_list_calls(&self) -> usize {
        self.group_list_calls.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn fetch_metadata(&self, _timeout: Duration) -> Result<ClusterMetadata, ClientError> {
        self.ensure_open()?;
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);

        let (latency, fail, metadata) = {
            let state = self.state();
            (
                state.metadata_latency,
                state.fail_metadata,
                state.metadata.clone(),
            )
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if fail {
            return Err(ClientError::Kafka {
                operation: "fetch_metadata",
                reason: "all brokers down".to_string(),
            });
        }
        Ok(metadata)
    }

    async fn fetch_watermarks(
        &self,
        broker: i32,
        partitions: Vec<TopicPartitionId>,
        _timeout: Duration,
    ) -> Result<Vec<(TopicPartitionId, Watermarks)>, ClientError> {
        self.ensure_open()?;
        self.watermark_calls.fetch_add(1, Ordering::SeqCst);

        let (failed, delay, resolved) = {
            let state = self.state();
            let resolved: Vec<_> = partitions
                .into_iter()
                .filter_map(|tp| state.watermarks.get(&tp).map(|wm| (tp, *wm)))
                .collect();
            (
                state.failed_brokers.contains(&broker),
                state.broker_delays.get(&broker).copied(),
                resolved,
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failed {
            return Err(ClientError::BrokerUnavailable {
                broker,
                reason: "connection refused".to_string(),
            });
        }
        Ok(resolved)
    }

    async fn list_groups(&self, _timeout: Duration) -> Result<Vec<GroupDescription>, ClientError> {
        self.ensure_open()?;
        self.group_list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().groups.clone())
    }

    async fn fetch_committed_offsets(
        &self,
        group: &str,
        partitions: Vec<TopicPartitionId>,
        _timeout: Duration,
    ) -> Result<BTreeMap<TopicPartitionId, Option<i64>>, ClientError> {
        self.ensure_open()?;
        let state = self.state();
        if state.failed_group_offsets.contains(group) {
            return Err(ClientError::Kafka {
                operation: "fetch_committed_offsets",
                reason: "coordinator not available".to_string(),
            });
        }
        let commits = state.commits.get(group);
        Ok(partitions
            .into_iter()
            .map(|tp| {
                let offset = commits.and_then(|c| c.get(&tp)).copied();
                (tp, offset)
            })
            .collect())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
