//! The cluster capability consumed by the fetcher.
//!
//! Wire-level concerns (broker discovery, request framing, TLS) live behind
//! [`ClusterClient`]. The production implementation wraps librdkafka; tests
//! substitute [`crate::test_utils::FakeCluster`].

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::types::{GroupMember, TopicPartitionId};

pub mod assignment;
pub mod rdkafka_client;

pub use rdkafka_client::RdKafkaClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerInfo {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub id: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub in_sync_replicas: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub partitions: Vec<PartitionInfo>,
}

/// Cluster topology as currently known by the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterMetadata {
    pub brokers: Vec<BrokerInfo>,
    pub topics: Vec<TopicInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: i64,
    pub high: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescription {
    pub id: String,
    /// Raw coordinator state, e.g. "Stable" or "PreparingRebalance".
    pub state: String,
    pub members: Vec<GroupMember>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn fetch_metadata(&self, timeout: Duration) -> Result<ClusterMetadata, ClientError>;

    /// Watermarks for partitions led by `broker`, queried as one batch.
    ///
    /// Partitions that could not be resolved are left out of the result.
    /// An error means the broker as a whole did not answer.
    async fn fetch_watermarks(
        &self,
        broker: i32,
        partitions: Vec<TopicPartitionId>,
        timeout: Duration,
    ) -> Result<Vec<(TopicPartitionId, Watermarks)>, ClientError>;

    async fn list_groups(&self, timeout: Duration) -> Result<Vec<GroupDescription>, ClientError>;

    /// Committed offsets of `group`. Partitions without a commit map to None.
    async fn fetch_committed_offsets(
        &self,
        group: &str,
        partitions: Vec<TopicPartitionId>,
        timeout: Duration,
    ) -> Result<BTreeMap<TopicPartitionId, Option<i64>>, ClientError>;

    /// Releases the connection. Calls after the first are no-ops.
    async fn close(&self);
}
