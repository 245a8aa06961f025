use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::assignment::{decode_member_assignment, CONSUMER_PROTOCOL};
use super::{
    BrokerInfo, ClusterClient, ClusterMetadata, GroupDescription, PartitionInfo, TopicInfo,
    Watermarks,
};
use crate::config::ExporterSettings;
use crate::error::ClientError;
use crate::types::{GroupMember, TopicPartitionId};

/// Cluster client backed by librdkafka.
///
/// A single `BaseConsumer` without a group id serves metadata, watermark and
/// group listing requests. Committed offsets can only be read through a
/// consumer configured with the group's id, so each group gets its own
/// consumer. It never subscribes, is reused across fetches, and is dropped
/// once the group stops being listed or the client closes.
pub struct RdKafkaClient {
    config: ClientConfig,
    connections: Mutex<Option<Connections>>,
}

struct Connections {
    main: Arc<BaseConsumer>,
    groups: HashMap<String, Arc<BaseConsumer>>,
}

impl RdKafkaClient {
    /// Creates the client and checks that at least one broker answers.
    pub async fn connect(settings: &ExporterSettings) -> Result<Self, ClientError> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", settings.bootstrap_servers())
            .set("broker.version.fallback", &settings.kafka_version)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000");

        if settings.tls {
            config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        let client = Self::new(config)?;
        let consumer = client.consumer()?;
        let timeout = settings.fetch_timeout;
        let (brokers, topics) = run_blocking("fetch_metadata", move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|m| (m.brokers().len(), m.topics().len()))
                .map_err(|e| map_kafka_error("fetch_metadata", e))
        })
        .await?;
        info!(brokers, topics, "connected to kafka");

        Ok(client)
    }

    /// Creates the client without contacting the cluster.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let main = create_consumer("create_consumer", &config)?;
        Ok(Self {
            config,
            connections: Mutex::new(Some(Connections {
                main: Arc::new(main),
                groups: HashMap::new(),
            })),
        })
    }

    fn connections(&self) -> MutexGuard<'_, Option<Connections>> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn consumer(&self) -> Result<Arc<BaseConsumer>, ClientError> {
        self.connections()
            .as_ref()
            .map(|c| Arc::clone(&c.main))
            .ok_or(ClientError::Closed)
    }

    /// The consumer bound to `group`, created on first use.
    fn group_consumer(&self, group: &str) -> Result<Arc<BaseConsumer>, ClientError> {
        let mut connections = self.connections();
        let connections = connections.as_mut().ok_or(ClientError::Closed)?;
        if let Some(consumer) = connections.groups.get(group) {
            return Ok(Arc::clone(consumer));
        }

        let mut config = self.config.clone();
        config.set("group.id", group);
        let consumer = Arc::new(create_consumer("create_group_consumer", &config)?);
        debug!(group, "created group consumer");
        connections
            .groups
            .insert(group.to_string(), Arc::clone(&consumer));
        Ok(consumer)
    }

    /// Drops the consumers of groups that are no longer listed.
    fn retain_group_consumers(&self, listed: &[GroupDescription]) {
        if let Some(connections) = self.connections().as_mut() {
            let before = connections.groups.len();
            connections
                .groups
                .retain(|group, _| listed.iter().any(|g| &g.id == group));
            let evicted = before - connections.groups.len();
            if evicted > 0 {
                debug!(evicted, "released consumers of vanished groups");
            }
        }
    }

    #[cfg(test)]
    fn group_consumer_count(&self) -> usize {
        self.connections()
            .as_ref()
            .map_or(0, |c| c.groups.len())
    }
}

fn create_consumer(
    operation: &'static str,
    config: &ClientConfig,
) -> Result<BaseConsumer, ClientError> {
    config.create().map_err(|e| ClientError::Kafka {
        operation,
        reason: e.to_string(),
    })
}

async fn run_blocking<T, F>(operation: &'static str, f: F) -> Result<T, ClientError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ClientError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ClientError::Kafka {
            operation,
            reason: format!("blocking task failed: {e}"),
        })?
}

fn is_timeout_error(e: &KafkaError) -> bool {
    match e {
        KafkaError::Global(code)
        | KafkaError::MetadataFetch(code)
        | KafkaError::GroupListFetch(code)
        | KafkaError::OffsetFetch(code) => matches!(
            code,
            RDKafkaErrorCode::RequestTimedOut | RDKafkaErrorCode::OperationTimedOut
        ),
        _ => false,
    }
}

fn map_kafka_error(operation: &'static str, e: KafkaError) -> ClientError {
    if is_timeout_error(&e) {
        ClientError::Timeout { operation }
    } else {
        ClientError::Kafka {
            operation,
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl ClusterClient for RdKafkaClient {
    async fn fetch_metadata(&self, timeout: Duration) -> Result<ClusterMetadata, ClientError> {
        let consumer = self.consumer()?;
        run_blocking("fetch_metadata", move || {
            let metadata = consumer
                .fetch_metadata(None, timeout)
                .map_err(|e| map_kafka_error("fetch_metadata", e))?;

            let brokers = metadata
                .brokers()
                .iter()
                .map(|b| BrokerInfo {
                    id: b.id(),
                    host: b.host().to_string(),
                    port: b.port(),
                })
                .collect();

            let topics = metadata
                .topics()
                .iter()
                .filter(|t| {
                    if let Some(err) = t.error() {
                        debug!(topic = t.name(), error = ?err, "skipping topic with metadata error");
                        return false;
                    }
                    true
                })
                .map(|t| TopicInfo {
                    name: t.name().to_string(),
                    partitions: t
                        .partitions()
                        .iter()
                        .map(|p| PartitionInfo {
                            id: p.id(),
                            leader: p.leader(),
                            replicas: p.replicas().to_vec(),
                            in_sync_replicas: p.isr().to_vec(),
                        })
                        .collect(),
                })
                .collect();

            Ok(ClusterMetadata { brokers, topics })
        })
        .await
    }

    async fn fetch_watermarks(
        &self,
        broker: i32,
        partitions: Vec<TopicPartitionId>,
        timeout: Duration,
    ) -> Result<Vec<(TopicPartitionId, Watermarks)>, ClientError> {
        let consumer = self.consumer()?;
        run_blocking("fetch_watermarks", move || {
            let started = Instant::now();
            let mut resolved = Vec::with_capacity(partitions.len());
            let mut last_error = None;

            for tp in partitions {
                let Some(remaining) = timeout.checked_sub(started.elapsed()) else {
                    last_error = Some(ClientError::Timeout {
                        operation: "fetch_watermarks",
                    });
                    break;
                };
                match consumer.fetch_watermarks(&tp.topic, tp.partition, remaining) {
                    Ok((low, high)) => resolved.push((tp, Watermarks { low, high })),
                    Err(e) => {
                        debug!(broker, partition = %tp, error = %e, "failed to fetch watermarks");
                        last_error = Some(map_kafka_error("fetch_watermarks", e));
                    }
                }
            }

            match (resolved.is_empty(), last_error) {
                (true, Some(ClientError::Timeout { operation })) => {
                    Err(ClientError::Timeout { operation })
                }
                (true, Some(e)) => Err(ClientError::BrokerUnavailable {
                    broker,
                    reason: e.to_string(),
                }),
                _ => Ok(resolved),
            }
        })
        .await
    }

    async fn list_groups(&self, timeout: Duration) -> Result<Vec<GroupDescription>, ClientError> {
        let consumer = self.consumer()?;
        let described = run_blocking("list_groups", move || {
            let groups = consumer
                .fetch_group_list(None, timeout)
                .map_err(|e| map_kafka_error("list_groups", e))?;

            let described: Vec<GroupDescription> = groups
                .groups()
                .iter()
                .map(|g| {
                    let members = g
                        .members()
                        .iter()
                        .map(|m| {
                            let assignment = match m.assignment() {
                                Some(raw) if g.protocol_type() == CONSUMER_PROTOCOL => {
                                    decode_member_assignment(raw).unwrap_or_else(|e| {
                                        warn!(group = g.name(), member = m.id(), error = %e, "failed to decode member assignment");
                                        Vec::new()
                                    })
                                }
                                _ => Vec::new(),
                            };
                            GroupMember {
                                id: m.id().to_string(),
                                client_id: m.client_id().to_string(),
                                host: m.client_host().to_string(),
                                assignment,
                            }
                        })
                        .collect();
                    GroupDescription {
                        id: g.name().to_string(),
                        state: g.state().to_string(),
                        members,
                    }
                })
                .collect();

            Ok(described)
        })
        .await?;

        self.retain_group_consumers(&described);
        Ok(described)
    }

    async fn fetch_committed_offsets(
        &self,
        group: &str,
        partitions: Vec<TopicPartitionId>,
        timeout: Duration,
    ) -> Result<BTreeMap<TopicPartitionId, Option<i64>>, ClientError> {
        let consumer = self.group_consumer(group)?;
        run_blocking("fetch_committed_offsets", move || {
            let mut tpl = TopicPartitionList::new();
            for tp in &partitions {
                tpl.add_partition(&tp.topic, tp.partition);
            }

            let committed = consumer
                .committed_offsets(tpl, timeout)
                .map_err(|e| map_kafka_error("fetch_committed_offsets", e))?;

            Ok(committed
                .elements()
                .iter()
                .map(|elem| {
                    let offset = match elem.offset() {
                        Offset::Offset(offset) if offset >= 0 => Some(offset),
                        _ => None,
                    };
                    (TopicPartitionId::new(elem.topic(), elem.partition()), offset)
                })
                .collect())
        })
        .await
    }

    async fn close(&self) {
        // In-flight calls hold their own handle; the consumers are destroyed
        // once those calls return
        let released = self.connections().take();
        if let Some(released) = released {
            info!(
                group_consumers = released.groups.len(),
                "kafka client closed"
            );
        }
    }
}
