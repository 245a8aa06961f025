use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::MetadataCache;
use crate::client::{ClusterClient, RdKafkaClient};
use crate::config::{ExporterOptions, ExporterSettings};
use crate::error::ExporterError;
use crate::fetcher::SnapshotFetcher;
use crate::filter::FilterSet;
use crate::metrics_consts::SCRAPE_ERRORS;
use crate::reconciler::{exported_groups, reconcile};
use crate::types::{ClusterSnapshot, GroupState, LagRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    pub id: i32,
    pub address: String,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub topic: String,
    pub partition: i32,
    pub leader: i32,
    pub replicas: usize,
    pub in_sync_replicas: usize,
    pub high_watermark: Option<i64>,
    pub oldest_offset: Option<i64>,
    pub leader_is_preferred: bool,
    pub under_replicated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatus {
    pub group: String,
    pub state: GroupState,
    pub members: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupTopicSum {
    pub group: String,
    pub topic: String,
    pub current_offset: i64,
    pub lag: i64,
}

/// Everything one scrape reports, derived from a single cluster snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub brokers: Vec<BrokerStatus>,
    /// Partition count per topic, for topics passing the topic filter.
    pub topic_partitions: BTreeMap<String, usize>,
    pub partitions: Vec<PartitionStatus>,
    pub lag: Vec<LagRecord>,
    pub groups: Vec<GroupStatus>,
    pub group_topic_sums: Vec<GroupTopicSum>,
    pub warnings: usize,
}

impl MetricSnapshot {
    pub fn build(snapshot: &ClusterSnapshot, filters: &FilterSet, skip_empty_groups: bool) -> Self {
        let brokers = snapshot
            .brokers
            .iter()
            .map(|b| BrokerStatus {
                id: b.id,
                address: b.address.clone(),
                up: b.reachable,
            })
            .collect();

        let mut topic_partitions: BTreeMap<String, usize> = BTreeMap::new();
        let mut partitions = Vec::new();
        for p in snapshot.partitions.values() {
            if !filters.accepts_topic(&p.id.topic) {
                continue;
            }
            *topic_partitions.entry(p.id.topic.clone()).or_default() += 1;
            partitions.push(PartitionStatus {
                topic: p.id.topic.clone(),
                partition: p.id.partition,
                leader: p.leader,
                replicas: p.replicas.len(),
                in_sync_replicas: p.in_sync_replicas.len(),
                high_watermark: p.high_watermark,
                oldest_offset: p.oldest_offset,
                leader_is_preferred: p.leader_is_preferred(),
                under_replicated: p.is_under_replicated(),
            });
        }

        let groups = exported_groups(snapshot, filters, skip_empty_groups)
            .map(|g| GroupStatus {
                group: g.id.clone(),
                state: g.state,
                members: g.member_count(),
            })
            .collect();

        let lag = reconcile(snapshot, filters, skip_empty_groups);

        let mut sums: BTreeMap<(&str, &str), (i64, i64)> = BTreeMap::new();
        for record in &lag {
            let sum = sums
                .entry((record.group.as_str(), record.topic.as_str()))
                .or_default();
            sum.0 += record.committed_offset;
            sum.1 += record.lag;
        }
        let group_topic_sums = sums
            .into_iter()
            .map(|((group, topic), (current_offset, lag))| GroupTopicSum {
                group: group.to_string(),
                topic: topic.to_string(),
                current_offset,
                lag,
            })
            .collect();

        Self {
            fetched_at: snapshot.fetched_at,
            brokers,
            topic_partitions,
            partitions,
            lag,
            groups,
            group_topic_sums,
            warnings: snapshot.warnings.len(),
        }
    }
}

/// Entry point for scraping a Kafka cluster.
///
/// Built once from validated options, shared between any number of
/// concurrent scrapers, and closed exactly once at shutdown. Every scrape
/// after `close` fails with [`ExporterError::Closed`].
pub struct Exporter {
    settings: ExporterSettings,
    client: Arc<dyn ClusterClient>,
    cache: MetadataCache,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Exporter {
    /// Validates the options and connects to the cluster. Bad options fail
    /// before any connection is attempted.
    pub async fn connect(options: &ExporterOptions) -> Result<Self, ExporterError> {
        let settings = ExporterSettings::try_from(options)?;
        let client = RdKafkaClient::connect(&settings)
            .await
            .map_err(ExporterError::Connection)?;
        info!(brokers = %settings.bootstrap_servers(), "connected to kafka");
        Ok(Self::with_client(settings, Arc::new(client)))
    }

    pub fn with_client(settings: ExporterSettings, client: Arc<dyn ClusterClient>) -> Self {
        let fetcher = SnapshotFetcher::new(Arc::clone(&client), settings.fetch_timeout);
        let cache = MetadataCache::new(fetcher, settings.metadata_refresh_interval);
        Self {
            settings,
            client,
            cache,
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ExporterSettings {
        &self.settings
    }

    /// Starts the periodic metadata refresh. It stops when the exporter closes.
    pub fn spawn_refresh_loop(&self) -> JoinHandle<()> {
        self.cache.spawn_refresh_loop(self.shutdown.child_token())
    }

    pub fn has_snapshot(&self) -> bool {
        self.cache.current().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn scrape(&self) -> Result<MetricSnapshot, ExporterError> {
        let result = self.scrape_inner().await;
        if let Err(e) = &result {
            counter!(SCRAPE_ERRORS, "kind" => e.kind()).increment(1);
        }
        result
    }

    async fn scrape_inner(&self) -> Result<MetricSnapshot, ExporterError> {
        if self.is_closed() {
            return Err(ExporterError::Closed);
        }
        let fetched = self.cache.get().await;
        // A close that raced with the fetch wins, whatever the fetch returned
        if self.is_closed() {
            return Err(ExporterError::Closed);
        }
        let snapshot = fetched.map_err(|e| {
            error!(error = %e, "scrape failed with no snapshot to fall back on");
            ExporterError::from(e)
        })?;

        Ok(MetricSnapshot::build(
            &snapshot,
            &self.settings.filters,
            self.settings.skip_empty_consumer_groups,
        ))
    }

    /// Stops the refresh loop and releases the cluster connection. Calling
    /// it again is a no-op.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            warn!("exporter already closed");
            return;
        }
        self.shutdown.cancel();
        self.client.close().await;
        self.cache.close();
        info!("exporter closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::filter::FilterPatterns;
    use crate::test_utils::FakeCluster;

    fn exporter(cluster: &Arc<FakeCluster>, options: ExporterOptions) -> Exporter {
        let settings = ExporterSettings::try_from(&options).unwrap();
        Exporter::with_client(settings, cluster.clone())
    }

    #[tokio::test]
    async fn builds_metric_snapshot() {
        let cluster = Arc::new(FakeCluster::sample());
        let exporter = exporter(&cluster, ExporterOptions::default());

        let metrics = exporter.scrape().await.unwrap();

        assert_eq!(metrics.brokers.len(), 2);
        assert!(metrics.brokers.iter().all(|b| b.up));
        assert_eq!(metrics.topic_partitions["orders"], 2);
        assert_eq!(metrics.partitions.len(), 4);

        let orders_1 = metrics
            .partitions
            .iter()
            .find(|p| p.topic == "orders" && p.partition == 1)
            .unwrap();
        assert_eq!(orders_1.oldest_offset, Some(10));
        assert!(orders_1.under_replicated);
        assert!(orders_1.leader_is_preferred);

        assert_eq!(metrics.lag.len(), 3);
        let shipping = metrics
            .group_topic_sums
            .iter()
            .find(|s| s.group == "shipping" && s.topic == "orders")
            .unwrap();
        assert_eq!(shipping.current_offset, 170);
        assert_eq!(shipping.lag, 10);

        let groups: Vec<_> = metrics.groups.iter().map(|g| g.group.as_str()).collect();
        assert_eq!(groups, vec!["billing", "idle", "shipping"]);
    }

    #[tokio::test]
    async fn topic_filter_applies_to_partition_metrics() {
        let cluster = Arc::new(FakeCluster::sample());
        let exporter = exporter(
            &cluster,
            ExporterOptions {
                filters: FilterPatterns {
                    topic_exclude: "^__.*".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );

        let metrics = exporter.scrape().await.unwrap();
        assert!(!metrics.topic_partitions.contains_key("__consumer_offsets"));
        assert!(metrics.partitions.iter().all(|p| !p.topic.starts_with("__")));
    }

    #[tokio::test]
    async fn skip_empty_groups_hides_idle_group() {
        let cluster = Arc::new(FakeCluster::sample());
        let exporter = exporter(
            &cluster,
            ExporterOptions {
                skip_empty_consumer_groups: true,
                ..Default::default()
            },
        );

        let metrics = exporter.scrape().await.unwrap();
        assert!(metrics.groups.iter().all(|g| g.group != "idle"));
    }

    #[tokio::test]
    async fn scrape_after_close_fails() {
        let cluster = Arc::new(FakeCluster::sample());
        let exporter = exporter(&cluster, ExporterOptions::default());
        exporter.scrape().await.unwrap();

        exporter.close().await;
        exporter.close().await;

        assert!(exporter.is_closed());
        assert!(cluster.is_closed());
        assert!(!exporter.has_snapshot());
        assert!(matches!(
            exporter.scrape().await,
            Err(ExporterError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_refresh_loop() {
        let cluster = Arc::new(FakeCluster::sample());
        let exporter = exporter(&cluster, ExporterOptions::default());
        let handle = exporter.spawn_refresh_loop();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(exporter.has_snapshot());

        exporter.close().await;
        handle.await.unwrap();
        assert_eq!(cluster.metadata_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_scrape_leaves_no_snapshot() {
        let cluster = Arc::new(FakeCluster::sample());
        cluster.set_metadata_latency(Duration::from_secs(1));
        let exporter = Arc::new(exporter(&cluster, ExporterOptions::default()));

        let scrape = tokio::spawn({
            let exporter = Arc::clone(&exporter);
            async move { exporter.scrape().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        exporter.close().await;

        assert!(matches!(scrape.await.unwrap(), Err(ExporterError::Closed)));
        assert!(!exporter.has_snapshot());
    }

    #[tokio::test]
    async fn fetch_failure_without_snapshot_is_fetch_timeout_kind() {
        let cluster = Arc::new(FakeCluster::sample());
        cluster.fail_metadata(true);
        let exporter = exporter(&cluster, ExporterOptions::default());

        let err = exporter.scrape().await.unwrap_err();
        assert_eq!(err.kind(), "fetch_timeout");
    }
}
