use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::exporter::{BrokerStatus, GroupStatus, GroupTopicSum, MetricSnapshot, PartitionStatus};
use crate::metrics_consts::*;
use crate::types::LagRecord;

/// Register the exporter's own metrics with descriptions
pub fn register_metrics() {
    describe_histogram!(FETCH_DURATION_MS, "Duration of a full cluster fetch in milliseconds");
    describe_counter!(FETCHES, "Cluster fetches by outcome");
    describe_counter!(FETCH_WARNINGS, "Partial failures recorded during cluster fetches");
    describe_counter!(
        STALE_SNAPSHOTS_SERVED,
        "Scrapes answered from a stale snapshot after a failed fetch"
    );
    describe_gauge!(
        SNAPSHOT_AGE_SECONDS,
        "Age of the cluster snapshot served by the last scrape"
    );
    describe_counter!(SCRAPE_ERRORS, "Failed scrapes by error kind");
}

/// Renders one scrape in the Prometheus text format.
///
/// Each call records into its own recorder, so the body holds exactly the
/// series of this snapshot and nothing left over from earlier scrapes.
pub fn render_snapshot(snapshot: &MetricSnapshot) -> String {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::with_local_recorder(&recorder, || {
        describe_cluster_metrics();
        record_snapshot(snapshot);
    });
    handle.render()
}

fn describe_cluster_metrics() {
    describe_gauge!(BROKERS, "Number of brokers in the Kafka cluster");
    describe_gauge!(BROKER_INFO, "Information about the Kafka broker");
    describe_gauge!(
        BROKER_UP,
        "Whether the broker answered during the last cluster fetch"
    );

    describe_gauge!(TOPIC_PARTITIONS, "Number of partitions for this topic");
    describe_gauge!(
        TOPIC_PARTITION_CURRENT_OFFSET,
        "Current offset (high watermark) of a topic partition"
    );
    describe_gauge!(
        TOPIC_PARTITION_OLDEST_OFFSET,
        "Oldest offset (low watermark) of a topic partition"
    );
    describe_gauge!(TOPIC_PARTITION_LEADER, "Leader broker id of a topic partition");
    describe_gauge!(
        TOPIC_PARTITION_REPLICAS,
        "Number of replicas for a topic partition"
    );
    describe_gauge!(
        TOPIC_PARTITION_IN_SYNC_REPLICAS,
        "Number of in-sync replicas for a topic partition"
    );
    describe_gauge!(
        TOPIC_PARTITION_LEADER_IS_PREFERRED,
        "1 if the topic partition is led by its preferred broker"
    );
    describe_gauge!(
        TOPIC_PARTITION_UNDER_REPLICATED,
        "1 if the topic partition is under-replicated"
    );

    describe_gauge!(
        CONSUMERGROUP_CURRENT_OFFSET,
        "Committed offset of a consumer group on a topic partition"
    );
    describe_gauge!(
        CONSUMERGROUP_CURRENT_OFFSET_SUM,
        "Sum of committed offsets of a consumer group on a topic"
    );
    describe_gauge!(
        CONSUMERGROUP_LAG,
        "Number of messages behind for the consumer group on a topic partition"
    );
    describe_gauge!(
        CONSUMERGROUP_LAG_SUM,
        "Number of messages behind for the consumer group on a topic"
    );
    describe_gauge!(CONSUMERGROUP_MEMBERS, "Number of members in a consumer group");
}

fn record_snapshot(snapshot: &MetricSnapshot) {
    gauge!(BROKERS).set(snapshot.brokers.len() as f64);
    snapshot.brokers.iter().for_each(record_broker);

    for (topic, count) in &snapshot.topic_partitions {
        gauge!(TOPIC_PARTITIONS, "topic" => topic.clone()).set(*count as f64);
    }
    snapshot.partitions.iter().for_each(record_partition);

    snapshot.lag.iter().for_each(record_lag);
    snapshot.group_topic_sums.iter().for_each(record_group_topic_sum);
    snapshot.groups.iter().for_each(record_group);
}

fn record_broker(broker: &BrokerStatus) {
    let id = broker.id.to_string();
    gauge!(BROKER_INFO, "id" => id.clone(), "address" => broker.address.clone()).set(1.0);
    gauge!(BROKER_UP, "id" => id).set(if broker.up { 1.0 } else { 0.0 });
}

fn record_partition(p: &PartitionStatus) {
    let labels = [
        ("topic", p.topic.clone()),
        ("partition", p.partition.to_string()),
    ];

    // Offsets are only known when the leader answered
    if let Some(high) = p.high_watermark {
        gauge!(TOPIC_PARTITION_CURRENT_OFFSET, &labels).set(high as f64);
    }
    if let Some(low) = p.oldest_offset {
        gauge!(TOPIC_PARTITION_OLDEST_OFFSET, &labels).set(low as f64);
    }
    gauge!(TOPIC_PARTITION_LEADER, &labels).set(f64::from(p.leader));
    gauge!(TOPIC_PARTITION_REPLICAS, &labels).set(p.replicas as f64);
    gauge!(TOPIC_PARTITION_IN_SYNC_REPLICAS, &labels).set(p.in_sync_replicas as f64);
    gauge!(TOPIC_PARTITION_LEADER_IS_PREFERRED, &labels)
        .set(if p.leader_is_preferred { 1.0 } else { 0.0 });
    gauge!(TOPIC_PARTITION_UNDER_REPLICATED, &labels)
        .set(if p.under_replicated { 1.0 } else { 0.0 });
}

fn record_lag(record: &LagRecord) {
    let labels = [
        ("consumergroup", record.group.clone()),
        ("topic", record.topic.clone()),
        ("partition", record.partition.to_string()),
    ];
    gauge!(CONSUMERGROUP_CURRENT_OFFSET, &labels).set(record.committed_offset as f64);
    gauge!(CONSUMERGROUP_LAG, &labels).set(record.lag as f64);
}

fn record_group_topic_sum(sum: &GroupTopicSum) {
    let labels = [
        ("consumergroup", sum.group.clone()),
        ("topic", sum.topic.clone()),
    ];
    gauge!(CONSUMERGROUP_CURRENT_OFFSET_SUM, &labels).set(sum.current_offset as f64);
    gauge!(CONSUMERGROUP_LAG_SUM, &labels).set(sum.lag as f64);
}

fn record_group(group: &GroupStatus) {
    gauge!(CONSUMERGROUP_MEMBERS,
        "consumergroup" => group.group.clone(),
        "state" => group.state.as_str(),
    )
    .set(group.members as f64);
}
