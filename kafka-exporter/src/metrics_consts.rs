// Cluster metrics
pub const BROKERS: &str = "kafka_brokers";
pub const BROKER_INFO: &str = "kafka_broker_info";
pub const BROKER_UP: &str = "kafka_broker_up";

pub const TOPIC_PARTITIONS: &str = "kafka_topic_partitions";
pub const TOPIC_PARTITION_CURRENT_OFFSET: &str = "kafka_topic_partition_current_offset";
pub const TOPIC_PARTITION_OLDEST_OFFSET: &str = "kafka_topic_partition_oldest_offset";
pub const TOPIC_PARTITION_LEADER: &str = "kafka_topic_partition_leader";
pub const TOPIC_PARTITION_REPLICAS: &str = "kafka_topic_partition_replicas";
pub const TOPIC_PARTITION_IN_SYNC_REPLICAS: &str = "kafka_topic_partition_in_sync_replica";
pub const TOPIC_PARTITION_LEADER_IS_PREFERRED: &str = "kafka_topic_partition_leader_is_preferred";
pub const TOPIC_PARTITION_UNDER_REPLICATED: &str =
    "kafka_topic_partition_under_replicated_partition";

pub const CONSUMERGROUP_CURRENT_OFFSET: &str = "kafka_consumergroup_current_offset";
pub const CONSUMERGROUP_CURRENT_OFFSET_SUM: &str = "kafka_consumergroup_current_offset_sum";
pub const CONSUMERGROUP_LAG: &str = "kafka_consumergroup_lag";
pub const CONSUMERGROUP_LAG_SUM: &str = "kafka_consumergroup_lag_sum";
pub const CONSUMERGROUP_MEMBERS: &str = "kafka_consumergroup_members";

// Exporter self metrics
pub const FETCH_DURATION_MS: &str = "kafka_exporter_fetch_duration_ms";
pub const FETCHES: &str = "kafka_exporter_fetches";
pub const FETCH_WARNINGS: &str = "kafka_exporter_fetch_warnings";
pub const STALE_SNAPSHOTS_SERVED: &str = "kafka_exporter_stale_snapshots_served";
pub const SNAPSHOT_AGE_SECONDS: &str = "kafka_exporter_snapshot_age_seconds";
pub const SCRAPE_ERRORS: &str = "kafka_exporter_scrape_errors";
