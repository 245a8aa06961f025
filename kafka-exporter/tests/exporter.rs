use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kafka_exporter::config::{ExporterOptions, ExporterSettings};
use kafka_exporter::filter::FilterPatterns;
use kafka_exporter::test_utils::{member, FakeCluster};
use kafka_exporter::{Exporter, ExporterError};

fn exporter_with(cluster: &Arc<FakeCluster>, options: ExporterOptions) -> Exporter {
    let settings = ExporterSettings::try_from(&options).expect("valid options");
    Exporter::with_client(settings, cluster.clone())
}

fn lag_of(
    snapshot: &kafka_exporter::MetricSnapshot,
    group: &str,
    topic: &str,
    partition: i32,
) -> Option<i64> {
    snapshot
        .lag
        .iter()
        .find(|r| r.group == group && r.topic == topic && r.partition == partition)
        .map(|r| r.lag)
}

#[tokio::test(start_paused = true)]
async fn scrapes_within_refresh_window_are_identical() {
    let cluster = Arc::new(FakeCluster::sample());
    let exporter = exporter_with(&cluster, ExporterOptions::default());

    let first = exporter.scrape().await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    let second = exporter.scrape().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(cluster.metadata_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn scrape_after_refresh_window_sees_new_offsets() {
    let cluster = Arc::new(FakeCluster::sample());
    let exporter = exporter_with(&cluster, ExporterOptions::default());

    let first = exporter.scrape().await.unwrap();
    assert_eq!(lag_of(&first, "shipping", "orders", 0), Some(10));

    cluster.set_high_watermark("orders", 0, 130);
    tokio::time::advance(Duration::from_secs(31)).await;

    let second = exporter.scrape().await.unwrap();
    assert_eq!(lag_of(&second, "shipping", "orders", 0), Some(40));
    assert!(second.fetched_at >= first.fetched_at);
}

#[tokio::test(start_paused = true)]
async fn concurrent_scrapes_share_one_fetch() {
    let cluster = Arc::new(FakeCluster::sample());
    cluster.set_metadata_latency(Duration::from_millis(500));
    let exporter = Arc::new(exporter_with(&cluster, ExporterOptions::default()));

    let scrapes = (0..16).map(|_| {
        let exporter = Arc::clone(&exporter);
        tokio::spawn(async move { exporter.scrape().await })
    });
    let results = join_all(scrapes).await;

    assert_eq!(cluster.metadata_calls(), 1);
    assert_eq!(cluster.group_list_calls(), 1);
    let snapshots: Vec<_> = results
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();
    assert!(snapshots.iter().all(|s| s == &snapshots[0]));
}

#[tokio::test]
async fn partial_fetch_omits_unreachable_partitions() {
    let cluster = Arc::new(FakeCluster::sample());
    cluster.fail_broker(2);
    let exporter = exporter_with(&cluster, ExporterOptions::default());

    let snapshot = exporter.scrape().await.unwrap();

    // orders/1 is led by the failed broker
    assert_eq!(lag_of(&snapshot, "shipping", "orders", 1), None);
    assert_eq!(lag_of(&snapshot, "shipping", "orders", 0), Some(10));
    assert_eq!(lag_of(&snapshot, "billing", "payments", 0), Some(5));
    assert!(snapshot.warnings > 0);
    assert!(snapshot.brokers.iter().any(|b| b.id == 2 && !b.up));
}

#[tokio::test(start_paused = true)]
async fn stale_snapshot_served_when_cluster_goes_away() {
    let cluster = Arc::new(FakeCluster::sample());
    let exporter = exporter_with(&cluster, ExporterOptions::default());
    let first = exporter.scrape().await.unwrap();

    cluster.fail_broker(1);
    cluster.fail_broker(2);
    tokio::time::advance(Duration::from_secs(60)).await;

    let stale = exporter.scrape().await.unwrap();
    assert_eq!(first, stale);
    assert_eq!(cluster.metadata_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_without_snapshot_reaches_caller() {
    let cluster = Arc::new(FakeCluster::sample());
    cluster.delay_broker(1, Duration::from_secs(120));
    cluster.delay_broker(2, Duration::from_secs(120));
    let exporter = exporter_with(&cluster, ExporterOptions::default());

    let err = exporter.scrape().await.unwrap_err();
    assert!(matches!(err, ExporterError::FetchTimeout(_)));
}

#[tokio::test]
async fn group_topic_exclude_rejects_group_consuming_internal_topic() {
    let cluster = Arc::new(FakeCluster::sample());
    cluster.add_group(
        "auditor",
        "Stable",
        vec![member("auditor-1", &[("orders", 0), ("__consumer_offsets", 0)])],
    );
    cluster.commit("auditor", "orders", 0, 50);
    cluster.commit("auditor", "__consumer_offsets", 0, 5);

    let exporter = exporter_with(
        &cluster,
        ExporterOptions {
            filters: FilterPatterns {
                group_topic_exclude: "^__.*".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
    );

    let snapshot = exporter.scrape().await.unwrap();
    assert!(snapshot.lag.iter().all(|r| r.group != "auditor"));
    assert!(snapshot.groups.iter().all(|g| g.group != "auditor"));
    assert_eq!(lag_of(&snapshot, "shipping", "orders", 0), Some(10));
}

#[tokio::test]
async fn restrictive_group_topic_include_rejects_non_matching_groups() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.add_broker(1, "kafka-1");
    cluster.add_partition("dev-orders", 0, 1, &[1], &[1], 0, 20);
    cluster.add_partition("prod-orders", 0, 1, &[1], &[1], 0, 20);
    cluster.add_group("dev", "Stable", vec![member("dev-1", &[("dev-orders", 0)])]);
    cluster.commit("dev", "dev-orders", 0, 10);
    cluster.add_group("prod", "Stable", vec![member("prod-1", &[("prod-orders", 0)])]);
    cluster.commit("prod", "prod-orders", 0, 15);

    let exporter = exporter_with(
        &cluster,
        ExporterOptions {
            filters: FilterPatterns {
                group_topic_filter: "^prod-.*".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
    );

    let snapshot = exporter.scrape().await.unwrap();
    let groups: Vec<_> = snapshot.lag.iter().map(|r| r.group.as_str()).collect();
    assert_eq!(groups, vec!["prod"]);
    assert_eq!(lag_of(&snapshot, "prod", "prod-orders", 0), Some(5));
}

#[tokio::test]
async fn skip_empty_groups_drops_member_less_and_offset_less_groups() {
    let cluster = Arc::new(FakeCluster::sample());
    // Has a member but never committed
    cluster.add_group("fresh", "Stable", vec![member("fresh-1", &[("orders", 0)])]);

    let exporter = exporter_with(
        &cluster,
        ExporterOptions {
            skip_empty_consumer_groups: true,
            ..Default::default()
        },
    );

    let snapshot = exporter.scrape().await.unwrap();
    let groups: Vec<_> = snapshot.groups.iter().map(|g| g.group.as_str()).collect();
    assert_eq!(groups, vec!["billing", "shipping"]);
}

#[tokio::test]
async fn invalid_pattern_fails_construction() {
    let options = ExporterOptions {
        filters: FilterPatterns {
            topic_filter: "(unclosed".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    let err = ExporterSettings::try_from(&options).unwrap_err();
    assert_eq!(err.kind(), "configuration");

    let err = Exporter::connect(&options).await.err().unwrap();
    assert!(matches!(
        err,
        ExporterError::InvalidPattern {
            option: "topic_filter",
            ..
        }
    ));
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_later_scrapes() {
    let cluster = Arc::new(FakeCluster::sample());
    let exporter = exporter_with(&cluster, ExporterOptions::default());
    exporter.scrape().await.unwrap();

    exporter.close().await;
    exporter.close().await;

    assert!(cluster.is_closed());
    for _ in 0..3 {
        assert!(matches!(exporter.scrape().await, Err(ExporterError::Closed)));
    }
}
