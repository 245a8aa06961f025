use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the exporter to its caller.
///
/// Configuration problems only ever come out of construction. Once the
/// exporter is ready, a scrape can only fail with `FetchTimeout` (no usable
/// snapshot at all) or `Closed`.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("invalid value for {option}: {reason}")]
    Configuration { option: &'static str, reason: String },

    #[error("invalid pattern for {option}: {source}")]
    InvalidPattern {
        option: &'static str,
        #[source]
        source: regex::Error,
    },

    #[error("failed to connect to kafka: {0}")]
    Connection(#[source] ClientError),

    #[error("no cluster snapshot available: {0}")]
    FetchTimeout(#[from] FetchError),

    #[error("exporter is closed")]
    Closed,
}

impl ExporterError {
    pub fn configuration(option: &'static str, reason: impl Into<String>) -> Self {
        ExporterError::Configuration {
            option,
            reason: reason.into(),
        }
    }

    /// Returns the error type tag for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ExporterError::Configuration { .. } | ExporterError::InvalidPattern { .. } => {
                "configuration"
            }
            ExporterError::Connection(_) => "connection",
            ExporterError::FetchTimeout(_) => "fetch_timeout",
            ExporterError::Closed => "closed",
        }
    }
}

/// Cluster-wide failure of a single fetch cycle.
///
/// Cloneable because every scrape joined onto the same in-flight fetch
/// receives its own copy of the outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No broker answered, or the client refused the request.
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// Every broker exceeded the fetch deadline.
    #[error("fetch deadline of {0:?} exceeded")]
    Timeout(Duration),
}

/// Failures reported by the underlying cluster client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("timeout during {operation}")]
    Timeout { operation: &'static str },

    #[error("broker {broker} unavailable: {reason}")]
    BrokerUnavailable { broker: i32, reason: String },

    #[error("kafka error during {operation}: {reason}")]
    Kafka {
        operation: &'static str,
        reason: String,
    },

    #[error("client is closed")]
    Closed,
}

impl ClientError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}

/// Degradation recorded on a snapshot. The fetch still succeeds; the
/// affected data is simply missing from the snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartialFetchWarning {
    #[error("broker {broker} unreachable: {reason}")]
    BrokerUnreachable { broker: i32, reason: String },

    #[error("partition {topic}/{partition} has no leader")]
    PartitionLeaderless { topic: String, partition: i32 },

    #[error("leader did not report watermarks for partition {topic}/{partition}")]
    PartitionUnavailable { topic: String, partition: i32 },

    #[error("failed to list consumer groups: {reason}")]
    GroupListingFailed { reason: String },

    #[error("failed to fetch committed offsets for group {group}: {reason}")]
    GroupOffsetsFailed { group: String, reason: String },
}

impl PartialFetchWarning {
    /// Returns the warning type tag for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            PartialFetchWarning::BrokerUnreachable { .. } => "broker_unreachable",
            PartialFetchWarning::PartitionLeaderless { .. } => "partition_leaderless",
            PartialFetchWarning::PartitionUnavailable { .. } => "partition_unavailable",
            PartialFetchWarning::GroupListingFailed { .. } => "group_listing_failed",
            PartialFetchWarning::GroupOffsetsFailed { .. } => "group_offsets_failed",
        }
    }
}
