use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ExporterError;
use crate::filter::{FilterPatterns, FilterSet};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka connection
    #[envconfig(from = "KAFKA_HOSTS", default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(from = "KAFKA_VERSION", default = "2.0.0")]
    pub kafka_version: String,

    #[envconfig(from = "KAFKA_TLS", default = "false")]
    pub kafka_tls: bool,

    // Collection cadence
    #[envconfig(from = "METADATA_REFRESH_INTERVAL", default = "30s")]
    pub metadata_refresh_interval: String,

    #[envconfig(from = "FETCH_TIMEOUT", default = "10s")]
    pub fetch_timeout: String,

    // Filters
    #[envconfig(from = "TOPIC_FILTER", default = ".*")]
    pub topic_filter: String,

    #[envconfig(from = "TOPIC_EXCLUDE", default = "^$")]
    pub topic_exclude: String,

    #[envconfig(from = "GROUP_FILTER", default = ".*")]
    pub group_filter: String,

    #[envconfig(from = "GROUP_EXCLUDE", default = "^$")]
    pub group_exclude: String,

    #[envconfig(from = "GROUP_TOPIC_FILTER", default = ".*")]
    pub group_topic_filter: String,

    #[envconfig(from = "GROUP_TOPIC_EXCLUDE", default = "^$")]
    pub group_topic_exclude: String,

    #[envconfig(from = "SKIP_EMPTY_CONSUMER_GROUPS", default = "false")]
    pub skip_empty_consumer_groups: bool,

    // HTTP server
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9308")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn broker_list(&self) -> Vec<String> {
        self.kafka_hosts
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn exporter_options(&self) -> ExporterOptions {
        ExporterOptions {
            brokers: self.broker_list(),
            kafka_version: self.kafka_version.clone(),
            tls: self.kafka_tls,
            metadata_refresh_interval: self.metadata_refresh_interval.clone(),
            fetch_timeout: self.fetch_timeout.clone(),
            filters: FilterPatterns {
                topic_filter: self.topic_filter.clone(),
                topic_exclude: self.topic_exclude.clone(),
                group_filter: self.group_filter.clone(),
                group_exclude: self.group_exclude.clone(),
                group_topic_filter: self.group_topic_filter.clone(),
                group_topic_exclude: self.group_topic_exclude.clone(),
            },
            skip_empty_consumer_groups: self.skip_empty_consumer_groups,
        }
    }
}

/// Unvalidated exporter options, as handed over by the process entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterOptions {
    pub brokers: Vec<String>,
    pub kafka_version: String,
    pub tls: bool,
    pub metadata_refresh_interval: String,
    pub fetch_timeout: String,
    pub filters: FilterPatterns,
    pub skip_empty_consumer_groups: bool,
}

impl Default for ExporterOptions {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            kafka_version: "2.0.0".to_string(),
            tls: false,
            metadata_refresh_interval: "30s".to_string(),
            fetch_timeout: "10s".to_string(),
            filters: FilterPatterns::default(),
            skip_empty_consumer_groups: false,
        }
    }
}

/// Validated options with every pattern compiled and every duration parsed.
#[derive(Debug, Clone)]
pub struct ExporterSettings {
    pub brokers: Vec<String>,
    pub kafka_version: String,
    pub tls: bool,
    pub metadata_refresh_interval: Duration,
    pub fetch_timeout: Duration,
    pub filters: FilterSet,
    pub skip_empty_consumer_groups: bool,
}

impl TryFrom<&ExporterOptions> for ExporterSettings {
    type Error = ExporterError;

    fn try_from(options: &ExporterOptions) -> Result<Self, Self::Error> {
        let brokers: Vec<String> = options
            .brokers
            .iter()
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(ExporterError::configuration(
                "brokers",
                "at least one broker address is required",
            ));
        }

        validate_kafka_version(&options.kafka_version)?;

        let metadata_refresh_interval =
            parse_positive_duration("metadata_refresh_interval", &options.metadata_refresh_interval)?;
        let fetch_timeout = parse_positive_duration("fetch_timeout", &options.fetch_timeout)?;

        let filters = FilterSet::compile(&options.filters)?;

        Ok(Self {
            brokers,
            kafka_version: options.kafka_version.trim().to_string(),
            tls: options.tls,
            metadata_refresh_interval,
            fetch_timeout,
            filters,
            skip_empty_consumer_groups: options.skip_empty_consumer_groups,
        })
    }
}

impl ExporterSettings {
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }
}

fn validate_kafka_version(version: &str) -> Result<(), ExporterError> {
    let parts: Vec<&str> = version.trim().split('.').collect();
    let numeric = parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    if !(3..=4).contains(&parts.len()) || !numeric {
        return Err(ExporterError::configuration(
            "kafka_version",
            format!("expected a dotted version like 2.0.0, got {version:?}"),
        ));
    }
    Ok(())
}

fn parse_positive_duration(option: &'static str, value: &str) -> Result<Duration, ExporterError> {
    let duration = parse_duration(value).map_err(|e| ExporterError::configuration(option, e))?;
    if duration.is_zero() {
        return Err(ExporterError::configuration(option, "must be greater than zero"));
    }
    Ok(duration)
}

/// Parse a Go-style duration string such as "30s", "500ms" or "1m30s".
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {s:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration value in {s:?}: {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            unit => return Err(format!("unknown duration unit {unit:?} in {s:?}")),
        };
        total += part;
        rest = &rest[unit_len..];
    }

    Ok(total)
}
