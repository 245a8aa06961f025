pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod exporter;
pub mod fetcher;
pub mod filter;
pub mod metrics;
pub mod metrics_consts;
pub mod reconciler;
pub mod types;

pub mod test_utils;

// Re-export main modules for library users
pub use config::{Config, ExporterOptions};
pub use error::ExporterError;
pub use exporter::{Exporter, MetricSnapshot};
