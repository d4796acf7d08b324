pub mod collector;
pub mod exporter;

pub use collector::{MetricsSnapshot, ProbeMetrics};
pub use exporter::PrometheusExporter;
