use crate::metrics::collector::ProbeMetrics;
use crate::{NcpError, Result};
use prometheus::{Encoder, TextEncoder};
use std::path::Path;
use tracing::debug;

/// Renders probe metrics in the Prometheus text exposition format
pub struct PrometheusExporter {
    metrics: ProbeMetrics,
}

impl PrometheusExporter {
    pub fn new(metrics: ProbeMetrics) -> Self {
        Self { metrics }
    }

    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.metrics.registry().gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| NcpError::MetricsError(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| NcpError::MetricsError(format!("Metrics output is not UTF-8: {}", e)))
    }

    /// Replaces `path` with the current metrics, for a node exporter textfile collector.
    ///
    /// The file is written beside the target and renamed into place so readers
    /// never see a partial file.
    pub async fn write_textfile(&self, path: &Path) -> Result<()> {
        let body = self.render()?;
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!("Wrote metrics to {}", path.display());
        Ok(())
    }
}
