//! Destinations for per-epoch scalar metrics

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::info;

use crate::error::Result;

/// Receives grouped scalars once per epoch.
///
/// Groups mirror the dashboard layout: `loss`, `tri_precision`,
/// `satisfy_margin`, `global_dist`, `local_dist`. Only enabled terms are
/// ever recorded, so a sink never has to filter.
pub trait MetricsSink: Send {
    /// Record one group of named scalars for an epoch.
    fn record(&mut self, epoch: usize, group: &str, values: &[(&str, f64)]) -> Result<()>;

    /// Flush buffered records. Called at the end of each epoch and at the
    /// end of the run.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sink that logs every group as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&mut self, epoch: usize, group: &str, values: &[(&str, f64)]) -> Result<()> {
        let rendered = values
            .iter()
            .map(|(name, value)| format!("{name} {value:.4}"))
            .collect::<Vec<_>>()
            .join(", ");
        info!(epoch, group, "{rendered}");
        Ok(())
    }
}

/// Sink that appends one JSON object per record to a file.
///
/// Each line is `{"epoch": .., "group": "..", "values": {..}}`, easy to
/// load into a dataframe after the run.
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Create (or truncate) the metrics file, creating parent directories
    /// as needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn record(&mut self, epoch: usize, group: &str, values: &[(&str, f64)]) -> Result<()> {
        let values: serde_json::Map<String, serde_json::Value> = values
            .iter()
            .map(|(name, value)| (name.to_string(), serde_json::json!(value)))
            .collect();
        let record = serde_json::json!({
            "epoch": epoch,
            "group": group,
            "values": values,
        });
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
