//! Scalar metrics reporting. Reporting never blocks a round and never fails it.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Networks, System};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    pub category: String,
    pub name: String,
    pub value: f64,
    pub round: u32,
}

pub trait TelemetrySink: Send + Sync {
    fn report_scalar(&self, category: &str, name: &str, value: f64, round: u32) -> anyhow::Result<()>;
}

/// Fans a scalar out to every sink, logging and dropping sink errors.
#[derive(Clone, Default)]
pub struct Telemetry {
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn report(&self, category: &str, name: &str, value: f64, round: u32) {
        for sink in &self.sinks {
            if let Err(e) = sink.report_scalar(category, name, value, round) {
                warn!(category, name, round, "telemetry sink failed: {e:#}");
            }
        }
    }
}

/// Emits every scalar as a `tracing` event.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn report_scalar(&self, category: &str, name: &str, value: f64, round: u32) -> anyhow::Result<()> {
        info!(target: "fedguard::metrics", category, name, value, round);
        Ok(())
    }
}

/// Appends scalars as JSON lines from a background task fed by a bounded channel.
pub struct JsonLinesSink {
    tx: mpsc::Sender<Scalar>,
}

impl JsonLinesSink {
    pub const CAPACITY: usize = 1024;

    pub async fn spawn(path: PathBuf) -> anyhow::Result<(Self, JoinHandle<()>)> {
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        let (tx, mut rx) = mpsc::channel::<Scalar>(Self::CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(scalar) = rx.recv().await {
                let mut line = match serde_json::to_vec(&scalar) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("could not encode metric: {e}");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = file.write_all(&line).await {
                    warn!(path = %path.display(), "could not write metric: {e}");
                }
            }
            let _ = file.flush().await;
        });
        Ok((Self { tx }, handle))
    }
}

impl TelemetrySink for JsonLinesSink {
    fn report_scalar(&self, category: &str, name: &str, value: f64, round: u32) -> anyhow::Result<()> {
        let scalar = Scalar { category: category.to_string(), name: name.to_string(), value, round };
        self.tx.try_send(scalar).map_err(|e| anyhow::anyhow!("metrics channel: {e}"))
    }
}

/// Keeps scalars in memory for inspection after a run.
#[derive(Default)]
pub struct MemorySink {
    scalars: Mutex<Vec<Scalar>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self, category: &str, name: &str) -> Vec<(u32, f64)> {
        self.scalars
            .lock()
            .iter()
            .filter(|s| s.category == category && s.name == name)
            .map(|s| (s.round, s.value))
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn report_scalar(&self, category: &str, name: &str, value: f64, round: u32) -> anyhow::Result<()> {
        self.scalars.lock().push(Scalar { category: category.to_string(), name: name.to_string(), value, round });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SystemUsage {
    pub cpu_percent: f64,
    pub ram_percent: f64,
}

/// Host resource sampling for the `System` metrics.
pub struct SystemProbe {
    sys: System,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self { sys }
    }

    /// CPU usage is measured since the previous call.
    pub fn sample(&mut self) -> SystemUsage {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        let total = self.sys.total_memory();
        let ram_percent = if total == 0 { 0.0 } else { self.sys.used_memory() as f64 * 100.0 / total as f64 };
        SystemUsage { cpu_percent: f64::from(self.sys.global_cpu_usage()), ram_percent }
    }

    pub fn network_sent_mb() -> f64 {
        let networks = Networks::new_with_refreshed_list();
        let sent: u64 = networks.list().values().map(|n| n.total_transmitted()).sum();
        sent as f64 / 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    impl TelemetrySink for Broken {
        fn report_scalar(&self, _: &str, _: &str, _: f64, _: u32) -> anyhow::Result<()> {
            anyhow::bail!("dashboard unreachable")
        }
    }

    #[test]
    fn failing_sink_does_not_stop_others() {
        let memory = Arc::new(MemorySink::new());
        let telemetry = Telemetry::new().with_sink(Arc::new(Broken)).with_sink(memory.clone());
        telemetry.report("Client Participation", "count", 3.0, 1);
        assert_eq!(memory.values("Client Participation", "count"), vec![(1, 3.0)]);
    }

    #[test]
    fn probe_reports_percentages() {
        let usage = SystemProbe::new().sample();
        assert!((0.0..=100.0).contains(&usage.ram_percent));
        assert!(usage.cpu_percent >= 0.0);
    }

    #[tokio::test]
    async fn json_lines_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let (sink, handle) = JsonLinesSink::spawn(path.clone()).await.unwrap();
        sink.report_scalar("Validation", "avg_mAP@0.5", 0.42, 2).unwrap();
        sink.report_scalar("Drift", "Reverted", 1.0, 3).unwrap();
        drop(sink);
        handle.await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let scalars: Vec<Scalar> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(scalars.len(), 2);
        assert_eq!(scalars[1].category, "Drift");
        assert_eq!(scalars[0].round, 2);
    }
}
