//! Metric sinks for the per-step key to scalar mapping

use log::info;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{FinetuneError, Result};

pub type Metrics = BTreeMap<String, f64>;

pub trait MetricsSink: Send {
    fn log(&mut self, step: usize, metrics: &Metrics) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn format_metrics(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(k, v)| format!("{}={:.6}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Writes every `log_every`-th step through the `log` facade.
pub struct LogSink {
    log_every: usize,
}

impl LogSink {
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every: log_every.max(1),
        }
    }
}

impl MetricsSink for LogSink {
    fn log(&mut self, step: usize, metrics: &Metrics) -> Result<()> {
        if step % self.log_every == 0 {
            info!("Step {}: {}", step, format_metrics(metrics));
        }
        Ok(())
    }
}

/// One JSON object per line: `{"step": n, "<key>": value, ...}`.
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FinetuneError::persistence(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FinetuneError::persistence(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn log(&mut self, step: usize, metrics: &Metrics) -> Result<()> {
        let mut record = Map::new();
        record.insert("step".to_string(), json!(step));
        for (key, value) in metrics {
            record.insert(key.clone(), json!(value));
        }
        serde_json::to_writer(&mut self.writer, &Value::Object(record))?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| FinetuneError::persistence(&self.path, e))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| FinetuneError::persistence(&self.path, e))
    }
}

/// Keeps every record in memory; clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(usize, Metrics)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(usize, Metrics)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemorySink {
    fn log(&mut self, step: usize, metrics: &Metrics) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| FinetuneError::Model("metrics buffer poisoned".to_string()))?
            .push((step, metrics.clone()));
        Ok(())
    }
}
