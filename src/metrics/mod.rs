//! Metrics records and recorders
//!
//! What this module provides
//! - The versioned, line-oriented record every component emits once per logical run
//! - Recorder services: `Service<MetricsRecord, Response = (), Error = BoxError>`
//!
//! Exports
//! - Models
//!   - `MetricsRecord` with optional `ShadowFields` / `ConsensusFields`
//!   - `SCHEMA_VERSION`, written on every line
//! - Services
//!   - `JsonlRecorder`: append-only JSON-lines file, one locked `write_all` per record
//!   - `InMemoryRecorder`: captures records for tests
//! - Utils
//!   - `emit`: best-effort send through an optional recorder; failures are logged, never raised
//!   - `read_records`: parse a JSON-lines log back
//!
//! Testing strategy
//! - Concurrent appends from many tasks must yield exactly one parseable line per record

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service, ServiceExt};
use tracing::warn;

use crate::error::{ErrorKind, Result};

/// Bumped on any breaking change to the record layout.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// One attempt-executor run
    Run,
    /// Primary run plus shadow comparison
    Shadow,
    /// Parallel aggregation decision
    Consensus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowFields {
    pub provider_id: String,
    pub status: String,
    pub failure_kind: Option<ErrorKind>,
    pub latency_ms: Option<u64>,
    pub diff_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusFields {
    pub mode: String,
    pub strategy: String,
    pub candidates: usize,
    pub completed: usize,
    /// Votes per equivalence group, keyed by the group's lowest slot
    pub tally: BTreeMap<usize, usize>,
    pub winning_slot: Option<usize>,
    pub tie_break: Option<String>,
    /// Why the controller stopped collecting candidates
    pub stop_reason: String,
    /// Slots cancelled before they reached a verdict
    pub discarded_slots: Vec<usize>,
    pub accrued_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub record_kind: RecordKind,
    /// Candidate slot, for runs started by the aggregation controller
    pub slot: Option<usize>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub status: RunStatus,
    pub failure_kind: Option<ErrorKind>,
    pub latency_ms: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    /// Number of fallback-chain entries touched
    pub fallback_stages: usize,
    pub attempts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow: Option<ShadowFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusFields>,
}

impl MetricsRecord {
    pub fn new(run_id: impl Into<String>, record_kind: RecordKind, status: RunStatus) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            timestamp: Utc::now(),
            run_id: run_id.into(),
            record_kind,
            slot: None,
            provider_id: None,
            model_id: None,
            status,
            failure_kind: None,
            latency_ms: 0,
            prompt_tokens: None,
            completion_tokens: None,
            fallback_stages: 0,
            attempts: 0,
            shadow: None,
            consensus: None,
        }
    }

    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Boxed recorder as held by executors, shadow runners and aggregators.
pub type MetricsSvc = BoxCloneSyncService<MetricsRecord, (), BoxError>;

/// Send a record through the recorder, if any. Recorder failures only produce a warning.
pub async fn emit(recorder: Option<&MetricsSvc>, record: MetricsRecord) {
    let Some(recorder) = recorder else {
        return;
    };
    let mut svc = recorder.clone();
    let run_id = record.run_id.clone();
    let res = match ServiceExt::ready(&mut svc).await {
        Ok(ready) => ready.call(record).await,
        Err(e) => Err(e),
    };
    if let Err(e) = res {
        warn!(run_id = %run_id, error = %e, "failed to record metrics");
    }
}

/// Append-only JSON-lines recorder.
#[derive(Clone)]
pub struct JsonlRecorder {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl JsonlRecorder {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn boxed(self) -> MetricsSvc {
        BoxCloneSyncService::new(self)
    }
}

impl Service<MetricsRecord> for JsonlRecorder {
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<(), BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: MetricsRecord) -> Self::Future {
        let file = self.file.clone();
        Box::pin(async move {
            let line = record.to_line()?;
            // Whole line under one lock so concurrent records never interleave.
            let mut f = file.lock().await;
            f.write_all(line.as_bytes()).await?;
            f.flush().await?;
            Ok(())
        })
    }
}

/// Recorder that keeps everything in memory.
#[derive(Default, Clone)]
pub struct InMemoryRecorder(Arc<Mutex<Vec<MetricsRecord>>>);

impl InMemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<MetricsRecord> {
        self.0.lock().await.clone()
    }

    pub fn boxed(self) -> MetricsSvc {
        BoxCloneSyncService::new(self)
    }
}

impl Service<MetricsRecord> for InMemoryRecorder {
    type Response = ();
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<(), BoxError>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: MetricsRecord) -> Self::Future {
        let store = self.0.clone();
        Box::pin(async move {
            store.lock().await.push(record);
            Ok(())
        })
    }
}

/// Parse a JSON-lines metrics log. Blank lines are skipped.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<MetricsRecord>> {
    let raw = std::fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        out.push(serde_json::from_str(line)?);
    }
    Ok(out)
}

pub(crate) fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(super::millis(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn record(i: usize) -> MetricsRecord {
        let mut r = MetricsRecord::new(format!("run-{}", i), RecordKind::Run, RunStatus::Success);
        r.provider_id = Some("p".into());
        r.latency_ms = i as u64;
        r
    }

    #[tokio::test]
    async fn in_memory_recorder_captures() {
        let rec = InMemoryRecorder::new();
        let mut svc = rec.clone();
        svc.ready().await.unwrap().call(record(1)).await.unwrap();
        let data = rec.records().await;
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn emit_without_recorder_is_noop() {
        emit(None, record(0)).await;
    }

    #[tokio::test]
    async fn jsonl_concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let recorder = JsonlRecorder::open(&path).await.unwrap().boxed();

        let mut handles = Vec::new();
        for i in 0..64 {
            let rec = recorder.clone();
            handles.push(tokio::spawn(async move {
                emit(Some(&rec), record(i)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 64);
        let mut ids: Vec<_> = records.iter().map(|r| r.latency_ms).collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..64).collect::<Vec<u64>>());
    }

    #[test]
    fn optional_sections_are_omitted() {
        let line = record(3).to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert!(!line.contains("\"shadow\""));
        assert!(!line.contains("\"consensus\""));
        assert!(line.contains("\"schema_version\":1"));
    }
}
