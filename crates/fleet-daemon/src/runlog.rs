//! Batched log sink for one run: control-plane `append_log` plus the local
//! `run.log` mirror.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use fleet_core::types::{ProjectId, RunId};
use fleet_harness::control_plane::ControlPlane;

use crate::artifacts;

pub const DEFAULT_BATCH_LINES: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

pub struct RunLog {
    control_plane: Arc<dyn ControlPlane>,
    project_id: ProjectId,
    run_id: RunId,
    mirror: Option<PathBuf>,
    buffer: String,
    buffered_lines: usize,
    batch_lines: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl RunLog {
    pub fn new(control_plane: Arc<dyn ControlPlane>, project_id: ProjectId, run_id: RunId) -> Self {
        Self {
            control_plane,
            project_id,
            run_id,
            mirror: None,
            buffer: String::new(),
            buffered_lines: 0,
            batch_lines: DEFAULT_BATCH_LINES,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            last_flush: Instant::now(),
        }
    }

    pub fn with_batching(mut self, lines: usize, interval: Duration) -> Self {
        self.batch_lines = lines.max(1);
        self.flush_interval = interval;
        self
    }

    /// Mirror everything written from now on into `path`.
    pub fn set_mirror(&mut self, path: PathBuf) {
        self.mirror = Some(path);
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// Buffer one output line; flushes on the line or time threshold.
    pub async fn push(&mut self, line: &str) {
        self.buffer.push_str(line.trim_end_matches(['\n', '\r']));
        self.buffer.push('\n');
        self.buffered_lines += 1;
        if self.buffered_lines >= self.batch_lines || self.last_flush.elapsed() >= self.flush_interval {
            self.flush().await;
        }
    }

    /// Flush if the time threshold has passed.
    pub async fn flush_if_due(&mut self) {
        if self.buffered_lines > 0 && self.last_flush.elapsed() >= self.flush_interval {
            self.flush().await;
        }
    }

    pub async fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let chunk = std::mem::take(&mut self.buffer);
            self.write(&chunk).await;
        }
        self.buffered_lines = 0;
        self.last_flush = Instant::now();
    }

    /// Write a marker line right away, after anything still buffered.
    pub async fn line(&mut self, text: impl AsRef<str>) {
        self.flush().await;
        let mut chunk = text.as_ref().trim_end_matches('\n').to_string();
        chunk.push('\n');
        self.write(&chunk).await;
    }

    async fn write(&self, chunk: &str) {
        if let Some(path) = &self.mirror {
            if let Err(e) = artifacts::append(path, chunk).await {
                warn!(run_id = self.run_id, error = %e, "run log mirror write failed");
            }
        }
        if let Err(e) = self
            .control_plane
            .append_log(self.project_id, self.run_id, chunk)
            .await
        {
            warn!(run_id = self.run_id, project_id = self.project_id, error = %e, "append-log failed");
        }
    }
}
