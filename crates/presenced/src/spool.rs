//! Frame spool: a directory a capture process drops images into. Each image
//! file is one frame; it is removed once the engine has seen it.

use crate::engine::{EngineError, EngineHandle, FrameOutcome};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Counters from one pass over the spool.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub frames: usize,
    pub logged: usize,
    pub failed: usize,
}

pub struct SpoolWatcher {
    dir: PathBuf,
    poll: Duration,
    refresh_every: Duration,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SpoolError + '_ {
    move |source| SpoolError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl SpoolWatcher {
    pub fn new(dir: impl Into<PathBuf>, poll: Duration, refresh_every: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll,
            refresh_every,
        }
    }

    /// Image files currently waiting, oldest name first.
    async fn pending(&self) -> Result<Vec<PathBuf>, SpoolError> {
        let mut frames = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await.map_err(io_err(&self.dir))?;
        while let Some(entry) = dir.next_entry().await.map_err(io_err(&self.dir))? {
            let path = entry.path();
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if is_file && presence_io::corpus::is_image(&path) {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(frames)
    }

    /// Feed every waiting frame to the engine and remove it.
    ///
    /// A frame the engine rejects is logged and dropped; only a dead engine
    /// stops the pass.
    pub async fn drain_once(&self, engine: &EngineHandle) -> Result<DrainReport, SpoolError> {
        let mut report = DrainReport::default();

        for path in self.pending().await? {
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot read frame; will retry");
                    continue;
                }
            };
            report.frames += 1;

            let source = path.display().to_string();
            match engine.observe(bytes, source, Utc::now()).await {
                Ok(FrameOutcome::Logged { .. }) => report.logged += 1,
                Ok(_) => {}
                Err(EngineError::ChannelClosed) => return Err(EngineError::ChannelClosed.into()),
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(path = %path.display(), error = %e, "frame rejected");
                }
            }

            tokio::fs::remove_file(&path).await.map_err(io_err(&path))?;
        }

        if report.frames > 0 {
            tracing::debug!(
                frames = report.frames,
                logged = report.logged,
                failed = report.failed,
                "spool drained"
            );
        }
        Ok(report)
    }

    /// Poll the spool until the engine goes away, refreshing the snapshot
    /// every `refresh_every`.
    pub async fn run(self, engine: EngineHandle) -> Result<(), SpoolError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err(&self.dir))?;
        tracing::info!(
            dir = %self.dir.display(),
            poll_ms = self.poll.as_millis() as u64,
            refresh_secs = self.refresh_every.as_secs(),
            "watching frame spool"
        );

        let mut poll = tokio::time::interval(self.poll);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.refresh_every);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The engine loaded a snapshot at startup; skip the immediate tick.
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    match self.drain_once(&engine).await {
                        Ok(_) => {}
                        Err(SpoolError::Engine(e)) => return Err(e.into()),
                        Err(e) => tracing::warn!(error = %e, "spool pass failed"),
                    }
                }
                _ = refresh.tick() => {
                    match engine.refresh().await {
                        Ok(summary) => tracing::debug!(snapshot = %summary.id, "periodic refresh"),
                        Err(EngineError::ChannelClosed) => return Err(EngineError::ChannelClosed.into()),
                        Err(_) => {}
                    }
                }
            }
        }
    }
}
