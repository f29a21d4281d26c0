//! Real-time log streaming via Server-Sent Events (SSE).
//!
//! This module provides a broadcast channel for conversion logs and
//! progress that can be streamed to clients via SSE. Every entry is also
//! mirrored to the `log` facade.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{Progress, RunState};
use crate::transform::pipeline::ProgressSink;

/// Log level for client display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
    Progress,
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Job the entry belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Fraction in `[0, 1]` for progress entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
}

impl LogEntry {
    fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            job_id: None,
            fraction: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, message)
    }

    pub fn progress(progress: &Progress) -> Self {
        let message = match progress.total {
            Some(total) => format!("{}/{} records", progress.records, total),
            None => format!("{} records", progress.records),
        };
        Self {
            fraction: Some(progress.fraction),
            ..Self::new(LogLevel::Progress, message)
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Global log broadcaster
pub static LOG_BROADCASTER: Lazy<LogBroadcaster> = Lazy::new(LogBroadcaster::new);

/// Broadcasts log entries to all connected SSE clients
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogEntry>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(100);
        Self { sender }
    }

    /// Send a log entry to all subscribers
    pub fn log(&self, entry: LogEntry) {
        let job = entry.job_id.as_deref().unwrap_or("-");
        match entry.level {
            LogLevel::Info | LogLevel::Success => log::info!("[{}] {}", job, entry.message),
            LogLevel::Progress => log::debug!("[{}] {}", job, entry.message),
            LogLevel::Warning => log::warn!("[{}] {}", job, entry.message),
            LogLevel::Error => log::error!("[{}] {}", job, entry.message),
        }

        // No receivers is not an error
        let _ = self.sender.send(entry);
    }

    /// Get a receiver for SSE streaming
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards a job's run states and progress to [`LOG_BROADCASTER`].
#[derive(Debug, Clone)]
pub struct BroadcastProgress {
    job_id: String,
}

impl BroadcastProgress {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self { job_id: job_id.into() }
    }
}

impl ProgressSink for BroadcastProgress {
    fn on_state(&self, state: RunState) {
        let entry = match state {
            RunState::Completed => LogEntry::success("Conversion completed"),
            RunState::Stopped => LogEntry::warning("Conversion stopped"),
            RunState::Failed => LogEntry::error("Conversion failed"),
            other => LogEntry::info(format!("State: {}", other)),
        };
        LOG_BROADCASTER.log(entry.with_job(self.job_id.clone()));
    }

    fn on_progress(&self, progress: Progress) {
        LOG_BROADCASTER.log(LogEntry::progress(&progress).with_job(self.job_id.clone()));
    }
}
