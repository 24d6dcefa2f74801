use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Severity of a user-visible log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// A single activity log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Local wall-clock time, `HH:MM:SS`
    pub timestamp: String,
    pub text: String,
    pub severity: Severity,
}

/// Append-only log of device interactions, shared by everything a
/// [`ClockClient`](crate::ClockClient) hands out
///
/// Entries live in memory only. Each one is also emitted through `tracing`
/// and broadcast to any observers.
#[derive(Clone)]
pub struct ActivityLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    tx: broadcast::Sender<LogEntry>,
}

impl ActivityLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(100);
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            tx,
        }
    }

    /// Append an entry stamped with the current local time
    pub fn push(&self, severity: Severity, text: impl Into<String>) {
        let entry = LogEntry {
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            text: text.into(),
            severity,
        };

        match severity {
            Severity::Info | Severity::Success => tracing::info!("{}", entry.text),
            Severity::Warning => tracing::warn!("{}", entry.text),
            Severity::Error => tracing::error!("{}", entry.text),
        }

        self.lock().push(entry.clone());
        let _ = self.tx.send(entry);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.push(Severity::Info, text);
    }

    pub fn success(&self, text: impl Into<String>) {
        self.push(Severity::Success, text);
    }

    pub fn warning(&self, text: impl Into<String>) {
        self.push(Severity::Warning, text);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.push(Severity::Error, text);
    }

    /// Snapshot of all entries in insertion order
    pub fn entries(&self) -> Vec<LogEntry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Receive entries as they are appended
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }

    // Entries are pushed whole, so a poisoned lock still holds a valid list
    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}
