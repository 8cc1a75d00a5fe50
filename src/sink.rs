//! Operator-facing log sinks
//!
//! Every line the session wants a human to see (upload progress, the run
//! banner, echoed prints, reported errors) is written to a [`LogSink`].
//! Diagnostic logging goes through `tracing` separately.

use crossbeam_channel::{Sender, TrySendError};
use std::sync::{Arc, Mutex};

/// Destination for operator-visible lines
pub trait LogSink: Send + Sync {
    /// Write one line
    fn write_line(&self, line: &str);
}

/// Shared handle to a sink
pub type SharedSink = Arc<dyn LogSink>;

/// Forwards lines to `tracing` at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write_line(&self, line: &str) {
        tracing::info!(target: "taskrun::log", "{}", line);
    }
}

/// Sends lines over a channel to a consumer thread
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<String>,
}

impl ChannelSink {
    pub fn new(sender: Sender<String>) -> Self {
        Self { sender }
    }
}

impl LogSink for ChannelSink {
    fn write_line(&self, line: &str) {
        match self.sender.try_send(line.to_string()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Log channel full, dropping line: {}", line);
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::debug!("Log channel closed, dropping line: {}", line);
            }
        }
    }
}

/// Keeps lines in memory for inspection
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every line written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Whether any line contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.count_containing(needle) > 0
    }

    /// Number of lines containing `needle`
    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines
            .lock()
            .map(|l| l.iter().filter(|line| line.contains(needle)).count())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_lines() {
        let sink = MemorySink::new();
        sink.write_line("Uploading..");
        sink.write_line("Uploaded : blinker");

        assert_eq!(sink.lines().len(), 2);
        assert!(sink.contains("blinker"));
        assert_eq!(sink.count_containing("Upload"), 2);

        sink.clear();
        assert!(sink.lines().is_empty());
    }

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sink = ChannelSink::new(tx);
        sink.write_line("first");
        sink.write_line("second");

        assert_eq!(rx.try_recv().unwrap(), "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_sink_survives_closed_receiver() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        ChannelSink::new(tx).write_line("nobody listening");
    }
}
