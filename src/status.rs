//! Sink for notable tunnel events, shared by both ends.

use std::sync::Arc;

/// Receiver for notable tunnel events (connect, reconnect, request received, error).
///
/// Implementations must not block; the engine calls `log` inline on its I/O tasks.
pub trait StatusSink: Send + Sync {
    fn log(&self, message: &str);
}

pub type SharedSink = Arc<dyn StatusSink>;

/// Default sink that emits every event through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn log(&self, message: &str) {
        tracing::info!(target: "tunnel::status", "{}", message);
    }
}

impl TracingSink {
    pub fn shared() -> SharedSink {
        Arc::new(TracingSink)
    }
}

/// Sink that keeps every message in memory, for assertions in tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

#[cfg(test)]
impl StatusSink for RecordingSink {
    fn log(&self, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.to_string());
        }
    }
}
