//! Build log context.
//!
//! A [`LogContext`] is created once per build and handed to every component.
//! Each event goes to `tracing` immediately and is buffered for the
//! configured [`LogSink`]; [`LogContext::flush`] drains the buffer. The most
//! recent events are also retained so a diagnostics bundle can include them
//! even when the sink is not a file.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::timestamp::now_utc_rfc3339;

const DEFAULT_FLUSH_THRESHOLD: usize = 256;
const DEFAULT_RECENT_CAPACITY: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub at_utc: String,
    pub level: Level,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

/// Destination for flushed events.
pub trait LogSink: Send {
    fn write(&mut self, events: &[LogEvent]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// File backing this sink, if any.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// Appends events as JSON lines to a file, opened on first write.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Option<File>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("log file not open"))
    }
}

impl LogSink for JsonLinesSink {
    fn write(&mut self, events: &[LogEvent]) -> io::Result<()> {
        let file = self.file()?;
        for event in events {
            let line = serde_json::to_string(event).map_err(io::Error::other)?;
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.sync_data(),
            None => Ok(()),
        }
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Keeps flushed events in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<LogEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        lock(&self.events).clone()
    }
}

impl LogSink for MemorySink {
    fn write(&mut self, events: &[LogEvent]) -> io::Result<()> {
        lock(&self.events).extend_from_slice(events);
        Ok(())
    }
}

struct LogState {
    buffer: Vec<LogEvent>,
    recent: VecDeque<LogEvent>,
    sink: Box<dyn LogSink>,
    flush_threshold: usize,
    recent_capacity: usize,
}

/// Shared, cloneable handle to one build's log.
#[derive(Clone)]
pub struct LogContext {
    state: Arc<Mutex<LogState>>,
}

impl LogContext {
    pub fn new(sink: Box<dyn LogSink>) -> Self {
        Self {
            state: Arc::new(Mutex::new(LogState {
                buffer: Vec::new(),
                recent: VecDeque::new(),
                sink,
                flush_threshold: DEFAULT_FLUSH_THRESHOLD,
                recent_capacity: DEFAULT_RECENT_CAPACITY,
            })),
        }
    }

    /// Log context backed by a [`MemorySink`]; the sink handle is returned
    /// for inspection.
    pub fn in_memory() -> (Self, MemorySink) {
        let sink = MemorySink::new();
        (Self::new(Box::new(sink.clone())), sink)
    }

    /// Number of buffered events before an automatic flush. `0` disables
    /// automatic flushing.
    pub fn with_flush_threshold(self, threshold: usize) -> Self {
        lock(&self.state).flush_threshold = threshold;
        self
    }

    pub fn record(
        &self,
        level: Level,
        component: &str,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        let event = LogEvent {
            at_utc: now_utc_rfc3339(),
            level,
            component: component.to_string(),
            message: message.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };
        emit_tracing(&event);

        let mut state = lock(&self.state);
        if state.recent.len() >= state.recent_capacity {
            state.recent.pop_front();
        }
        state.recent.push_back(event.clone());
        state.buffer.push(event);
        if state.flush_threshold > 0 && state.buffer.len() >= state.flush_threshold {
            if let Err(err) = drain(&mut state) {
                tracing::warn!("automatic log flush failed: {err}");
            }
        }
    }

    pub fn debug(
        &self,
        component: &str,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        self.record(Level::Debug, component, message, fields);
    }

    pub fn info(
        &self,
        component: &str,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        self.record(Level::Info, component, message, fields);
    }

    pub fn warn(
        &self,
        component: &str,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        self.record(Level::Warn, component, message, fields);
    }

    pub fn error(
        &self,
        component: &str,
        message: impl Into<String>,
        fields: impl IntoIterator<Item = (&'static str, Value)>,
    ) {
        self.record(Level::Error, component, message, fields);
    }

    /// Write all buffered events to the sink. Returns how many were written.
    pub fn flush(&self) -> io::Result<usize> {
        let mut state = lock(&self.state);
        drain(&mut state)
    }

    pub fn pending(&self) -> usize {
        lock(&self.state).buffer.len()
    }

    /// Most recent events, oldest first, whether flushed or not.
    pub fn recent(&self) -> Vec<LogEvent> {
        lock(&self.state).recent.iter().cloned().collect()
    }

    pub fn sink_location(&self) -> Option<PathBuf> {
        lock(&self.state).sink.location().map(Path::to_path_buf)
    }
}

impl std::fmt::Debug for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogContext")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

fn drain(state: &mut LogState) -> io::Result<usize> {
    if state.buffer.is_empty() {
        return Ok(0);
    }
    let events = std::mem::take(&mut state.buffer);
    if let Err(err) = state.sink.write(&events) {
        // Keep the events so a later flush can retry.
        let mut retained = events;
        retained.append(&mut state.buffer);
        state.buffer = retained;
        return Err(err);
    }
    state.sink.flush()?;
    Ok(events.len())
}

fn emit_tracing(event: &LogEvent) {
    let fields = if event.fields.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&event.fields).unwrap_or_default()
    };
    match event.level {
        Level::Debug => {
            tracing::debug!(component = %event.component, fields = %fields, "{}", event.message)
        }
        Level::Info => {
            tracing::info!(component = %event.component, fields = %fields, "{}", event.message)
        }
        Level::Warn => {
            tracing::warn!(component = %event.component, fields = %fields, "{}", event.message)
        }
        Level::Error => {
            tracing::error!(component = %event.component, fields = %fields, "{}", event.message)
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn events_stay_buffered_until_flush() {
        let (log, sink) = LogContext::in_memory();
        log.info("session", "mounted", [("session", json!("abc"))]);
        log.warn("store", "unload busy", []);

        assert_eq!(log.pending(), 2);
        assert!(sink.events().is_empty());

        assert_eq!(log.flush().unwrap(), 2);
        assert_eq!(log.pending(), 0);
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].fields["session"], json!("abc"));
        assert_eq!(events[1].level, Level::Warn);

        assert_eq!(log.flush().unwrap(), 0);
    }

    #[test]
    fn threshold_triggers_automatic_flush() {
        let (log, sink) = LogContext::in_memory();
        let log = log.with_flush_threshold(3);
        for i in 0..3 {
            log.info("pipeline", format!("event {i}"), []);
        }
        assert_eq!(sink.events().len(), 3);
        assert_eq!(log.pending(), 0);
    }

    #[test]
    fn recent_is_retained_after_flush() {
        let (log, _sink) = LogContext::in_memory();
        log.error("orchestrator", "stage failed", [("stage", json!("mutations"))]);
        log.flush().unwrap();
        let recent = log.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "stage failed");
    }

    #[test]
    fn json_lines_sink_appends_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("logs/build.jsonl");
        let log = LogContext::new(Box::new(JsonLinesSink::new(&path)));
        assert_eq!(log.sink_location().as_deref(), Some(path.as_path()));

        log.info("a", "one", []);
        log.flush().unwrap();
        log.info("a", "two", []);
        log.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<LogEvent> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].message, "two");
    }
}
