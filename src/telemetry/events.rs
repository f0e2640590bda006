use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::models::event::Event;

/// Append-only JSONL event log. One JSON object per line, `ts` first.
///
/// This is the sole audit surface: both the cycle thread and background
/// feed tick handlers write through it, so appends are serialized behind a
/// mutex and flushed per record.
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Failures are logged, never propagated: losing a
    /// telemetry record must not take down a trading cycle.
    pub fn append(&self, event: &Event) {
        let line = match Self::render(event) {
            Ok(l) => l,
            Err(e) => {
                warn!("event serialization failed: {e}");
                return;
            }
        };

        let mut guard = self.writer.lock();
        if guard.is_none() {
            match self.open() {
                Ok(w) => *guard = Some(w),
                Err(e) => {
                    warn!("event log open failed ({}): {e}", self.path.display());
                    return;
                }
            }
        }
        if let Some(w) = guard.as_mut() {
            if writeln!(w, "{line}").and_then(|_| w.flush()).is_err() {
                // Drop the handle so the next append retries from scratch.
                *guard = None;
            }
        }
    }

    fn open(&self) -> std::io::Result<BufWriter<File>> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(BufWriter::new(file))
    }

    fn render(event: &Event) -> anyhow::Result<String> {
        let value = serde_json::to_value(event)?;
        let Value::Object(fields) = value else {
            anyhow::bail!("event did not serialize to an object");
        };
        let mut out = Map::with_capacity(fields.len() + 1);
        out.insert(
            "ts".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        for (k, v) in fields {
            out.insert(k, v);
        }
        Ok(serde_json::to_string(&Value::Object(out))?)
    }

    /// Read back every parseable event. A truncated trailing line (torn
    /// write on crash) is skipped rather than treated as corruption.
    pub fn read_all(path: impl AsRef<Path>) -> std::io::Result<Vec<Event>> {
        let file = File::open(path.as_ref())?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Event>(&line) {
                Ok(ev) => out.push(ev),
                Err(_) => continue,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::Event;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("oddsmith-events-{}-{}.jsonl", name, std::process::id()))
    }

    #[test]
    fn append_then_read_roundtrip() {
        let path = temp_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let log = EventLog::new(&path);
        log.append(&Event::LoopError {
            error: "one".into(),
        });
        log.append(&Event::MarketScanEmpty {
            reason: "no_markets_for_focus_keywords".into(),
            focus_keywords: vec!["btc".into()],
        });

        let events = EventLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::LoopError { .. }));
        assert!(matches!(events[1], Event::MarketScanEmpty { .. }));

        // Every line starts with the ts field.
        let raw = std::fs::read_to_string(&path).unwrap();
        for line in raw.lines() {
            assert!(line.starts_with("{\"ts\":"), "line missing leading ts: {line}");
        }
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn truncated_trailing_line_is_skipped() {
        let path = temp_path("truncated");
        let _ = std::fs::remove_file(&path);
        let log = EventLog::new(&path);
        log.append(&Event::LoopError {
            error: "kept".into(),
        });
        // Simulate a torn write.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"ts\":\"2026-01-01T00:00:00Z\",\"type\":\"loop_err").unwrap();
        }
        let events = EventLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 1);
        let _ = std::fs::remove_file(&path);
    }
}
