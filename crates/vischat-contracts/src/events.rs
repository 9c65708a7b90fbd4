use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only log of one chat session (`events.jsonl`).
///
/// Each line is one compact JSON object with `type`, `ts` and the
/// `session_id` also stored in `transcript.json`, so a resumed session keeps
/// appending under the same id. The caller's payload is merged last. Clones
/// share one lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> EventPayload {
        value.as_object().cloned().unwrap_or_default()
    }

    fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
        let content = fs::read_to_string(path)?;
        let mut rows = Vec::new();
        for line in content.lines() {
            rows.push(serde_json::from_str(line)?);
        }
        Ok(rows)
    }

    #[test]
    fn generation_event_carries_session_id_and_timestamp() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "5d1c0a77");

        let emitted = writer.emit(
            "generation_started",
            payload(json!({"target": "a1b2c3d4", "model": "gpt-4o-mini", "force": false})),
        )?;

        let rows = read_events(&path)?;
        assert_eq!(rows, vec![emitted]);
        assert_eq!(rows[0]["type"], json!("generation_started"));
        assert_eq!(rows[0]["session_id"], json!("5d1c0a77"));
        assert_eq!(rows[0]["target"], json!("a1b2c3d4"));
        assert_eq!(rows[0]["force"], json!(false));
        DateTime::parse_from_rfc3339(rows[0]["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn resumed_session_appends_under_same_id() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("session").join("events.jsonl");

        let first = EventWriter::new(&path, "5d1c0a77");
        first.emit("session_started", payload(json!({"turns": 0})))?;
        first.clone().emit("session_finished", payload(json!({"turns": 2})))?;

        let resumed = EventWriter::new(&path, first.session_id());
        resumed.emit("session_started", payload(json!({"turns": 2})))?;

        let rows = read_events(&path)?;
        let types: Vec<&str> = rows.iter().filter_map(|row| row["type"].as_str()).collect();
        assert_eq!(types, vec!["session_started", "session_finished", "session_started"]);
        assert!(rows.iter().all(|row| row["session_id"] == json!("5d1c0a77")));
        assert_eq!(rows[2]["turns"], json!(2));
        Ok(())
    }

    #[test]
    fn payload_is_merged_after_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "5d1c0a77");

        let emitted = writer.emit("turn_deleted", payload(json!({"type": "turn_removed"})))?;
        assert_eq!(emitted["type"], json!("turn_removed"));
        assert_eq!(emitted["session_id"], json!("5d1c0a77"));
        assert_eq!(writer.path(), temp.path().join("events.jsonl"));
        Ok(())
    }
}
