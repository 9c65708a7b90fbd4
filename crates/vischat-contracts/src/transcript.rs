use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::conversation::{Conversation, Turn, TurnId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub id: TurnId,
    #[serde(flatten)]
    pub turn: Turn,
}

/// On-disk snapshot of a conversation (`transcript.json`).
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub path: PathBuf,
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub cursor: Option<TurnId>,
    pub turns: Vec<TranscriptTurn>,
}

impl Transcript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            schema_version: 1,
            session_id: Uuid::new_v4().to_string(),
            created_at: now_utc_iso(),
            updated_at: None,
            cursor: None,
            turns: Vec::new(),
        }
    }

    /// Loads a transcript, keeping whatever parses. A missing or corrupt file
    /// yields a fresh transcript at the same path.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut transcript = Self::new(path.clone());
        let payload = read_json(&path).unwrap_or(Value::Object(Map::new()));
        let Some(obj) = payload.as_object() else {
            return transcript;
        };

        transcript.schema_version = obj
            .get("schema_version")
            .and_then(Value::as_u64)
            .unwrap_or(transcript.schema_version);
        transcript.session_id = obj
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(transcript.session_id);
        transcript.created_at = obj
            .get("created_at")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(transcript.created_at);
        transcript.updated_at = obj
            .get("updated_at")
            .and_then(Value::as_str)
            .map(str::to_string);
        transcript.cursor = obj
            .get("cursor")
            .and_then(Value::as_str)
            .map(TurnId::from);

        if let Some(turns) = obj.get("turns").and_then(Value::as_array) {
            for item in turns {
                if let Ok(parsed) = serde_json::from_value::<TranscriptTurn>(item.clone()) {
                    transcript.turns.push(parsed);
                }
            }
        }
        transcript
    }

    pub fn conversation(&self) -> Conversation {
        let mut turns = IndexMap::new();
        for entry in &self.turns {
            turns.insert(entry.id.clone(), entry.turn.clone());
        }
        Conversation::from_parts(turns, self.cursor.clone())
    }

    pub fn record(&mut self, conversation: &Conversation) {
        self.turns = conversation
            .iter()
            .map(|(id, turn)| TranscriptTurn {
                id: id.clone(),
                turn: turn.clone(),
            })
            .collect();
        self.cursor = Some(conversation.cursor().clone());
        self.updated_at = Some(now_utc_iso());
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let mut payload = Map::new();
        payload.insert(
            "schema_version".to_string(),
            Value::Number(self.schema_version.into()),
        );
        payload.insert(
            "session_id".to_string(),
            Value::String(self.session_id.clone()),
        );
        payload.insert(
            "created_at".to_string(),
            Value::String(self.created_at.clone()),
        );
        payload.insert(
            "updated_at".to_string(),
            self.updated_at
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        payload.insert(
            "cursor".to_string(),
            self.cursor
                .as_ref()
                .map(|id| Value::String(id.to_string()))
                .unwrap_or(Value::Null),
        );
        payload.insert("turns".to_string(), serde_json::to_value(&self.turns)?);

        write_json(&self.path, Value::Object(payload))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

fn write_json(path: &Path, payload: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&payload)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::Transcript;
    use crate::conversation::{Conversation, Role, TurnId, TurnUpdate};

    #[test]
    fn transcript_roundtrip_keeps_order_cursor_and_errors() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("session").join("transcript.json");

        let mut conversation = Conversation::new();
        let u1 = conversation.update_cursor_turn(TurnUpdate::Text("what is this".to_string()));
        conversation.set_turn(&u1, TurnUpdate::Image("data:image/jpeg;base64,AA".to_string()));
        let a1 = TurnId::from("a1a1a1a1");
        conversation.upsert_reply(&a1, "a cat");
        conversation.mark_failed(&a1, "a cat", "connection reset");
        conversation.set_system_prompt("be brief");
        conversation.pick_cursor();

        let mut transcript = Transcript::new(&path);
        transcript.record(&conversation);
        transcript.save()?;

        let loaded = Transcript::load(&path);
        assert_eq!(loaded.session_id, transcript.session_id);
        let restored = loaded.conversation();
        assert_eq!(restored.turns(), conversation.turns());
        assert_eq!(restored.cursor(), conversation.cursor());
        let roles: Vec<Role> = restored.iter().map(|(_, turn)| turn.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
        Ok(())
    }

    #[test]
    fn load_skips_unreadable_turns_and_tolerates_missing_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("transcript.json");
        assert!(Transcript::load(&path).turns.is_empty());

        fs::write(
            &path,
            serde_json::to_string(&json!({
                "schema_version": 1,
                "session_id": "s-1",
                "turns": [
                    {"id": "u1", "role": "user", "content": {"text": "hi"}},
                    {"id": "bad", "role": "narrator", "content": {"text": "?"}},
                ]
            }))?,
        )?;
        let loaded = Transcript::load(&path);
        assert_eq!(loaded.session_id, "s-1");
        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.conversation().cursor().as_str(), "u1");
        Ok(())
    }
}
