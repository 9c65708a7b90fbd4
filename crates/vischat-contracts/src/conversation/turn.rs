use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const TURN_ID_LEN: usize = 8;

/// Short opaque identifier of a turn, the first 8 characters of a random v4 uuid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    pub fn random() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(raw[..TURN_ID_LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for TurnId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TurnId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnContent {
    pub text: String,
    /// Attached image as a `data:` URL (or any URL the endpoint accepts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    /// Set when the generation that produced this turn failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: TurnContent {
                text: text.into(),
                image: None,
            },
            error: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.content.image = Some(url.into());
        self
    }

    pub fn text(&self) -> &str {
        self.content.text.as_str()
    }

    pub fn image(&self) -> Option<&str> {
        self.content.image.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// A single edit applied to the turn under the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnUpdate {
    Text(String),
    Image(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Role, Turn, TurnId};

    #[test]
    fn random_ids_are_eight_chars() {
        let id = TurnId::random();
        assert_eq!(id.as_str().len(), 8);
        assert_ne!(id, TurnId::random());
    }

    #[test]
    fn turn_serializes_without_empty_optionals() {
        let value = serde_json::to_value(Turn::user("hello")).unwrap();
        assert_eq!(
            value,
            json!({"role": "user", "content": {"text": "hello"}})
        );

        let with_image = serde_json::to_value(Turn::user("").with_image("data:x")).unwrap();
        assert_eq!(with_image["content"]["image"], json!("data:x"));
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }
}
