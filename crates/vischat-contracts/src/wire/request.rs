use serde::Serialize;
use serde_json::{Map, Value};

use crate::conversation::{Role, Turn, TurnId};

/// One message in the chat-completions `messages` array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: WireContent,
}

/// Plain string for text-only turns, `[text, image_url]` parts otherwise.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts([WirePart; 2]),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

impl From<&Turn> for WireMessage {
    fn from(turn: &Turn) -> Self {
        let content = match turn.image() {
            Some(url) => WireContent::Parts([
                WirePart::Text {
                    text: turn.text().to_string(),
                },
                WirePart::ImageUrl {
                    image_url: ImageUrl {
                        url: url.to_string(),
                    },
                },
            ]),
            None => WireContent::Text(turn.text().to_string()),
        };
        Self {
            role: turn.role,
            content,
        }
    }
}

/// Maps a conversation prefix to wire messages. Turns whose generation failed
/// carry no usable reply and are left out.
pub fn wire_messages<'a, I>(prefix: I) -> Vec<WireMessage>
where
    I: IntoIterator<Item = (&'a TurnId, &'a Turn)>,
{
    prefix
        .into_iter()
        .filter(|(_, turn)| !turn.is_failed())
        .map(|(_, turn)| WireMessage::from(turn))
        .collect()
}

/// `{ messages, stream: true }` with the model's extra config merged last, so
/// config keys win over the defaults.
pub fn build_request_body(
    messages: &[WireMessage],
    config: &Map<String, Value>,
) -> anyhow::Result<Map<String, Value>> {
    let mut body = Map::new();
    body.insert("messages".to_string(), serde_json::to_value(messages)?);
    body.insert("stream".to_string(), Value::Bool(true));
    for (key, value) in config {
        body.insert(key.clone(), value.clone());
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{build_request_body, wire_messages, WireMessage};
    use crate::conversation::{Turn, TurnId};

    #[test]
    fn text_only_turn_is_plain_string() {
        let message = WireMessage::from(&Turn::user("hello"));
        assert_eq!(
            serde_json::to_value(message).unwrap(),
            json!({"role": "user", "content": "hello"})
        );
    }

    #[test]
    fn image_turn_is_text_then_image_parts() {
        let turn = Turn::user("what is this").with_image("data:image/jpeg;base64,AAAA");
        assert_eq!(
            serde_json::to_value(WireMessage::from(&turn)).unwrap(),
            json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAA"}},
                ]
            })
        );
    }

    #[test]
    fn failed_turns_are_skipped() {
        let u1 = TurnId::from("u1");
        let a1 = TurnId::from("a1");
        let user = Turn::user("hi");
        let mut failed = Turn::assistant("");
        failed.error = Some("stream failed".to_string());
        let messages = wire_messages(vec![(&u1, &user), (&a1, &failed)]);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn config_is_merged_last() -> anyhow::Result<()> {
        let mut config = Map::new();
        config.insert("model".to_string(), json!("gpt-4o-mini"));
        config.insert("temperature".to_string(), json!(0.2));
        config.insert("stream".to_string(), Value::Bool(false));

        let body = build_request_body(&[WireMessage::from(&Turn::system("be brief"))], &config)?;
        assert_eq!(body["model"], json!("gpt-4o-mini"));
        assert_eq!(body["temperature"], json!(0.2));
        assert_eq!(body["stream"], Value::Bool(false));
        assert_eq!(
            body["messages"],
            json!([{"role": "system", "content": "be brief"}])
        );
        Ok(())
    }
}
