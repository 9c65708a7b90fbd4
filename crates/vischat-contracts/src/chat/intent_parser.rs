use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS, TURN_ID_COMMANDS,
};

/// One line of chat input, resolved to an action name plus its arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub text: Option<String>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            text: None,
            command_args: BTreeMap::new(),
        }
    }

    fn with_arg(mut self, key: &str, value: impl Into<String>) -> Self {
        self.command_args
            .insert(key.to_string(), Value::String(value.into()));
        self
    }

    pub fn arg(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(raw_spec) = RAW_ARG_COMMANDS
                .iter()
                .find(|raw_spec| raw_spec.spec.command == command)
            {
                return Intent::new(raw_spec.spec.action, text).with_arg(raw_spec.arg_key, arg);
            }

            if let Some(action) = find_action(&command, TURN_ID_COMMANDS) {
                let id = arg.split_whitespace().next().unwrap_or_default();
                return Intent::new(action, text).with_arg("id", id);
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                return Intent::new(action, text).with_arg("path", parse_single_path_arg(arg));
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            return Intent::new("unknown", text)
                .with_arg("command", command)
                .with_arg("arg", arg);
        }
    }

    let mut intent = Intent::new("send", text);
    intent.text = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn parse_plain_text_is_send() {
        let intent = parse_intent("  what is in this picture?  ");
        assert_eq!(intent.action, "send");
        assert_eq!(intent.text.as_deref(), Some("what is in this picture?"));
    }

    #[test]
    fn parse_blank_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn parse_path_commands() {
        let attach = parse_intent("/attach \"/tmp/a b.png\"");
        assert_eq!(attach.action, "attach_image");
        assert_eq!(attach.command_args["path"], json!("/tmp/a b.png"));

        let inject = parse_intent("/image cat.jpg");
        assert_eq!(inject.action, "inject_image");
        assert_eq!(inject.arg("path"), Some("cat.jpg"));
    }

    #[test]
    fn parse_turn_id_commands() {
        let edit = parse_intent("/edit 1a2b3c4d");
        assert_eq!(edit.action, "edit");
        assert_eq!(edit.arg("id"), Some("1a2b3c4d"));

        assert_eq!(parse_intent("/regen 1a2b3c4d").action, "regenerate");
        let delete = parse_intent("/delete   9f9f9f9f extra");
        assert_eq!(delete.action, "delete");
        assert_eq!(delete.arg("id"), Some("9f9f9f9f"));
        assert_eq!(parse_intent("/delete").arg("id"), None);
    }

    #[test]
    fn parse_model_and_system_commands() {
        let model = parse_intent("/model gpt-4o-mini");
        assert_eq!(model.action, "set_model");
        assert_eq!(model.arg("model"), Some("gpt-4o-mini"));

        let system = parse_intent("/system Answer in one sentence.");
        assert_eq!(system.action, "set_system");
        assert_eq!(system.arg("text"), Some("Answer in one sentence."));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/help").action, "help");
        assert_eq!(parse_intent("/models").action, "list_models");
        assert_eq!(parse_intent("/LIST").action, "list");
        assert_eq!(parse_intent("/exit").action, "quit");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }

    #[test]
    fn parse_bare_slash_is_text() {
        assert_eq!(parse_intent("/ hello").action, "send");
    }
}
