use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, EXPORT_COMMAND, NO_ARG_COMMANDS, PICK_COMMAND, RAW_ARG_COMMANDS,
    SETTING_COMMANDS, SINGLE_PATH_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    fn invalid(raw: &str, command: &str, reason: &str) -> Self {
        let mut intent = Self::new("invalid", raw);
        intent
            .command_args
            .insert("command".to_string(), Value::String(command.to_string()));
        intent
            .command_args
            .insert("reason".to_string(), Value::String(reason.to_string()));
        intent
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
    parse_path_args(arg).join(" ")
}

fn parse_setting_value(command: &str, arg: &str) -> Option<Value> {
    match command {
        "steps" => arg
            .parse::<u32>()
            .ok()
            .filter(|value| *value > 0)
            .map(|value| Value::Number(value.into())),
        _ => arg
            .parse::<f64>()
            .ok()
            .filter(|value| value.is_finite() && *value >= 0.0)
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
    }
}

/// `/pick 2` selects by 1-based position, anything else by option text.
fn parse_pick(raw: &str, arg: &str) -> Intent {
    if arg.is_empty() {
        return Intent::invalid(raw, PICK_COMMAND.command, "expected an option number or name");
    }
    let mut intent = Intent::new(PICK_COMMAND.action, raw);
    match arg.parse::<usize>() {
        Ok(0) => return Intent::invalid(raw, PICK_COMMAND.command, "options are numbered from 1"),
        Ok(position) => {
            intent
                .command_args
                .insert("index".to_string(), Value::Number((position - 1).into()));
        }
        Err(_) => {
            intent
                .command_args
                .insert("option".to_string(), Value::String(arg.to_string()));
        }
    }
    intent
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '-')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let arg = slash_tail[command_len..].trim();

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert("endpoint".to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if let Some(action) = find_action(&command, SETTING_COMMANDS) {
                let Some(value) = parse_setting_value(&command, arg) else {
                    return Intent::invalid(text, &command, "expected a non-negative number");
                };
                let mut intent = Intent::new(action, text);
                intent.settings_update.insert(command, value);
                return intent;
            }

            if command == PICK_COMMAND.command {
                return parse_pick(text, arg);
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            if command == EXPORT_COMMAND.command {
                let mut intent = Intent::new(EXPORT_COMMAND.action, text);
                let path = parse_single_path_arg(arg);
                intent.command_args.insert(
                    "path".to_string(),
                    if path.is_empty() {
                        Value::Null
                    } else {
                        Value::String(path)
                    },
                );
                return intent;
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("submit", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::parse_intent;

    #[test]
    fn plain_text_submits_trimmed_prompt() {
        let intent = parse_intent("  a red car at dusk \n");
        assert_eq!(intent.action, "submit");
        assert_eq!(intent.prompt.as_deref(), Some("a red car at dusk"));
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn pick_by_position_is_zero_based_internally() {
        let intent = parse_intent("/pick 2");
        assert_eq!(intent.action, "select_option");
        assert_eq!(intent.command_args["index"], json!(1));
    }

    #[test]
    fn pick_by_name_keeps_full_text() {
        let intent = parse_intent("/pick sunset lighting");
        assert_eq!(intent.action, "select_option");
        assert_eq!(intent.command_args["option"], json!("sunset lighting"));
    }

    #[test]
    fn pick_rejects_zero_and_empty() {
        assert_eq!(parse_intent("/pick 0").action, "invalid");
        let empty = parse_intent("/pick");
        assert_eq!(empty.action, "invalid");
        assert_eq!(empty.command_args["command"], json!("pick"));
    }

    #[test]
    fn setting_commands_parse_numbers() {
        let steps = parse_intent("/steps 8");
        assert_eq!(steps.action, "set_steps");
        assert_eq!(steps.settings_update["steps"], json!(8));

        let guidance = parse_intent("/guidance 1.5");
        assert_eq!(guidance.action, "set_guidance");
        assert_eq!(guidance.settings_update["guidance"], json!(1.5));

        assert_eq!(parse_intent("/steps 0").action, "invalid");
        assert_eq!(parse_intent("/guidance -1").action, "invalid");
    }

    #[test]
    fn analyze_takes_quoted_path() {
        let intent = parse_intent("/analyze \"/tmp/my image.png\"");
        assert_eq!(intent.action, "analyze_image");
        assert_eq!(intent.command_args["path"], json!("/tmp/my image.png"));
    }

    #[test]
    fn no_arg_commands_and_aliases() {
        assert_eq!(parse_intent("/reset").action, "reset");
        assert_eq!(parse_intent("/PLAN").action, "show_plan");
        assert_eq!(parse_intent("/history").action, "show_history");
        assert_eq!(parse_intent("/exit").action, "quit");
    }

    #[test]
    fn export_path_is_optional() {
        assert_eq!(parse_intent("/export").command_args["path"], Value::Null);
        assert_eq!(
            parse_intent("/export out/page.html").command_args["path"],
            json!("out/page.html")
        );
    }

    #[test]
    fn endpoint_and_unknown_commands() {
        let endpoint = parse_intent("/endpoint analyze-for-detail");
        assert_eq!(endpoint.action, "set_endpoint");
        assert_eq!(endpoint.command_args["endpoint"], json!("analyze-for-detail"));

        let unknown = parse_intent("/magic foo bar");
        assert_eq!(unknown.action, "unknown");
        assert_eq!(unknown.command_args["command"], json!("magic"));
        assert_eq!(unknown.command_args["arg"], json!("foo bar"));
    }
}
