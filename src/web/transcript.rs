// Wire adaptation for the web transport: the whole conversation is
// presented as a single labelled transcript in one user turn

use crate::api::models::{
    ContentBlock, ImageSource, MessagesRequest, Role, SystemPrompt,
};
use crate::config::AppConfig;
use crate::error::{ProxyError, Result};

/// Fenced-JSON calling convention recognized by the tool-call event
/// stage.
pub const TOOL_FENCE_OPEN: &str = "```tool_use";
pub const TOOL_FENCE_CLOSE: &str = "```";

const TOOL_PROMPT_HEADER: &str = "You may call the tools listed below. To call one, reply with a \
fenced block in exactly this form and nothing else on those lines:\n\
```tool_use\n{\"name\": \"<tool name>\", \"input\": {<arguments>}}\n```\n\
After the tool runs, its result is handed back to you as a tool result message.\n\
Available tools:";

const PAD_PHRASE: &str = "The quick brown fox jumps over the lazy dog. ";

#[derive(Debug, Default)]
pub struct RenderedPrompt {
    pub prompt: String,
    /// Base64 images to upload out-of-band, as (media_type, data).
    pub inline_images: Vec<(String, String)>,
    /// External URLs, only populated when the config allows them.
    pub external_image_urls: Vec<String>,
}

/// Deterministic prompt padding. The same configured length always
/// yields the same bytes, so upstream prompt caching stays stable.
pub fn padding(length: usize) -> String {
    if length == 0 {
        return String::new();
    }
    let mut out = String::with_capacity(length);
    while out.len() < length {
        out.push_str(PAD_PHRASE);
    }
    out.truncate(length);
    out
}

/// Flatten the request into the single-turn transcript shape the web
/// endpoint expects.
pub fn render(request: &MessagesRequest, config: &AppConfig) -> Result<RenderedPrompt> {
    let mut rendered = RenderedPrompt::default();
    let mut sections: Vec<String> = Vec::new();

    let mut system = String::new();
    if !config.custom_prompt.is_empty() {
        system.push_str(&config.custom_prompt);
        system.push('\n');
    }
    match &request.system {
        Some(SystemPrompt::Text(text)) if !text.is_empty() => {
            system.push_str(text);
            system.push('\n');
        }
        Some(SystemPrompt::Blocks(blocks)) => {
            for block in blocks {
                system.push_str(&block.text);
                system.push('\n');
            }
        }
        _ => {}
    }
    if let Some(tools) = &request.tools {
        if !tools.is_empty() {
            system.push_str(TOOL_PROMPT_HEADER);
            system.push('\n');
            system.push_str(&serde_json::to_string_pretty(tools).unwrap_or_default());
            system.push('\n');
        }
    }
    if config.padtxt_length > 0 {
        system.push_str(&padding(config.padtxt_length));
        system.push('\n');
    }
    if !system.is_empty() {
        sections.push(system.trim_end().to_string());
    }

    let mut prefill: Option<String> = None;
    let message_count = request.messages.len();
    for (index, message) in request.messages.iter().enumerate() {
        let text = render_message(message, config, &mut rendered)?;
        let is_last = index + 1 == message_count;
        if is_last && message.role == Role::Assistant {
            prefill = Some(text);
            continue;
        }
        if config.use_real_roles {
            let label = match message.role {
                Role::User => &config.human_name,
                Role::Assistant => &config.assistant_name,
            };
            sections.push(format!("{}: {}", label, text));
        } else {
            sections.push(text);
        }
    }

    let mut prompt = sections.join("\n\n");
    if config.use_real_roles {
        // The trailing assistant label elicits a continuation; any
        // prefill from a final assistant turn rides after it.
        prompt.push_str("\n\n");
        prompt.push_str(&config.assistant_name);
        prompt.push(':');
        if let Some(prefill) = prefill {
            prompt.push(' ');
            prompt.push_str(&prefill);
        }
    } else if let Some(prefill) = prefill {
        prompt.push_str("\n\n");
        prompt.push_str(&prefill);
    }

    rendered.prompt = prompt;
    Ok(rendered)
}

fn render_message(
    message: &crate::api::models::InputMessage,
    config: &AppConfig,
    rendered: &mut RenderedPrompt,
) -> Result<String> {
    let mut parts: Vec<String> = Vec::new();
    for block in message.content.blocks() {
        match block {
            ContentBlock::Text { text, .. } => parts.push(text),
            ContentBlock::Image { source } => {
                match source {
                    ImageSource::Base64 { media_type, data } => {
                        rendered.inline_images.push((media_type, data));
                    }
                    ImageSource::Url { url } => {
                        if !config.allow_external_images {
                            return Err(ProxyError::RequestInvalid(
                                "external image URLs are not allowed".to_string(),
                            ));
                        }
                        rendered.external_image_urls.push(url);
                    }
                    ImageSource::File { .. } => {}
                }
                parts.push("[image attached]".to_string());
            }
            ContentBlock::ToolUse { id, name, input } => {
                parts.push(format!(
                    "{}\n{}\n{}",
                    TOOL_FENCE_OPEN,
                    serde_json::json!({ "id": id, "name": name, "input": input }),
                    TOOL_FENCE_CLOSE
                ));
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let body = match &content {
                    serde_json::Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                let label = if is_error == Some(true) {
                    "Tool error"
                } else {
                    "Tool result"
                };
                parts.push(format!("{} ({}): {}", label, tool_use_id, body));
            }
            // Thinking is not replayable through the web interface.
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => {}
        }
    }
    Ok(parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(body).unwrap()
    }

    fn config() -> AppConfig {
        AppConfig::default()
    }

    #[test]
    fn transcript_labels_turns_and_ends_with_assistant() {
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "system": "Stay in character.",
            "messages": [
                {"role": "user", "content": "Hello there"},
                {"role": "assistant", "content": "General Kenobi"},
                {"role": "user", "content": "Nice."}
            ]
        }));
        let rendered = render(&req, &config()).unwrap();
        assert!(rendered.prompt.starts_with("Stay in character."));
        assert!(rendered.prompt.contains("Human: Hello there"));
        assert!(rendered.prompt.contains("Assistant: General Kenobi"));
        assert!(rendered.prompt.ends_with("Assistant:"));
    }

    #[test]
    fn custom_names_replace_defaults() {
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let config = AppConfig {
            human_name: "H".to_string(),
            assistant_name: "A".to_string(),
            ..AppConfig::default()
        };
        let rendered = render(&req, &config).unwrap();
        assert!(rendered.prompt.contains("H: hi"));
        assert!(rendered.prompt.ends_with("A:"));
    }

    #[test]
    fn final_assistant_turn_becomes_prefill() {
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "user", "content": "Finish: roses are"},
                {"role": "assistant", "content": "red,"}
            ]
        }));
        let rendered = render(&req, &config()).unwrap();
        assert!(rendered.prompt.ends_with("Assistant: red,"));
    }

    #[test]
    fn tool_definitions_enter_the_system_section() {
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "tools": [{"name": "get_weather", "input_schema": {"type": "object"}}],
            "messages": [{"role": "user", "content": "weather in Paris?"}]
        }));
        let rendered = render(&req, &config()).unwrap();
        assert!(rendered.prompt.contains(TOOL_FENCE_OPEN));
        assert!(rendered.prompt.contains("get_weather"));
        let fence_pos = rendered.prompt.find(TOOL_FENCE_OPEN).unwrap();
        let turn_pos = rendered.prompt.find("Human:").unwrap();
        assert!(fence_pos < turn_pos, "tool prompt belongs to the system section");
    }

    #[test]
    fn tool_results_render_with_their_id() {
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_abc", "name": "get_weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_abc", "content": "sunny"}
                ]}
            ]
        }));
        let rendered = render(&req, &config()).unwrap();
        assert!(rendered.prompt.contains("Tool result (toolu_abc): sunny"));
        assert!(rendered.prompt.contains("\"name\":\"get_weather\""));
    }

    #[test]
    fn padding_is_deterministic_and_sized() {
        assert_eq!(padding(0), "");
        assert_eq!(padding(100).len(), 100);
        assert_eq!(padding(100), padding(100));
        let config = AppConfig {
            padtxt_length: 256,
            ..AppConfig::default()
        };
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let rendered = render(&req, &config).unwrap();
        assert!(rendered.prompt.contains(&padding(256)));
    }

    #[test]
    fn external_images_require_opt_in() {
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{"role": "user", "content": [
                {"type": "image", "source": {"type": "url", "url": "https://example.com/cat.png"}}
            ]}]
        }));
        assert!(render(&req, &config()).is_err());

        let allowing = AppConfig {
            allow_external_images: true,
            ..AppConfig::default()
        };
        let rendered = render(&req, &allowing).unwrap();
        assert_eq!(rendered.external_image_urls, vec!["https://example.com/cat.png"]);
    }

    #[test]
    fn raw_mode_skips_labels() {
        let config = AppConfig {
            use_real_roles: false,
            ..AppConfig::default()
        };
        let req = request(json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                {"role": "user", "content": "one"},
                {"role": "assistant", "content": "two"},
                {"role": "user", "content": "three"}
            ]
        }));
        let rendered = render(&req, &config).unwrap();
        assert!(!rendered.prompt.contains("Human:"));
        assert!(!rendered.prompt.contains("Assistant:"));
        assert!(rendered.prompt.contains("one"));
        assert!(rendered.prompt.contains("three"));
    }
}
