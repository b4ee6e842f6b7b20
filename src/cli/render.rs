//! Human and JSON output for command results.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rust_mcp_schema::{
    CallToolResult, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, ReadResourceResult,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use unicode_width::UnicodeWidthStr;

use super::OutputFormat;
use crate::mcp::client::ServerDetails;

#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    format: OutputFormat,
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value)
        .unwrap_or_else(|err| json!({ "error": err.to_string() }).to_string())
}

fn as_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Two-column listing padded by display width.
fn table(rows: &[(String, String)]) -> String {
    let width = rows
        .iter()
        .map(|(left, _)| UnicodeWidthStr::width(left.as_str()))
        .max()
        .unwrap_or(0);
    rows.iter()
        .map(|(left, right)| {
            if right.is_empty() {
                left.clone()
            } else {
                let pad = width - UnicodeWidthStr::width(left.as_str());
                format!("{left}{}  {right}", " ".repeat(pad))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn items_table(list: &Value, key: &str, label: impl Fn(&Value) -> (String, String)) -> String {
    let rows: Vec<(String, String)> = list
        .get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().map(label).collect())
        .unwrap_or_default();
    if rows.is_empty() {
        return format!("(no {key})");
    }
    table(&rows)
}

fn blob_summary(kind: &str, mime: Option<&str>, data: Option<&str>) -> String {
    let size = data
        .map(|data| match STANDARD.decode(data) {
            Ok(bytes) => format!("{} bytes", bytes.len()),
            Err(_) => "invalid base64".to_string(),
        })
        .unwrap_or_else(|| "no data".to_string());
    format!("[{kind} {}, {size}]", mime.unwrap_or("application/octet-stream"))
}

/// One content block (tool result, prompt message) as text.
fn content_block(block: &Value) -> String {
    match str_field(block, "type") {
        Some("text") => str_field(block, "text").unwrap_or_default().to_string(),
        Some(kind @ ("image" | "audio")) => {
            blob_summary(kind, str_field(block, "mimeType"), str_field(block, "data"))
        }
        Some("resource_link") => format!(
            "[resource link {}]",
            str_field(block, "uri").unwrap_or("?")
        ),
        Some("resource") => block
            .get("resource")
            .map(resource_contents)
            .unwrap_or_default(),
        _ => block.to_string(),
    }
}

fn resource_contents(contents: &Value) -> String {
    if let Some(text) = str_field(contents, "text") {
        return text.to_string();
    }
    blob_summary(
        "blob",
        str_field(contents, "mimeType"),
        str_field(contents, "blob"),
    )
}

pub fn is_tool_error(result: &CallToolResult) -> bool {
    as_value(result)
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

impl Renderer {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    fn json_mode(&self) -> bool {
        self.format == OutputFormat::Json
    }

    pub fn server_details(&self, details: &ServerDetails) -> String {
        if self.json_mode() {
            return to_json(details);
        }
        let mut capabilities: Vec<String> = details
            .capabilities
            .iter()
            .map(|capability| capability.to_string())
            .collect();
        for (flag, name) in [
            (details.capabilities.resource_subscribe, "resources.subscribe"),
            (details.capabilities.logging, "logging"),
            (details.capabilities.completions, "completions"),
        ] {
            if flag {
                capabilities.push(name.to_string());
            }
        }
        let mut lines = vec![
            format!(
                "Server: {} {}",
                details.server_info.name, details.server_info.version
            ),
            format!("Protocol: {}", details.protocol_version),
            format!(
                "Capabilities: {}",
                if capabilities.is_empty() {
                    "(none)".to_string()
                } else {
                    capabilities.join(", ")
                }
            ),
        ];
        if let Some(instructions) = &details.instructions {
            lines.push("Instructions:".to_string());
            lines.extend(instructions.lines().map(|line| format!("  {line}")));
        }
        lines.join("\n")
    }

    pub fn ping(&self, elapsed: Duration) -> String {
        let millis = elapsed.as_secs_f64() * 1000.0;
        if self.json_mode() {
            return to_json(&json!({ "elapsed_ms": millis }));
        }
        format!("pong ({millis:.1} ms)")
    }

    pub fn tools(&self, list: &ListToolsResult) -> String {
        if self.json_mode() {
            return to_json(list);
        }
        items_table(&as_value(list), "tools", |tool| {
            (
                str_field(tool, "name").unwrap_or("?").to_string(),
                str_field(tool, "description")
                    .and_then(|text| text.lines().next())
                    .unwrap_or_default()
                    .to_string(),
            )
        })
    }

    pub fn tool_result(&self, result: &CallToolResult) -> String {
        if self.json_mode() {
            return to_json(result);
        }
        let value = as_value(result);
        let mut parts: Vec<String> = value
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| blocks.iter().map(content_block).collect())
            .unwrap_or_default();
        if let Some(structured) = value.get("structuredContent").filter(|v| !v.is_null()) {
            parts.push(to_json(structured));
        }
        if is_tool_error(result) {
            parts.insert(0, "Tool reported an error:".to_string());
        }
        parts.join("\n")
    }

    pub fn resources(&self, list: &ListResourcesResult) -> String {
        if self.json_mode() {
            return to_json(list);
        }
        items_table(&as_value(list), "resources", |resource| {
            let mut detail = str_field(resource, "uri").unwrap_or("?").to_string();
            if let Some(mime) = str_field(resource, "mimeType") {
                detail.push_str(&format!(" ({mime})"));
            }
            (
                str_field(resource, "name").unwrap_or("?").to_string(),
                detail,
            )
        })
    }

    pub fn templates(&self, list: &ListResourceTemplatesResult) -> String {
        if self.json_mode() {
            return to_json(list);
        }
        items_table(&as_value(list), "resourceTemplates", |template| {
            (
                str_field(template, "name").unwrap_or("?").to_string(),
                str_field(template, "uriTemplate").unwrap_or("?").to_string(),
            )
        })
    }

    pub fn resource_contents(&self, result: &ReadResourceResult) -> String {
        if self.json_mode() {
            return to_json(result);
        }
        as_value(result)
            .get("contents")
            .and_then(Value::as_array)
            .map(|contents| {
                contents
                    .iter()
                    .map(resource_contents)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default()
    }

    pub fn prompts(&self, list: &ListPromptsResult) -> String {
        if self.json_mode() {
            return to_json(list);
        }
        items_table(&as_value(list), "prompts", |prompt| {
            let arguments: Vec<String> = prompt
                .get("arguments")
                .and_then(Value::as_array)
                .map(|arguments| {
                    arguments
                        .iter()
                        .filter_map(|argument| {
                            let name = str_field(argument, "name")?;
                            let required = argument
                                .get("required")
                                .and_then(Value::as_bool)
                                .unwrap_or(false);
                            Some(if required {
                                format!("{name}*")
                            } else {
                                name.to_string()
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            let mut detail = str_field(prompt, "description")
                .unwrap_or_default()
                .to_string();
            if !arguments.is_empty() {
                detail.push_str(&format!(" [{}]", arguments.join(", ")));
            }
            (
                str_field(prompt, "name").unwrap_or("?").to_string(),
                detail.trim().to_string(),
            )
        })
    }

    pub fn prompt(&self, result: &GetPromptResult) -> String {
        if self.json_mode() {
            return to_json(result);
        }
        let value = as_value(result);
        let mut lines = Vec::new();
        if let Some(description) = str_field(&value, "description") {
            lines.push(format!("# {description}"));
        }
        if let Some(messages) = value.get("messages").and_then(Value::as_array) {
            for message in messages {
                let role = str_field(message, "role").unwrap_or("?");
                let content = message
                    .get("content")
                    .map(content_block)
                    .unwrap_or_default();
                lines.push(format!("{role}: {content}"));
            }
        }
        lines.join("\n")
    }

    pub fn instructions(&self, instructions: Option<&str>) -> String {
        if self.json_mode() {
            return to_json(&json!({ "instructions": instructions }));
        }
        instructions.unwrap_or("(no instructions)").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text() -> Renderer {
        Renderer::new(OutputFormat::Text)
    }

    #[test]
    fn tool_listing_aligns_descriptions() {
        let list: ListToolsResult = serde_json::from_value(json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "Echo input\nsecond line",
                    "inputSchema": {"type": "object"}
                },
                {"name": "sleep_ms", "inputSchema": {"type": "object"}}
            ]
        }))
        .unwrap();
        assert_eq!(text().tools(&list), "echo      Echo input\nsleep_ms");
    }

    #[test]
    fn empty_listing_says_so() {
        let list: ListPromptsResult = serde_json::from_value(json!({"prompts": []})).unwrap();
        assert_eq!(text().prompts(&list), "(no prompts)");
    }

    #[test]
    fn binary_content_is_summarized() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "image", "data": STANDARD.encode([0u8; 12]), "mimeType": "image/png"}
            ],
            "isError": true
        }))
        .unwrap();
        assert!(is_tool_error(&result));
        assert_eq!(
            text().tool_result(&result),
            "Tool reported an error:\nhello\n[image image/png, 12 bytes]"
        );
    }

    #[test]
    fn blob_resources_report_decoded_size() {
        let result: ReadResourceResult = serde_json::from_value(json!({
            "contents": [
                {"uri": "mem://a", "text": "alpha"},
                {"uri": "mem://b", "blob": STANDARD.encode(b"xyz"), "mimeType": "application/zip"}
            ]
        }))
        .unwrap();
        assert_eq!(
            text().resource_contents(&result),
            "alpha\n[blob application/zip, 3 bytes]"
        );
    }

    #[test]
    fn json_mode_emits_parsable_output() {
        let output = Renderer::new(OutputFormat::Json).instructions(Some("Use echo."));
        let parsed: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["instructions"], "Use echo.");
    }
}
