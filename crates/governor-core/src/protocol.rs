//! Tool-call protocol — the self-closing tag the model writes to call a tool.
//!
//! ```text
//! <tool_call name="calculator" expression="2+2" precision="2" />
//! ```
//!
//! Calls are extracted verbatim from generated text, their attributes are
//! turned into a JSON argument object, and the named tool is dispatched.
//! Attribute values are plain text; `&quot;`, `&apos;`, `&lt;`, `&gt;` and
//! `&amp;` are unescaped. The closing marker is only recognised outside a
//! quoted value.

use serde_json::{Map, Number, Value};

use crate::tools::{ParameterSpec, ToolRegistry};

/// Opening marker of a tool call.
pub const CALL_OPEN: &str = "<tool_call";

/// Closing marker of a tool call.
pub const CALL_CLOSE: &str = "/>";

/// Attribute that selects the tool.
pub const NAME_ATTRIBUTE: &str = "name";

/// A tool-call tag captured verbatim from model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCall {
    /// The tag text, markers included.
    pub text: String,
    /// Byte offset of the opening marker in the scanned text.
    pub start: usize,
    /// Byte offset just past the closing marker.
    pub end: usize,
}

/// A call resolved against a tool's parameters, ready to dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    /// Tool name from the `name` attribute.
    pub name: String,
    /// JSON object built from the accepted attributes.
    pub arguments: Value,
}

impl ToolInvocation {
    /// Arguments as the JSON string handed to [`Tool::execute`](crate::tools::Tool::execute).
    pub fn arguments_json(&self) -> String {
        self.arguments.to_string()
    }
}

/// Recoverable tool-call failures. These are shown to the model, never
/// returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolCallError {
    #[error("tool call has no name attribute")]
    MissingName,

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("tool '{tool}' requires the '{attribute}' attribute")]
    MissingAttribute { tool: String, attribute: String },

    #[error("tool '{0}' was not confirmed by the user")]
    Declined(String),

    #[error("tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },
}

/// Length of the tag at the start of `text`, up to and including the
/// closing marker.
///
/// `text` must begin with [`CALL_OPEN`]. Returns `None` when the tag is not
/// closed yet, or when another opening marker starts before it closes.
pub fn find_call_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut in_quote = false;
    let mut i = CALL_OPEN.len();
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quote = !in_quote,
            b'/' if !in_quote && bytes.get(i + 1) == Some(&b'>') => return Some(i + 2),
            b'<' if !in_quote && text[i..].starts_with(CALL_OPEN) => return None,
            _ => {}
        }
        i += 1;
    }
    None
}

/// Extract up to `max_calls` complete tool-call tags, left to right.
///
/// Scanning resumes after each match; an unterminated tag is skipped.
pub fn extract_calls(text: &str, max_calls: usize) -> Vec<RawCall> {
    let mut calls = Vec::new();
    let mut cursor = 0;
    while calls.len() < max_calls {
        let Some(offset) = text[cursor..].find(CALL_OPEN) else {
            break;
        };
        let start = cursor + offset;
        match find_call_end(&text[start..]) {
            Some(len) => {
                let end = start + len;
                calls.push(RawCall {
                    text: text[start..end].to_string(),
                    start,
                    end,
                });
                cursor = end;
            }
            None => cursor = start + CALL_OPEN.len(),
        }
    }
    calls
}

/// Whether `text` holds at least one complete tool-call tag.
pub fn contains_complete_call(text: &str) -> bool {
    !extract_calls(text, 1).is_empty()
}

/// Remove every complete tool-call tag from `text`.
pub fn strip_calls(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for call in extract_calls(text, usize::MAX) {
        out.push_str(&text[cursor..call.start]);
        cursor = call.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// All `key="value"` attributes of a raw call, in tag order.
///
/// Values are unescaped. Text that is not a well-formed attribute is skipped.
pub fn parse_attributes(raw_call: &str) -> Vec<(String, String)> {
    let body = raw_call.strip_prefix(CALL_OPEN).unwrap_or(raw_call);
    let mut attributes = Vec::new();
    let mut rest = body;

    while !rest.is_empty() {
        let key_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(rest.len());
        if key_len == 0 {
            // Not the start of a key; skip one character.
            let skip = rest.chars().next().map_or(1, char::len_utf8);
            rest = &rest[skip..];
            continue;
        }
        let key = &rest[..key_len];
        let after_key = &rest[key_len..];
        let Some(quoted) = after_key.strip_prefix("=\"") else {
            rest = after_key;
            continue;
        };
        let Some(value_len) = quoted.find('"') else {
            break;
        };
        attributes.push((key.to_string(), unescape(&quoted[..value_len])));
        rest = &quoted[value_len + 1..];
    }
    attributes
}

/// Value of the attribute named exactly `key`, unescaped.
pub fn parse_attribute(raw_call: &str, key: &str) -> Option<String> {
    parse_attributes(raw_call)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Classify an attribute value: digits with an optional leading sign and
/// decimal point become a JSON number, everything else a JSON string.
pub fn classify_value(value: &str) -> Value {
    let numeric = value.chars().any(|c| c.is_ascii_digit())
        && value
            .char_indices()
            .all(|(i, c)| c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+')));
    if numeric {
        if let Ok(int) = value.parse::<i64>() {
            return Value::from(int);
        }
        if let Some(number) = value.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(number);
        }
    }
    Value::String(value.to_string())
}

/// Build the invocation for a raw call.
///
/// With a parameter spec that declares properties, only those keys are
/// accepted (in declaration order) and required keys must be present.
/// Without one, every attribute except `name` is accepted in tag order.
pub fn to_tool_invocation(
    raw_call: &RawCall,
    parameters: Option<&ParameterSpec>,
) -> Result<ToolInvocation, ToolCallError> {
    let attributes = parse_attributes(&raw_call.text);
    let lookup = |key: &str| {
        attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    let name = lookup(NAME_ATTRIBUTE)
        .filter(|n| !n.is_empty())
        .ok_or(ToolCallError::MissingName)?
        .to_string();

    let mut arguments = Map::new();
    match parameters.filter(|p| !p.properties.is_empty()) {
        Some(spec) => {
            for key in spec.properties.iter().filter(|k| *k != NAME_ATTRIBUTE) {
                if let Some(value) = lookup(key) {
                    arguments.insert(key.clone(), classify_value(value));
                }
            }
        }
        None => {
            for (key, value) in attributes.iter().filter(|(k, _)| k != NAME_ATTRIBUTE) {
                if !arguments.contains_key(key) {
                    arguments.insert(key.clone(), classify_value(value));
                }
            }
        }
    }

    if let Some(spec) = parameters {
        if let Some(missing) = spec.required.iter().find(|k| !arguments.contains_key(*k)) {
            return Err(ToolCallError::MissingAttribute {
                tool: name,
                attribute: missing.clone(),
            });
        }
    }

    Ok(ToolInvocation {
        name,
        arguments: Value::Object(arguments),
    })
}

/// Resolve a raw call against the registry: the tool must exist and the
/// attributes must satisfy its parameters.
pub fn resolve_call(
    raw_call: &RawCall,
    registry: &ToolRegistry,
) -> Result<ToolInvocation, ToolCallError> {
    let name = parse_attribute(&raw_call.text, NAME_ATTRIBUTE)
        .filter(|n| !n.is_empty())
        .ok_or(ToolCallError::MissingName)?;
    let tool = registry
        .find(&name)
        .ok_or(ToolCallError::UnknownTool(name))?;
    to_tool_invocation(raw_call, Some(tool.parameters()))
}

/// Run the invoked tool.
pub fn execute_call(
    invocation: &ToolInvocation,
    registry: &ToolRegistry,
) -> Result<String, ToolCallError> {
    let tool = registry
        .find(&invocation.name)
        .ok_or_else(|| ToolCallError::UnknownTool(invocation.name.clone()))?;
    tool.execute(&invocation.arguments_json())
        .map_err(|message| ToolCallError::Execution {
            tool: invocation.name.clone(),
            message,
        })
}
