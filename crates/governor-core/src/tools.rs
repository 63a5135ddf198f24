//! Tool registry — callable capabilities the model can invoke.
//!
//! Each tool has a name, a description and a JSON Schema for its parameters,
//! all of which are rendered into the system prompt. Registration order is
//! preserved so the prompt text is stable across runs.

use std::collections::HashMap;

use governor_config::RegistryConfig;
use serde_json::Value;

use crate::protocol::{CALL_CLOSE, CALL_OPEN};

/// A capability the model can call through the tool-call protocol.
///
/// Tools receive their arguments as a JSON object string and return a
/// JSON or plain-text result. Any state a tool needs is owned by the tool
/// value itself. Closures with the matching signature are tools too.
pub trait Tool: Send + Sync {
    /// Execute the tool with JSON-encoded arguments.
    fn execute(&self, args: &str) -> Result<String, String>;
}

impl<F> Tool for F
where
    F: Fn(&str) -> Result<String, String> + Send + Sync,
{
    fn execute(&self, args: &str) -> Result<String, String> {
        self(args)
    }
}

/// Errors from tool registration and prompt rendering.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool already registered: {0}")]
    Duplicate(String),

    #[error("tool registry is full (capacity {capacity})")]
    CapacityExceeded { capacity: usize },

    #[error("invalid tool name {0:?}: use letters, digits, '_' or '-'")]
    InvalidName(String),

    #[error("invalid parameter schema for tool '{name}': {reason}")]
    InvalidSchema { name: String, reason: String },

    #[error("system prompt is {size} bytes, limit is {limit} (raise registry.max_prompt_bytes)")]
    PromptTooLarge { size: usize, limit: usize },
}

/// Parameter names extracted from a tool's JSON Schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSpec {
    /// Keys of `properties`, in declaration order.
    pub properties: Vec<String>,
    /// Keys listed in `required`.
    pub required: Vec<String>,
}

impl ParameterSpec {
    /// Parse the `properties`/`required` keys from a JSON Schema string.
    ///
    /// An empty schema declares no parameters.
    pub fn from_schema(schema: &str) -> Result<Self, String> {
        if schema.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(schema).map_err(|e| e.to_string())?;
        let Value::Object(object) = value else {
            return Err("schema must be a JSON object".to_string());
        };

        let properties = match object.get("properties") {
            Some(Value::Object(props)) => props.keys().cloned().collect(),
            Some(_) => return Err("\"properties\" must be an object".to_string()),
            None => Vec::new(),
        };
        let required = match object.get("required") {
            Some(Value::Array(keys)) => keys
                .iter()
                .map(|k| {
                    k.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| "\"required\" entries must be strings".to_string())
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err("\"required\" must be an array".to_string()),
            None => Vec::new(),
        };

        Ok(Self {
            properties,
            required,
        })
    }
}

/// A tool together with the metadata the governor and prompt need.
pub struct ToolDefinition {
    /// Unique name the model uses in `name="..."`.
    pub name: String,
    /// Human-readable description rendered into the system prompt.
    pub description: String,
    /// JSON Schema of the parameters, kept verbatim.
    pub parameter_schema: String,
    /// Same arguments always give the same result.
    pub is_deterministic: bool,
    /// The caller must approve each invocation.
    pub requires_confirmation: bool,
    /// Invocations have side effects on tool-owned state.
    pub is_stateful: bool,
    /// Rough latency hint in milliseconds.
    pub estimated_latency_ms: u32,
    parameters: ParameterSpec,
    tool: Box<dyn Tool>,
}

impl ToolDefinition {
    /// Create a definition with all flags cleared.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameter_schema: impl Into<String>,
        tool: impl Tool + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameter_schema: parameter_schema.into(),
            is_deterministic: false,
            requires_confirmation: false,
            is_stateful: false,
            estimated_latency_ms: 0,
            parameters: ParameterSpec::default(),
            tool: Box::new(tool),
        }
    }

    pub fn deterministic(mut self, value: bool) -> Self {
        self.is_deterministic = value;
        self
    }

    pub fn requires_confirmation(mut self, value: bool) -> Self {
        self.requires_confirmation = value;
        self
    }

    pub fn stateful(mut self, value: bool) -> Self {
        self.is_stateful = value;
        self
    }

    pub fn estimated_latency_ms(mut self, value: u32) -> Self {
        self.estimated_latency_ms = value;
        self
    }

    /// Parameter keys parsed from the schema at registration.
    pub fn parameters(&self) -> &ParameterSpec {
        &self.parameters
    }

    /// Run the tool.
    pub fn execute(&self, args: &str) -> Result<String, String> {
        self.tool.execute(args)
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("parameter_schema", &self.parameter_schema)
            .field("is_deterministic", &self.is_deterministic)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("is_stateful", &self.is_stateful)
            .field("estimated_latency_ms", &self.estimated_latency_ms)
            .finish_non_exhaustive()
    }
}

/// Registry of available tools, in registration order.
///
/// Read-only once handed to a governor; share it between governors with an
/// `Arc` when the tools themselves tolerate concurrent calls.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
    index: HashMap<String, usize>,
    capacity: usize,
    max_prompt_bytes: usize,
    preamble: String,
}

impl ToolRegistry {
    /// Create an empty registry with default limits.
    pub fn new() -> Self {
        Self::from_config(&RegistryConfig::default())
    }

    /// Create an empty registry with the configured limits and preamble.
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            tools: Vec::new(),
            index: HashMap::new(),
            capacity: config.capacity,
            max_prompt_bytes: config.max_prompt_bytes,
            preamble: config.preamble.clone(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, mut definition: ToolDefinition) -> Result<(), RegistryError> {
        let name = definition.name.clone();
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid_name {
            return Err(RegistryError::InvalidName(name));
        }
        if self.index.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        if self.tools.len() >= self.capacity {
            return Err(RegistryError::CapacityExceeded {
                capacity: self.capacity,
            });
        }

        definition.parameters = ParameterSpec::from_schema(&definition.parameter_schema)
            .map_err(|reason| RegistryError::InvalidSchema {
                name: name.clone(),
                reason,
            })?;

        tracing::debug!(tool = %name, "Registered tool");
        self.index.insert(name, self.tools.len());
        self.tools.push(definition);
        Ok(())
    }

    /// Look up a tool by exact name.
    pub fn find(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Registered tool names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Iterate tools in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolDefinition> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Render the tool section of the system prompt.
    ///
    /// The output depends only on the preamble and the registration sequence.
    pub fn build_system_prompt(&self) -> Result<String, RegistryError> {
        let mut prompt = String::new();
        prompt.push_str(self.preamble.trim_end());
        prompt.push_str("\n\nTool call syntax: ");
        prompt.push_str(CALL_OPEN);
        prompt.push_str(" name=\"TOOL_NAME\" parameter=\"value\" ");
        prompt.push_str(CALL_CLOSE);
        prompt.push_str("\n\nAvailable tools:");

        if self.tools.is_empty() {
            prompt.push_str(" none\n");
        } else {
            prompt.push('\n');
        }
        for tool in &self.tools {
            prompt.push_str("- ");
            prompt.push_str(&tool.name);
            prompt.push_str(": ");
            prompt.push_str(tool.description.trim());
            if tool.requires_confirmation {
                prompt.push_str(" (asks the user for confirmation)");
            }
            prompt.push('\n');
            if !tool.parameter_schema.trim().is_empty() {
                prompt.push_str("  parameters: ");
                prompt.push_str(&compact_schema(&tool.parameter_schema));
                prompt.push('\n');
            }
        }

        if prompt.len() > self.max_prompt_bytes {
            return Err(RegistryError::PromptTooLarge {
                size: prompt.len(),
                limit: self.max_prompt_bytes,
            });
        }
        Ok(prompt)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-line rendering of a schema that was validated at registration.
fn compact_schema(schema: &str) -> String {
    serde_json::from_str::<Value>(schema)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| schema.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const CALC_SCHEMA: &str = r#"{
        "type": "object",
        "properties": {
            "expression": { "type": "string" },
            "precision": { "type": "integer" }
        },
        "required": ["expression"]
    }"#;

    fn echo(args: &str) -> Result<String, String> {
        Ok(args.to_string())
    }

    #[test]
    fn test_empty_registry() {
        let registry = ToolRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.names().is_empty());
        assert!(registry.find("nonexistent").is_none());
    }

    #[test]
    fn test_register_and_find() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("calculator", "Evaluate arithmetic", CALC_SCHEMA, echo)
                    .deterministic(true)
                    .estimated_latency_ms(5),
            )
            .unwrap();

        let tool = registry.find("calculator").unwrap();
        assert!(tool.is_deterministic);
        assert!(!tool.is_stateful);
        assert_eq!(tool.estimated_latency_ms, 5);
        assert_eq!(
            tool.parameters().properties,
            vec!["expression".to_string(), "precision".to_string()]
        );
        assert_eq!(tool.parameters().required, vec!["expression".to_string()]);
        assert_eq!(tool.execute("{}").unwrap(), "{}");
    }

    #[test]
    fn test_lookup_is_exact() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new("timer", "Set a timer", "", echo))
            .unwrap();
        assert!(registry.find("Timer").is_none());
        assert!(registry.find("time").is_none());
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new("timer", "Set a timer", "", echo))
            .unwrap();
        let err = registry
            .register(ToolDefinition::new("timer", "Another timer", "", echo))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(name) if name == "timer"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_capacity_enforced() {
        let config = RegistryConfig {
            capacity: 2,
            ..RegistryConfig::default()
        };
        let mut registry = ToolRegistry::from_config(&config);
        registry
            .register(ToolDefinition::new("a", "A", "", echo))
            .unwrap();
        registry
            .register(ToolDefinition::new("b", "B", "", echo))
            .unwrap();
        let err = registry
            .register(ToolDefinition::new("c", "C", "", echo))
            .unwrap_err();
        assert!(matches!(err, RegistryError::CapacityExceeded { capacity: 2 }));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let mut registry = ToolRegistry::new();
        for name in ["", "has space", "quote\"d"] {
            let err = registry
                .register(ToolDefinition::new(name, "bad", "", echo))
                .unwrap_err();
            assert!(matches!(err, RegistryError::InvalidName(_)));
        }
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let mut registry = ToolRegistry::new();
        let err = registry
            .register(ToolDefinition::new("bad", "Bad schema", "[1, 2]", echo))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));

        let err = registry
            .register(ToolDefinition::new("worse", "Not JSON", "{nope", echo))
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_names_keep_insertion_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry
                .register(ToolDefinition::new(name, "t", "", echo))
                .unwrap();
        }
        assert_eq!(registry.names(), vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_system_prompt_lists_tools_in_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new("timer", "Set a timer.", "", echo))
            .unwrap();
        registry
            .register(
                ToolDefinition::new("calculator", "Evaluate arithmetic.", CALC_SCHEMA, echo)
                    .requires_confirmation(true),
            )
            .unwrap();

        let prompt = registry.build_system_prompt().unwrap();
        let timer = prompt.find("- timer: Set a timer.").unwrap();
        let calc = prompt.find("- calculator: Evaluate arithmetic.").unwrap();
        assert!(timer < calc);
        assert!(prompt.contains("(asks the user for confirmation)"));
        assert!(prompt.contains(r#"parameters: {"type":"object","properties":{"expression""#));
        assert!(prompt.contains("<tool_call name=\"TOOL_NAME\" parameter=\"value\" />"));
    }

    #[test]
    fn test_system_prompt_is_deterministic() {
        let build = || {
            let mut registry = ToolRegistry::new();
            registry
                .register(ToolDefinition::new("calculator", "Math", CALC_SCHEMA, echo))
                .unwrap();
            registry
                .register(ToolDefinition::new("timer", "Timers", "", echo))
                .unwrap();
            registry.build_system_prompt().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_system_prompt_without_tools() {
        let prompt = ToolRegistry::new().build_system_prompt().unwrap();
        assert!(prompt.contains("Available tools: none"));
    }

    #[test]
    fn test_system_prompt_too_large() {
        let config = RegistryConfig {
            max_prompt_bytes: 64,
            ..RegistryConfig::default()
        };
        let mut registry = ToolRegistry::from_config(&config);
        registry
            .register(ToolDefinition::new("timer", "x".repeat(200), "", echo))
            .unwrap();
        let err = registry.build_system_prompt().unwrap_err();
        assert!(matches!(err, RegistryError::PromptTooLarge { limit: 64, .. }));
    }

    #[test]
    fn test_closure_captures_context() {
        let unit = "celsius".to_string();
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new(
                "weather",
                "Current weather",
                "",
                move |_args: &str| -> Result<String, String> {
                    Ok(format!("{{\"temp\": 21, \"unit\": \"{unit}\"}}"))
                },
            ))
            .unwrap();
        let out = registry.find("weather").unwrap().execute("{}").unwrap();
        assert!(out.contains("celsius"));
    }
}
