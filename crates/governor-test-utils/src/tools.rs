//! Tool fixtures.
//!
//! [`recording_tool`] returns a canned response and logs every argument
//! string it receives; [`failing_tool`] always errors.

use std::sync::{Arc, Mutex};

use governor_core::tools::{Tool, ToolDefinition, ToolRegistry};

/// Shared log of the argument strings a [`RecordingTool`] received.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    /// Arguments of every call so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.0.lock().expect("call log poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("call log poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A tool that answers with a fixed response and records its arguments.
#[derive(Debug)]
pub struct RecordingTool {
    log: CallLog,
    response: String,
}

impl Tool for RecordingTool {
    fn execute(&self, args: &str) -> Result<String, String> {
        self.log
            .0
            .lock()
            .expect("call log poisoned")
            .push(args.to_string());
        Ok(self.response.clone())
    }
}

/// A recording tool definition together with its call log.
pub fn recording_tool(name: &str, schema: &str, response: &str) -> (ToolDefinition, CallLog) {
    let log = CallLog::default();
    let tool = RecordingTool {
        log: log.clone(),
        response: response.to_string(),
    };
    let definition = ToolDefinition::new(name, format!("Test tool {name}."), schema, tool);
    (definition, log)
}

/// A tool whose every call fails with `message`.
pub fn failing_tool(name: &str, message: &str) -> ToolDefinition {
    let message = message.to_string();
    ToolDefinition::new(
        name,
        format!("Always fails: {message}."),
        "",
        move |_args: &str| -> Result<String, String> { Err(message.clone()) },
    )
}

/// Registry holding `definitions`, in order.
pub fn registry_with(definitions: Vec<ToolDefinition>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for definition in definitions {
        registry
            .register(definition)
            .expect("failed to register test tool");
    }
    Arc::new(registry)
}

/// Render a tool-call tag the way a model would write it.
pub fn tool_call_tag(name: &str, attributes: &[(&str, &str)]) -> String {
    let mut tag = format!("<tool_call name=\"{name}\"");
    for (key, value) in attributes {
        tag.push_str(&format!(" {key}=\"{value}\""));
    }
    tag.push_str(" />");
    tag
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_tool_logs_arguments() {
        let (definition, log) = recording_tool("probe", "", "ok");
        assert_eq!(definition.execute(r#"{"a":1}"#).unwrap(), "ok");
        assert_eq!(log.calls(), vec![r#"{"a":1}"#.to_string()]);
    }

    #[test]
    fn test_tool_call_tag() {
        assert_eq!(
            tool_call_tag("timer", &[("minutes", "5")]),
            r#"<tool_call name="timer" minutes="5" />"#
        );
    }
}
