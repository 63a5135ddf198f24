//! Chat formatting for the loaded model family.
//!
//! Wraps [`ChatTemplateConfig`] with the rendering and marker-search helpers
//! the execution loop needs.

use governor_config::ChatTemplateConfig;

use crate::protocol;

/// Renders turns and locates control markers for one model family.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    config: ChatTemplateConfig,
}

impl ChatTemplate {
    pub fn new(config: ChatTemplateConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChatTemplateConfig {
        &self.config
    }

    /// The full system turn around the registry's tool section.
    pub fn render_system(&self, body: &str) -> String {
        format!(
            "{}{}{}",
            self.config.system_prefix, body, self.config.system_suffix
        )
    }

    /// The user turn followed by the opening of the assistant turn.
    pub fn render_user_turn(&self, query: &str) -> String {
        format!(
            "{}{}{}{}",
            self.config.user_prefix, query, self.config.user_suffix, self.config.assistant_prefix
        )
    }

    /// A complete tool-error block, tokenized like ordinary text.
    pub fn render_tool_error(&self, message: &str) -> String {
        format!(
            "{}{}{}",
            self.config.tool_error_open, message, self.config.tool_error_close
        )
    }

    /// Byte offset of the earliest turn marker in `text`.
    pub fn find_turn_marker(&self, text: &str) -> Option<usize> {
        self.config
            .turn_markers
            .iter()
            .filter_map(|marker| text.find(marker.as_str()))
            .min()
    }

    /// Fragments the stream filter must never show: stop fragments plus
    /// turn markers.
    pub fn suppressed_fragments(&self) -> Vec<String> {
        let mut fragments = self.config.stop_fragments.clone();
        for marker in &self.config.turn_markers {
            if !fragments.contains(marker) {
                fragments.push(marker.clone());
            }
        }
        fragments
    }

    /// Remove every suppressed fragment from `text`.
    pub fn strip_fragments(&self, text: &str) -> String {
        let mut out = text.to_string();
        for fragment in self.suppressed_fragments() {
            if out.contains(&fragment) {
                out = out.replace(&fragment, "");
            }
        }
        out
    }

    /// The user-facing answer: no tool tags, no control fragments, trimmed.
    ///
    /// An unterminated tag cuts the answer off where it starts.
    pub fn clean_answer(&self, text: &str) -> String {
        let mut answer = self.strip_fragments(&protocol::strip_calls(text));
        if let Some(start) = answer.find(protocol::CALL_OPEN) {
            answer.truncate(start);
        }
        answer.trim().to_string()
    }
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self::new(ChatTemplateConfig::default())
    }
}
