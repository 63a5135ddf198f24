#![deny(unsafe_code)]

//! Configuration loading and validation for the Governor.
//!
//! Loads TOML configuration files and validates them. [`AppConfig`] is the
//! central configuration structure; every section falls back to defaults so
//! an empty file is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model location.
    #[serde(default)]
    pub model: ModelConfig,

    /// Reasoning-loop limits.
    #[serde(default)]
    pub governor: GovernorConfig,

    /// Per-iteration token generation limits.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Tool registry limits and system prompt preamble.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Chat-formatting markers of the loaded model family.
    #[serde(default)]
    pub template: ChatTemplateConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the model lives.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path handed to the inference engine's `load_model`.
    #[serde(default)]
    pub path: Option<String>,
}

/// Limits of the reasoning loop. Immutable for a governor's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Advisory confidence threshold in `[0.0, 1.0]`. Not used in scoring.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Maximum generate → extract → execute cycles per query.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum tool calls extracted from a single iteration's output.
    #[serde(default = "default_max_tool_calls_per_iteration")]
    pub max_tool_calls_per_iteration: usize,

    /// Wall-clock limit per query, checked at iteration boundaries (0 = none).
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_iterations: default_max_iterations(),
            max_tool_calls_per_iteration: default_max_tool_calls_per_iteration(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_confidence_threshold() -> f32 {
    0.7
}

fn default_max_iterations() -> u32 {
    5
}

fn default_max_tool_calls_per_iteration() -> usize {
    4
}

fn default_timeout_seconds() -> u64 {
    120
}

/// Token generation limits applied inside one iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard safety cap on tokens sampled in a single iteration.
    #[serde(default = "default_max_tokens_per_iteration")]
    pub max_tokens_per_iteration: usize,

    /// Tokens still allowed once an opening tool-call marker was seen.
    #[serde(default = "default_post_tool_call_token_budget")]
    pub post_tool_call_token_budget: usize,

    /// Size of the engine's context window in tokens.
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_iteration: default_max_tokens_per_iteration(),
            post_tool_call_token_budget: default_post_tool_call_token_budget(),
            context_window_tokens: default_context_window_tokens(),
        }
    }
}

fn default_max_tokens_per_iteration() -> usize {
    512
}

fn default_post_tool_call_token_budget() -> usize {
    64
}

fn default_context_window_tokens() -> usize {
    4096
}

/// Tool registry configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of registered tools.
    #[serde(default = "default_registry_capacity")]
    pub capacity: usize,

    /// Upper bound on the rendered tool section of the system prompt.
    #[serde(default = "default_max_prompt_bytes")]
    pub max_prompt_bytes: usize,

    /// Instructions placed before the tool list in the system prompt.
    #[serde(default = "default_preamble")]
    pub preamble: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            capacity: default_registry_capacity(),
            max_prompt_bytes: default_max_prompt_bytes(),
            preamble: default_preamble(),
        }
    }
}

fn default_registry_capacity() -> usize {
    16
}

fn default_max_prompt_bytes() -> usize {
    8192
}

fn default_preamble() -> String {
    "You are a helpful assistant running fully offline. Answer briefly.\n\
     You may call a tool by writing exactly one self-closing tag per call:\n\
     <tool_call name=\"TOOL_NAME\" parameter=\"value\" />\n\
     After a tool call, stop and wait for the <tool_result>. \
     If no tool is needed, answer directly."
        .to_string()
}

/// Chat-formatting markers of the loaded model family.
///
/// Defaults follow the ChatML convention. The tool-result wrappers are
/// tokenized once at model load and reused for every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTemplateConfig {
    #[serde(default = "default_system_prefix")]
    pub system_prefix: String,
    #[serde(default = "default_turn_suffix")]
    pub system_suffix: String,
    #[serde(default = "default_user_prefix")]
    pub user_prefix: String,
    #[serde(default = "default_turn_suffix")]
    pub user_suffix: String,
    #[serde(default = "default_assistant_prefix")]
    pub assistant_prefix: String,

    /// Opens a successful tool result block.
    #[serde(default = "default_tool_result_open")]
    pub tool_result_open: String,
    /// Closes a successful tool result block and reopens the assistant turn.
    #[serde(default = "default_tool_result_close")]
    pub tool_result_close: String,
    /// Opens a tool error block.
    #[serde(default = "default_tool_error_open")]
    pub tool_error_open: String,
    /// Closes a tool error block and reopens the assistant turn.
    #[serde(default = "default_tool_error_close")]
    pub tool_error_close: String,

    /// Markers that mean the model started hallucinating a new turn.
    #[serde(default = "default_turn_markers")]
    pub turn_markers: Vec<String>,

    /// Control fragments never shown to the user.
    #[serde(default = "default_stop_fragments")]
    pub stop_fragments: Vec<String>,
}

impl Default for ChatTemplateConfig {
    fn default() -> Self {
        Self {
            system_prefix: default_system_prefix(),
            system_suffix: default_turn_suffix(),
            user_prefix: default_user_prefix(),
            user_suffix: default_turn_suffix(),
            assistant_prefix: default_assistant_prefix(),
            tool_result_open: default_tool_result_open(),
            tool_result_close: default_tool_result_close(),
            tool_error_open: default_tool_error_open(),
            tool_error_close: default_tool_error_close(),
            turn_markers: default_turn_markers(),
            stop_fragments: default_stop_fragments(),
        }
    }
}

fn default_system_prefix() -> String {
    "<|im_start|>system\n".to_string()
}

fn default_user_prefix() -> String {
    "<|im_start|>user\n".to_string()
}

fn default_assistant_prefix() -> String {
    "<|im_start|>assistant\n".to_string()
}

fn default_turn_suffix() -> String {
    "<|im_end|>\n".to_string()
}

fn default_tool_result_open() -> String {
    "<|im_end|>\n<|im_start|>user\n<tool_result>".to_string()
}

fn default_tool_result_close() -> String {
    "</tool_result><|im_end|>\n<|im_start|>assistant\n".to_string()
}

fn default_tool_error_open() -> String {
    "<|im_end|>\n<|im_start|>user\n<tool_error>".to_string()
}

fn default_tool_error_close() -> String {
    "</tool_error><|im_end|>\n<|im_start|>assistant\n".to_string()
}

fn default_turn_markers() -> Vec<String> {
    vec!["<|im_start|>".to_string(), "<|im_end|>".to_string()]
}

fn default_stop_fragments() -> Vec<String> {
    vec![
        "<|im_start|>".to_string(),
        "<|im_end|>".to_string(),
        "<|endoftext|>".to_string(),
    ]
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        tracing::debug!(path = %path.display(), bytes = content.len(), "Loaded config file");
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let governor = &self.governor;
        if !(0.0..=1.0).contains(&governor.confidence_threshold) {
            return Err(ConfigError::Validation(format!(
                "governor.confidence_threshold must be in [0.0, 1.0], got {}",
                governor.confidence_threshold
            )));
        }
        if governor.max_iterations == 0 {
            return Err(ConfigError::Validation(
                "governor.max_iterations must be at least 1".to_string(),
            ));
        }

        let generation = &self.generation;
        if generation.max_tokens_per_iteration == 0 {
            return Err(ConfigError::Validation(
                "generation.max_tokens_per_iteration must be non-zero".to_string(),
            ));
        }
        if generation.post_tool_call_token_budget == 0 {
            return Err(ConfigError::Validation(
                "generation.post_tool_call_token_budget must be non-zero".to_string(),
            ));
        }
        if generation.context_window_tokens == 0 {
            return Err(ConfigError::Validation(
                "generation.context_window_tokens must be non-zero".to_string(),
            ));
        }

        if self.registry.capacity == 0 || self.registry.capacity > 256 {
            return Err(ConfigError::Validation(format!(
                "registry.capacity must be in 1..=256, got {}",
                self.registry.capacity
            )));
        }
        if self.registry.max_prompt_bytes == 0 {
            return Err(ConfigError::Validation(
                "registry.max_prompt_bytes must be non-zero".to_string(),
            ));
        }

        let template = &self.template;
        let wrappers = [
            ("tool_result_open", &template.tool_result_open),
            ("tool_result_close", &template.tool_result_close),
            ("tool_error_open", &template.tool_error_open),
            ("tool_error_close", &template.tool_error_close),
            ("assistant_prefix", &template.assistant_prefix),
        ];
        for (field, value) in wrappers {
            if value.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "template.{field} must not be empty"
                )));
            }
        }
        for (i, marker) in template.turn_markers.iter().enumerate() {
            if marker.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "template.turn_markers[{i}] must not be empty"
                )));
            }
        }
        for (i, fragment) in template.stop_fragments.iter().enumerate() {
            if fragment.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "template.stop_fragments[{i}] must not be empty"
                )));
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}
