//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use std::path::{Path, PathBuf};

use governor_config::AppConfig;
use tempfile::TempDir;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_iterations(3)
///     .timeout_seconds(0)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn max_iterations(mut self, n: u32) -> Self {
        self.config.governor.max_iterations = n;
        self
    }

    pub fn max_tool_calls_per_iteration(mut self, n: usize) -> Self {
        self.config.governor.max_tool_calls_per_iteration = n;
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.governor.timeout_seconds = seconds;
        self
    }

    pub fn max_tokens_per_iteration(mut self, n: usize) -> Self {
        self.config.generation.max_tokens_per_iteration = n;
        self
    }

    pub fn post_tool_call_token_budget(mut self, n: usize) -> Self {
        self.config.generation.post_tool_call_token_budget = n;
        self
    }

    pub fn context_window_tokens(mut self, n: usize) -> Self {
        self.config.generation.context_window_tokens = n;
        self
    }

    pub fn registry_capacity(mut self, n: usize) -> Self {
        self.config.registry.capacity = n;
        self
    }

    pub fn preamble(mut self, preamble: &str) -> Self {
        self.config.registry.preamble = preamble.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A file written into a temp directory that lives as long as this value.
pub struct TempFile {
    pub path: PathBuf,
    _dir: TempDir,
}

impl TempFile {
    /// Write `content` to `name` inside a fresh temp directory.
    pub fn with_content(name: &str, content: &str) -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join(name);
        std::fs::write(&path, content).expect("failed to write temp file");
        Self { path, _dir: dir }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
