//! Governor — the bounded reasoning loop.
//!
//! One `execute` call runs one session:
//!
//! ```text
//!  reset to system prompt ─▶ append user turn
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//!   generate (stream filter, early stops) ─▶ extract calls
//!        │ no calls                         │ calls
//!        ▼                                  ▼
//!     Success                 run tools, append results ┘
//! ```
//!
//! The loop ends with `Timeout` once `max_iterations` is used up or the
//! wall-clock limit passes at an iteration boundary. Engine and context
//! failures end it with `Error`; tool failures are shown to the model and
//! the loop goes on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor_config::{AppConfig, ConfigError};
use tracing::{debug, error, info, trace, warn};

use crate::context::{ContextTracker, ExecutionSession, TrackerError};
use crate::engine::{EngineError, InferenceEngine, Position, TokenId};
use crate::protocol::{self, CALL_OPEN, NAME_ATTRIBUTE, RawCall, ToolCallError, ToolInvocation};
use crate::stream_filter::StreamFilter;
use crate::template::ChatTemplate;
use crate::tools::{RegistryError, ToolRegistry};

/// Final status of one `execute` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernorStatus {
    /// The model produced an answer without calling a tool.
    Success(String),
    /// A fatal engine or context failure.
    Error(String),
    /// Iteration or wall-clock limit reached.
    Timeout(String),
}

impl GovernorStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The answer, error message or timeout reason.
    pub fn message(&self) -> &str {
        match self {
            Self::Success(s) | Self::Error(s) | Self::Timeout(s) => s,
        }
    }
}

/// Counters describing how a session went.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfidenceMetrics {
    /// Iterations started.
    pub iteration_count: u32,
    /// Tool calls attempted, failed ones included.
    pub tool_calls_made: u32,
}

/// Result of [`Governor::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: GovernorStatus,
    /// `None` when no model was loaded.
    pub metrics: Option<ConfidenceMetrics>,
}

/// Why token generation stopped within an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfGeneration,
    ToolCallComplete,
    TurnMarker,
    ToolCallBudget,
    SafetyCap,
}

/// Progress notifications delivered to [`ExecuteHooks::with_progress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernorEvent {
    IterationStarted {
        iteration: u32,
    },
    GenerationFinished {
        iteration: u32,
        tokens: usize,
        stop: StopReason,
    },
    ToolCallStarted {
        name: String,
    },
    ToolCallFinished {
        name: String,
        success: bool,
    },
}

/// Caller callbacks for one `execute` call. All are optional.
///
/// Without a confirmation callback, tools that require confirmation are
/// declined.
#[derive(Default)]
pub struct ExecuteHooks<'a> {
    progress: Option<Box<dyn FnMut(&GovernorEvent) + 'a>>,
    tokens: Option<Box<dyn FnMut(&str) + 'a>>,
    confirm: Option<Box<dyn FnMut(&ToolInvocation) -> bool + 'a>>,
}

impl<'a> ExecuteHooks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive loop progress events.
    pub fn with_progress(mut self, f: impl FnMut(&GovernorEvent) + 'a) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Receive filtered output text as it is generated.
    pub fn with_tokens(mut self, f: impl FnMut(&str) + 'a) -> Self {
        self.tokens = Some(Box::new(f));
        self
    }

    /// Approve or decline tools flagged `requires_confirmation`.
    pub fn with_confirmation(mut self, f: impl FnMut(&ToolInvocation) -> bool + 'a) -> Self {
        self.confirm = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for ExecuteHooks<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteHooks")
            .field("progress", &self.progress.is_some())
            .field("tokens", &self.tokens.is_some())
            .field("confirm", &self.confirm.is_some())
            .finish()
    }
}

/// Errors from construction and model loading.
#[derive(Debug, thiserror::Error)]
pub enum GovernorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no model loaded")]
    NotLoaded,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// State built at model load and reused by every session.
#[derive(Debug)]
struct LoadedModel {
    tracker: ContextTracker,
    result_open: Vec<TokenId>,
    result_close: Vec<TokenId>,
    path: PathBuf,
}

/// Drives an inference engine through the tool-calling loop.
///
/// Owns its engine; `execute` takes `&mut self`, so a governor runs one
/// session at a time. The registry may be shared between governors.
pub struct Governor<E: InferenceEngine> {
    config: AppConfig,
    registry: Arc<ToolRegistry>,
    template: ChatTemplate,
    engine: E,
    loaded: Option<LoadedModel>,
}

impl<E: InferenceEngine> Governor<E> {
    /// Validate `config` and wrap `engine`. No model is loaded yet.
    ///
    /// The registry is built by the caller, usually with
    /// [`ToolRegistry::from_config`] over `config.registry`; the governor only
    /// reads it.
    pub fn new(
        config: AppConfig,
        registry: Arc<ToolRegistry>,
        engine: E,
    ) -> Result<Self, GovernorError> {
        config.validate()?;
        let template = ChatTemplate::new(config.template.clone());
        Ok(Self {
            config,
            registry,
            template,
            engine,
            loaded: None,
        })
    }

    /// Load the model, decode the system prompt and tokenize the tool-result
    /// wrappers. Replaces a previously loaded model.
    pub fn load_model(&mut self, path: &Path) -> Result<(), GovernorError> {
        if self.loaded.is_some() {
            self.cleanup();
        }
        self.engine.load_model(path)?;
        match self.prepare(path) {
            Ok(loaded) => {
                info!(
                    engine = self.engine.name(),
                    path = %path.display(),
                    tools = self.registry.len(),
                    system_prompt_tokens = loaded.tracker.system_prompt_tokens(),
                    "Model loaded"
                );
                self.loaded = Some(loaded);
                Ok(())
            }
            Err(e) => {
                self.engine.unload();
                Err(e)
            }
        }
    }

    fn prepare(&mut self, path: &Path) -> Result<LoadedModel, GovernorError> {
        let system_prompt = self.render_system_prompt()?;
        let tracker = ContextTracker::prime(
            &mut self.engine,
            &system_prompt,
            self.config.generation.context_window_tokens,
        )?;
        let template = self.template.config();
        let result_open = self.engine.tokenize(&template.tool_result_open, false)?;
        let result_close = self.engine.tokenize(&template.tool_result_close, false)?;
        Ok(LoadedModel {
            tracker,
            result_open,
            result_close,
            path: path.to_path_buf(),
        })
    }

    /// Run one query to completion.
    pub fn execute(&mut self, query: &str, hooks: ExecuteHooks<'_>) -> ExecutionOutcome {
        let Some(loaded) = self.loaded.as_ref() else {
            warn!("Execute called without a loaded model");
            return ExecutionOutcome {
                status: GovernorStatus::Error(GovernorError::NotLoaded.to_string()),
                metrics: None,
            };
        };

        let started = Instant::now();
        let mut runner = SessionRunner {
            config: &self.config,
            registry: &self.registry,
            template: &self.template,
            engine: &mut self.engine,
            loaded,
            hooks,
            metrics: ConfidenceMetrics::default(),
        };
        let status = match runner.run(query) {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "Session failed");
                GovernorStatus::Error(e.to_string())
            }
        };
        let metrics = runner.metrics;

        info!(
            success = status.is_success(),
            iterations = metrics.iteration_count,
            tool_calls = metrics.tool_calls_made,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Session finished"
        );
        ExecutionOutcome {
            status,
            metrics: Some(metrics),
        }
    }

    /// Clear the engine cache and unload the model. Safe to call twice.
    pub fn cleanup(&mut self) {
        let Some(loaded) = self.loaded.take() else {
            return;
        };
        if let Err(e) = self.engine.trim_cache(0) {
            warn!(error = %e, "Failed to clear engine cache");
        }
        self.engine.unload();
        info!(path = %loaded.path.display(), "Model unloaded");
    }

    /// The full system turn decoded at model load.
    pub fn render_system_prompt(&self) -> Result<String, RegistryError> {
        let body = self.registry.build_system_prompt()?;
        Ok(self.template.render_system(&body))
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Cached system prompt length, once a model is loaded.
    pub fn system_prompt_tokens(&self) -> Option<Position> {
        self.loaded
            .as_ref()
            .map(|l| l.tracker.system_prompt_tokens())
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.loaded.as_ref().map(|l| l.path.as_path())
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }
}

impl<E: InferenceEngine> Drop for Governor<E> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Text produced by one iteration.
struct Generation {
    text: String,
    tokens: usize,
    stop: StopReason,
}

/// Borrows what a single session needs from the governor.
struct SessionRunner<'a, 'h, E> {
    config: &'a AppConfig,
    registry: &'a ToolRegistry,
    template: &'a ChatTemplate,
    engine: &'a mut E,
    loaded: &'a LoadedModel,
    hooks: ExecuteHooks<'h>,
    metrics: ConfidenceMetrics,
}

impl<E: InferenceEngine> SessionRunner<'_, '_, E> {
    fn run(&mut self, query: &str) -> Result<GovernorStatus, GovernorError> {
        let timeout = self.config.governor.timeout_seconds;
        let deadline = (timeout > 0).then(|| Instant::now() + Duration::from_secs(timeout));
        let tracker = self.loaded.tracker;

        let mut session = tracker.reset_to_system_prompt(&mut *self.engine)?;
        let user_turn = self.template.render_user_turn(query);
        tracker.append_and_decode(&mut *self.engine, &mut session, &user_turn)?;

        let max_iterations = self.config.governor.max_iterations;
        for iteration in 1..=max_iterations {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(iteration, timeout_seconds = timeout, "Session timed out");
                return Ok(GovernorStatus::Timeout(format!(
                    "timed out after {timeout}s"
                )));
            }
            self.metrics.iteration_count = iteration;
            self.emit(GovernorEvent::IterationStarted { iteration });

            let generation = self.generate(&tracker, &mut session)?;
            debug!(
                iteration,
                tokens = generation.tokens,
                stop = ?generation.stop,
                position = session.current_position(),
                "Generation finished"
            );
            self.emit(GovernorEvent::GenerationFinished {
                iteration,
                tokens: generation.tokens,
                stop: generation.stop,
            });

            let calls = protocol::extract_calls(
                &generation.text,
                self.config.governor.max_tool_calls_per_iteration,
            );
            if calls.is_empty() {
                let answer = self.template.clean_answer(&generation.text);
                return Ok(GovernorStatus::Success(answer));
            }
            for call in &calls {
                self.dispatch(&tracker, &mut session, call)?;
            }
        }

        Ok(GovernorStatus::Timeout(format!(
            "no final answer after {max_iterations} iterations"
        )))
    }

    fn generate(
        &mut self,
        tracker: &ContextTracker,
        session: &mut ExecutionSession,
    ) -> Result<Generation, GovernorError> {
        let max_tokens = self.config.generation.max_tokens_per_iteration;
        let post_call_budget = self.config.generation.post_tool_call_token_budget;
        let start_position = session.current_position();
        let start_len = session.conversation().len();
        let mut filter = StreamFilter::new(self.template.suppressed_fragments());
        let mut text = String::new();
        // Byte offset in `text` where each generated token starts.
        let mut offsets: Vec<usize> = Vec::new();
        let mut budget_end: Option<usize> = None;
        let mut stop = StopReason::SafetyCap;

        while offsets.len() < max_tokens {
            let token = self.engine.sample_next()?;
            if self.engine.is_end_of_generation(token) {
                stop = StopReason::EndOfGeneration;
                break;
            }
            let piece = self.engine.token_to_text(token)?;
            tracker.accept_generated(&mut *self.engine, session, token, &piece)?;
            trace!(token, piece = %piece, "Generated token");

            let piece_start = text.len();
            offsets.push(piece_start);
            text.push_str(&piece);

            // Nothing from a turn marker onwards reaches the stream.
            let marker = self.template.find_turn_marker(&text);
            let visible = match marker {
                Some(marker) => &piece[..marker.saturating_sub(piece_start)],
                None => piece.as_str(),
            };
            for chunk in filter.push(visible) {
                self.emit_text(&chunk);
            }

            if protocol::contains_complete_call(&text) {
                stop = StopReason::ToolCallComplete;
                break;
            }
            if let Some(marker) = marker {
                // Cut back to the start of the token holding the marker,
                // then restore the text before the marker.
                let k = offsets.partition_point(|&offset| offset <= marker) - 1;
                tracker.rollback(
                    &mut *self.engine,
                    session,
                    start_position + k,
                    start_len + offsets[k],
                )?;
                tracker.append_and_decode(&mut *self.engine, session, &text[offsets[k]..marker])?;
                text.truncate(marker);
                debug!(offset = marker, "Turn marker in output, truncated");
                stop = StopReason::TurnMarker;
                break;
            }
            if budget_end.is_none() && text.contains(CALL_OPEN) {
                budget_end = Some(offsets.len() + post_call_budget);
            }
            if budget_end.is_some_and(|end| offsets.len() >= end) {
                stop = StopReason::ToolCallBudget;
                break;
            }
        }

        for chunk in filter.finish() {
            self.emit_text(&chunk);
        }
        Ok(Generation {
            text,
            tokens: offsets.len(),
            stop,
        })
    }

    fn dispatch(
        &mut self,
        tracker: &ContextTracker,
        session: &mut ExecutionSession,
        call: &RawCall,
    ) -> Result<(), GovernorError> {
        let name = protocol::parse_attribute(&call.text, NAME_ATTRIBUTE).unwrap_or_default();
        self.metrics.tool_calls_made += 1;
        self.emit(GovernorEvent::ToolCallStarted { name: name.clone() });

        let result = self.invoke(call);
        let success = result.is_ok();
        match result {
            Ok(output) => {
                debug!(tool = %name, bytes = output.len(), "Tool call succeeded");
                let template = self.template.config();
                tracker.append_precomputed(
                    &mut *self.engine,
                    session,
                    &self.loaded.result_open,
                    &template.tool_result_open,
                )?;
                tracker.append_and_decode(&mut *self.engine, session, &output)?;
                tracker.append_precomputed(
                    &mut *self.engine,
                    session,
                    &self.loaded.result_close,
                    &template.tool_result_close,
                )?;
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                let block = self.template.render_tool_error(&e.to_string());
                tracker.append_and_decode(&mut *self.engine, session, &block)?;
            }
        }

        self.emit(GovernorEvent::ToolCallFinished { name, success });
        Ok(())
    }

    fn invoke(&mut self, call: &RawCall) -> Result<String, ToolCallError> {
        let invocation = protocol::resolve_call(call, self.registry)?;
        let needs_confirmation = self
            .registry
            .find(&invocation.name)
            .is_some_and(|tool| tool.requires_confirmation);
        if needs_confirmation {
            let approved = self
                .hooks
                .confirm
                .as_mut()
                .is_some_and(|confirm| confirm(&invocation));
            if !approved {
                return Err(ToolCallError::Declined(invocation.name));
            }
        }
        protocol::execute_call(&invocation, self.registry)
    }

    fn emit(&mut self, event: GovernorEvent) {
        if let Some(progress) = self.hooks.progress.as_mut() {
            progress(&event);
        }
    }

    fn emit_text(&mut self, chunk: &str) {
        if let Some(tokens) = self.hooks.tokens.as_mut() {
            tokens(chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReplayEngine, ReplayTurn};
    use crate::tools::ToolDefinition;
    use pretty_assertions::assert_eq;

    fn governor(turns: Vec<ReplayTurn>) -> Governor<ReplayEngine> {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new(
                "clock",
                "Current time.",
                "",
                |_args: &str| -> Result<String, String> { Ok("12:00".to_string()) },
            ))
            .unwrap();
        Governor::new(
            AppConfig::default(),
            Arc::new(registry),
            ReplayEngine::new(turns),
        )
        .unwrap()
    }

    #[test]
    fn test_execute_without_model() {
        let mut governor = governor(vec![ReplayTurn::from_text("hi")]);
        let outcome = governor.execute("hello", ExecuteHooks::new());
        assert_eq!(
            outcome.status,
            GovernorStatus::Error("no model loaded".to_string())
        );
        assert!(outcome.metrics.is_none());
    }

    #[test]
    fn test_load_primes_system_prompt() {
        let mut governor = governor(vec![]);
        governor.load_model(Path::new("model.gguf")).unwrap();

        let system = governor.render_system_prompt().unwrap();
        assert!(system.contains("- clock: Current time."));
        assert_eq!(governor.engine().cached_text(), system);
        // BOS + one token per character.
        assert_eq!(
            governor.system_prompt_tokens(),
            Some(system.chars().count() + 1)
        );
        assert_eq!(governor.model_path(), Some(Path::new("model.gguf")));
    }

    #[test]
    fn test_cleanup_unloads() {
        let mut governor = governor(vec![]);
        governor.load_model(Path::new("model.gguf")).unwrap();
        governor.cleanup();
        assert!(!governor.is_loaded());
        assert!(!governor.engine().is_loaded());
        assert!(governor.engine().cache().is_empty());
        governor.cleanup();
    }

    #[test]
    fn test_reload_replaces_model() {
        let mut governor = governor(vec![ReplayTurn::from_text("4")]);
        governor.load_model(Path::new("a.gguf")).unwrap();
        governor.load_model(Path::new("b.gguf")).unwrap();
        assert_eq!(governor.model_path(), Some(Path::new("b.gguf")));

        let outcome = governor.execute("2+2?", ExecuteHooks::new());
        assert_eq!(outcome.status, GovernorStatus::Success("4".to_string()));
    }

    #[test]
    fn test_prompt_too_large_fails_load() {
        let mut config = AppConfig::default();
        config.registry.max_prompt_bytes = 16;
        let registry = ToolRegistry::from_config(&config.registry);
        let mut governor =
            Governor::new(config, Arc::new(registry), ReplayEngine::new(vec![])).unwrap();

        let err = governor.load_model(Path::new("m")).unwrap_err();
        assert!(matches!(
            err,
            GovernorError::Registry(RegistryError::PromptTooLarge { .. })
        ));
        assert!(!governor.is_loaded());
        assert!(!governor.engine().is_loaded());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AppConfig::default();
        config.governor.max_iterations = 0;
        let err = Governor::new(config, Arc::new(ToolRegistry::new()), ReplayEngine::new(vec![]))
            .err()
            .unwrap();
        assert!(matches!(err, GovernorError::Config(ConfigError::Validation(_))));
        assert!(err.to_string().contains("max_iterations"));
    }

    #[test]
    fn test_status_message() {
        assert_eq!(GovernorStatus::Timeout("late".to_string()).message(), "late");
        assert!(!GovernorStatus::Error("x".to_string()).is_success());
    }
}
