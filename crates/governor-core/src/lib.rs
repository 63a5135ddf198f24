#![deny(unsafe_code)]

//! Governor core — a bounded, offline tool-calling loop over a local
//! inference engine.
//!
//! The governor submits a query, lets the model call registered tools
//! through a self-closing tag protocol, feeds the results back into the
//! engine's context and repeats until the model answers or a limit is hit.
//! Protocol syntax is filtered out of the text streamed to the caller.

/// Conversation text to engine position mapping.
pub mod context;
/// Inference engine trait and the scripted replay engine.
pub mod engine;
/// The execution loop.
pub mod governor;
/// Tool-call tag parsing and dispatch.
pub mod protocol;
/// Live output filtering.
pub mod stream_filter;
/// Chat formatting for the loaded model family.
pub mod template;
/// Tool trait and registry.
pub mod tools;

pub use context::{ContextTracker, ExecutionSession, TrackerError};
pub use engine::{EngineError, InferenceEngine, ReplayEngine, ReplayScript, ReplayTurn};
pub use governor::{
    ConfidenceMetrics, ExecuteHooks, ExecutionOutcome, Governor, GovernorError, GovernorEvent,
    GovernorStatus, StopReason,
};
pub use protocol::{RawCall, ToolCallError, ToolInvocation};
pub use stream_filter::{FilterState, StreamFilter};
pub use template::ChatTemplate;
pub use tools::{RegistryError, Tool, ToolDefinition, ToolRegistry};
