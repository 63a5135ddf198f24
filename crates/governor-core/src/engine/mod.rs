//! Inference engine boundary — the narrow contract the governor drives.
//!
//! The engine is an opaque service: it owns the model weights, the
//! tokenizer, the sampler and an append-only context cache indexed by token
//! position. The governor never looks inside; it only tokenizes, appends
//! tokens at explicit positions, samples, detokenizes and trims.
//!
//! ```text
//! ┌──────────┐  tokenize / decode_append   ┌──────────────────┐
//! │ Governor │ ──────────────────────────▶ │ InferenceEngine  │  (trait)
//! └──────────┘ ◀────────────────────────── └────────┬─────────┘
//!                sample_next / token_to_text        │
//!                                          ┌────────┴────────┐
//!                                          ▼                 ▼
//!                                   ┌────────────┐   ┌──────────────┐
//!                                   │  Replay    │   │ native model │
//!                                   │ (scripted) │   │  (external)  │
//!                                   └────────────┘   └──────────────┘
//! ```

pub mod replay;

use std::path::Path;

pub use replay::{ReplayEngine, ReplayScript, ReplayStats, ReplayTurn, ScriptedTool};

/// Identifier of a vocabulary entry.
pub type TokenId = u32;

/// Index into the engine's context cache.
pub type Position = usize;

/// Identifier of a cache sequence. The governor only ever uses [`MAIN_SEQUENCE`].
pub type SequenceId = u32;

/// The sequence every governor session decodes into.
pub const MAIN_SEQUENCE: SequenceId = 0;

/// Errors reported by an inference engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Load(String),

    #[error("no model loaded")]
    NotLoaded,

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("sampling failed: {0}")]
    Sample(String),

    #[error("unknown token id {0}")]
    UnknownToken(TokenId),

    #[error("cache trim failed: {0}")]
    Trim(String),
}

/// Core trait for inference engines.
///
/// All calls are blocking. An engine instance holds exactly one context
/// cache, so it must never be shared between concurrent sessions.
pub trait InferenceEngine: Send {
    /// Engine display name (used in logs).
    fn name(&self) -> &str;

    /// Load model weights from `path`, replacing any previously loaded model.
    fn load_model(&mut self, path: &Path) -> Result<(), EngineError>;

    /// Convert text to token ids. `add_special` prepends the model's
    /// beginning-of-sequence token when it has one.
    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, EngineError>;

    /// Append `tokens` to the cache. `positions` has one entry per token.
    fn decode_append(
        &mut self,
        tokens: &[TokenId],
        positions: &[Position],
        sequence: SequenceId,
    ) -> Result<(), EngineError>;

    /// Sample the next token given everything decoded so far.
    fn sample_next(&mut self) -> Result<TokenId, EngineError>;

    /// Text piece of a single token.
    fn token_to_text(&self, token: TokenId) -> Result<String, EngineError>;

    /// Whether `token` marks the end of generation.
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Discard all cached state at or after `from_position`.
    fn trim_cache(&mut self, from_position: Position) -> Result<(), EngineError>;

    /// Release the loaded model. The default does nothing.
    fn unload(&mut self) {}
}
