//! Context tracking — keeps the conversation text and the engine's token
//! positions in lockstep.
//!
//! The engine's cache is append-only and indexed by position:
//!
//! ```text
//!  0                      system_prompt_tokens          current_position
//!  │ cached system prompt │ current session ............ │ free ...  │ limit
//!  └──────────────────────┴──────────────────────────────┴───────────┘
//! ```
//!
//! Everything before `system_prompt_tokens` is decoded once at model load
//! and reused; everything after belongs to the running session and is
//! trimmed before the next one starts. Text is tokenized exactly once, when
//! it first crosses the `processed_len` watermark.

use crate::engine::{EngineError, InferenceEngine, MAIN_SEQUENCE, Position, TokenId};

/// Errors from the context tracker. All of them end the session.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(
        "context window full: {needed} more tokens at position {position} exceed the {limit}-token window"
    )]
    ContextFull {
        position: Position,
        needed: usize,
        limit: usize,
    },

    #[error("invalid rollback to position {position} (session spans {start}..{end})")]
    InvalidRollback {
        position: Position,
        start: Position,
        end: Position,
    },
}

/// Per-query conversation state. Created by
/// [`ContextTracker::reset_to_system_prompt`] and discarded after the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSession {
    conversation: String,
    processed_len: usize,
    current_position: Position,
    system_prompt_tokens: Position,
}

impl ExecutionSession {
    /// Logical text of the session, everything after the system prompt.
    pub fn conversation(&self) -> &str {
        &self.conversation
    }

    /// Prefix length of [`conversation`](Self::conversation) already in the engine.
    pub fn processed_len(&self) -> usize {
        self.processed_len
    }

    /// Next free cache position.
    pub fn current_position(&self) -> Position {
        self.current_position
    }

    /// First position owned by the session.
    pub fn system_prompt_tokens(&self) -> Position {
        self.system_prompt_tokens
    }

    /// Tokens decoded for this session so far.
    pub fn session_tokens(&self) -> usize {
        self.current_position - self.system_prompt_tokens
    }
}

/// Maps session text onto engine positions.
///
/// Built once per loaded model by [`prime`](Self::prime); holds the system
/// prompt boundary and the context window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextTracker {
    system_prompt_tokens: Position,
    context_limit: usize,
}

impl ContextTracker {
    /// Tracker for an engine whose cache already holds `system_prompt_tokens`
    /// tokens of system prompt.
    pub fn new(system_prompt_tokens: Position, context_limit: usize) -> Self {
        Self {
            system_prompt_tokens,
            context_limit,
        }
    }

    /// Clear the engine cache, decode the system prompt at position 0 and
    /// record its length as the session boundary.
    pub fn prime(
        engine: &mut dyn InferenceEngine,
        system_prompt: &str,
        context_limit: usize,
    ) -> Result<Self, TrackerError> {
        engine.trim_cache(0)?;
        let tokens = engine.tokenize(system_prompt, true)?;
        let tracker = Self::new(0, context_limit);
        tracker.decode_at(engine, 0, &tokens)?;
        tracing::debug!(tokens = tokens.len(), "System prompt decoded");
        Ok(Self::new(tokens.len(), context_limit))
    }

    pub fn system_prompt_tokens(&self) -> Position {
        self.system_prompt_tokens
    }

    /// Drop everything a previous session left in the cache and start a
    /// fresh session right after the system prompt.
    pub fn reset_to_system_prompt(
        &self,
        engine: &mut dyn InferenceEngine,
    ) -> Result<ExecutionSession, TrackerError> {
        engine.trim_cache(self.system_prompt_tokens)?;
        Ok(ExecutionSession {
            conversation: String::new(),
            processed_len: 0,
            current_position: self.system_prompt_tokens,
            system_prompt_tokens: self.system_prompt_tokens,
        })
    }

    /// Append `new_text` to the session and decode the unprocessed suffix.
    ///
    /// Returns the number of tokens decoded.
    pub fn append_and_decode(
        &self,
        engine: &mut dyn InferenceEngine,
        session: &mut ExecutionSession,
        new_text: &str,
    ) -> Result<usize, TrackerError> {
        session.conversation.push_str(new_text);
        let pending = &session.conversation[session.processed_len..];
        if pending.is_empty() {
            return Ok(0);
        }

        let tokens = engine.tokenize(pending, false)?;
        self.decode_at(engine, session.current_position, &tokens)?;
        session.current_position += tokens.len();
        session.processed_len = session.conversation.len();
        Ok(tokens.len())
    }

    /// Append tokens that were tokenized ahead of time, together with the
    /// text they stand for.
    pub fn append_precomputed(
        &self,
        engine: &mut dyn InferenceEngine,
        session: &mut ExecutionSession,
        tokens: &[TokenId],
        text: &str,
    ) -> Result<(), TrackerError> {
        debug_assert_eq!(session.processed_len, session.conversation.len());
        self.decode_at(engine, session.current_position, tokens)?;
        session.conversation.push_str(text);
        session.current_position += tokens.len();
        session.processed_len = session.conversation.len();
        Ok(())
    }

    /// Decode a freshly sampled token so the engine can condition on it.
    pub fn accept_generated(
        &self,
        engine: &mut dyn InferenceEngine,
        session: &mut ExecutionSession,
        token: TokenId,
        piece: &str,
    ) -> Result<(), TrackerError> {
        self.append_precomputed(engine, session, &[token], piece)
    }

    /// Cut the session back to an earlier token boundary: the cache is
    /// trimmed at `position` and the text at `conversation_len`.
    pub fn rollback(
        &self,
        engine: &mut dyn InferenceEngine,
        session: &mut ExecutionSession,
        position: Position,
        conversation_len: usize,
    ) -> Result<(), TrackerError> {
        if position < session.system_prompt_tokens
            || position > session.current_position
            || conversation_len > session.conversation.len()
            || !session.conversation.is_char_boundary(conversation_len)
        {
            return Err(TrackerError::InvalidRollback {
                position,
                start: session.system_prompt_tokens,
                end: session.current_position,
            });
        }

        engine.trim_cache(position)?;
        session.current_position = position;
        session.conversation.truncate(conversation_len);
        session.processed_len = conversation_len;
        Ok(())
    }

    fn decode_at(
        &self,
        engine: &mut dyn InferenceEngine,
        start: Position,
        tokens: &[TokenId],
    ) -> Result<(), TrackerError> {
        if tokens.is_empty() {
            return Ok(());
        }
        if start + tokens.len() > self.context_limit {
            return Err(TrackerError::ContextFull {
                position: start,
                needed: tokens.len(),
                limit: self.context_limit,
            });
        }
        let positions: Vec<Position> = (start..start + tokens.len()).collect();
        engine.decode_append(tokens, &positions, MAIN_SEQUENCE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ReplayEngine, ReplayTurn};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn loaded_engine() -> ReplayEngine {
        let mut engine = ReplayEngine::new(vec![ReplayTurn::from_text("ok")]);
        engine.load_model(Path::new("replay")).unwrap();
        engine
    }

    #[test]
    fn test_prime_records_boundary() {
        let mut engine = loaded_engine();
        let tracker = ContextTracker::prime(&mut engine, "sys", 64).unwrap();
        // BOS + one token per character.
        assert_eq!(tracker.system_prompt_tokens(), 4);
        assert_eq!(engine.cache().len(), 4);
        assert_eq!(engine.cached_text(), "sys");
    }

    #[test]
    fn test_positions_advance_by_token_count() {
        let mut engine = loaded_engine();
        let tracker = ContextTracker::prime(&mut engine, "sys", 64).unwrap();
        let mut session = tracker.reset_to_system_prompt(&mut engine).unwrap();
        assert_eq!(session.current_position(), 4);

        let mut expected = session.current_position();
        for chunk in ["hello", " ", "wörld", ""] {
            let decoded = tracker
                .append_and_decode(&mut engine, &mut session, chunk)
                .unwrap();
            assert_eq!(decoded, chunk.chars().count());
            expected += decoded;
            assert_eq!(session.current_position(), expected);
            assert_eq!(session.processed_len(), session.conversation().len());
        }
        assert_eq!(session.session_tokens(), 11);
        assert_eq!(engine.cached_text(), "syshello wörld");
    }

    #[test]
    fn test_processed_text_is_never_retokenized() {
        let mut engine = loaded_engine();
        let tracker = ContextTracker::prime(&mut engine, "sys", 64).unwrap();
        let mut session = tracker.reset_to_system_prompt(&mut engine).unwrap();
        let before = engine.stats();

        tracker
            .append_and_decode(&mut engine, &mut session, "abc")
            .unwrap();
        tracker
            .append_and_decode(&mut engine, &mut session, "de")
            .unwrap();

        let after = engine.stats();
        assert_eq!(after.tokenize_calls - before.tokenize_calls, 2);
        assert_eq!(after.tokenized_bytes - before.tokenized_bytes, 5);
    }

    #[test]
    fn test_precomputed_skips_tokenizer() {
        let mut engine = loaded_engine();
        let tracker = ContextTracker::prime(&mut engine, "", 64).unwrap();
        let wrapper = engine.tokenize("<w>", false).unwrap();
        let mut session = tracker.reset_to_system_prompt(&mut engine).unwrap();
        let calls = engine.stats().tokenize_calls;

        tracker
            .append_precomputed(&mut engine, &mut session, &wrapper, "<w>")
            .unwrap();
        tracker
            .append_precomputed(&mut engine, &mut session, &wrapper, "<w>")
            .unwrap();

        assert_eq!(engine.stats().tokenize_calls, calls);
        assert_eq!(session.conversation(), "<w><w>");
        assert_eq!(session.session_tokens(), 6);
    }

    #[test]
    fn test_reset_discards_previous_session() {
        let mut engine = loaded_engine();
        let tracker = ContextTracker::prime(&mut engine, "sys", 64).unwrap();

        let mut first = tracker.reset_to_system_prompt(&mut engine).unwrap();
        tracker
            .append_and_decode(&mut engine, &mut first, "first query")
            .unwrap();

        let second = tracker.reset_to_system_prompt(&mut engine).unwrap();
        assert_eq!(second.current_position(), tracker.system_prompt_tokens());
        assert!(second.conversation().is_empty());
        assert_eq!(engine.cached_text(), "sys");
    }

    #[test]
    fn test_context_full_is_an_error() {
        let mut engine = loaded_engine();
        let tracker = ContextTracker::prime(&mut engine, "sys", 8).unwrap();
        let mut session = tracker.reset_to_system_prompt(&mut engine).unwrap();

        let err = tracker
            .append_and_decode(&mut engine, &mut session, "too long")
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::ContextFull {
                position: 4,
                needed: 8,
                limit: 8
            }
        ));
        assert_eq!(session.current_position(), 4);
    }

    #[test]
    fn test_rollback_trims_cache_and_text() {
        let mut engine = loaded_engine();
        let tracker = ContextTracker::prime(&mut engine, "s", 64).unwrap();
        let mut session = tracker.reset_to_system_prompt(&mut engine).unwrap();
        tracker
            .append_and_decode(&mut engine, &mut session, "keep|drop")
            .unwrap();

        let start = session.system_prompt_tokens();
        tracker
            .rollback(&mut engine, &mut session, start + 4, 4)
            .unwrap();
        assert_eq!(session.conversation(), "keep");
        assert_eq!(session.current_position(), start + 4);
        assert_eq!(engine.cached_text(), "skeep");

        let err = tracker
            .rollback(&mut engine, &mut session, start - 1, 0)
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidRollback { .. }));
    }

    #[test]
    fn test_engine_errors_propagate() {
        let mut engine = ReplayEngine::new(vec![]);
        let err = ContextTracker::prime(&mut engine, "sys", 64).unwrap_err();
        assert!(matches!(err, TrackerError::Engine(EngineError::NotLoaded)));
    }
}
