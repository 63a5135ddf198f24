//! Fault injection around a real engine.
//!
//! [`FaultyEngine`] forwards to the wrapped engine until a configured number
//! of decode or tokenize calls has gone through, then fails every later call.

use std::cell::Cell;
use std::path::Path;

use governor_core::engine::{EngineError, InferenceEngine, Position, SequenceId, TokenId};

/// Wraps an engine and fails calls past a threshold.
#[derive(Debug)]
pub struct FaultyEngine<E> {
    inner: E,
    fail_decode_after: Option<usize>,
    fail_tokenize_after: Option<usize>,
    decode_calls: usize,
    tokenize_calls: Cell<usize>,
}

impl<E: InferenceEngine> FaultyEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            fail_decode_after: None,
            fail_tokenize_after: None,
            decode_calls: 0,
            tokenize_calls: Cell::new(0),
        }
    }

    /// Let `n` decode calls succeed, then fail.
    pub fn fail_decode_after(mut self, n: usize) -> Self {
        self.fail_decode_after = Some(n);
        self
    }

    /// Let `n` tokenize calls succeed, then fail.
    pub fn fail_tokenize_after(mut self, n: usize) -> Self {
        self.fail_tokenize_after = Some(n);
        self
    }

    /// Decode calls seen so far, failed ones included.
    pub fn decode_calls(&self) -> usize {
        self.decode_calls
    }
}

impl<E: InferenceEngine> InferenceEngine for FaultyEngine<E> {
    fn name(&self) -> &str {
        "faulty"
    }

    fn load_model(&mut self, path: &Path) -> Result<(), EngineError> {
        self.inner.load_model(path)
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, EngineError> {
        let calls = self.tokenize_calls.get();
        self.tokenize_calls.set(calls + 1);
        if self.fail_tokenize_after.is_some_and(|n| calls >= n) {
            return Err(EngineError::Tokenize("injected tokenize failure".to_string()));
        }
        self.inner.tokenize(text, add_special)
    }

    fn decode_append(
        &mut self,
        tokens: &[TokenId],
        positions: &[Position],
        sequence: SequenceId,
    ) -> Result<(), EngineError> {
        let calls = self.decode_calls;
        self.decode_calls += 1;
        if self.fail_decode_after.is_some_and(|n| calls >= n) {
            return Err(EngineError::Decode("injected decode failure".to_string()));
        }
        self.inner.decode_append(tokens, positions, sequence)
    }

    fn sample_next(&mut self) -> Result<TokenId, EngineError> {
        self.inner.sample_next()
    }

    fn token_to_text(&self, token: TokenId) -> Result<String, EngineError> {
        self.inner.token_to_text(token)
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        self.inner.is_end_of_generation(token)
    }

    fn trim_cache(&mut self, from_position: Position) -> Result<(), EngineError> {
        self.inner.trim_cache(from_position)
    }

    fn unload(&mut self) {
        self.inner.unload();
    }
}
