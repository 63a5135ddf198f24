//! Replay engine — plays back scripted model turns.
//!
//! Tokenization is character-level, so any text can be decoded, and each
//! scripted turn is sampled piece by piece until it runs out, at which point
//! the engine reports end-of-generation. The cache is real: decodes must
//! arrive at contiguous positions and trimming discards the tail, which makes
//! the engine strict enough to catch position-tracking mistakes.
//!
//! ## Script format
//!
//! ```toml
//! repeat_last_turn = false
//!
//! [[tools]]
//! name = "weather"
//! description = "Current weather for a city."
//! schema = '{"type":"object","properties":{"city":{"type":"string"}},"required":["city"]}'
//! response = '{"temp_c": 21}'
//!
//! [[turns]]
//! text = '<tool_call name="weather" city="Oslo" />'
//!
//! [[turns]]
//! tokens = ["It is ", "21", " degrees."]
//! ```

use std::cell::Cell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{EngineError, InferenceEngine, MAIN_SEQUENCE, Position, SequenceId, TokenId};
use crate::tools::{RegistryError, ToolDefinition, ToolRegistry};

/// End-of-generation token.
pub const EOG_TOKEN: TokenId = 0;
/// Beginning-of-sequence token, added when `add_special` is set.
pub const BOS_TOKEN: TokenId = 1;

const CHAR_BASE: TokenId = 16;
const PIECE_BASE: TokenId = 0x0020_0000;

/// One scripted model turn.
///
/// `tokens` gives the exact sampled pieces; otherwise `text` is sampled one
/// character at a time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplayTurn {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
}

impl ReplayTurn {
    /// A turn sampled character by character.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            tokens: Vec::new(),
        }
    }

    /// A turn sampled as the given pieces.
    pub fn from_tokens<I, S>(pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            text: None,
            tokens: pieces.into_iter().map(Into::into).collect(),
        }
    }

    fn pieces(&self) -> Vec<String> {
        if !self.tokens.is_empty() {
            return self.tokens.clone();
        }
        self.text
            .as_deref()
            .unwrap_or_default()
            .chars()
            .map(String::from)
            .collect()
    }
}

/// A tool with a canned answer, declared in a replay script.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: String,
    /// Returned on every call.
    #[serde(default)]
    pub response: Option<String>,
    /// Returned as the tool's error on every call (wins over `response`).
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub requires_confirmation: bool,
}

impl ScriptedTool {
    /// Turn the declaration into a registrable definition.
    pub fn to_definition(&self) -> ToolDefinition {
        let response = self.response.clone().unwrap_or_else(|| "{}".to_string());
        let error = self.error.clone();
        ToolDefinition::new(
            self.name.clone(),
            self.description.clone(),
            self.schema.clone(),
            move |_args: &str| -> Result<String, String> {
                match &error {
                    Some(message) => Err(message.clone()),
                    None => Ok(response.clone()),
                }
            },
        )
        .deterministic(true)
        .requires_confirmation(self.requires_confirmation)
    }
}

/// A replay script: canned tools plus the turns the "model" will produce.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub tools: Vec<ScriptedTool>,
    #[serde(default)]
    pub turns: Vec<ReplayTurn>,
    /// Keep producing the last turn once the script runs out.
    #[serde(default)]
    pub repeat_last_turn: bool,
}

impl ReplayScript {
    /// Parse a script from TOML.
    pub fn parse(s: &str) -> Result<Self, EngineError> {
        toml::from_str(s).map_err(|e| EngineError::Load(format!("invalid replay script: {e}")))
    }

    /// Read and parse a script file.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Load(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Register the script's tools into `registry`.
    pub fn register_tools(&self, registry: &mut ToolRegistry) -> Result<(), RegistryError> {
        for tool in &self.tools {
            registry.register(tool.to_definition())?;
        }
        Ok(())
    }
}

/// Usage counters, for checking how the engine was driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub tokenize_calls: usize,
    pub tokenized_bytes: usize,
    pub decode_calls: usize,
    pub decoded_tokens: usize,
    pub sampled_tokens: usize,
    pub trims: usize,
}

/// Scripted [`InferenceEngine`].
#[derive(Debug)]
pub struct ReplayEngine {
    turns: Vec<Vec<String>>,
    repeat_last_turn: bool,
    vocab: Vec<String>,
    piece_ids: HashMap<String, TokenId>,
    turn: usize,
    cursor: usize,
    last_sampled: Option<TokenId>,
    cache: Vec<TokenId>,
    model: Option<PathBuf>,
    stats: Cell<ReplayStats>,
}

impl ReplayEngine {
    /// Engine that plays `turns` in order.
    pub fn new(turns: Vec<ReplayTurn>) -> Self {
        let mut engine = Self {
            turns: Vec::with_capacity(turns.len()),
            repeat_last_turn: false,
            vocab: Vec::new(),
            piece_ids: HashMap::new(),
            turn: 0,
            cursor: 0,
            last_sampled: None,
            cache: Vec::new(),
            model: None,
            stats: Cell::new(ReplayStats::default()),
        };
        for turn in turns {
            let pieces = turn.pieces();
            for piece in &pieces {
                engine.intern(piece);
            }
            engine.turns.push(pieces);
        }
        engine
    }

    /// Engine that plays a script's turns.
    pub fn from_script(script: &ReplayScript) -> Self {
        Self::new(script.turns.clone()).repeat_last_turn(script.repeat_last_turn)
    }

    /// Keep producing the last turn once the script runs out.
    pub fn repeat_last_turn(mut self, repeat: bool) -> Self {
        self.repeat_last_turn = repeat;
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Token ids currently in the cache.
    pub fn cache(&self) -> &[TokenId] {
        &self.cache
    }

    /// Detokenized cache contents.
    pub fn cached_text(&self) -> String {
        self.cache
            .iter()
            .filter_map(|&t| self.piece(t))
            .collect()
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats.get()
    }

    /// Number of turns fully played.
    pub fn turns_played(&self) -> usize {
        self.turn
    }

    fn intern(&mut self, piece: &str) {
        if piece.chars().count() <= 1 || self.piece_ids.contains_key(piece) {
            return;
        }
        let id = PIECE_BASE + self.vocab.len() as TokenId;
        self.vocab.push(piece.to_string());
        self.piece_ids.insert(piece.to_string(), id);
    }

    fn id_of(&self, piece: &str) -> TokenId {
        let mut chars = piece.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => CHAR_BASE + c as TokenId,
            (None, _) => EOG_TOKEN,
            _ => self.piece_ids.get(piece).copied().unwrap_or(EOG_TOKEN),
        }
    }

    fn piece(&self, token: TokenId) -> Option<String> {
        match token {
            EOG_TOKEN | BOS_TOKEN => Some(String::new()),
            t if t >= PIECE_BASE => self.vocab.get((t - PIECE_BASE) as usize).cloned(),
            t if t >= CHAR_BASE => char::from_u32(t - CHAR_BASE).map(String::from),
            _ => None,
        }
    }

    fn current_turn(&self) -> Option<&[String]> {
        if let Some(turn) = self.turns.get(self.turn) {
            return Some(turn.as_slice());
        }
        if self.repeat_last_turn {
            return self.turns.last().map(Vec::as_slice);
        }
        None
    }

    fn finish_turn(&mut self) {
        if self.turn < self.turns.len() {
            self.turn += 1;
        }
        self.cursor = 0;
    }

    fn update_stats(&self, f: impl FnOnce(&mut ReplayStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        if self.model.is_none() {
            return Err(EngineError::NotLoaded);
        }
        Ok(())
    }
}

impl InferenceEngine for ReplayEngine {
    fn name(&self) -> &str {
        "replay"
    }

    fn load_model(&mut self, path: &Path) -> Result<(), EngineError> {
        self.cache.clear();
        self.last_sampled = None;
        self.model = Some(path.to_path_buf());
        tracing::debug!(path = %path.display(), turns = self.turns.len(), "Replay engine loaded");
        Ok(())
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>, EngineError> {
        self.ensure_loaded()?;
        self.update_stats(|s| {
            s.tokenize_calls += 1;
            s.tokenized_bytes += text.len();
        });
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_special {
            tokens.push(BOS_TOKEN);
        }
        tokens.extend(text.chars().map(|c| CHAR_BASE + c as TokenId));
        Ok(tokens)
    }

    fn decode_append(
        &mut self,
        tokens: &[TokenId],
        positions: &[Position],
        sequence: SequenceId,
    ) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        if sequence != MAIN_SEQUENCE {
            return Err(EngineError::Decode(format!(
                "sequence {sequence} is not supported"
            )));
        }
        if tokens.len() != positions.len() {
            return Err(EngineError::Decode(format!(
                "{} tokens but {} positions",
                tokens.len(),
                positions.len()
            )));
        }
        for (i, &position) in positions.iter().enumerate() {
            let expected = self.cache.len() + i;
            if position != expected {
                return Err(EngineError::Decode(format!(
                    "position {position} does not continue the cache (expected {expected})"
                )));
            }
        }
        if let Some(&bad) = tokens.iter().find(|&&t| self.piece(t).is_none()) {
            return Err(EngineError::UnknownToken(bad));
        }

        // Anything other than the echo of the token just sampled is new
        // input, which ends the turn in progress.
        let echo = tokens.len() == 1 && self.last_sampled == Some(tokens[0]);
        if !echo && self.cursor > 0 {
            self.finish_turn();
        }
        self.last_sampled = None;

        self.cache.extend_from_slice(tokens);
        self.update_stats(|s| {
            s.decode_calls += 1;
            s.decoded_tokens += tokens.len();
        });
        Ok(())
    }

    fn sample_next(&mut self) -> Result<TokenId, EngineError> {
        self.ensure_loaded()?;
        let next = self
            .current_turn()
            .and_then(|turn| turn.get(self.cursor))
            .map(|piece| self.id_of(piece));

        let token = match next {
            Some(token) => {
                self.cursor += 1;
                token
            }
            None => {
                self.finish_turn();
                EOG_TOKEN
            }
        };
        self.last_sampled = Some(token);
        self.update_stats(|s| s.sampled_tokens += 1);
        Ok(token)
    }

    fn token_to_text(&self, token: TokenId) -> Result<String, EngineError> {
        self.piece(token).ok_or(EngineError::UnknownToken(token))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn trim_cache(&mut self, from_position: Position) -> Result<(), EngineError> {
        self.ensure_loaded()?;
        self.cache.truncate(from_position);
        self.update_stats(|s| s.trims += 1);
        Ok(())
    }

    fn unload(&mut self) {
        self.model = None;
        self.cache.clear();
        self.last_sampled = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn loaded(turns: Vec<ReplayTurn>) -> ReplayEngine {
        let mut engine = ReplayEngine::new(turns);
        engine.load_model(Path::new("script.toml")).unwrap();
        engine
    }

    fn sample_turn(engine: &mut ReplayEngine) -> String {
        let mut out = String::new();
        loop {
            let token = engine.sample_next().unwrap();
            if engine.is_end_of_generation(token) {
                return out;
            }
            let position = engine.cache().len();
            engine.decode_append(&[token], &[position], MAIN_SEQUENCE).unwrap();
            out.push_str(&engine.token_to_text(token).unwrap());
        }
    }

    #[test]
    fn test_requires_load() {
        let mut engine = ReplayEngine::new(vec![]);
        assert!(matches!(engine.tokenize("x", false), Err(EngineError::NotLoaded)));
        assert!(matches!(engine.sample_next(), Err(EngineError::NotLoaded)));
        engine.load_model(Path::new("m")).unwrap();
        assert!(engine.is_loaded());
        engine.unload();
        assert!(!engine.is_loaded());
    }

    #[test]
    fn test_tokenize_round_trips_text() {
        let engine = loaded(vec![]);
        let tokens = engine.tokenize("héllo", true).unwrap();
        assert_eq!(tokens.len(), 6);
        assert_eq!(tokens[0], BOS_TOKEN);
        let text: String = tokens
            .iter()
            .map(|&t| engine.token_to_text(t).unwrap())
            .collect();
        assert_eq!(text, "héllo");
    }

    #[test]
    fn test_plays_turns_in_order() {
        let mut engine = loaded(vec![
            ReplayTurn::from_text("hi"),
            ReplayTurn::from_tokens(["It is ", "4", "."]),
        ]);
        assert_eq!(sample_turn(&mut engine), "hi");
        assert_eq!(sample_turn(&mut engine), "It is 4.");
        assert_eq!(sample_turn(&mut engine), "");
        assert_eq!(engine.turns_played(), 2);
        assert_eq!(engine.cached_text(), "hiIt is 4.");
    }

    #[test]
    fn test_repeat_last_turn() {
        let mut engine = loaded(vec![ReplayTurn::from_text("again")]).repeat_last_turn(true);
        assert_eq!(sample_turn(&mut engine), "again");
        assert_eq!(sample_turn(&mut engine), "again");
    }

    #[test]
    fn test_new_input_ends_interrupted_turn() {
        let mut engine = loaded(vec![
            ReplayTurn::from_text("abcdef"),
            ReplayTurn::from_text("next"),
        ]);
        let token = engine.sample_next().unwrap();
        engine.decode_append(&[token], &[0], MAIN_SEQUENCE).unwrap();

        let input = engine.tokenize("x", false).unwrap();
        engine.decode_append(&input, &[1], MAIN_SEQUENCE).unwrap();
        assert_eq!(sample_turn(&mut engine), "next");
    }

    #[test]
    fn test_rejects_position_gaps() {
        let mut engine = loaded(vec![]);
        let tokens = engine.tokenize("ab", false).unwrap();
        let err = engine
            .decode_append(&tokens, &[1, 2], MAIN_SEQUENCE)
            .unwrap_err();
        assert!(matches!(err, EngineError::Decode(_)));
        assert!(engine.cache().is_empty());
    }

    #[test]
    fn test_trim_cache() {
        let mut engine = loaded(vec![]);
        let tokens = engine.tokenize("abcd", false).unwrap();
        engine
            .decode_append(&tokens, &[0, 1, 2, 3], MAIN_SEQUENCE)
            .unwrap();
        engine.trim_cache(2).unwrap();
        assert_eq!(engine.cached_text(), "ab");
        assert_eq!(engine.stats().trims, 1);
    }

    #[test]
    fn test_parse_script() {
        let script = ReplayScript::parse(
            r#"
            repeat_last_turn = true

            [[tools]]
            name = "weather"
            description = "Current weather."
            schema = '{"type":"object","properties":{"city":{"type":"string"}}}'
            response = '{"temp_c": 21}'

            [[tools]]
            name = "broken"
            error = "sensor offline"

            [[turns]]
            text = '<tool_call name="weather" city="Oslo" />'

            [[turns]]
            tokens = ["It is ", "21", "."]
            "#,
        )
        .unwrap();
        assert!(script.repeat_last_turn);
        assert_eq!(script.turns.len(), 2);
        assert_eq!(script.turns[1].tokens.len(), 3);

        let mut registry = ToolRegistry::new();
        script.register_tools(&mut registry).unwrap();
        assert_eq!(registry.names(), vec!["weather", "broken"]);
        assert_eq!(
            registry.find("weather").unwrap().execute("{}").unwrap(),
            r#"{"temp_c": 21}"#
        );
        assert_eq!(
            registry.find("broken").unwrap().execute("{}").unwrap_err(),
            "sensor offline"
        );
    }

    #[test]
    fn test_load_script_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("script.toml");
        std::fs::write(&path, "[[turns]]\ntext = \"hello\"\n").unwrap();
        let script = ReplayScript::load(&path).unwrap();
        assert_eq!(script.turns, vec![ReplayTurn::from_text("hello")]);

        let err = ReplayScript::load(&tmp.path().join("missing.toml")).unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
    }
}
