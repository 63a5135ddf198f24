//! Streaming output filter — decides, piece by piece, what generated text
//! the caller may see while the model is still writing.
//!
//! ```text
//!            tail is a prefix of "<tool_call"
//!   Normal ─────────────────────────────────▶ PossibleToolStart
//!     ▲  ▲          diverged: release held      │
//!     │  └──────────────────────────────────────┘
//!     │                                         │ marker complete
//!     │            closing "/>" seen            ▼
//!     └──────────────────────────────────── InsideToolCall
//! ```
//!
//! Complete control fragments are removed; partial ones are held back like
//! partial tool-call markers. The filter only sees copies of generated text.

use crate::protocol::{self, CALL_OPEN};

/// Filter state after the last pushed piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// Text flows through.
    Normal,
    /// The tail might start a tool call or control fragment and is held.
    PossibleToolStart,
    /// Inside a tool-call tag; everything is suppressed.
    InsideToolCall,
}

/// Incremental filter over one iteration's generated pieces.
#[derive(Debug, Clone)]
pub struct StreamFilter {
    state: FilterState,
    pending: String,
    fragments: Vec<String>,
}

impl StreamFilter {
    /// Filter that also removes the given control fragments.
    pub fn new(fragments: Vec<String>) -> Self {
        Self {
            state: FilterState::Normal,
            pending: String::new(),
            fragments: fragments.into_iter().filter(|f| !f.is_empty()).collect(),
        }
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    /// Feed one generated piece; returns the chunks that may be shown now.
    pub fn push(&mut self, piece: &str) -> Vec<String> {
        self.pending.push_str(piece);
        let mut out = Vec::new();

        loop {
            if self.state == FilterState::InsideToolCall {
                match protocol::find_call_end(&self.pending) {
                    Some(end) => {
                        self.pending.drain(..end);
                        self.state = FilterState::Normal;
                    }
                    None => {
                        // A new opening marker before the close restarts the tag.
                        if let Some(offset) = self.pending[CALL_OPEN.len()..].find(CALL_OPEN) {
                            self.pending.drain(..CALL_OPEN.len() + offset);
                            continue;
                        }
                        break;
                    }
                }
                continue;
            }

            self.strip_fragments();
            if let Some(start) = self.pending.find(CALL_OPEN) {
                emit(&mut out, &self.pending[..start]);
                self.pending.drain(..start);
                self.state = FilterState::InsideToolCall;
                continue;
            }

            let held = self.held_suffix_len();
            let release = self.pending.len() - held;
            emit(&mut out, &self.pending[..release]);
            self.pending.drain(..release);
            self.state = if held > 0 {
                FilterState::PossibleToolStart
            } else {
                FilterState::Normal
            };
            break;
        }
        out
    }

    /// End of generation: release what is safe to show and reset.
    ///
    /// A held prefix of two or more bytes is protocol syntax and dropped; a
    /// lone held byte such as `<` is ordinary text.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if self.state != FilterState::InsideToolCall && self.pending.len() < 2 {
            emit(&mut out, &self.pending);
        }
        self.pending.clear();
        self.state = FilterState::Normal;
        out
    }

    fn strip_fragments(&mut self) {
        while let Some(fragment) = self
            .fragments
            .iter()
            .find(|f| self.pending.contains(f.as_str()))
            .cloned()
        {
            self.pending = self.pending.replace(&fragment, "");
        }
    }

    /// Longest tail of the pending text that is a proper prefix of the
    /// opening marker or of a control fragment.
    fn held_suffix_len(&self) -> usize {
        let text = self.pending.as_str();
        std::iter::once(CALL_OPEN)
            .chain(self.fragments.iter().map(String::as_str))
            .flat_map(|marker| {
                (1..marker.len()).filter(move |&len| {
                    len <= text.len()
                        && marker.is_char_boundary(len)
                        && text.is_char_boundary(text.len() - len)
                        && text.ends_with(&marker[..len])
                })
            })
            .max()
            .unwrap_or(0)
    }
}

fn emit(out: &mut Vec<String>, text: &str) {
    if !text.is_empty() {
        out.push(text.to_string());
    }
}
