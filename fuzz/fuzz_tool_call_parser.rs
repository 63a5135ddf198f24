//! Fuzz target for tool-call extraction and the streaming filter.
//!
//! Run with: cargo +nightly fuzz run fuzz_tool_call_parser
//!
//! The first byte picks a piece size; the rest is treated as model output.

#![no_main]

use governor_core::protocol::{self, CALL_OPEN};
use governor_core::stream_filter::StreamFilter;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&size, rest)) = data.split_first() else {
        return;
    };
    let Ok(text) = std::str::from_utf8(rest) else {
        return;
    };

    let calls = protocol::extract_calls(text, 8);
    for call in &calls {
        assert_eq!(&text[call.start..call.end], call.text);
        let _ = protocol::parse_attributes(&call.text);
        let _ = protocol::to_tool_invocation(call, None);
    }
    let _ = protocol::strip_calls(text);

    let chars: Vec<char> = text.chars().collect();
    let mut filter = StreamFilter::new(vec!["<|im_end|>".to_string()]);
    let mut shown = String::new();
    for piece in chars.chunks(usize::from(size % 16) + 1) {
        let piece: String = piece.iter().collect();
        shown.extend(filter.push(&piece));
    }
    shown.extend(filter.finish());
    if !text.contains(CALL_OPEN) {
        assert!(!shown.contains(CALL_OPEN));
    }
});
