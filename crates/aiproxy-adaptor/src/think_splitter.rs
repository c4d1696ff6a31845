//! Splits a provider-embedded `<think>…</think>` block out of streamed
//! content into a synthesised `reasoning_content` field.
//!
//! A small state machine with states `{Scanning, InThink, AfterThink}`.
//! `feed` consumes an arbitrary byte chunk and emits
//! `(reasoning_delta, content_delta)`; it must handle the opening and
//! closing tags being split across chunk boundaries, so unmatched trailing
//! bytes that could be a tag prefix are held back until the next `feed`
//! call (or flushed as content by [`ThinkSplitter::finish`] at stream end).

const OPEN_TAG: &[u8] = b"<think>";
const CLOSE_TAG: &[u8] = b"</think>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Scanning,
    InThink,
    AfterThink,
}

#[derive(Debug, Default)]
pub struct ThinkSplitter {
    state: StateWrap,
    pending: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct StateWrap(State);

impl Default for StateWrap {
    fn default() -> Self {
        StateWrap(State::Scanning)
    }
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next chunk of upstream content and returns
    /// `(reasoning_delta, content_delta)` as owned strings. Invalid UTF-8
    /// across a split is not expected from JSON-decoded text content, so
    /// this operates on `&str` chunks; byte-level tag matching still
    /// handles splits that land inside the tag text itself.
    pub fn feed(&mut self, chunk: &str) -> (String, String) {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk.as_bytes());

        let mut reasoning = Vec::new();
        let mut content = Vec::new();
        let mut cursor = 0usize;

        loop {
            match self.state.0 {
                State::Scanning => match find_tag(&buf[cursor..], OPEN_TAG) {
                    Some(rel_idx) => {
                        let idx = cursor + rel_idx;
                        content.extend_from_slice(&buf[cursor..idx]);
                        cursor = idx + OPEN_TAG.len();
                        self.state.0 = State::InThink;
                    }
                    None => {
                        let partial = partial_suffix_len(&buf[cursor..], OPEN_TAG);
                        let emit_end = buf.len() - partial;
                        content.extend_from_slice(&buf[cursor..emit_end]);
                        self.pending = buf[emit_end..].to_vec();
                        break;
                    }
                },
                State::InThink => match find_tag(&buf[cursor..], CLOSE_TAG) {
                    Some(rel_idx) => {
                        let idx = cursor + rel_idx;
                        reasoning.extend_from_slice(&buf[cursor..idx]);
                        cursor = idx + CLOSE_TAG.len();
                        self.state.0 = State::AfterThink;
                    }
                    None => {
                        let partial = partial_suffix_len(&buf[cursor..], CLOSE_TAG);
                        let emit_end = buf.len() - partial;
                        reasoning.extend_from_slice(&buf[cursor..emit_end]);
                        self.pending = buf[emit_end..].to_vec();
                        break;
                    }
                },
                State::AfterThink => {
                    content.extend_from_slice(&buf[cursor..]);
                    self.pending.clear();
                    break;
                }
            }
        }

        (
            String::from_utf8_lossy(&reasoning).into_owned(),
            String::from_utf8_lossy(&content).into_owned(),
        )
    }

    /// Flushes any bytes still held back as a possible tag prefix, treating
    /// them as ordinary content — called once the upstream stream ends.
    pub fn finish(mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}

fn find_tag(buf: &[u8], tag: &[u8]) -> Option<usize> {
    if tag.is_empty() || buf.len() < tag.len() {
        return None;
    }
    buf.windows(tag.len()).position(|w| w == tag)
}

/// Longest suffix of `buf` that is also a (proper) prefix of `tag`, used to
/// decide how many trailing bytes to hold back across a chunk boundary.
fn partial_suffix_len(buf: &[u8], tag: &[u8]) -> usize {
    let max_k = (tag.len() - 1).min(buf.len());
    for k in (1..=max_k).rev() {
        if buf.ends_with(&tag[..k]) {
            return k;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn splits_single_chunk() {
        let mut splitter = ThinkSplitter::new();
        let (reasoning, content) = splitter.feed("A<think>B</think>C");
        assert_eq!(reasoning, "B");
        assert_eq!(content, "AC");
        assert_eq!(splitter.finish(), "");
    }

    #[test]
    fn handles_no_think_block() {
        let mut splitter = ThinkSplitter::new();
        let (reasoning, content) = splitter.feed("just content");
        assert_eq!(reasoning, "");
        assert_eq!(content, "just content");
    }

    /// "for all byte splits of the input
    /// `"A<think>B</think>C"`, concatenated outputs give
    /// `reasoning_content="B"`, `content="AC"`." Kept as a literal,
    /// human-readable instance of the property proptest checks below.
    #[test]
    fn round_trips_for_every_byte_split() {
        let input = "A<think>B</think>C";
        for split in 0..=input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let (first, second) = input.split_at(split);
            let mut splitter = ThinkSplitter::new();
            let (mut reasoning, mut content) = splitter.feed(first);
            let (r2, c2) = splitter.feed(second);
            reasoning.push_str(&r2);
            content.push_str(&c2);
            content.push_str(&splitter.finish());
            assert_eq!(reasoning, "B", "split at {split}");
            assert_eq!(content, "AC", "split at {split}");
        }
    }

    proptest! {
        /// For arbitrary ASCII before/reasoning/after text and any byte
        /// split of the assembled input, the two feeds (plus `finish`)
        /// reconstruct the same `reasoning`/`content` a single feed would,
        /// regardless of where the chunk boundary falls relative to the
        /// `<think>`/`</think>` tags.
        #[test]
        fn round_trips_for_arbitrary_content_and_split(
            before in "[a-zA-Z0-9 ]{0,12}",
            reasoning in "[a-zA-Z0-9 ]{0,12}",
            after in "[a-zA-Z0-9 ]{0,12}",
            split_fraction in 0.0f64..=1.0f64,
        ) {
            let input = format!("{before}<think>{reasoning}</think>{after}");
            // ASCII-only generators guarantee every byte offset is a char
            // boundary, so this never needs to search for one.
            let split = ((input.len() as f64) * split_fraction).round() as usize;
            let (first, second) = input.split_at(split);

            let mut splitter = ThinkSplitter::new();
            let (mut got_reasoning, mut got_content) = splitter.feed(first);
            let (r2, c2) = splitter.feed(second);
            got_reasoning.push_str(&r2);
            got_content.push_str(&c2);
            got_content.push_str(&splitter.finish());

            prop_assert_eq!(got_reasoning, reasoning);
            prop_assert_eq!(got_content, format!("{before}{after}"));
        }
    }

    #[test]
    fn handles_byte_by_byte_feed() {
        let input = "A<think>B</think>C";
        let mut splitter = ThinkSplitter::new();
        let mut reasoning = String::new();
        let mut content = String::new();
        for ch in input.chars() {
            let (r, c) = splitter.feed(&ch.to_string());
            reasoning.push_str(&r);
            content.push_str(&c);
        }
        content.push_str(&splitter.finish());
        assert_eq!(reasoning, "B");
        assert_eq!(content, "AC");
    }
}
