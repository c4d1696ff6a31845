//! SSE streaming normalisation for chat/completions.
//!
//! Reads line-delimited `data:` frames, rewrites `model` to the origin
//! model, splits an optional `<think>` block into `reasoning_content`, and
//! forwards the rewritten frame to the client. If the upstream never sends
//! a final `usage` object, usage is synthesised from the accumulated
//! response text and the request's recorded input-token count.

use bytes::Bytes;

use aiproxy_core::model::Usage;
use aiproxy_core::ProxyError;

use crate::think_splitter::ThinkSplitter;
use crate::types::ChatCompletionChunk;
use crate::ClientWriter;

pub const DONE_SENTINEL: &str = "[DONE]";

/// Counts tokens for a given model's text, used only when the upstream
/// omits `usage`. Implementations are keyed by actual-model so different
/// providers' tokenizers don't collide.
pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, model: &str, text: &str) -> u32;
}

/// A cheap, dependency-free approximation: ~4 bytes per token, the same
/// ballpark heuristic most lightweight proxies use when an exact
/// provider-specific tokeniser isn't linked in.
pub struct ApproxTokenizer;

impl Tokenizer for ApproxTokenizer {
    fn count_tokens(&self, _model: &str, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        ((text.len() as f64) / 4.0).ceil() as u32
    }
}

/// Accumulates incoming bytes and yields complete `\n`-terminated lines,
/// holding back a trailing partial line across calls.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        loop {
            let Some(pos) = self.pending.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop(); // drop '\n'
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

fn parse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|s| s.trim_start())
}

/// Drives one chat/completions SSE stream to completion, rewriting frames
/// and splitting think-blocks as they arrive.
pub struct StreamProcessor<'a> {
    origin_model: String,
    meta_input_tokens: u32,
    tokenizer: &'a dyn Tokenizer,
    lines: LineBuffer,
    splitter: ThinkSplitter,
    accumulated_content: String,
    usage: Usage,
    saw_done: bool,
}

impl<'a> StreamProcessor<'a> {
    pub fn new(origin_model: impl Into<String>, meta_input_tokens: u32, tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            origin_model: origin_model.into(),
            meta_input_tokens,
            tokenizer,
            lines: LineBuffer::default(),
            splitter: ThinkSplitter::new(),
            accumulated_content: String::new(),
            usage: Usage::default(),
            saw_done: false,
        }
    }

    /// Feeds raw upstream bytes, writing zero or more rewritten `data:`
    /// frames to `writer`.
    pub fn feed(&mut self, chunk: &[u8], writer: &mut dyn ClientWriter) -> Result<(), ProxyError> {
        for line in self.lines.push(chunk) {
            self.process_line(&line, writer)?;
        }
        Ok(())
    }

    fn process_line(&mut self, line: &str, writer: &mut dyn ClientWriter) -> Result<(), ProxyError> {
        let Some(payload) = parse_data_line(line) else {
            // Blank lines and comment lines are part of SSE framing; pass
            // them through unchanged so chunk boundaries stay intact.
            if !line.is_empty() {
                writer.write(Bytes::from(format!("{line}\n")))?;
            } else {
                writer.write(Bytes::from_static(b"\n"))?;
            }
            return Ok(());
        };

        if payload.trim() == DONE_SENTINEL {
            self.saw_done = true;
            writer.write(Bytes::from_static(b"data: [DONE]\n\n"))?;
            return Ok(());
        }

        let mut chunk: ChatCompletionChunk = serde_json::from_str(payload)
            .map_err(|err| ProxyError::MalformedResponse(err.to_string()))?;

        chunk.model = self.origin_model.clone();

        if let Some(usage) = chunk.usage.take() {
            self.usage = aiproxy_core::model::Usage::from(usage).reconcile(self.meta_input_tokens);
        }

        for choice in &mut chunk.choices {
            if let Some(content) = choice.delta.content.take() {
                let (reasoning, visible) = self.splitter.feed(&content);
                self.accumulated_content.push_str(&visible);
                if !reasoning.is_empty() {
                    let existing = choice.delta.reasoning_content.take().unwrap_or_default();
                    choice.delta.reasoning_content = Some(existing + &reasoning);
                }
                choice.delta.content = Some(visible);
            }
        }

        let rewritten = serde_json::to_string(&chunk)
            .map_err(|err| ProxyError::MalformedResponse(err.to_string()))?;
        writer.write(Bytes::from(format!("data: {rewritten}\n\n")))?;
        Ok(())
    }

    /// Finalises the stream: flushes any trailing think-splitter bytes as
    /// plain content and synthesises usage if the upstream never sent one.
    pub fn finish(mut self) -> Usage {
        let tail = self.splitter.finish();
        self.accumulated_content.push_str(&tail);

        if self.usage.is_empty() {
            let completion_tokens = self
                .tokenizer
                .count_tokens(&self.origin_model, &self.accumulated_content);
            self.usage = Usage {
                prompt_tokens: self.meta_input_tokens,
                completion_tokens,
                total_tokens: self.meta_input_tokens + completion_tokens,
                cached_tokens: 0,
                cache_creation_tokens: 0,
            };
        }
        self.usage
    }

    pub fn saw_done(&self) -> bool {
        self.saw_done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecordingWriter;

    #[test]
    fn rewrites_model_field_and_forwards() {
        let tokenizer = ApproxTokenizer;
        let mut proc = StreamProcessor::new("my-origin-model", 10, &tokenizer);
        let mut writer = RecordingWriter::new();
        let frame = "data: {\"model\":\"upstream-model\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n";
        proc.feed(frame.as_bytes(), &mut writer).unwrap();
        proc.feed(b"data: [DONE]\n\n", &mut writer).unwrap();
        let out = writer.as_string();
        assert!(out.contains("\"model\":\"my-origin-model\""));
        assert!(!out.contains("upstream-model"));
        assert!(out.contains("[DONE]"));
    }

    #[test]
    fn splits_think_block_across_two_chunks() {
        let tokenizer = ApproxTokenizer;
        let mut proc = StreamProcessor::new("m", 5, &tokenizer);
        let mut writer = RecordingWriter::new();
        let frame1 = "data: {\"model\":\"u\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"A<think>B\"}}]}\n\n";
        let frame2 = "data: {\"model\":\"u\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"</think>C\"}}]}\n\n";
        proc.feed(frame1.as_bytes(), &mut writer).unwrap();
        proc.feed(frame2.as_bytes(), &mut writer).unwrap();
        proc.feed(b"data: [DONE]\n\n", &mut writer).unwrap();
        let out = writer.as_string();
        assert!(out.contains("\"reasoning_content\":\"B\""));
    }

    #[test]
    fn synthesises_usage_when_absent() {
        let tokenizer = ApproxTokenizer;
        let mut proc = StreamProcessor::new("m", 500, &tokenizer);
        let mut writer = RecordingWriter::new();
        let content = "x".repeat(400); // ~100 tokens at 4 bytes/token
        let frame = format!(
            "data: {{\"model\":\"u\",\"choices\":[{{\"index\":0,\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
        );
        proc.feed(frame.as_bytes(), &mut writer).unwrap();
        let usage = proc.finish();
        assert_eq!(usage.prompt_tokens, 500);
        assert_eq!(usage.completion_tokens, 100);
        assert_eq!(usage.total_tokens, 600);
    }

    #[test]
    fn uses_upstream_usage_when_present() {
        let tokenizer = ApproxTokenizer;
        let mut proc = StreamProcessor::new("m", 500, &tokenizer);
        let mut writer = RecordingWriter::new();
        let frame = "data: {\"model\":\"u\",\"usage\":{\"prompt_tokens\":500,\"completion_tokens\":250,\"total_tokens\":750}}\n\n";
        proc.feed(frame.as_bytes(), &mut writer).unwrap();
        let usage = proc.finish();
        assert_eq!(usage.prompt_tokens, 500);
        assert_eq!(usage.completion_tokens, 250);
    }

    #[test]
    fn handles_split_across_arbitrary_chunk_boundaries() {
        let tokenizer = ApproxTokenizer;
        let full = "data: {\"model\":\"u\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n";
        for split in 1..full.len() {
            let mut proc = StreamProcessor::new("origin", 1, &tokenizer);
            let mut writer = RecordingWriter::new();
            proc.feed(full[..split].as_bytes(), &mut writer).unwrap();
            proc.feed(full[split..].as_bytes(), &mut writer).unwrap();
            assert!(proc.saw_done());
            let out = writer.as_string();
            assert!(out.contains("\"model\":\"origin\""));
        }
    }
}
