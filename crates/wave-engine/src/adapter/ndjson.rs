//! Parses a Claude-CLI-style NDJSON event stream into token accounting.
//!
//! Precedence, per line processed in order: a `result` event's totals are
//! authoritative and override everything seen so far; an `assistant` event's
//! running totals are kept only until a `result` event arrives; if the stream
//! never yields either, the caller falls back to a byte-length estimate.
//! Cached-read input tokens are tracked separately and never folded into the
//! billable count.

use serde::Deserialize;
use wave_core::step_progress::TokenUsage;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum NdjsonEvent {
    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        usage: RawUsage,
    },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        usage: RawUsage,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, rename = "cache_read_input_tokens")]
    pub cached_read_tokens: u64,
}

#[derive(Debug, Default)]
pub struct TokenAccumulator {
    from_result: Option<TokenUsage>,
    from_assistant: Option<TokenUsage>,
    lines_seen: usize,
    bytes_seen: usize,
}

impl TokenAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one NDJSON line. Unparseable lines are counted toward the
    /// byte-length fallback but otherwise ignored — the adapter's stdout may
    /// interleave non-JSON diagnostic output.
    pub fn feed_line(&mut self, line: &str) {
        self.lines_seen += 1;
        self.bytes_seen += line.len();
        let Ok(event) = serde_json::from_str::<NdjsonEvent>(line) else {
            return;
        };
        match event {
            NdjsonEvent::Result { usage } => {
                self.from_result = Some(usage_to_tokens(&usage));
            }
            NdjsonEvent::Assistant { usage } => {
                self.from_assistant = Some(usage_to_tokens(&usage));
            }
            NdjsonEvent::Other => {}
        }
    }

    /// Resolve the canonical token count per the precedence described above.
    pub fn finalize(&self) -> TokenUsage {
        if let Some(tokens) = &self.from_result {
            return tokens.clone();
        }
        if let Some(tokens) = &self.from_assistant {
            return tokens.clone();
        }
        TokenUsage {
            input_tokens: self.bytes_seen as u64 / 4,
            output_tokens: 0,
            cached_read_tokens: 0,
        }
    }
}

fn usage_to_tokens(usage: &RawUsage) -> TokenUsage {
    TokenUsage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cached_read_tokens: usage.cached_read_tokens,
    }
}
