//! Usage Accounting
//!
//! Reads the relay's duplicate stream, extracts reported token usage and
//! writes one usage record per routed request.

use crate::api::relay::{AccountingSink, Tap};
use crate::clock::Clock;
use crate::error::Result;
use crate::router::orchestrator::AttemptHandle;
use crate::store::{Store, UsageRecord};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Largest non-streamed body, and largest partial line, kept for usage extraction
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Token counts reported by the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl TokenUsage {
    /// Fold in any usage object found in a response or event
    fn absorb(&mut self, value: &Value) {
        let candidates = [
            value.get("usage"),
            value.get("message").and_then(|m| m.get("usage")),
        ];
        for usage in candidates.into_iter().flatten() {
            let prompt = usage
                .get("prompt_tokens")
                .or_else(|| usage.get("input_tokens"))
                .and_then(Value::as_u64);
            let completion = usage
                .get("completion_tokens")
                .or_else(|| usage.get("output_tokens"))
                .and_then(Value::as_u64);

            if prompt.is_some() {
                self.prompt_tokens = prompt;
            }
            if completion.is_some() {
                self.completion_tokens = completion;
            }
        }
    }
}

/// Parse one SSE line into its JSON payload
pub fn parse_sse_line(line: &str) -> Option<Value> {
    // Skip empty lines and comments
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }

    let data = line.strip_prefix("data:")?.trim();
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str(data) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(error = %e, "skipping unparseable SSE data");
            None
        }
    }
}

/// Incremental scanner over response bytes
#[derive(Debug, Default)]
pub struct UsageScanner {
    pending: Vec<u8>,

    /// The current line outgrew the cap and is skipped up to its newline
    line_overflow: bool,
    body: Vec<u8>,
    body_truncated: bool,
    saw_events: bool,
    bytes: u64,
    usage: TokenUsage,
}

impl UsageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;

        if !self.body_truncated {
            if self.body.len() + chunk.len() > MAX_BODY_BYTES {
                self.body_truncated = true;
                self.body.clear();
            } else {
                self.body.extend_from_slice(chunk);
            }
        }

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            let (line, tail) = rest.split_at(pos + 1);
            if self.line_overflow {
                self.line_overflow = false;
            } else if self.pending.is_empty() {
                self.scan_line(line);
            } else {
                self.pending.extend_from_slice(line);
                let line = std::mem::take(&mut self.pending);
                self.scan_line(&line);
            }
            rest = tail;
        }
        self.hold_partial(rest);
    }

    fn hold_partial(&mut self, partial: &[u8]) {
        if self.line_overflow || partial.is_empty() {
            return;
        }
        if self.pending.len() + partial.len() > MAX_BODY_BYTES {
            debug!(held = self.pending.len(), "dropping oversized line");
            self.pending = Vec::new();
            self.line_overflow = true;
        } else {
            self.pending.extend_from_slice(partial);
        }
    }

    fn scan_line(&mut self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        if line.trim_start().starts_with("data:") {
            self.saw_events = true;
        }
        if let Some(value) = parse_sse_line(&line) {
            self.usage.absorb(&value);
        }
    }

    /// Byte count and usage once the stream has ended
    pub fn finish(mut self) -> (u64, TokenUsage) {
        if !self.line_overflow && !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.scan_line(&rest);
        }

        if !self.saw_events && !self.body_truncated && !self.body.is_empty() {
            match serde_json::from_slice::<Value>(&self.body) {
                Ok(value) => self.usage.absorb(&value),
                Err(e) => debug!(error = %e, "response body is not JSON"),
            }
        }

        (self.bytes, self.usage)
    }
}

/// Accounting sink that stores a [`UsageRecord`]
pub struct UsageRecorder {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    handle: AttemptHandle,
}

impl UsageRecorder {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, handle: AttemptHandle) -> Self {
        Self {
            store,
            clock,
            handle,
        }
    }
}

#[async_trait]
impl AccountingSink for UsageRecorder {
    async fn consume(&self, mut tap: Tap) -> Result<()> {
        let mut scanner = UsageScanner::new();
        let mut error = None;

        while let Some(item) = tap.next().await {
            match item {
                Ok(chunk) => scanner.feed(&chunk),
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let (bytes, usage) = scanner.finish();
        let handle = &self.handle;
        let record = UsageRecord {
            model: handle.model.clone(),
            link_id: handle.link_id,
            provider_id: handle.provider_id,
            key_id: handle.key_id,
            attempts: handle.attempts,
            status: handle.status,
            bytes,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            started_at: handle.started_at,
            finished_at: self.clock.now(),
            error,
        };

        info!(
            model = %record.model,
            link = record.link_id,
            key = record.key_id,
            attempts = record.attempts,
            status = record.status,
            bytes = record.bytes,
            prompt_tokens = ?record.prompt_tokens,
            completion_tokens = ?record.completion_tokens,
            latency_ms = (record.finished_at - record.started_at).num_milliseconds(),
            error = ?record.error,
            "usage recorded"
        );

        self.store.insert_usage(record).await
    }
}
