//! Incremental decoder for the generate response body.
//!
//! The backend writes one JSON object per line, but the transport hands us chunks that
//! split lines (and UTF-8 sequences) anywhere. [`FrameDecoder`] reassembles them:
//! segments are appended to an accumulator until it holds a structurally complete value.
//!
//! "Partial" is decided by a structural scan, not by parser errors: the accumulator is
//! partial while a string is open or a `{`/`[` is unclosed. It is invalid when it starts
//! with anything other than `{`/`[`, or when a closing bracket does not match. A value that
//! is structurally complete but rejected by `serde_json` is also invalid.

use std::collections::VecDeque;

use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::error::{ChatError, ProtocolError};
use crate::history::ChatResponse;

#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// A complete value ends at this byte offset.
    Complete(usize),
    Partial,
    Invalid(String),
}

fn scan(text: &str) -> Scan {
    let start = text.len() - text.trim_start().len();
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text[start..].char_indices() {
        if i == 0 && c != '{' && c != '[' {
            return Scan::Invalid(format!("unexpected '{}' at start of fragment", c));
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return Scan::Invalid(format!("unbalanced '{}'", c));
                }
                if stack.is_empty() {
                    return Scan::Complete(start + i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    Scan::Partial
}

/// Reassembles newline-delimited JSON values from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Trailing bytes of an unfinished UTF-8 sequence.
    pending: Vec<u8>,
    accumulator: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every value completed by it, in arrival order.
    /// Empty objects (`{}` keep-alives) are never returned.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Value>, ProtocolError> {
        let text = self.decode_utf8(chunk);
        let mut out = Vec::new();
        for segment in text.split('\n') {
            let segment = segment.trim_end_matches('\r');
            if segment.trim().is_empty() {
                continue;
            }
            if self.accumulator.is_empty() && segment.trim() == "{}" {
                continue;
            }
            self.accumulator.push_str(segment);
            self.drain_complete(&mut out)?;
        }
        Ok(out)
    }

    /// End of stream. Whatever is still accumulated can never complete and is dropped.
    pub fn finish(&mut self) {
        if !self.accumulator.trim().is_empty() || !self.pending.is_empty() {
            log::warn!(
                "stream ended with an incomplete fragment ({} bytes), ignoring",
                self.accumulator.len() + self.pending.len()
            );
        }
        self.accumulator.clear();
        self.pending.clear();
    }

    pub fn is_idle(&self) -> bool {
        self.accumulator.is_empty() && self.pending.is_empty()
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let s = s.to_string();
                self.pending.clear();
                s
            }
            // Incomplete sequence at the tail: keep it for the next chunk.
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let rest = self.pending.split_off(valid);
                let s = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = rest;
                s
            }
            Err(_) => {
                let s = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                s
            }
        }
    }

    fn drain_complete(&mut self, out: &mut Vec<Value>) -> Result<(), ProtocolError> {
        loop {
            if self.accumulator.trim().is_empty() {
                self.accumulator.clear();
                return Ok(());
            }
            match scan(&self.accumulator) {
                Scan::Partial => {
                    log::trace!("incomplete fragment, waiting for more data");
                    return Ok(());
                }
                Scan::Invalid(reason) => return Err(ProtocolError::Malformed(reason)),
                Scan::Complete(end) => {
                    let value: Value = serde_json::from_str(&self.accumulator[..end])
                        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                    self.accumulator.drain(..end);
                    if value.as_object().map_or(false, |o| o.is_empty()) {
                        continue;
                    }
                    out.push(value);
                }
            }
        }
    }
}

/// Turn one decoded value into a server event, enforcing the stream's failure rules.
pub fn decode_event(value: Value) -> Result<ChatResponse, ProtocolError> {
    if let Some(err) = value.get("error").filter(|e| !e.is_null()) {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| err.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| err.to_string());
        return Err(ProtocolError::Server(message));
    }
    let response: ChatResponse =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let has_content = response
        .choices
        .first()
        .and_then(|c| c.messages.first())
        .map_or(false, |m| !m.content.is_empty());
    if !has_content {
        return Err(ProtocolError::NoContent);
    }
    Ok(response)
}

/// Lazy sequence of server events over one response body. Not restartable: after the
/// first error or the end of the body it only yields `None`.
pub struct EventStream<S> {
    inner: S,
    decoder: FrameDecoder,
    ready: VecDeque<Value>,
    finished: bool,
}

impl<S, B, E> EventStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<ChatError>,
{
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
        }
    }

    pub async fn next_event(&mut self) -> Option<Result<ChatResponse, ChatError>> {
        loop {
            if let Some(value) = self.ready.pop_front() {
                let event = decode_event(value);
                if event.is_err() {
                    self.abort();
                }
                return Some(event.map_err(ChatError::from));
            }
            if self.finished {
                return None;
            }
            match self.inner.next().await {
                Some(Ok(chunk)) => match self.decoder.feed(chunk.as_ref()) {
                    Ok(values) => self.ready.extend(values),
                    Err(e) => {
                        self.abort();
                        return Some(Err(e.into()));
                    }
                },
                Some(Err(e)) => {
                    self.abort();
                    return Some(Err(e.into()));
                }
                None => {
                    self.finished = true;
                    self.decoder.finish();
                }
            }
        }
    }

    fn abort(&mut self) {
        self.finished = true;
        self.ready.clear();
    }
}
