//! Response framing for streaming vendors.
//!
//! Vendor bodies arrive split at arbitrary byte offsets. The framers here
//! buffer raw bytes and only hand out complete units: whole SSE lines, or
//! whole top-level JSON objects from an NDJSON body or a streamed JSON array.
//! [`windowed`] groups body chunks into short time windows first so a unit is
//! rarely parsed from a sliver.

use std::time::Duration;

use async_stream::stream;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use tokio::time::Instant;

// ─── SSE ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Payload of a `data:` line.
    Data(String),
    /// The `[DONE]` sentinel.
    Done,
}

/// Line-oriented `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseFramer {
    buf: Vec<u8>,
}

impl SseFramer {
    /// Feed raw bytes; returns the events completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = parse_line(&line[..line.len() - 1]) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let line = std::mem::take(&mut self.buf);
        parse_line(&line).into_iter().collect()
    }
}

fn parse_line(line: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim_end_matches('\r');
    // Comments, `event:`, `id:` and blank separators carry nothing we use
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }
    if payload == "[DONE]" {
        return Some(SseEvent::Done);
    }
    Some(SseEvent::Data(payload.to_string()))
}

// ─── JSON objects ──────────────────────────────────────────────────────────

/// Extracts balanced top-level `{...}` objects from a byte stream.
///
/// Bytes between objects (array brackets, commas, newlines) are skipped, so
/// the same framer reads NDJSON and a JSON array streamed element by element.
#[derive(Debug, Default)]
pub struct JsonObjectFramer {
    buf: Vec<u8>,
    scanned: usize,
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl JsonObjectFramer {
    /// Feed raw bytes; returns every object completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut objects = Vec::new();

        for i in self.scanned..self.buf.len() {
            let b = self.buf[i];
            let Some(start) = self.start else {
                if b == b'{' {
                    self.start = Some(i);
                    self.depth = 1;
                }
                continue;
            };

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        objects.push(self.buf[start..=i].to_vec());
                        self.start = None;
                    }
                }
                _ => {}
            }
        }

        // Keep only the unfinished object, if any
        match self.start {
            Some(start) => {
                self.buf.drain(..start);
                self.start = Some(0);
                self.scanned = self.buf.len();
            }
            None => {
                self.buf.clear();
                self.scanned = 0;
            }
        }
        objects
    }

    /// Bytes of an object still waiting for its closing brace.
    pub fn pending(&self) -> usize {
        if self.start.is_some() { self.buf.len() } else { 0 }
    }
}

// ─── Time windows ──────────────────────────────────────────────────────────

/// Regroup a byte stream into windows: the first chunk after a flush opens a
/// window of `window`, and everything arriving before the deadline is emitted
/// together. The tail is flushed when the body ends; an error flushes what is
/// buffered and then ends the stream.
pub fn windowed<S, B, E>(body: S, window: Duration) -> BoxStream<'static, Result<Vec<u8>, E>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Send + 'static,
{
    Box::pin(stream! {
        let mut body = Box::pin(body);
        let mut pending: Vec<u8> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, body.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        deadline = None;
                        yield Ok(std::mem::take(&mut pending));
                        continue;
                    }
                },
                None => body.next().await,
            };

            match next {
                Some(Ok(bytes)) => {
                    let bytes = bytes.as_ref();
                    if bytes.is_empty() {
                        continue;
                    }
                    if pending.is_empty() {
                        deadline = Some(Instant::now() + window);
                    }
                    pending.extend_from_slice(bytes);
                    if window.is_zero() {
                        deadline = None;
                        yield Ok(std::mem::take(&mut pending));
                    }
                }
                Some(Err(e)) => {
                    if !pending.is_empty() {
                        yield Ok(std::mem::take(&mut pending));
                    }
                    yield Err(e);
                    break;
                }
                None => {
                    if !pending.is_empty() {
                        yield Ok(std::mem::take(&mut pending));
                    }
                    break;
                }
            }
        }
    })
}
