//! Single writer per session socket.
//!
//! Everything a session sends goes through one queue drained by one task, so
//! a JSON frame can never land between an audio meta frame and its binary
//! payload. Each queue entry is a group of messages written back to back.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use duet_core::protocol::ServerFrame;
use duet_core::types::{AudioChunk, PipelineEvent};

use crate::error::{PipelineError, PipelineResult};

const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
    Ping,
}

/// The transport half a session writes to.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, message: WireMessage) -> PipelineResult<()>;

    async fn close(&mut self) {}
}

/// Per-turn values that go into outbound frames.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameContext {
    pub turn_id: Uuid,
    pub character_name: String,
}

enum Entry {
    Group(Vec<WireMessage>),
    Close,
}

/// Cloneable handle onto a session's writer task.
#[derive(Clone)]
pub struct EventMultiplexer {
    tx: mpsc::Sender<Entry>,
    max_binary_frame: usize,
}

impl EventMultiplexer {
    /// Start the writer task. It ends on [`close`](Self::close), when every
    /// handle is dropped, or at the first failed write.
    pub fn spawn<S>(sink: S, max_binary_frame: usize) -> (Self, JoinHandle<()>)
    where
        S: FrameSink + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(writer(sink, rx));
        (
            Self {
                tx,
                max_binary_frame: max_binary_frame.max(1),
            },
            handle,
        )
    }

    pub async fn send_frame(&self, frame: &ServerFrame) -> PipelineResult<()> {
        self.enqueue(vec![WireMessage::Text(frame.to_json()?)]).await
    }

    pub async fn ping(&self) -> PipelineResult<()> {
        self.enqueue(vec![WireMessage::Ping]).await
    }

    /// Serialize one pipeline event. Audio goes out as its meta frame
    /// followed by the payload, split into frames of at most
    /// `max_binary_frame` bytes.
    pub async fn publish(&self, event: &PipelineEvent, ctx: &FrameContext) -> PipelineResult<()> {
        let group = match event {
            PipelineEvent::Status(message) => vec![text(&ServerFrame::status(message))?],
            PipelineEvent::TranscriptResult(ev) => vec![text(&ServerFrame::transcript(ev))?],
            PipelineEvent::GenerationChunk(chunk) => {
                vec![text(&ServerFrame::generation(chunk, &ctx.character_name))?]
            }
            PipelineEvent::AudioChunk(chunk) => self.audio_group(chunk)?,
            PipelineEvent::Error { scope, message } => {
                vec![text(&ServerFrame::error(*scope, message))?]
            }
            PipelineEvent::Complete => vec![text(&ServerFrame::complete(ctx.turn_id))?],
        };
        self.enqueue(group).await
    }

    /// Ask the writer to close the socket once everything queued is out.
    pub async fn close(&self) {
        let _ = self.tx.send(Entry::Close).await;
    }

    fn audio_group(&self, chunk: &AudioChunk) -> PipelineResult<Vec<WireMessage>> {
        let parts: Vec<&[u8]> = chunk.bytes.chunks(self.max_binary_frame).collect();
        let mut group = Vec::with_capacity(parts.len() + 1);
        group.push(text(&ServerFrame::audio_meta(chunk, parts.len()))?);
        group.extend(parts.into_iter().map(|p| WireMessage::Binary(p.to_vec())));
        Ok(group)
    }

    async fn enqueue(&self, group: Vec<WireMessage>) -> PipelineResult<()> {
        self.tx
            .send(Entry::Group(group))
            .await
            .map_err(|_| PipelineError::Transport("client connection closed".into()))
    }
}

fn text(frame: &ServerFrame) -> PipelineResult<WireMessage> {
    Ok(WireMessage::Text(frame.to_json()?))
}

async fn writer<S: FrameSink>(mut sink: S, mut rx: mpsc::Receiver<Entry>) {
    while let Some(entry) = rx.recv().await {
        let group = match entry {
            Entry::Group(group) => group,
            Entry::Close => break,
        };
        for message in group {
            if let Err(e) = sink.send(message).await {
                warn!("mux: write failed, writer stopping: {e}");
                return;
            }
        }
    }
    debug!("mux: closing sink");
    sink.close().await;
}

/// Collects everything written, for tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct RecordingSink {
    messages: std::sync::Arc<std::sync::Mutex<Vec<WireMessage>>>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn messages(&self) -> Vec<WireMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Text frames parsed as JSON, in order.
    pub fn frames(&self) -> Vec<serde_json::Value> {
        self.messages()
            .into_iter()
            .filter_map(|m| match m {
                WireMessage::Text(t) => Some(serde_json::from_str(&t).unwrap()),
                _ => None,
            })
            .collect()
    }

    /// The `type` of every text frame, in order.
    pub fn kinds(&self) -> Vec<String> {
        self.frames()
            .iter()
            .map(|f| f["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, message: WireMessage) -> PipelineResult<()> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
