//! Turn coordinator.
//!
//! One turn runs the stages in order:
//!
//! ```text
//! authorize → fetch profile → validate all stage configs
//!   → Transcribing (audio only) → Generating → Synthesizing → Completed
//! ```
//!
//! Events are forwarded to the session's multiplexer as they arrive. Config
//! problems and permission failures end the turn with an `error` frame
//! before any vendor is contacted. Vendor trouble inside a stage degrades to
//! that stage's terminal event and the turn carries on; only a synthesis
//! failure is reported as an error frame, and it still lets the turn
//! complete. Messages are persisted from spawned tasks so a slow store
//! never holds up the stages.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use duet_core::text_prep::{estimate_speech_ms, estimate_tokens, segment_for_synthesis};
use duet_core::types::{
    AudioFormat, ErrorScope, GenerationChunk, PipelineEvent, ProviderConfig, SenderType,
    TranscriptEvent, Turn, TurnState,
};

use crate::config::{PipelineSettings, SynthesisMode};
use crate::context::{
    ConversationContextProvider, MessageMetadata, PersistenceGateway, build_system_prompt,
};
use crate::error::{ErrorKind, PipelineError, PipelineResult};
use crate::ingest::AudioClip;
use crate::llm::{FINISH_ERROR, FINISH_FALLBACK, GenerationRequest, GenerationStage};
use crate::mux::{EventMultiplexer, FrameContext};
use crate::registry::ProviderRegistry;
use crate::session::CancelSignal;
use crate::stt::TranscriptionStage;
use crate::tts::{SegmentBatch, SynthesisEvent, SynthesisStage};

/// What the user said or typed.
#[derive(Debug)]
pub enum TurnInput {
    Audio(AudioClip),
    Text(String),
}

#[derive(Debug)]
pub struct TurnRequest {
    pub conversation_id: String,
    pub user_id: String,
    pub input: TurnInput,
}

/// Why a turn stopped early.
enum TurnFailure {
    /// Reported to the client already.
    Aborted(PipelineError),
    Disconnected,
}

/// Publishes a turn's events, holding back `Complete` after a fatal error.
struct TurnEmitter<'a> {
    mux: &'a EventMultiplexer,
    ctx: FrameContext,
    complete_suppressed: bool,
}

impl<'a> TurnEmitter<'a> {
    fn new(mux: &'a EventMultiplexer, turn_id: Uuid) -> Self {
        Self {
            mux,
            ctx: FrameContext {
                turn_id,
                character_name: String::new(),
            },
            complete_suppressed: false,
        }
    }

    async fn emit(&mut self, event: PipelineEvent) -> Result<(), TurnFailure> {
        match &event {
            PipelineEvent::Error { scope, .. } if scope.suppresses_complete() => {
                self.complete_suppressed = true;
            }
            PipelineEvent::Complete if self.complete_suppressed => {
                debug!("turn {}: complete withheld after error", self.ctx.turn_id);
                return Ok(());
            }
            _ => {}
        }
        self.mux
            .publish(&event, &self.ctx)
            .await
            .map_err(|_| TurnFailure::Disconnected)
    }

    async fn status(&mut self, message: &str) -> Result<(), TurnFailure> {
        self.emit(PipelineEvent::Status(message.to_string())).await
    }

    /// Report `err` to the client and end the turn.
    async fn reject(&mut self, scope: ErrorScope, err: PipelineError) -> TurnFailure {
        match err.kind() {
            ErrorKind::Validation => info!("turn {}: {scope:?} rejected: {err}", self.ctx.turn_id),
            _ => warn!("turn {}: {scope:?} rejected: {err}", self.ctx.turn_id),
        }
        let event = PipelineEvent::Error {
            scope,
            message: err.client_message(),
        };
        match self.emit(event).await {
            Ok(()) => TurnFailure::Aborted(err),
            Err(failure) => failure,
        }
    }
}

struct StageProviders {
    stt: String,
    llm: String,
    tts: String,
}

pub struct PipelineCoordinator {
    stt: TranscriptionStage,
    llm: GenerationStage,
    tts: SynthesisStage,
    providers: StageProviders,
    settings: PipelineSettings,
    context: Arc<dyn ConversationContextProvider>,
    store: Arc<dyn PersistenceGateway>,
}

impl PipelineCoordinator {
    /// Resolve the configured providers. Unknown ids and adapters without
    /// credentials fail here, at startup.
    pub fn new(
        registry: &ProviderRegistry,
        settings: &PipelineSettings,
        context: Arc<dyn ConversationContextProvider>,
        store: Arc<dyn PersistenceGateway>,
    ) -> PipelineResult<Self> {
        let stt = TranscriptionStage::new(registry.stt(&settings.stt)?, settings.stt_timeout());
        let llm = GenerationStage::new(
            registry.llm(&settings.llm)?,
            settings.llm_timeout(),
            settings.fallback_message.clone(),
        );
        let tts = SynthesisStage::new(
            registry.tts(&settings.tts)?,
            settings.tts_timeout(),
            SegmentBatch {
                max_items: settings.segment_max_items.max(1),
                max_chars: settings.segment_max_chars.max(1),
                window: std::time::Duration::from_millis(settings.segment_window_ms),
            },
        );
        let providers = StageProviders {
            stt: stt.provider(),
            llm: llm.provider(),
            tts: tts.provider(),
        };
        info!(
            "pipeline: stt={} llm={} tts={}",
            providers.stt, providers.llm, providers.tts
        );
        Ok(Self {
            stt,
            llm,
            tts,
            providers,
            settings: settings.clone(),
            context,
            store,
        })
    }

    /// Run one turn to its end and return it in a terminal state. Firing
    /// `cancel` drops whichever stage is active, which closes its vendor
    /// stream, and leaves the turn `Failed`.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        mux: &EventMultiplexer,
        mut cancel: CancelSignal,
    ) -> Turn {
        let mut turn = Turn::new(&request.conversation_id);
        let mut emitter = TurnEmitter::new(mux, turn.turn_id);
        let mut checkpoints: Vec<JoinHandle<()>> = Vec::new();
        info!(
            "turn {}: started for {} ({})",
            turn.turn_id,
            request.conversation_id,
            match request.input {
                TurnInput::Audio(_) => "audio",
                TurnInput::Text(_) => "text",
            }
        );
        if cancel.is_cancelled() {
            turn.fail();
            info!("turn {}: cancelled before it started", turn.turn_id);
            return turn;
        }

        let outcome = {
            let work = self.execute(&mut turn, request, &mut emitter, &mut checkpoints);
            tokio::pin!(work);
            tokio::select! {
                result = &mut work => Some(result),
                _ = cancel.cancelled() => None,
            }
        };

        match outcome {
            Some(Ok(())) => {}
            Some(Err(TurnFailure::Aborted(e))) => {
                turn.fail();
                warn!("turn {}: aborted: {e}", turn.turn_id);
            }
            Some(Err(TurnFailure::Disconnected)) => {
                turn.fail();
                info!("turn {}: client went away", turn.turn_id);
            }
            None => {
                turn.fail();
                info!("turn {}: cancelled", turn.turn_id);
            }
        }

        for checkpoint in checkpoints {
            let _ = checkpoint.await;
        }
        log_metrics(&turn);
        turn
    }

    async fn execute(
        &self,
        turn: &mut Turn,
        request: TurnRequest,
        emitter: &mut TurnEmitter<'_>,
        checkpoints: &mut Vec<JoinHandle<()>>,
    ) -> Result<(), TurnFailure> {
        let TurnRequest {
            conversation_id,
            user_id,
            input,
        } = request;

        if let Err(e) = self.context.authorize(&user_id, &conversation_id).await {
            return Err(emitter.reject(ErrorScope::Turn, e).await);
        }
        let profile = match self.context.fetch(&conversation_id).await {
            Ok(profile) => profile,
            Err(e) => return Err(emitter.reject(ErrorScope::Turn, e).await),
        };
        emitter.ctx.character_name = profile.character_name.clone();

        let announced = match &input {
            TurnInput::Audio(clip) => Some((clip.format, clip.sample_rate)),
            TurnInput::Text(_) => None,
        };
        let config = ProviderConfig::resolve(&profile, &self.settings.provider_defaults(), announced);
        self.validate(&config, announced, emitter).await?;

        let history = match self.context.history(&conversation_id, config.context_window).await {
            Ok(history) => history,
            Err(e) => {
                warn!("turn {}: history unavailable, continuing without: {e}", turn.turn_id);
                Vec::new()
            }
        };

        // ── Transcribing ──
        let (transcript, confidence) = match input {
            TurnInput::Audio(clip) => {
                let event = self.transcribe(turn, clip, &config, emitter).await?;
                (event.text.trim().to_string(), Some(event.confidence))
            }
            TurnInput::Text(text) => (text.trim().to_string(), None),
        };
        turn.transcript = Some(transcript.clone());

        // ── Generating ──
        advance(turn, TurnState::Generating, emitter).await?;
        emitter.status("generating").await?;
        let mut chunks = if transcript.is_empty() {
            debug!("turn {}: nothing heard, answering with fallback", turn.turn_id);
            self.llm.fallback(&self.settings.unheard_message)
        } else {
            checkpoints.push(self.checkpoint(
                &conversation_id,
                SenderType::User,
                &transcript,
                self.metadata(turn.turn_id, announced.is_some(), confidence, None),
            ));
            let request = GenerationRequest {
                system_prompt: build_system_prompt(&profile),
                history,
                user_message: transcript.clone(),
                config: config.generation.clone(),
            };
            match self.llm.run(request) {
                Ok(chunks) => chunks,
                Err(e) => return Err(emitter.reject(ErrorScope::Generation, e).await),
            }
        };

        let mut last: Option<GenerationChunk> = None;
        while let Some(chunk) = chunks.next().await {
            if turn.metrics.first_token_ms.is_none() && !chunk.content.is_empty() {
                turn.metrics.first_token_ms = Some(turn.elapsed_ms());
            }
            let is_final = chunk.is_final;
            emitter.emit(PipelineEvent::GenerationChunk(chunk.clone())).await?;
            if is_final {
                last = Some(chunk);
                break;
            }
        }
        drop(chunks);
        turn.metrics.generation_ms = Some(turn.elapsed_ms());

        let reply = last.as_ref().map(|c| c.accumulated_content.clone()).unwrap_or_default();
        turn.metrics.output_tokens = estimate_tokens(&reply);
        turn.generated_text = Some(reply.clone());
        if let Some(chunk) = last.as_ref().filter(|c| should_persist(c)) {
            checkpoints.push(self.checkpoint(
                &conversation_id,
                SenderType::Assistant,
                &reply,
                self.metadata(
                    turn.turn_id,
                    announced.is_some(),
                    None,
                    chunk.finish_reason.clone(),
                ),
            ));
        }

        // ── Synthesizing ──
        advance(turn, TurnState::Synthesizing, emitter).await?;
        emitter.status("synthesizing").await?;
        let mut audio = match self.settings.synthesis_mode {
            SynthesisMode::Whole => self.tts.whole(&reply, &config.synthesis),
            SynthesisMode::Segmented => {
                let segments = segment_for_synthesis(&reply, self.settings.segment_max_chars.max(1));
                self.tts.segmented(
                    Box::pin(futures_util::stream::iter(segments)),
                    &config.synthesis,
                )
            }
        };
        while let Some(event) = audio.next().await {
            match event {
                SynthesisEvent::Audio(chunk) => {
                    emitter.emit(PipelineEvent::AudioChunk(chunk.clone())).await?;
                    turn.audio_chunks.push(chunk);
                }
                SynthesisEvent::Failed(message) => {
                    warn!("turn {}: synthesis failed after text was sent", turn.turn_id);
                    emitter
                        .emit(PipelineEvent::Error {
                            scope: ErrorScope::Synthesis,
                            message,
                        })
                        .await?;
                }
            }
        }
        turn.metrics.synthesis_ms = Some(turn.elapsed_ms());

        advance(turn, TurnState::Completed, emitter).await?;
        emitter.emit(PipelineEvent::Complete).await
    }

    /// All three configs are checked before the first vendor call.
    async fn validate(
        &self,
        config: &ProviderConfig,
        announced: Option<(AudioFormat, u32)>,
        emitter: &mut TurnEmitter<'_>,
    ) -> Result<(), TurnFailure> {
        let stt = match announced {
            Some(_) => self.stt.validate(&config.stt),
            None => Ok(()),
        };
        let checks = [
            (ErrorScope::Transcription, stt),
            (ErrorScope::Generation, self.llm.validate(&config.generation)),
            (ErrorScope::Synthesis, self.tts.validate(&config.synthesis)),
        ];
        for (scope, result) in checks {
            if let Err(e) = result {
                return Err(emitter.reject(scope, e).await);
            }
        }
        Ok(())
    }

    async fn transcribe(
        &self,
        turn: &mut Turn,
        clip: AudioClip,
        config: &ProviderConfig,
        emitter: &mut TurnEmitter<'_>,
    ) -> Result<TranscriptEvent, TurnFailure> {
        advance(turn, TurnState::Transcribing, emitter).await?;
        emitter.status("transcribing").await?;
        debug!(
            "turn {}: {} bytes of {} audio{}",
            turn.turn_id,
            clip.len(),
            clip.format,
            clip.duration_ms().map_or_else(String::new, |ms| format!(", {ms}ms"))
        );

        let mut events = self.stt.run(clip.into_stream(), &config.stt);
        let mut last = None;
        while let Some(event) = events.next().await {
            emitter.emit(PipelineEvent::TranscriptResult(event.clone())).await?;
            if event.is_final {
                last = Some(event);
                break;
            }
        }
        turn.metrics.transcription_ms = Some(turn.elapsed_ms());

        let event = last.unwrap_or_else(|| TranscriptEvent::finished("", 0.0));
        if let Some(marker) = &event.error {
            warn!("turn {}: transcription ended with {marker}", turn.turn_id);
        }
        Ok(event)
    }

    fn metadata(
        &self,
        turn_id: Uuid,
        spoken: bool,
        confidence: Option<f32>,
        finish_reason: Option<String>,
    ) -> MessageMetadata {
        MessageMetadata {
            processing_timestamp: chrono::Utc::now(),
            turn_id,
            stt_provider: spoken.then(|| self.providers.stt.clone()),
            ai_provider: self.providers.llm.clone(),
            tts_provider: self.providers.tts.clone(),
            confidence,
            finish_reason,
        }
    }

    /// Persist in the background, bounded by the flush time.
    fn checkpoint(
        &self,
        conversation_id: &str,
        sender: SenderType,
        text: &str,
        metadata: MessageMetadata,
    ) -> JoinHandle<()> {
        let store = self.store.clone();
        let flush = self.settings.persistence_flush();
        let conversation_id = conversation_id.to_string();
        let text = text.to_string();
        tokio::spawn(async move {
            let append = store.append(&conversation_id, sender, &text, metadata);
            match tokio::time::timeout(flush, append).await {
                Ok(Ok(id)) => {
                    debug!(target: "duet::persistence", "{conversation_id}: saved {sender:?} message {id}");
                }
                Ok(Err(e)) if e.kind() == ErrorKind::Persistence => {
                    error!(target: "duet::persistence", "{conversation_id}: {sender:?} message not saved: {e}");
                }
                Ok(Err(e)) => {
                    warn!(target: "duet::persistence", "{conversation_id}: {sender:?} message refused: {e}");
                }
                Err(_) => {
                    warn!(target: "duet::persistence", "{conversation_id}: {sender:?} message not saved within {flush:?}");
                }
            }
        })
    }
}

async fn advance(
    turn: &mut Turn,
    next: TurnState,
    emitter: &mut TurnEmitter<'_>,
) -> Result<(), TurnFailure> {
    match turn.advance(next) {
        Ok(()) => Ok(()),
        Err(e) => Err(emitter.reject(ErrorScope::Turn, e.into()).await),
    }
}

/// Canned replies and apologies standing in for a failed call are not part
/// of the conversation.
fn should_persist(last: &GenerationChunk) -> bool {
    match last.finish_reason.as_deref() {
        Some(FINISH_FALLBACK) => false,
        Some(FINISH_ERROR) => last.chunk_index > 0,
        _ => !last.accumulated_content.is_empty(),
    }
}

fn log_metrics(turn: &Turn) {
    let m = &turn.metrics;
    let ms = |v: Option<u64>| v.map_or_else(|| "-".to_string(), |v| format!("{v}ms"));
    let spoken = turn.generated_text.as_deref().map_or(0, estimate_speech_ms);
    info!(
        "turn {} {:?}: stt {}, first token {}, llm {}, tts {}, ~{} tokens ({}), {} audio bytes, ~{}ms speech",
        turn.turn_id,
        turn.state(),
        ms(m.transcription_ms),
        ms(m.first_token_ms),
        ms(m.generation_ms),
        ms(m.synthesis_ms),
        m.output_tokens,
        m.tokens_per_second()
            .map_or_else(|| "-".to_string(), |t| format!("{t:.1} tok/s")),
        turn.audio_bytes(),
        spoken,
    );
}
