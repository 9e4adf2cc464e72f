//! One LLM → TTS response cycle.
//!
//! A [`GenerationTask`] owns the cancellation token for its cycle and the
//! handle of the task doing the work. Cancelling only signals; teardown runs
//! asynchronously and [`GenerationTask::join`] waits for it.

use super::messages::{AudioFrame, GenerationId, LlmRequest, TextDelta};
use super::session::SessionEvent;
use super::turn::TurnInput;
use crate::audio::AudioFrameBus;
use crate::error::{StageError, StageKind};
use crate::stage::{DeltaStream, RetryPolicy, StageRun, StageSet, retry_with_backoff};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered deltas between LLM and TTS.
const DELTA_CHANNEL_CAPACITY: usize = 32;

/// Everything a response cycle needs from its session.
#[derive(Clone)]
pub struct GenerationContext {
    /// Provider adapters.
    pub stages: StageSet,
    /// Where synthesized audio goes.
    pub bus: Arc<AudioFrameBus>,
    /// Back channel to the session loop.
    pub events: mpsc::UnboundedSender<SessionEvent>,
    /// Start-up retry policy for LLM and TTS.
    pub retry: RetryPolicy,
    /// Spoken when the LLM fails recoverably or produces no audio.
    pub fallback_response: String,
}

/// Handle to an in-flight response cycle.
pub struct GenerationTask {
    id: GenerationId,
    interruptible: bool,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl GenerationTask {
    /// Start a response cycle for `request` under a child of `parent`.
    pub fn spawn(
        ctx: GenerationContext,
        id: GenerationId,
        interruptible: bool,
        request: LlmRequest,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        let handle = tokio::spawn(run_generation(ctx, id, request, token.clone()));
        Self {
            id,
            interruptible,
            token,
            handle,
        }
    }

    /// Identifier of the cycle.
    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// Whether barge-in may cancel this cycle.
    pub fn interruptible(&self) -> bool {
        self.interruptible
    }

    /// Signal cancellation. Returns immediately; safe to call repeatedly.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!(generation = %self.id, "generation cancel requested");
        }
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether teardown has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the cycle's task to finish.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(generation = %self.id, "generation task failed: {e}");
        }
    }
}

/// Drive one cycle and report its outcome to the session.
async fn run_generation(
    ctx: GenerationContext,
    id: GenerationId,
    request: LlmRequest,
    token: CancellationToken,
) {
    let outcome = respond(&ctx, id, request, &token).await;
    if token.is_cancelled() {
        let text = match outcome {
            Ok(reply) => reply.text,
            Err(_) => String::new(),
        };
        send(&ctx, SessionEvent::AgentReply {
            generation: id,
            text,
            interrupted: true,
        });
        return;
    }

    let reply = match outcome {
        Ok(reply) if reply.frames > 0 => Ok(reply),
        Ok(_) => {
            warn!(generation = %id, "response produced no audio; speaking fallback");
            speak_fallback(&ctx, id, &token).await
        }
        Err(e) if e.is_retryable() => {
            warn!(generation = %id, "response failed after retries: {e}; speaking fallback");
            speak_fallback(&ctx, id, &token).await
        }
        Err(e) => Err(e),
    };

    match reply {
        Ok(reply) if reply.frames > 0 || token.is_cancelled() => {
            ctx.bus.push_end(id);
            info!(generation = %id, frames = reply.frames, "response fully queued");
            send(&ctx, SessionEvent::AgentReply {
                generation: id,
                text: reply.text,
                interrupted: token.is_cancelled(),
            });
        }
        Ok(_) => send(&ctx, SessionEvent::GenerationFailed {
            generation: id,
            error: StageError::fatal(StageKind::Tts, "no audio produced, even for the fallback response"),
        }),
        Err(error) if error.cancelled => {}
        Err(error) => send(&ctx, SessionEvent::GenerationFailed {
            generation: id,
            error,
        }),
    }
}

/// What a cycle managed to say.
struct Reply {
    text: String,
    frames: usize,
}

/// Stream the LLM answer for `request` through TTS.
async fn respond(
    ctx: &GenerationContext,
    id: GenerationId,
    request: LlmRequest,
    token: &CancellationToken,
) -> Result<Reply, StageError> {
    let llm = {
        let stage = Arc::clone(&ctx.stages.llm);
        retry_with_backoff(&ctx.retry, StageKind::Llm, token, |_| {
            let stage = Arc::clone(&stage);
            let request = request.clone();
            let token = token.clone();
            async move { StageRun::start(&*stage, request, &token).await }
        })
        .await?
    };
    let (tts, delta_tx) = start_tts(ctx, token).await?;
    let (text, frames) = tokio::join!(pump_text(id, llm, delta_tx), pump_audio(ctx, id, tts));
    let text = text?;
    Ok(Reply {
        text,
        frames: frames?,
    })
}

/// Speak the configured fallback response.
async fn speak_fallback(
    ctx: &GenerationContext,
    id: GenerationId,
    token: &CancellationToken,
) -> Result<Reply, StageError> {
    let (tts, delta_tx) = start_tts(ctx, token).await?;
    let text = ctx.fallback_response.clone();
    let feed = async move {
        // The receiver only goes away if TTS stopped early.
        let _ = delta_tx.send(TextDelta::text(text)).await;
        let _ = delta_tx.send(TextDelta::end()).await;
    };
    let ((), frames) = tokio::join!(feed, pump_audio(ctx, id, tts));
    Ok(Reply {
        text: ctx.fallback_response.clone(),
        frames: frames?,
    })
}

async fn start_tts(
    ctx: &GenerationContext,
    token: &CancellationToken,
) -> Result<(StageRun<AudioFrame>, mpsc::Sender<TextDelta>), StageError> {
    let stage = Arc::clone(&ctx.stages.tts);
    retry_with_backoff(&ctx.retry, StageKind::Tts, token, |_| {
        let stage = Arc::clone(&stage);
        let token = token.clone();
        async move {
            let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
            let input: DeltaStream = Box::pin(ReceiverStream::new(rx));
            let run = StageRun::start(&*stage, input, &token).await?;
            Ok((run, tx))
        }
    })
    .await
}

/// Forward LLM deltas to TTS, returning the text generated.
///
/// A recoverable mid-stream failure ends the answer early; a fatal one is
/// returned. Dropping `tx` tells TTS the text is complete.
async fn pump_text(
    id: GenerationId,
    mut llm: StageRun<TextDelta>,
    tx: mpsc::Sender<TextDelta>,
) -> Result<String, StageError> {
    let mut text = String::new();
    while let Some(item) = llm.next().await {
        match item {
            Ok(delta) if delta.is_end => break,
            Ok(delta) => {
                text.push_str(&delta.text);
                if tx.send(delta).await.is_err() {
                    break;
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(generation = %id, "llm stream interrupted: {e}");
                if text.is_empty() {
                    return Err(e);
                }
                break;
            }
            Err(e) if e.cancelled => break,
            Err(e) => return Err(e),
        }
    }
    Ok(text)
}

/// Move synthesized frames onto the bus, reporting the first one.
async fn pump_audio(
    ctx: &GenerationContext,
    id: GenerationId,
    mut tts: StageRun<AudioFrame>,
) -> Result<usize, StageError> {
    let mut frames = 0_usize;
    while let Some(item) = tts.next().await {
        let frame = match item {
            Ok(frame) => frame,
            Err(e) if e.cancelled => break,
            Err(e) if frames > 0 && e.is_retryable() => {
                warn!(generation = %id, frames, "tts stream interrupted: {e}");
                break;
            }
            Err(e) => return Err(e),
        };
        if !ctx.bus.push_frame(id, frame).await {
            tts.cancel();
            break;
        }
        if frames == 0 {
            send(ctx, SessionEvent::Turn(TurnInput::FirstAudio(id)));
        }
        frames += 1;
    }
    Ok(frames)
}

fn send(ctx: &GenerationContext, event: SessionEvent) {
    // The session loop has already ended if this fails.
    let _ = ctx.events.send(event);
}
