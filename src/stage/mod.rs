//! Streaming pipeline stage contract shared by STT, LLM and TTS.
//!
//! A stage is started with its input and a [`CancellationToken`] and hands back
//! a lazy stream of results. Callers normally drive that stream through
//! [`StageRun`], which owns a child token and guarantees that nothing is
//! delivered after [`StageRun::cancel`], even if the provider keeps streaming.

pub mod retry;
pub mod scripted;

pub use retry::{RetryPolicy, retry_with_backoff};

use crate::error::{StageError, StageKind};
use crate::pipeline::messages::{AudioFrame, LlmRequest, TextDelta, TranscriptSegment};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lazy, possibly infinite sequence of stage results.
pub type StageStream<T> = Pin<Box<dyn Stream<Item = Result<T, StageError>> + Send>>;

/// Inbound audio fed to STT.
pub type FrameStream = Pin<Box<dyn Stream<Item = AudioFrame> + Send>>;

/// LLM output fed to TTS.
pub type DeltaStream = Pin<Box<dyn Stream<Item = TextDelta> + Send>>;

/// A streaming, cancellable pipeline stage.
///
/// Implementations must stop producing once `cancel` fires and release any
/// provider-side resources. Failures are reported as [`StageError`] items or as
/// an `Err` from `start`; a stage never ends a call on its own.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// What the stage consumes.
    type Input: Send + 'static;
    /// What the stage produces.
    type Output: Send + 'static;

    /// Which of the three stages this is.
    fn kind(&self) -> StageKind;

    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Begin processing `input`, producing results until the input is exhausted,
    /// the provider finishes, or `cancel` fires.
    async fn start(
        &self,
        input: Self::Input,
        cancel: CancellationToken,
    ) -> Result<StageStream<Self::Output>, StageError>;
}

/// Speech-to-text: audio frames in, transcript segments out.
pub type SttStage = dyn PipelineStage<Input = FrameStream, Output = TranscriptSegment>;

/// Language model: finalized utterance plus history in, text deltas out.
pub type LlmStage = dyn PipelineStage<Input = LlmRequest, Output = TextDelta>;

/// Text-to-speech: text deltas in, audio frames out.
pub type TtsStage = dyn PipelineStage<Input = DeltaStream, Output = AudioFrame>;

/// The three adapters a session runs with.
#[derive(Clone)]
pub struct StageSet {
    /// Speech-to-text adapter.
    pub stt: Arc<SttStage>,
    /// Language model adapter.
    pub llm: Arc<LlmStage>,
    /// Text-to-speech adapter.
    pub tts: Arc<TtsStage>,
}

/// A started stage whose output can be cut off at any time.
pub struct StageRun<T> {
    kind: StageKind,
    inner: StageStream<T>,
    token: CancellationToken,
    finished: bool,
}

impl<T: Send + 'static> StageRun<T> {
    /// Start `stage` under a child of `parent`.
    ///
    /// Cancelling `parent` cancels the run; cancelling the run leaves `parent`
    /// untouched.
    pub async fn start<S>(
        stage: &S,
        input: S::Input,
        parent: &CancellationToken,
    ) -> Result<Self, StageError>
    where
        S: PipelineStage<Output = T> + ?Sized,
    {
        let token = parent.child_token();
        let kind = stage.kind();
        if token.is_cancelled() {
            return Err(StageError::cancelled(kind));
        }
        debug!(stage = %kind, provider = stage.name(), "stage starting");
        let inner = stage.start(input, token.clone()).await?;
        Ok(Self {
            kind,
            inner,
            token,
            finished: false,
        })
    }

    /// Which stage is running.
    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Abort the run. Safe to call any number of times.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A handle that cancels this run from another task.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Next result, or `None` once the stage finished or was cancelled.
    pub async fn next(&mut self) -> Option<Result<T, StageError>> {
        if self.finished || self.token.is_cancelled() {
            self.finished = true;
            return None;
        }
        let item = tokio::select! {
            biased;
            () = self.token.cancelled() => None,
            item = self.inner.next() => item,
        };
        // A result racing with cancel() is dropped.
        if item.is_none() || self.token.is_cancelled() {
            self.finished = true;
            return None;
        }
        item
    }
}
