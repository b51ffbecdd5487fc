//! Uniform streaming contracts over heterogeneous model back-ends.
//!
//! All four provider kinds are bounded, reusable stream adapters with an
//! explicit [`Provider::reset`] between uses. Instances are constructed by
//! registered factories (see [`registry`]), pre-initialised by the pool
//! manager, and leased to sessions as a coherent [`crate::pool::ProviderSet`].

pub mod openai;
pub mod registry;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::audio::{AudioFrame, AudioParams};
use crate::dialogue::{DialogueHistory, Role};
use crate::error::Result;

/// One chat turn in provider wire shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    /// Snapshot a dialogue history for a provider call.
    pub fn from_history(history: &DialogueHistory) -> Vec<ChatTurn> {
        history
            .snapshot()
            .into_iter()
            .map(|(role, content)| ChatTurn { role, content })
            .collect()
    }
}

/// Incremental and final transcripts delivered to the ASR listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Partial(String),
    Final(String),
}

pub type TranscriptListener = mpsc::UnboundedSender<TranscriptEvent>;

/// Finite, non-restartable token stream. Dropping the receiver cancels the
/// producer at its next send.
pub type TokenStream = mpsc::Receiver<Result<String>>;

/// Ordered synthesis output in the session's negotiated codec.
pub type FrameStream = mpsc::Receiver<Result<AudioFrame>>;

/// A decoded image blob plus its format tag. Providers do their own
/// vendor-shaped encoding (base64, URL, ...).
#[derive(Debug, Clone)]
pub struct ImageBlob {
    pub format: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct VoiceConfig {
    pub voice: Option<String>,
    pub speed: Option<f32>,
}

/// Lifecycle shared by all provider kinds. `initialize` and `cleanup` are
/// idempotent; `reset` is cheap and called between leases.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn initialize(&self) -> Result<()>;

    async fn cleanup(&self) -> Result<()>;

    async fn reset(&self) -> Result<()>;
}

/// Streaming speech recognition.
#[async_trait]
pub trait AsrProvider: Provider {
    /// Buffer one utterance frame. Fails with
    /// [`crate::error::Error::ProviderBusy`] while a prior utterance's
    /// finalisation is pending.
    async fn add_audio(&self, frame: &AudioFrame) -> Result<()>;

    async fn set_listener(&self, listener: TranscriptListener);

    async fn take_listener(&self) -> Option<TranscriptListener>;

    /// Signal end of utterance. The final transcript is delivered to the
    /// installed listener.
    async fn finalize(&self) -> Result<()>;
}

/// Streaming text generation.
#[async_trait]
pub trait LlmProvider: Provider {
    /// `<think>…</think>` spans are suppressed before tokens surface.
    async fn respond(&self, turns: Vec<ChatTurn>) -> Result<TokenStream>;
}

/// Vision-capable streaming text generation.
#[async_trait]
pub trait VlllmProvider: Provider {
    async fn respond_with_image(
        &self,
        turns: Vec<ChatTurn>,
        image: ImageBlob,
        query: &str,
    ) -> Result<TokenStream>;
}

/// Streaming speech synthesis.
#[async_trait]
pub trait TtsProvider: Provider {
    /// Frames arrive already in the codec declared by `params`. `reset`
    /// aborts an in-flight synthesis.
    async fn synthesise(
        &self,
        text: &str,
        voice: &VoiceConfig,
        params: AudioParams,
    ) -> Result<FrameStream>;
}
