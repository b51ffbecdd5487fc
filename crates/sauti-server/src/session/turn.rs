//! One generation turn: LLM stream → sentence segmentation → ordered TTS.
//!
//! A turn runs on its own task inside the session scope. Sentences are
//! synthesised strictly in stream order and there is never concurrent
//! synthesis of two sentences on one session; barge-in cancels the task's
//! token and the queued remainder dies with it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sauti_core::audio::AudioParams;
use sauti_core::error::Error;
use sauti_core::protocol::{ServerEnvelope, TtsState};
use sauti_core::providers::{
    ChatTurn, ImageBlob, LlmProvider, TokenStream, TtsProvider, VlllmProvider, VoiceConfig,
};
use sauti_core::segment::{SegmentEvent, Sentence, SentenceSegmenter};

use super::{SessionCmd, SessionContext, TurnStatus};

pub struct TurnConfig {
    pub turn_id: u64,
    pub allow_tool_calls: bool,
    pub max_sentence_chars: usize,
    pub voice: VoiceConfig,
    pub audio_params: AudioParams,
}

/// What the turn generates from.
pub enum TurnSource {
    Chat {
        turns: Vec<ChatTurn>,
    },
    /// The image is passed to the provider out of band; `turns` must not
    /// already contain the image query.
    Vision {
        turns: Vec<ChatTurn>,
        image: ImageBlob,
        query: String,
    },
}

pub struct ActiveTurn {
    pub turn_id: u64,
    pub cancel: CancellationToken,
    pub handle: tokio::task::JoinHandle<()>,
}

pub fn spawn_turn(
    ctx: SessionContext,
    llm: Arc<dyn LlmProvider>,
    vlllm: Option<Arc<dyn VlllmProvider>>,
    tts: Arc<dyn TtsProvider>,
    source: TurnSource,
    config: TurnConfig,
) -> ActiveTurn {
    let cancel = ctx.cancel.child_token();
    let turn_id = config.turn_id;
    let task_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        let status = run_turn(&ctx, &task_cancel, llm, vlllm, tts, source, &config).await;
        if task_cancel.is_cancelled() {
            // Barge-in or session teardown: the driver has already moved on.
            return;
        }
        let _ = ctx.cmd_tx.send(SessionCmd::TurnFinished { turn_id, status });
    });
    ActiveTurn {
        turn_id,
        cancel,
        handle,
    }
}

async fn run_turn(
    ctx: &SessionContext,
    cancel: &CancellationToken,
    llm: Arc<dyn LlmProvider>,
    vlllm: Option<Arc<dyn VlllmProvider>>,
    tts: Arc<dyn TtsProvider>,
    source: TurnSource,
    config: &TurnConfig,
) -> TurnStatus {
    let (mut tokens, component) = match open_stream(llm, vlllm, source).await {
        Ok(opened) => opened,
        Err((err, component)) => return status_from_error(err, component),
    };

    let mut segmenter = SentenceSegmenter::new(config.max_sentence_chars);
    let mut pipeline = TtsPipeline {
        ctx,
        cancel,
        tts,
        config,
        speaking: false,
        spoke_prose: false,
    };
    let mut assistant_text = String::new();

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return TurnStatus::Completed,
            item = tokens.recv() => item,
        };
        match item {
            Some(Ok(token)) => {
                assistant_text.push_str(&token);
                for event in segmenter.push(&token) {
                    if let Some(status) = pipeline.handle_event(event).await {
                        pipeline.finish();
                        return status;
                    }
                }
            }
            Some(Err(err)) => {
                pipeline.finish();
                return status_from_error(err, component);
            }
            None => break,
        }
    }

    for event in segmenter.finish() {
        if let Some(status) = pipeline.handle_event(event).await {
            pipeline.finish();
            return status;
        }
    }
    pipeline.finish();

    if pipeline.spoke_prose && !cancel.is_cancelled() {
        let text = assistant_text.trim().to_string();
        if !text.is_empty() {
            let _ = ctx.cmd_tx.send(SessionCmd::AssistantText {
                turn_id: config.turn_id,
                text,
            });
        }
    }
    TurnStatus::Completed
}

async fn open_stream(
    llm: Arc<dyn LlmProvider>,
    vlllm: Option<Arc<dyn VlllmProvider>>,
    source: TurnSource,
) -> Result<(TokenStream, &'static str), (Error, &'static str)> {
    match source {
        TurnSource::Chat { turns } => llm
            .respond(turns)
            .await
            .map(|stream| (stream, "LLM"))
            .map_err(|err| (err, "LLM")),
        TurnSource::Vision {
            turns,
            image,
            query,
        } => match vlllm {
            Some(vlllm) => vlllm
                .respond_with_image(turns, image, &query)
                .await
                .map(|stream| (stream, "VLLLM"))
                .map_err(|err| (err, "VLLLM")),
            // The driver degrades to a text placeholder before spawning,
            // so a missing VLLLM here is a wiring bug.
            None => Err((
                Error::Internal("vision turn without VLLLM provider".to_string()),
                "VLLLM",
            )),
        },
    }
}

struct TtsPipeline<'a> {
    ctx: &'a SessionContext,
    cancel: &'a CancellationToken,
    tts: Arc<dyn TtsProvider>,
    config: &'a TurnConfig,
    speaking: bool,
    spoke_prose: bool,
}

impl TtsPipeline<'_> {
    /// Returns `Some(status)` when the turn must end early.
    async fn handle_event(&mut self, event: SegmentEvent) -> Option<TurnStatus> {
        match event {
            SegmentEvent::Sentence(sentence) => self.speak_sentence(sentence).await,
            SegmentEvent::ToolCall(envelope) => {
                if self.config.allow_tool_calls {
                    let _ = self.ctx.cmd_tx.send(SessionCmd::ToolCall {
                        turn_id: self.config.turn_id,
                        envelope,
                    });
                } else {
                    warn!(tool = %envelope.tool, "ignoring nested tool call in follow-up pass");
                }
                None
            }
        }
    }

    async fn speak_sentence(&mut self, sentence: Sentence) -> Option<TurnStatus> {
        self.ctx.pending_tts.fetch_add(1, Ordering::SeqCst);
        let result = self.speak_sentence_inner(&sentence).await;
        self.ctx.pending_tts.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn speak_sentence_inner(&mut self, sentence: &Sentence) -> Option<TurnStatus> {
        if !self.speaking {
            self.speaking = true;
            self.ctx.send_envelope(ServerEnvelope::Tts {
                state: TtsState::Start,
                text: None,
                index: None,
            });
            self.ctx.send_envelope(ServerEnvelope::Audio {
                audio_params: self.config.audio_params,
            });
            let _ = self.ctx.cmd_tx.send(SessionCmd::Speaking {
                turn_id: self.config.turn_id,
            });
        }
        self.spoke_prose = true;

        self.ctx.send_envelope(ServerEnvelope::Llm {
            text: sentence.text.clone(),
        });
        self.ctx.send_envelope(ServerEnvelope::Tts {
            state: TtsState::SentenceStart,
            text: Some(sentence.text.clone()),
            index: Some(sentence.index),
        });

        let mut frames = match self
            .tts
            .synthesise(&sentence.text, &self.config.voice, self.config.audio_params)
            .await
        {
            Ok(frames) => frames,
            Err(err) => return Some(status_from_error(err, "TTS")),
        };

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Some(TurnStatus::Completed),
                frame = frames.recv() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    if self
                        .ctx
                        .out_tx
                        .send(Message::Binary(frame.data))
                        .is_err()
                    {
                        debug!("transport writer gone mid-sentence");
                        return Some(TurnStatus::Completed);
                    }
                }
                Some(Err(err)) => return Some(status_from_error(err, "TTS")),
                None => break,
            }
        }

        self.ctx.send_envelope(ServerEnvelope::Tts {
            state: TtsState::SentenceEnd,
            text: None,
            index: Some(sentence.index),
        });
        None
    }

    /// Close the TTS bracket if it was opened.
    fn finish(&mut self) {
        if self.speaking {
            self.ctx.send_envelope(ServerEnvelope::Tts {
                state: TtsState::Stop,
                text: None,
                index: None,
            });
        }
    }
}

fn status_from_error(error: Error, component: &'static str) -> TurnStatus {
    match error {
        Error::ProviderFatal(message) => TurnStatus::Fatal { message },
        Error::ProviderTransient(message) | Error::ProviderBusy(message) => TurnStatus::Transient {
            message,
            apology: format!("【{component}服务响应异常】"),
        },
        other => TurnStatus::Transient {
            message: other.to_string(),
            apology: format!("【{component}服务响应异常】"),
        },
    }
}
