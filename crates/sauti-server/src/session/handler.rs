//! Session driver: WebSocket upgrade, control dispatch, dialogue state.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sauti_core::audio::{AudioFramer, AudioParams};
use sauti_core::dialogue::{DialogueHistory, DialogueState, Role, Turn, TurnPayload};
use sauti_core::error::Error;
use sauti_core::pool::ProviderSet;
use sauti_core::protocol::{
    ClientEnvelope, ImagePayload, ListenState, ServerEnvelope, TtsState,
};
use sauti_core::providers::{
    ChatTurn, ImageBlob, TranscriptEvent, TranscriptListener, VoiceConfig,
};
use sauti_core::segment::ToolCallEnvelope;
use sauti_core::task::{TaskDescriptor, TaskKind};

use super::turn::{spawn_turn, ActiveTurn, TurnConfig, TurnSource};
use super::{SessionCmd, SessionContext, TurnStatus};
use crate::auth::{authenticate, AuthDecision};
use crate::state::{AppState, SessionHandle};

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    match authenticate(&state.config.auth, &state.verifier, &headers) {
        AuthDecision::Reject { reason } => {
            warn!("rejecting upgrade: {reason}");
            (StatusCode::UNAUTHORIZED, reason).into_response()
        }
        AuthDecision::Admit { device_id } => {
            ws.on_upgrade(move |socket| handle_socket(socket, state, device_id))
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, device_id: Option<String>) {
    let client_id = Uuid::new_v4();

    // Lease before entering idle: exhaustion rejects the connection and
    // leaves existing sessions untouched.
    let providers = match state.pools.lease_set().await {
        Ok(providers) => providers,
        Err(err) => {
            warn!(client = %client_id, "provider lease failed: {err}");
            reject_socket(socket, &err).await;
            return;
        }
    };

    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(write_outbound(ws_tx, out_rx));

    let cancel = state.shutdown.child_token();
    state
        .register_session(
            client_id,
            SessionHandle {
                device_id: device_id.clone(),
                cancel: cancel.clone(),
            },
        )
        .await;
    info!(client = %client_id, device = ?device_id, "session established");

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (asr_tx, asr_rx) = mpsc::unbounded_channel();
    providers.asr.set_listener(asr_tx.clone()).await;

    let ctx = SessionContext {
        client_id,
        cancel: cancel.clone(),
        out_tx: out_tx.clone(),
        cmd_tx,
        pending_tts: Arc::new(AtomicUsize::new(0)),
    };

    let mut session = Session::new(state.clone(), ctx, providers, asr_tx, cmd_rx, asr_rx);
    let fatal = session.run(ws_rx).await;

    state.remove_session(&client_id).await;
    cancel.cancel();

    // Abort any in-flight synthesis before the set changes hands.
    let _ = session.providers.tts.reset().await;
    let providers = session.into_providers();
    if fatal {
        state.pools.discard_set(providers).await;
    } else {
        state.pools.release_set(providers).await;
    }

    drop(out_tx);
    let _ = writer.await;
    info!(client = %client_id, "session closed");
}

async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = out_rx.recv().await {
        if ws_tx.send(message).await.is_err() {
            break;
        }
    }
}

async fn reject_socket(mut socket: WebSocket, error: &Error) {
    let envelope = ServerEnvelope::Error {
        kind: error.kind(),
        message: error.to_string(),
    };
    let _ = socket.send(Message::Text(envelope.to_json().into())).await;
    let _ = socket.send(Message::Close(None)).await;
}

enum Flow {
    Continue,
    Close,
}

struct Session {
    state: AppState,
    ctx: SessionContext,
    providers: ProviderSet,
    asr_listener: TranscriptListener,
    cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
    asr_rx: mpsc::UnboundedReceiver<TranscriptEvent>,
    history: DialogueHistory,
    dialogue_state: DialogueState,
    audio_params: AudioParams,
    framer: AudioFramer,
    hello_done: bool,
    active_turn: Option<ActiveTurn>,
    next_turn_id: u64,
    fatal: bool,
}

impl Session {
    fn new(
        state: AppState,
        ctx: SessionContext,
        providers: ProviderSet,
        asr_listener: TranscriptListener,
        cmd_rx: mpsc::UnboundedReceiver<SessionCmd>,
        asr_rx: mpsc::UnboundedReceiver<TranscriptEvent>,
    ) -> Self {
        let dialogue = &state.config.dialogue;
        let history = DialogueHistory::new(dialogue.system_prompt.clone(), dialogue.max_turns);
        let audio_params = AudioParams::default();
        Self {
            state,
            ctx,
            providers,
            asr_listener,
            cmd_rx,
            asr_rx,
            history,
            dialogue_state: DialogueState::Idle,
            audio_params,
            framer: AudioFramer::new(audio_params),
            hello_done: false,
            active_turn: None,
            next_turn_id: 0,
            fatal: false,
        }
    }

    fn into_providers(self) -> ProviderSet {
        self.providers
    }

    /// Drive the session until the transport closes, the scope fires, or a
    /// fatal error ends it. Returns whether the provider set must be
    /// destroyed rather than re-pooled.
    async fn run(&mut self, mut ws_rx: SplitStream<WebSocket>) -> bool {
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => {
                    self.dialogue_state = DialogueState::Closing;
                    break;
                }
                message = ws_rx.next() => {
                    match message {
                        None => break,
                        Some(Err(err)) => {
                            debug!(client = %self.ctx.client_id, "transport receive error: {err}");
                            break;
                        }
                        Some(Ok(message)) => match self.handle_message(message).await {
                            Flow::Continue => {}
                            Flow::Close => break,
                        },
                    }
                }
                Some(event) = self.asr_rx.recv() => {
                    self.handle_transcript(event);
                }
                Some(cmd) = self.cmd_rx.recv() => {
                    match self.handle_cmd(cmd).await {
                        Flow::Continue => {}
                        Flow::Close => break,
                    }
                }
            }
        }

        if let Some(turn) = self.active_turn.take() {
            turn.cancel.cancel();
        }
        self.fatal
    }

    async fn handle_message(&mut self, message: Message) -> Flow {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEnvelope>(text.as_str()) {
                Ok(envelope) => self.handle_envelope(envelope).await,
                Err(err) => {
                    self.ctx
                        .send_error(&Error::Protocol(format!("invalid envelope: {err}")));
                    Flow::Continue
                }
            },
            Message::Binary(data) => {
                self.handle_audio(data).await;
                Flow::Continue
            }
            Message::Ping(payload) => {
                let _ = self.ctx.out_tx.send(Message::Pong(payload));
                Flow::Continue
            }
            Message::Close(_) => Flow::Close,
            Message::Pong(_) => Flow::Continue,
        }
    }

    async fn handle_envelope(&mut self, envelope: ClientEnvelope) -> Flow {
        if !self.hello_done && !matches!(envelope, ClientEnvelope::Hello { .. }) {
            self.ctx.send_error(&Error::Protocol(
                "hello must be the first message".to_string(),
            ));
            return Flow::Continue;
        }

        match envelope {
            ClientEnvelope::Hello { audio_params, .. } => {
                self.audio_params = audio_params;
                self.framer = AudioFramer::new(audio_params);
                self.hello_done = true;
                self.dialogue_state = DialogueState::Idle;
                self.ctx.send_envelope(ServerEnvelope::Hello {
                    transport: "websocket",
                    session_id: self.ctx.client_id.to_string(),
                    audio_params,
                });
                Flow::Continue
            }
            ClientEnvelope::Listen { state, text } => {
                self.handle_listen(state, text).await;
                Flow::Continue
            }
            ClientEnvelope::Abort { reason } => {
                debug!(client = %self.ctx.client_id, reason = ?reason, "abort requested");
                if self.turn_in_progress() {
                    self.barge_in().await;
                }
                self.dialogue_state = DialogueState::Idle;
                Flow::Continue
            }
            ClientEnvelope::ImageQuery { image, text } => {
                self.handle_image_query(image, text).await;
                Flow::Continue
            }
            ClientEnvelope::Iot { payload } => {
                debug!(client = %self.ctx.client_id, ?payload, "iot descriptor received");
                Flow::Continue
            }
            ClientEnvelope::Mcp { payload } => {
                debug!(client = %self.ctx.client_id, ?payload, "mcp payload received");
                Flow::Continue
            }
            ClientEnvelope::Goodbye {} => {
                self.dialogue_state = DialogueState::Closing;
                self.ctx.send_envelope(ServerEnvelope::Goodbye {});
                Flow::Close
            }
        }
    }

    async fn handle_listen(&mut self, state: ListenState, wake_word: Option<String>) {
        match state {
            ListenState::Start => {
                if self.turn_in_progress() {
                    self.barge_in().await;
                }
                self.dialogue_state = DialogueState::Listening;
            }
            ListenState::Stop => {
                if self.dialogue_state != DialogueState::Listening {
                    debug!(client = %self.ctx.client_id, "listen stop outside listening state");
                    return;
                }
                self.dialogue_state = DialogueState::Transcribing;
                let asr = Arc::clone(&self.providers.asr);
                let cmd_tx = self.ctx.cmd_tx.clone();
                // The transcript itself arrives on the listener channel.
                tokio::spawn(async move {
                    if let Err(error) = asr.finalize().await {
                        let _ = cmd_tx.send(SessionCmd::AsrFailed { error });
                    }
                });
            }
            ListenState::Detect => {
                debug!(client = %self.ctx.client_id, wake_word = ?wake_word, "wake word detected");
            }
        }
    }

    async fn handle_audio(&mut self, data: Bytes) {
        if self.dialogue_state != DialogueState::Listening {
            debug!(client = %self.ctx.client_id, "dropping audio outside listening state");
            return;
        }
        let frame = match self.framer.wrap_wire(data) {
            Ok(frame) => frame,
            Err(err) => {
                self.ctx.send_error(&err);
                return;
            }
        };
        match self.providers.asr.add_audio(&frame).await {
            Ok(()) => {}
            Err(Error::ProviderBusy(_)) => {
                debug!(client = %self.ctx.client_id, "asr busy, frame dropped");
            }
            Err(err) => {
                warn!(client = %self.ctx.client_id, "asr add_audio failed: {err}");
            }
        }
    }

    fn handle_transcript(&mut self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::Partial(text) => {
                debug!(client = %self.ctx.client_id, "partial transcript: {text}");
            }
            TranscriptEvent::Final(text) => {
                if !matches!(
                    self.dialogue_state,
                    DialogueState::Listening | DialogueState::Transcribing
                ) {
                    debug!(client = %self.ctx.client_id, "stale transcript dropped");
                    return;
                }
                let text = text.trim().to_string();
                self.ctx.send_envelope(ServerEnvelope::Stt { text: text.clone() });
                if text.is_empty() {
                    self.dialogue_state = DialogueState::Idle;
                    return;
                }
                self.history.push(Turn::text(Role::User, text));
                self.spawn_chat_turn(true);
            }
        }
    }

    async fn handle_image_query(&mut self, image: ImagePayload, query: String) {
        if self.turn_in_progress() {
            self.barge_in().await;
        }

        let data = match BASE64.decode(image.data.as_bytes()) {
            Ok(data) => Bytes::from(data),
            Err(err) => {
                self.ctx
                    .send_error(&Error::Protocol(format!("invalid image payload: {err}")));
                return;
            }
        };

        if self.providers.vlllm.is_some() {
            // History snapshot excludes the query turn; the provider carries
            // the image out of band.
            let turns = ChatTurn::from_history(&self.history);
            self.history.push(Turn {
                role: Role::User,
                payload: TurnPayload::Multimodal {
                    text: query.clone(),
                    image_format: image.format.clone(),
                },
            });
            let source = TurnSource::Vision {
                turns,
                image: ImageBlob {
                    format: image.format,
                    data,
                },
                query,
            };
            self.spawn_source_turn(source, true);
        } else {
            // Degrade: the LLM sees a textual placeholder for the image.
            let placeholder = format!("[图片:{}] {}", image.format, query);
            self.history.push(Turn::text(Role::User, placeholder));
            self.spawn_chat_turn(true);
        }
    }

    async fn handle_cmd(&mut self, cmd: SessionCmd) -> Flow {
        match cmd {
            SessionCmd::AssistantText { turn_id, text } => {
                if self.is_current_turn(turn_id) {
                    self.history.push(Turn::text(Role::Assistant, text));
                }
                Flow::Continue
            }
            SessionCmd::ToolCall { turn_id, envelope } => {
                if self.is_current_turn(turn_id) {
                    self.submit_tool_call(envelope);
                }
                Flow::Continue
            }
            SessionCmd::ToolResult { tool, result } => {
                self.handle_tool_result(tool, result);
                Flow::Continue
            }
            SessionCmd::Speaking { turn_id } => {
                if self.is_current_turn(turn_id)
                    && self.dialogue_state == DialogueState::Generating
                {
                    self.dialogue_state = DialogueState::Speaking;
                }
                Flow::Continue
            }
            SessionCmd::TurnFinished { turn_id, status } => {
                if !self.is_current_turn(turn_id) {
                    return Flow::Continue;
                }
                self.active_turn = None;
                self.finish_turn(status).await
            }
            SessionCmd::AsrFailed { error } => {
                warn!(client = %self.ctx.client_id, "asr finalisation failed: {error}");
                match error {
                    Error::ProviderFatal(message) => {
                        self.finish_turn(TurnStatus::Fatal { message }).await
                    }
                    other => {
                        self.finish_turn(TurnStatus::Transient {
                            message: other.to_string(),
                            apology: "【ASR服务响应异常】".to_string(),
                        })
                        .await
                    }
                }
            }
        }
    }

    async fn finish_turn(&mut self, status: TurnStatus) -> Flow {
        match status {
            TurnStatus::Completed => {
                self.dialogue_state = DialogueState::Idle;
                Flow::Continue
            }
            TurnStatus::Transient { message, apology } => {
                warn!(client = %self.ctx.client_id, "transient provider failure: {message}");
                self.reset_providers().await;
                self.speak_fallback(apology);
                self.dialogue_state = DialogueState::Idle;
                Flow::Continue
            }
            TurnStatus::Fatal { message } => {
                let error = Error::ProviderFatal(message);
                warn!(client = %self.ctx.client_id, "fatal provider failure: {error}");
                self.ctx.send_error(&error);
                self.fatal = true;
                self.dialogue_state = DialogueState::Closing;
                Flow::Close
            }
        }
    }

    /// Reset the leased providers in place after a transient fault. The ASR
    /// listener is re-installed because reset clears it.
    async fn reset_providers(&mut self) {
        for (name, result) in [
            ("asr", self.providers.asr.reset().await),
            ("llm", self.providers.llm.reset().await),
            ("tts", self.providers.tts.reset().await),
        ] {
            if let Err(err) = result {
                warn!(client = %self.ctx.client_id, provider = name, "reset failed: {err}");
            }
        }
        if let Some(vlllm) = &self.providers.vlllm {
            if let Err(err) = vlllm.reset().await {
                warn!(client = %self.ctx.client_id, provider = "vlllm", "reset failed: {err}");
            }
        }
        self.providers
            .asr
            .set_listener(self.asr_listener.clone())
            .await;
    }

    /// Surface the apology sentinel as speech, degrading to an error
    /// envelope when synthesis itself is down.
    fn speak_fallback(&self, apology: String) {
        let ctx = self.ctx.clone();
        let tts = Arc::clone(&self.providers.tts);
        let voice = self.voice_config();
        let params = self.audio_params;
        tokio::spawn(async move {
            ctx.send_envelope(ServerEnvelope::Tts {
                state: TtsState::Start,
                text: None,
                index: None,
            });
            match tts.synthesise(&apology, &voice, params).await {
                Ok(mut frames) => {
                    while let Some(frame) = frames.recv().await {
                        match frame {
                            Ok(frame) => {
                                if ctx.out_tx.send(Message::Binary(frame.data)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                ctx.send_error(&err);
                                break;
                            }
                        }
                    }
                }
                Err(err) => ctx.send_error(&err),
            }
            ctx.send_envelope(ServerEnvelope::Tts {
                state: TtsState::Stop,
                text: None,
                index: None,
            });
        });
    }

    fn submit_tool_call(&mut self, envelope: ToolCallEnvelope) {
        let Some(turn) = self.active_turn.as_ref() else {
            return;
        };
        let tools = Arc::clone(&self.state.tools);
        let tool = envelope.tool.clone();
        let args = envelope.args.clone();
        let cmd_tx = self.ctx.cmd_tx.clone();
        let callback_tool = envelope.tool.clone();

        let descriptor = TaskDescriptor {
            client_id: self.ctx.client_id.to_string(),
            kind: TaskKind::ToolCall,
            work: Box::pin(async move { tools.dispatch(&tool, args).await }),
            callback: Box::new(move |outcome| {
                let _ = cmd_tx.send(SessionCmd::ToolResult {
                    tool: callback_tool,
                    result: outcome.result,
                });
            }),
            cancel: turn.cancel.clone(),
        };

        if let Err(err) = self.state.tasks.submit(descriptor) {
            // The quota refusal is logged; the turn continues without the
            // tool result.
            warn!(client = %self.ctx.client_id, "tool task rejected: {err}");
        }
    }

    fn handle_tool_result(
        &mut self,
        tool: String,
        result: sauti_core::Result<serde_json::Value>,
    ) {
        let content = match result {
            Ok(value) => value.to_string(),
            Err(err) => serde_json::json!({ "error": err.to_string() }).to_string(),
        };
        self.history
            .push(Turn::text(Role::Tool, format!("{tool}: {content}")));

        // One follow-up generation pass on the augmented history, unless the
        // client has already moved on to a new utterance.
        if self.active_turn.is_none()
            && matches!(
                self.dialogue_state,
                DialogueState::Idle | DialogueState::Generating
            )
        {
            self.spawn_chat_turn(false);
        }
    }

    fn spawn_chat_turn(&mut self, allow_tool_calls: bool) {
        let turns = ChatTurn::from_history(&self.history);
        self.spawn_source_turn(TurnSource::Chat { turns }, allow_tool_calls);
    }

    fn spawn_source_turn(&mut self, source: TurnSource, allow_tool_calls: bool) {
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        let config = TurnConfig {
            turn_id,
            allow_tool_calls,
            max_sentence_chars: self.state.config.dialogue.max_sentence_chars,
            voice: self.voice_config(),
            audio_params: self.audio_params,
        };
        let turn = spawn_turn(
            self.ctx.clone(),
            Arc::clone(&self.providers.llm),
            self.providers.vlllm.as_ref().map(Arc::clone),
            Arc::clone(&self.providers.tts),
            source,
            config,
        );
        self.active_turn = Some(turn);
        self.dialogue_state = DialogueState::Generating;
    }

    fn voice_config(&self) -> VoiceConfig {
        VoiceConfig {
            voice: self.state.config.providers.tts.voice.clone(),
            speed: None,
        }
    }

    fn turn_in_progress(&self) -> bool {
        matches!(
            self.dialogue_state,
            DialogueState::Generating | DialogueState::Speaking
        ) || self.active_turn.is_some()
    }

    fn is_current_turn(&self, turn_id: u64) -> bool {
        self.active_turn
            .as_ref()
            .is_some_and(|turn| turn.turn_id == turn_id)
    }

    /// Cancel the in-flight turn: the LLM stream is dropped, queued
    /// sentences die with the task, TTS aborts, and buffered frames are
    /// left to flush.
    async fn barge_in(&mut self) {
        self.dialogue_state = DialogueState::Interrupted;
        if let Some(turn) = self.active_turn.take() {
            turn.cancel.cancel();
        }
        if let Err(err) = self.providers.tts.reset().await {
            warn!(client = %self.ctx.client_id, "tts reset on barge-in failed: {err}");
        }
        self.ctx.send_envelope(ServerEnvelope::Tts {
            state: TtsState::Stop,
            text: None,
            index: None,
        });
    }
}
