//! OpenAI-compatible vendor integrations for all four provider kinds.
//!
//! Works against any endpoint speaking the OpenAI surface (OpenAI itself,
//! OpenRouter, Ollama, vLLM gateways). Wire details stay confined to this
//! module; the rest of the gateway sees only the provider contracts.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::audio::{pcm16le_to_wav, AudioCodec, AudioFramer, AudioParams};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::providers::registry::{AsrFactory, LlmFactory, TtsFactory, VlllmFactory};
use crate::providers::{
    AsrProvider, ChatTurn, FrameStream, ImageBlob, LlmProvider, Provider, TokenStream,
    TranscriptEvent, TranscriptListener, TtsProvider, VlllmProvider, VoiceConfig,
};
use crate::segment::ThinkFilter;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Vision requests carry a fixed deadline; the other calls stream and are
/// bounded by session cancellation instead.
const VISION_TIMEOUT: Duration = Duration::from_secs(30);

const TOKEN_CHANNEL_CAPACITY: usize = 32;
const FRAME_CHANNEL_CAPACITY: usize = 32;

fn http_client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(format!("sauti-gateway/{}", env!("CARGO_PKG_VERSION")));
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| Error::ProviderFatal(format!("http client init: {e}")))
}

fn effective_base_url(config: &ProviderConfig) -> String {
    let base = config.base_url.trim();
    let base = if base.is_empty() { DEFAULT_BASE_URL } else { base };
    base.trim_end_matches('/').to_string()
}

fn transport_error(context: &str, err: reqwest::Error) -> Error {
    Error::ProviderTransient(format!("{context}: {err}"))
}

/// 5xx responses are retryable vendor faults; anything else (bad key, bad
/// model, malformed request) will not get better on retry.
fn status_error(context: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let detail = body.chars().take(200).collect::<String>();
    if status.is_server_error() {
        Error::ProviderTransient(format!("{context}: {status} {detail}"))
    } else {
        Error::ProviderFatal(format!("{context}: {status} {detail}"))
    }
}

fn check_credentials(config: &ProviderConfig) -> Result<()> {
    if config.api_key.is_empty() && effective_base_url(config) == DEFAULT_BASE_URL {
        return Err(Error::ProviderFatal(
            "api_key is required for the hosted endpoint".to_string(),
        ));
    }
    Ok(())
}

fn authorize(req: reqwest::RequestBuilder, config: &ProviderConfig) -> reqwest::RequestBuilder {
    if config.api_key.is_empty() {
        req
    } else {
        req.bearer_auth(&config.api_key)
    }
}

fn chat_messages(turns: &[ChatTurn]) -> Vec<Value> {
    turns
        .iter()
        .map(|t| json!({"role": t.role.as_str(), "content": t.content}))
        .collect()
}

fn chat_body(config: &ProviderConfig, messages: Vec<Value>) -> Value {
    let mut body = json!({
        "model": config.model,
        "messages": messages,
        "stream": true,
    });
    if let Value::Object(map) = &mut body {
        for (key, value) in &config.extra {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    body
}

/// Extract the content delta from one SSE `data:` payload.
fn sse_delta(data: &str) -> Option<String> {
    let value: Value = serde_json::from_str(data).ok()?;
    value["choices"][0]["delta"]["content"]
        .as_str()
        .map(|s| s.to_string())
}

/// Drive one streaming chat response into a token channel, suppressing
/// `<think>` spans. Exits early when the receiver is dropped.
async fn pump_sse_tokens(response: reqwest::Response, tx: mpsc::Sender<Result<String>>) {
    let mut filter = ThinkFilter::new();
    let mut stream = response.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = tx.send(Err(transport_error("chat stream", err))).await;
                return;
            }
        };
        buf.extend_from_slice(&chunk);

        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                send_tail(&mut filter, &tx).await;
                return;
            }
            if let Some(delta) = sse_delta(data) {
                let visible = filter.push(&delta);
                if !visible.is_empty() && tx.send(Ok(visible)).await.is_err() {
                    return;
                }
            }
        }
    }
    send_tail(&mut filter, &tx).await;
}

async fn send_tail(filter: &mut ThinkFilter, tx: &mpsc::Sender<Result<String>>) {
    let tail = filter.finish();
    if !tail.is_empty() {
        let _ = tx.send(Ok(tail)).await;
    }
}

// ---------------------------------------------------------------------------
// ASR

#[derive(Debug, Default)]
struct UtteranceBuffer {
    data: Vec<u8>,
    codec: Option<AudioCodec>,
    sample_rate: u32,
    channels: u16,
    finalizing: bool,
}

/// Buffers utterance frames and transcribes them through the
/// `/audio/transcriptions` endpoint on finalisation.
pub struct OpenAiAsr {
    config: ProviderConfig,
    client: reqwest::Client,
    buffer: Mutex<UtteranceBuffer>,
    listener: Mutex<Option<TranscriptListener>>,
}

impl OpenAiAsr {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(None)?,
            config,
            buffer: Mutex::new(UtteranceBuffer::default()),
            listener: Mutex::new(None),
        })
    }

    async fn transcribe(&self, buffer: UtteranceBuffer) -> Result<String> {
        if buffer.data.is_empty() {
            return Ok(String::new());
        }

        let (bytes, file_name, mime) = match buffer.codec {
            Some(AudioCodec::Pcm16le) => (
                pcm16le_to_wav(&buffer.data, buffer.sample_rate, buffer.channels),
                "audio.wav",
                "audio/wav",
            ),
            _ => (buffer.data, "audio.opus", "audio/opus"),
        };

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| Error::Internal(format!("multipart: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.config.model.clone())
            .part("file", part);

        let url = format!("{}/audio/transcriptions", effective_base_url(&self.config));
        let response = authorize(self.client.post(url), &self.config)
            .multipart(form)
            .send()
            .await
            .map_err(|e| transport_error("transcription", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("transcription", status, &body));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| transport_error("transcription body", e))?;
        Ok(value["text"].as_str().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl Provider for OpenAiAsr {
    async fn initialize(&self) -> Result<()> {
        check_credentials(&self.config)
    }

    async fn cleanup(&self) -> Result<()> {
        debug!(kind = "asr", "provider cleanup");
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        *self.buffer.lock().await = UtteranceBuffer::default();
        self.listener.lock().await.take();
        Ok(())
    }
}

#[async_trait]
impl AsrProvider for OpenAiAsr {
    async fn add_audio(&self, frame: &crate::audio::AudioFrame) -> Result<()> {
        let mut buffer = self.buffer.lock().await;
        if buffer.finalizing {
            return Err(Error::ProviderBusy(
                "utterance finalisation pending".to_string(),
            ));
        }
        buffer.codec = Some(frame.codec);
        buffer.sample_rate = frame.sample_rate;
        buffer.channels = frame.channels;
        buffer.data.extend_from_slice(&frame.data);
        Ok(())
    }

    async fn set_listener(&self, listener: TranscriptListener) {
        *self.listener.lock().await = Some(listener);
    }

    async fn take_listener(&self) -> Option<TranscriptListener> {
        self.listener.lock().await.take()
    }

    async fn finalize(&self) -> Result<()> {
        let pending = {
            let mut buffer = self.buffer.lock().await;
            if buffer.finalizing {
                return Err(Error::ProviderBusy(
                    "utterance finalisation pending".to_string(),
                ));
            }
            std::mem::replace(
                &mut *buffer,
                UtteranceBuffer {
                    finalizing: true,
                    ..UtteranceBuffer::default()
                },
            )
        };

        let result = self.transcribe(pending).await;
        self.buffer.lock().await.finalizing = false;

        let text = result?;
        if let Some(listener) = self.listener.lock().await.as_ref() {
            let _ = listener.send(TranscriptEvent::Final(text));
        }
        Ok(())
    }
}

pub struct OpenAiAsrFactory;

#[async_trait]
impl AsrFactory for OpenAiAsrFactory {
    async fn create(&self, config: &ProviderConfig) -> Result<std::sync::Arc<dyn AsrProvider>> {
        Ok(std::sync::Arc::new(OpenAiAsr::new(config.clone())?))
    }
}

// ---------------------------------------------------------------------------
// LLM

pub struct OpenAiLlm {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(None)?,
            config,
        })
    }

    async fn open_stream(&self, body: Value, timeout: Option<Duration>) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", effective_base_url(&self.config));
        let mut request = authorize(self.client.post(url), &self.config).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error("chat completion", e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("chat completion", status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiLlm {
    async fn initialize(&self) -> Result<()> {
        check_credentials(&self.config)
    }

    async fn cleanup(&self) -> Result<()> {
        debug!(kind = "llm", "provider cleanup");
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlm {
    async fn respond(&self, turns: Vec<ChatTurn>) -> Result<TokenStream> {
        let body = chat_body(&self.config, chat_messages(&turns));
        let response = self.open_stream(body, None).await?;
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse_tokens(response, tx));
        Ok(rx)
    }
}

pub struct OpenAiLlmFactory;

#[async_trait]
impl LlmFactory for OpenAiLlmFactory {
    async fn create(&self, config: &ProviderConfig) -> Result<std::sync::Arc<dyn LlmProvider>> {
        Ok(std::sync::Arc::new(OpenAiLlm::new(config.clone())?))
    }
}

// ---------------------------------------------------------------------------
// VLLLM

pub struct OpenAiVlllm {
    inner: OpenAiLlm,
}

impl OpenAiVlllm {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            inner: OpenAiLlm {
                client: http_client(Some(VISION_TIMEOUT))?,
                config,
            },
        })
    }
}

#[async_trait]
impl Provider for OpenAiVlllm {
    async fn initialize(&self) -> Result<()> {
        check_credentials(&self.inner.config)
    }

    async fn cleanup(&self) -> Result<()> {
        debug!(kind = "vlllm", "provider cleanup");
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl VlllmProvider for OpenAiVlllm {
    async fn respond_with_image(
        &self,
        turns: Vec<ChatTurn>,
        image: ImageBlob,
        query: &str,
    ) -> Result<TokenStream> {
        let mut messages = chat_messages(&turns);
        let data_uri = format!(
            "data:image/{};base64,{}",
            image.format,
            base64::engine::general_purpose::STANDARD.encode(&image.data)
        );
        messages.push(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": query},
                {"type": "image_url", "image_url": {"url": data_uri}},
            ],
        }));

        let body = chat_body(&self.inner.config, messages);
        let response = self.inner.open_stream(body, Some(VISION_TIMEOUT)).await?;
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        tokio::spawn(pump_sse_tokens(response, tx));
        Ok(rx)
    }
}

pub struct OpenAiVlllmFactory;

#[async_trait]
impl VlllmFactory for OpenAiVlllmFactory {
    async fn create(&self, config: &ProviderConfig) -> Result<std::sync::Arc<dyn VlllmProvider>> {
        Ok(std::sync::Arc::new(OpenAiVlllm::new(config.clone())?))
    }
}

// ---------------------------------------------------------------------------
// TTS

pub struct OpenAiTts {
    config: ProviderConfig,
    client: reqwest::Client,
    active: Mutex<CancellationToken>,
}

impl OpenAiTts {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(None)?,
            config,
            active: Mutex::new(CancellationToken::new()),
        })
    }
}

#[async_trait]
impl Provider for OpenAiTts {
    async fn initialize(&self) -> Result<()> {
        check_credentials(&self.config)
    }

    async fn cleanup(&self) -> Result<()> {
        self.active.lock().await.cancel();
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut active = self.active.lock().await;
        active.cancel();
        *active = CancellationToken::new();
        Ok(())
    }
}

#[async_trait]
impl TtsProvider for OpenAiTts {
    async fn synthesise(
        &self,
        text: &str,
        voice: &VoiceConfig,
        params: AudioParams,
    ) -> Result<FrameStream> {
        let voice_name = voice
            .voice
            .clone()
            .or_else(|| self.config.voice.clone())
            .unwrap_or_else(|| "alloy".to_string());
        let mut body = json!({
            "model": self.config.model,
            "input": text,
            "voice": voice_name,
            "response_format": match params.format {
                AudioCodec::Pcm16le => "pcm",
                AudioCodec::Opus => "opus",
            },
        });
        if let Some(speed) = voice.speed {
            body["speed"] = json!(speed);
        }

        let url = format!("{}/audio/speech", effective_base_url(&self.config));
        let response = authorize(self.client.post(url), &self.config)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("speech synthesis", e))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(status_error("speech synthesis", status, &detail));
        }

        let token = {
            let mut active = self.active.lock().await;
            *active = CancellationToken::new();
            active.clone()
        };

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        tokio::spawn(pump_audio_frames(response, params, token, tx));
        Ok(rx)
    }
}

async fn pump_audio_frames(
    response: reqwest::Response,
    params: AudioParams,
    cancel: CancellationToken,
    tx: mpsc::Sender<Result<crate::audio::AudioFrame>>,
) {
    let framer = AudioFramer::new(params);
    let frame_bytes = framer.pcm_frame_bytes();
    let mut stream = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("synthesis aborted by reset");
                return;
            }
            chunk = stream.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                let _ = tx.send(Err(transport_error("speech stream", err))).await;
                return;
            }
            None => break,
        };
        if chunk.is_empty() {
            continue;
        }

        match params.format {
            AudioCodec::Opus => {
                if tx
                    .send(framer.wrap_wire(chunk).map_err(|e| {
                        warn!("malformed synthesis chunk: {e}");
                        e
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            AudioCodec::Pcm16le => {
                pending.extend_from_slice(&chunk);
                while pending.len() >= frame_bytes {
                    let frame: Vec<u8> = pending.drain(..frame_bytes).collect();
                    for frame in framer.frame_pcm(&frame) {
                        if tx.send(Ok(frame)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    if !pending.is_empty() {
        for frame in framer.frame_pcm(&pending) {
            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
    }
}

pub struct OpenAiTtsFactory;

#[async_trait]
impl TtsFactory for OpenAiTtsFactory {
    async fn create(&self, config: &ProviderConfig) -> Result<std::sync::Arc<dyn TtsProvider>> {
        Ok(std::sync::Arc::new(OpenAiTts::new(config.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialogue::Role;
    use bytes::Bytes;

    #[test]
    fn base_url_defaults_and_trims() {
        let mut config = ProviderConfig::default();
        assert_eq!(effective_base_url(&config), DEFAULT_BASE_URL);
        config.base_url = "http://localhost:11434/v1/".to_string();
        assert_eq!(effective_base_url(&config), "http://localhost:11434/v1");
    }

    #[test]
    fn chat_body_merges_vendor_extras() {
        let mut config = ProviderConfig::default();
        config.model = "qwen3".to_string();
        config
            .extra
            .insert("temperature".to_string(), json!(0.7));
        let body = chat_body(
            &config,
            chat_messages(&[ChatTurn::new(Role::User, "你好")]),
        );
        assert_eq!(body["model"], "qwen3");
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["temperature"], json!(0.7));
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn sse_delta_extracts_content() {
        let data = r#"{"choices":[{"delta":{"content":"你好"}}]}"#;
        assert_eq!(sse_delta(data).as_deref(), Some("你好"));
        assert_eq!(sse_delta(r#"{"choices":[{"delta":{}}]}"#), None);
        assert_eq!(sse_delta("not json"), None);
    }

    #[test]
    fn server_errors_are_transient_client_errors_fatal() {
        let transient = status_error(
            "tts",
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
            "overloaded",
        );
        assert_eq!(transient.kind(), "provider_transient");
        let fatal = status_error("tts", reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert_eq!(fatal.kind(), "provider_fatal");
    }

    #[test]
    fn hosted_endpoint_requires_api_key() {
        let config = ProviderConfig::default();
        assert!(check_credentials(&config).is_err());
        let mut local = ProviderConfig::default();
        local.base_url = "http://localhost:11434/v1".to_string();
        assert!(check_credentials(&local).is_ok());
    }

    #[tokio::test]
    async fn asr_add_audio_fails_while_finalizing() {
        let asr = OpenAiAsr::new(ProviderConfig::default()).expect("provider should build");
        asr.buffer.lock().await.finalizing = true;
        let framer = AudioFramer::new(AudioParams::default());
        let frame = framer
            .wrap_wire(Bytes::from_static(&[1, 2, 3]))
            .expect("frame");
        let err = asr.add_audio(&frame).await.expect_err("busy");
        assert_eq!(err.kind(), "provider_busy");
    }

    #[tokio::test]
    async fn asr_reset_clears_buffer_and_listener() {
        let asr = OpenAiAsr::new(ProviderConfig::default()).expect("provider should build");
        let (tx, _rx) = mpsc::unbounded_channel();
        asr.set_listener(tx).await;
        let framer = AudioFramer::new(AudioParams::default());
        let frame = framer.wrap_wire(Bytes::from_static(&[9; 8])).expect("frame");
        asr.add_audio(&frame).await.expect("buffered");
        asr.reset().await.expect("reset");
        assert!(asr.buffer.lock().await.data.is_empty());
        assert!(asr.take_listener().await.is_none());
    }
}
