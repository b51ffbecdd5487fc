//! Wire protocol envelopes.
//!
//! Sessions interleave two message kinds on one WebSocket: JSON control
//! envelopes (text) and audio frames (binary). The envelopes here are the
//! application-level protocol spoken by embedded, mobile, and desktop
//! clients.

use serde::{Deserialize, Serialize};

use crate::audio::AudioParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenState {
    Start,
    Stop,
    Detect,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Hello {
        #[serde(default)]
        version: Option<u32>,
        #[serde(default)]
        transport: Option<String>,
        #[serde(default)]
        audio_params: AudioParams,
    },
    Listen {
        state: ListenState,
        /// Wake-word text accompanying `detect`.
        #[serde(default)]
        text: Option<String>,
    },
    Abort {
        #[serde(default)]
        reason: Option<String>,
    },
    Iot {
        #[serde(default)]
        payload: serde_json::Value,
    },
    Mcp {
        #[serde(default)]
        payload: serde_json::Value,
    },
    ImageQuery {
        image: ImagePayload,
        text: String,
    },
    Goodbye {},
}

/// Image carried inside an `image_query` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ImagePayload {
    /// Format tag, e.g. `png` or `jpeg`.
    #[serde(default = "default_image_format")]
    pub format: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

fn default_image_format() -> String {
    "png".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Hello {
        transport: &'static str,
        session_id: String,
        audio_params: AudioParams,
    },
    Stt {
        text: String,
    },
    Llm {
        text: String,
    },
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
    },
    /// Announces the binary frames that follow for one utterance.
    Audio {
        audio_params: AudioParams,
    },
    Error {
        kind: &'static str,
        message: String,
    },
    Goodbye {},
}

impl ServerEnvelope {
    pub fn to_json(&self) -> String {
        // Serialization of these envelopes cannot fail: every payload field
        // is a string, number, or plain struct of those.
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioCodec;

    #[test]
    fn hello_parses_with_audio_params() {
        let raw = r#"{"type":"hello","version":1,"audio_params":{"format":"opus","sample_rate":16000,"channels":1,"frame_duration":60}}"#;
        let env: ClientEnvelope = serde_json::from_str(raw).expect("hello should parse");
        match env {
            ClientEnvelope::Hello { audio_params, .. } => {
                assert_eq!(audio_params.format, AudioCodec::Opus);
                assert_eq!(audio_params.sample_rate, 16000);
            }
            other => panic!("expected hello, got {other:?}"),
        }
    }

    #[test]
    fn listen_states_round_trip() {
        for (raw, want) in [
            (r#"{"type":"listen","state":"start"}"#, ListenState::Start),
            (r#"{"type":"listen","state":"stop"}"#, ListenState::Stop),
            (
                r#"{"type":"listen","state":"detect","text":"你好小智"}"#,
                ListenState::Detect,
            ),
        ] {
            let env: ClientEnvelope = serde_json::from_str(raw).expect("listen should parse");
            match env {
                ClientEnvelope::Listen { state, .. } => assert_eq!(state, want),
                other => panic!("expected listen, got {other:?}"),
            }
        }
    }

    #[test]
    fn image_query_carries_format_and_data() {
        let raw = r#"{"type":"image_query","image":{"format":"jpeg","data":"aGk="},"text":"这是什么?"}"#;
        let env: ClientEnvelope = serde_json::from_str(raw).expect("image_query should parse");
        match env {
            ClientEnvelope::ImageQuery { image, text } => {
                assert_eq!(image.format, "jpeg");
                assert_eq!(text, "这是什么?");
            }
            other => panic!("expected image_query, got {other:?}"),
        }
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type":"warp"}"#).is_err());
    }

    #[test]
    fn tts_envelope_serializes_snake_case() {
        let json = ServerEnvelope::Tts {
            state: TtsState::SentenceStart,
            text: Some("你好。".to_string()),
            index: Some(0),
        }
        .to_json();
        assert!(json.contains("\"state\":\"sentence_start\""));
        assert!(json.contains("\"type\":\"tts\""));
    }
}
