//! Per-connection session handling.
//!
//! Each live connection owns one driver task that reads the transport and
//! confines the dialogue history; per-utterance work (LLM streaming, TTS
//! synthesis, tool calls) runs on child tasks inside the session's
//! cancellation scope and reports back over the command channel.

mod handler;
mod turn;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use axum::extract::ws::Message;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sauti_core::error::Error;
use sauti_core::protocol::ServerEnvelope;
use sauti_core::segment::ToolCallEnvelope;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(handler::ws_upgrade))
}

/// How a generation turn ended, as reported by its task.
#[derive(Debug)]
pub enum TurnStatus {
    Completed,
    /// Recoverable vendor fault: the session returns to idle after the
    /// apology sentinel is surfaced.
    Transient { message: String, apology: String },
    /// Unrecoverable: the provider set is destroyed and the session closed.
    Fatal { message: String },
}

/// Messages from child tasks back into the driver, which is the only task
/// allowed to touch dialogue history and session state.
#[derive(Debug)]
pub enum SessionCmd {
    AssistantText {
        turn_id: u64,
        text: String,
    },
    ToolCall {
        turn_id: u64,
        envelope: ToolCallEnvelope,
    },
    ToolResult {
        tool: String,
        result: sauti_core::Result<serde_json::Value>,
    },
    /// First TTS audio for this turn is underway.
    Speaking {
        turn_id: u64,
    },
    TurnFinished {
        turn_id: u64,
        status: TurnStatus,
    },
    AsrFailed {
        error: Error,
    },
}

/// Session handles shared with child tasks.
#[derive(Clone)]
pub struct SessionContext {
    pub client_id: Uuid,
    pub cancel: CancellationToken,
    pub out_tx: mpsc::UnboundedSender<Message>,
    pub cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    /// Sentences queued for synthesis but not yet fully written out.
    pub pending_tts: Arc<AtomicUsize>,
}

impl SessionContext {
    pub fn send_envelope(&self, envelope: ServerEnvelope) {
        let _ = self.out_tx.send(Message::Text(envelope.to_json().into()));
    }

    pub fn send_error(&self, error: &Error) {
        self.send_envelope(ServerEnvelope::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}
