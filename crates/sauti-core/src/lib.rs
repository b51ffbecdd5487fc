//! Session core for the Sauti voice gateway.
//!
//! Everything a connection needs behind the transport: provider contracts
//! over heterogeneous model back-ends, bounded self-refilling provider
//! pools, a quota-bounded task manager, audio framing, dialogue state, and
//! the wire protocol envelopes.

pub mod audio;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod providers;
pub mod segment;
pub mod task;
pub mod tools;

pub use audio::{AudioCodec, AudioFrame, AudioFramer, AudioParams};
pub use config::{Config, PoolConfig, ProviderConfig, TaskManagerConfig};
pub use dialogue::{DialogueHistory, DialogueState, Role, Turn, TurnPayload};
pub use error::{Error, Result};
pub use pool::{PoolManager, PoolStats, ProviderSet, ResourcePool};
pub use protocol::{ClientEnvelope, ListenState, ServerEnvelope, TtsState};
pub use providers::registry::{register_builtin_providers, ProviderRegistry};
pub use segment::{SegmentEvent, Sentence, SentenceSegmenter, ThinkFilter, ToolCallEnvelope};
pub use task::{TaskDescriptor, TaskKind, TaskManager, TaskOutcome};
pub use tools::{TimeTool, Tool, ToolRegistry};
