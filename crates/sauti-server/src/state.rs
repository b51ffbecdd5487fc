//! Shared application state.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sauti_core::config::Config;
use sauti_core::pool::PoolManager;
use sauti_core::task::TaskManager;
use sauti_core::tools::ToolRegistry;

use crate::auth::TokenVerifier;
use crate::devices::DeviceStore;

/// Entry in the concurrent session map. Accept/close are low-frequency, so
/// a read/write-locked map suffices.
pub struct SessionHandle {
    pub device_id: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pools: Arc<PoolManager>,
    pub tasks: Arc<TaskManager>,
    pub tools: Arc<ToolRegistry>,
    pub sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    pub devices: Arc<dyn DeviceStore>,
    pub verifier: Arc<TokenVerifier>,
    /// Root scope fired on process shutdown; every session scope is a child.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub async fn register_session(&self, client_id: Uuid, handle: SessionHandle) {
        self.sessions.write().await.insert(client_id, handle);
    }

    pub async fn remove_session(&self, client_id: &Uuid) {
        self.sessions.write().await.remove(client_id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Fire every live session's scope (graceful shutdown step two).
    pub async fn cancel_all_sessions(&self) {
        for handle in self.sessions.read().await.values() {
            handle.cancel.cancel();
        }
    }
}
