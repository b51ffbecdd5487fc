//! Device records backing the OTA activation flow.
//!
//! The session core never writes persistent state; this narrow store is the
//! boundary behind which a relational database would sit in a full
//! deployment.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub serial_number: String,
    pub mac: Option<String>,
    pub client_uuid: Option<String>,
    pub activation_code: String,
    pub challenge: String,
    pub activated: bool,
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, serial_number: &str) -> Option<DeviceRecord>;

    async fn upsert(&self, record: DeviceRecord);

    async fn mark_activated(&self, serial_number: &str) -> bool;
}

#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: RwLock<HashMap<String, DeviceRecord>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get(&self, serial_number: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(serial_number).cloned()
    }

    async fn upsert(&self, record: DeviceRecord) {
        self.devices
            .write()
            .await
            .insert(record.serial_number.clone(), record);
    }

    async fn mark_activated(&self, serial_number: &str) -> bool {
        match self.devices.write().await.get_mut(serial_number) {
            Some(record) => {
                record.activated = true;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn activation_round_trip() {
        let store = MemoryDeviceStore::new();
        store
            .upsert(DeviceRecord {
                serial_number: "SN-1".to_string(),
                mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
                client_uuid: None,
                activation_code: "482913".to_string(),
                challenge: "ch-1".to_string(),
                activated: false,
            })
            .await;

        assert!(!store.get("SN-1").await.expect("record").activated);
        assert!(store.mark_activated("SN-1").await);
        assert!(store.get("SN-1").await.expect("record").activated);
        assert!(!store.mark_activated("SN-404").await);
    }
}
