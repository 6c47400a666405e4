//! Device record store.
//!
//! The service only needs point lookup/update by device id and bulk lookup
//! by owner; any persistent backend implementing [`DeviceStore`] will do.
//! [`InMemoryDeviceStore`] backs tests and the CLI.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use devhub_core::{DeviceStatus, DeviceType, Protocol};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted view of a managed device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub owner_id: String,
    pub protocol: Protocol,
    pub name: String,
    pub device_type: DeviceType,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub online: bool,
    pub status: DeviceStatus,
    /// Current merged state
    #[serde(default)]
    pub state: Map<String, Value>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

impl DeviceRecord {
    pub fn new(
        device_id: impl Into<String>,
        owner_id: impl Into<String>,
        protocol: Protocol,
        device_type: DeviceType,
        name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            device_id: device_id.into(),
            owner_id: owner_id.into(),
            protocol,
            name: name.into(),
            device_type,
            capabilities: Vec::new(),
            online: false,
            status: DeviceStatus::Unknown,
            state: Map::new(),
            last_seen: None,
            created_at: now,
            updated_at: now,
            metadata: Value::Null,
        }
    }

    /// Merge a state fragment key by key.
    pub fn merge_state(&mut self, fragment: &Map<String, Value>) {
        for (k, v) in fragment {
            self.state.insert(k.clone(), v.clone());
        }
        self.updated_at = Utc::now();
    }

    pub fn mark_seen(&mut self, status: DeviceStatus) {
        let now = Utc::now();
        self.status = status;
        self.online = status.is_online();
        self.last_seen = Some(now);
        self.updated_at = now;
    }
}

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn get(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>>;

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<DeviceRecord>>;

    async fn list_all(&self) -> StoreResult<Vec<DeviceRecord>>;

    /// Insert or replace.
    async fn upsert(&self, record: DeviceRecord) -> StoreResult<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, device_id: &str) -> StoreResult<bool>;
}

#[derive(Debug, Default)]
pub struct InMemoryDeviceStore {
    records: DashMap<String, DeviceRecord>,
}

impl InMemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl DeviceStore for InMemoryDeviceStore {
    async fn get(&self, device_id: &str) -> StoreResult<Option<DeviceRecord>> {
        Ok(self.records.get(device_id).map(|r| r.value().clone()))
    }

    async fn list_by_owner(&self, owner_id: &str) -> StoreResult<Vec<DeviceRecord>> {
        let mut records: Vec<DeviceRecord> = self
            .records
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(records)
    }

    async fn list_all(&self) -> StoreResult<Vec<DeviceRecord>> {
        Ok(self.records.iter().map(|r| r.value().clone()).collect())
    }

    async fn upsert(&self, record: DeviceRecord) -> StoreResult<()> {
        self.records.insert(record.device_id.clone(), record);
        Ok(())
    }

    async fn delete(&self, device_id: &str) -> StoreResult<bool> {
        Ok(self.records.remove(device_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_owner_lookup() {
        let store = InMemoryDeviceStore::new();
        for (id, owner) in [("b", "u1"), ("a", "u1"), ("c", "u2")] {
            store
                .upsert(DeviceRecord::new(id, owner, Protocol::Tuya, DeviceType::Light, id))
                .await
                .unwrap();
        }

        let mine = store.list_by_owner("u1").await.unwrap();
        assert_eq!(
            mine.iter().map(|r| r.device_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(store.delete("c").await.unwrap());
        assert!(!store.delete("c").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_merge_state_overwrites_keys() {
        let mut record = DeviceRecord::new("d", "u", Protocol::Tuya, DeviceType::Light, "Lamp");
        record.state.insert("switch_led".into(), json!(false));
        record.state.insert("bright_value".into(), json!(10));

        let mut fragment = Map::new();
        fragment.insert("switch_led".into(), json!(true));
        record.merge_state(&fragment);

        assert_eq!(record.state["switch_led"], json!(true));
        assert_eq!(record.state["bright_value"], json!(10));
    }
}
