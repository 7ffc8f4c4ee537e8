//! Device persistence.
//!
//! A [`DeviceStore`] keeps the last persisted snapshot of every device and a
//! handle to the live instance once one is registered. Recovery rebuilds a
//! device from the snapshot properties:
//!
//! | Property | Value |
//! |----------|-------|
//! | `name` | display name |
//! | `type_name` | registry type name |
//! | `properties` | driver properties |
//! | `metadata` | metadata map (absent when empty) |

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::ManagedDevice;
use crate::error::{DeviceError, Result};
use crate::state::DeviceState;

/// Well-known property names.
pub mod properties {
    pub const NAME: &str = "name";
    pub const TYPE_NAME: &str = "type_name";
    pub const PROPERTIES: &str = "properties";
    pub const METADATA: &str = "metadata";
}

/// Persisted view of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    #[serde(default)]
    pub state: DeviceState,
    pub updated_at: DateTime<Utc>,
}

impl DeviceSnapshot {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
        properties: Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            type_name: type_name.into(),
            properties,
            metadata: HashMap::new(),
            state: DeviceState::Created,
            updated_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Value of a persisted property. Unknown names are looked up inside `properties`.
    pub fn property(&self, property: &str) -> Option<Value> {
        match property {
            properties::NAME => Some(Value::String(self.name.clone())),
            properties::TYPE_NAME if self.type_name.is_empty() => None,
            properties::TYPE_NAME => Some(Value::String(self.type_name.clone())),
            properties::PROPERTIES if self.properties.is_null() => None,
            properties::PROPERTIES => Some(self.properties.clone()),
            properties::METADATA if self.metadata.is_empty() => None,
            properties::METADATA => serde_json::to_value(&self.metadata).ok(),
            other => self.properties.get(other).cloned(),
        }
    }
}

/// Persistence collaborator used by recovery.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Read one persisted property of a device.
    async fn get_property(&self, device_id: &str, property: &str) -> Result<Option<Value>>;

    /// Register a live device and persist its snapshot.
    async fn add_or_update(&self, device: Arc<ManagedDevice>) -> Result<()>;

    /// Live device registered under `device_id`.
    async fn get_device(&self, device_id: &str) -> Option<Arc<ManagedDevice>>;

    /// Persist a snapshot without a live device.
    async fn save_snapshot(&self, snapshot: DeviceSnapshot) -> Result<()>;

    /// Drop the live handle for a device, keeping its snapshot.
    async fn detach(&self, device_id: &str) -> Option<Arc<ManagedDevice>>;
}

/// Typed property access.
#[async_trait]
pub trait DeviceStoreExt: DeviceStore {
    async fn get_property_as<T>(&self, device_id: &str, property: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get_property(device_id, property).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

impl<S: DeviceStore + ?Sized> DeviceStoreExt for S {}

/// Shared store handle.
pub type SharedDeviceStore = Arc<dyn DeviceStore>;

/// In-memory store.
#[derive(Default)]
pub struct MemoryDeviceStore {
    snapshots: DashMap<String, DeviceSnapshot>,
    live: DashMap<String, Arc<ManagedDevice>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get_property(&self, device_id: &str, property: &str) -> Result<Option<Value>> {
        Ok(self
            .snapshots
            .get(device_id)
            .and_then(|s| s.property(property)))
    }

    async fn add_or_update(&self, device: Arc<ManagedDevice>) -> Result<()> {
        let snapshot = device.snapshot();
        self.snapshots.insert(snapshot.id.clone(), snapshot);
        self.live.insert(device.id().to_string(), device);
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Option<Arc<ManagedDevice>> {
        self.live.get(device_id).map(|d| Arc::clone(d.value()))
    }

    async fn save_snapshot(&self, snapshot: DeviceSnapshot) -> Result<()> {
        self.snapshots.insert(snapshot.id.clone(), snapshot);
        Ok(())
    }

    async fn detach(&self, device_id: &str) -> Option<Arc<ManagedDevice>> {
        self.live.remove(device_id).map(|(_, d)| d)
    }
}

const SNAPSHOT_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("device_snapshots");

fn storage_err(e: impl std::fmt::Display) -> DeviceError {
    DeviceError::Storage(e.to_string())
}

/// Redb-backed store. Snapshots are stored as JSON keyed by device id.
pub struct RedbDeviceStore {
    db: Arc<Database>,
    live: DashMap<String, Arc<ManagedDevice>>,
}

impl RedbDeviceStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(storage_err)?;
            }
        }

        let db = if path.exists() {
            Database::open(path).map_err(storage_err)?
        } else {
            Database::create(path).map_err(storage_err)?
        };

        // Make sure the table exists so read transactions can open it.
        let txn = db.begin_write().map_err(storage_err)?;
        txn.open_table(SNAPSHOT_TABLE).map_err(storage_err)?;
        txn.commit().map_err(storage_err)?;

        Ok(Self {
            db: Arc::new(db),
            live: DashMap::new(),
        })
    }

    fn write_snapshot(&self, snapshot: &DeviceSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec(snapshot)?;
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(SNAPSHOT_TABLE).map_err(storage_err)?;
            table
                .insert(snapshot.id.as_str(), bytes.as_slice())
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Load a persisted snapshot.
    pub fn read_snapshot(&self, device_id: &str) -> Result<Option<DeviceSnapshot>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(SNAPSHOT_TABLE).map_err(storage_err)?;
        match table.get(device_id).map_err(storage_err)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Ids of all persisted devices.
    pub fn device_ids(&self) -> Result<Vec<String>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = txn.open_table(SNAPSHOT_TABLE).map_err(storage_err)?;
        let mut ids = Vec::new();
        for item in table.iter().map_err(storage_err)? {
            let (key, _) = item.map_err(storage_err)?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }
}

#[async_trait]
impl DeviceStore for RedbDeviceStore {
    async fn get_property(&self, device_id: &str, property: &str) -> Result<Option<Value>> {
        Ok(self
            .read_snapshot(device_id)?
            .and_then(|s| s.property(property)))
    }

    async fn add_or_update(&self, device: Arc<ManagedDevice>) -> Result<()> {
        self.write_snapshot(&device.snapshot())?;
        self.live.insert(device.id().to_string(), device);
        Ok(())
    }

    async fn get_device(&self, device_id: &str) -> Option<Arc<ManagedDevice>> {
        self.live.get(device_id).map(|d| Arc::clone(d.value()))
    }

    async fn save_snapshot(&self, snapshot: DeviceSnapshot) -> Result<()> {
        self.write_snapshot(&snapshot)
    }

    async fn detach(&self, device_id: &str) -> Option<Arc<ManagedDevice>> {
        self.live.remove(device_id).map(|(_, d)| d)
    }
}
