//! Device management for Sprout.
//!
//! - [`ManagedDevice`]: lifecycle state machine plus self-healing
//! - [`DeviceDriver`]: device-specific hooks
//! - [`DeviceTypeRegistry`]: type name to factory mapping used to rebuild devices
//! - [`DeviceStore`]: persisted snapshots and live device handles

pub mod device;
pub mod driver;
pub mod error;
pub mod registry;
pub mod state;
pub mod store;

pub use device::{DeviceDeps, ManagedDevice};
pub use driver::{DeviceDriver, DeviceSpec};
pub use error::{DeviceError, Result};
pub use registry::{DeviceFactory, DeviceTypeRegistry};
pub use state::DeviceState;
pub use store::{
    properties, DeviceSnapshot, DeviceStore, DeviceStoreExt, MemoryDeviceStore, RedbDeviceStore,
    SharedDeviceStore,
};
