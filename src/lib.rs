//! BlueZ bridge library
//! A stateful client-side mirror of the BlueZ daemon's object tree.
//!
//! The [`BluezManager`] subscribes to the daemon's change notifications
//! before enumerating its objects, keeps the property table and GATT
//! hierarchy indexes consistent as signals arrive, and fans events out to
//! scan sessions, device watchers and condition waiters. [`BleScanner`]
//! is one caller's discovery view on top of it. The IPC transport is
//! abstract: implement [`Bus`] and [`BusConnector`] over a real message
//! bus to use the crate.

// Module declarations
pub mod bus;
pub mod constants;
pub mod error;
pub mod gatt;
pub mod manager;
pub mod monitor;
pub mod scanner;
pub mod values;

#[cfg(test)]
pub(crate) mod testbus;

// Re-export types that should be publicly accessible
pub use bus::{Bus, BusConnector, MatchRule, MethodCall, Reply, Signal};
pub use constants::*; // Re-export all constants
pub use error::{Error, Result};
pub use gatt::{GattCharacteristic, GattDescriptor, GattService, ServiceCollection};
pub use manager::{
    AdvertisementCallback, BluezManager, CharacteristicValueChangedCallback,
    ConnectedChangedCallback, DeviceRemovedCallback, DeviceWatcher, ScanStopper,
};
pub use monitor::{AdvertisementMonitor, OrPattern};
pub use scanner::{
    AdvertisementData, BleDevice, BleScanner, DetectionCallback, DiscoveryFilters, ScannerOptions,
    ScanningMode,
};
pub use values::{InterfaceProperties, Properties, Value};
