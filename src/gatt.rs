//! GATT snapshot types.
//!
//! A [`ServiceCollection`] is a point-in-time, immutable tree of the GATT
//! hierarchy of one device, built by the manager once service discovery
//! is known complete. Handles keep the raw daemon property sets alongside
//! the typed fields so higher layers can reach anything not modelled here.

use uuid::Uuid;

use crate::values::Properties;

/// A descriptor handle within a snapshot.
#[derive(Debug, Clone)]
pub struct GattDescriptor {
    /// Object path of the descriptor.
    pub path: String,
    pub uuid: Uuid,
    /// Object path of the owning characteristic.
    pub characteristic_path: String,
    /// Raw daemon properties at snapshot time.
    pub properties: Properties,
}

/// A characteristic handle within a snapshot.
#[derive(Debug, Clone)]
pub struct GattCharacteristic {
    /// Object path of the characteristic.
    pub path: String,
    pub uuid: Uuid,
    /// Object path of the owning service.
    pub service_path: String,
    /// Characteristic flags, e.g. "read", "notify".
    pub flags: Vec<String>,
    /// Usable write-without-response payload size, derived from the
    /// negotiated MTU minus the ATT header.
    pub max_write_without_response_size: usize,
    /// Raw daemon properties at snapshot time.
    pub properties: Properties,
    pub descriptors: Vec<GattDescriptor>,
}

/// A service handle within a snapshot.
#[derive(Debug, Clone)]
pub struct GattService {
    /// Object path of the service.
    pub path: String,
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
    /// Object path of the owning device.
    pub device_path: String,
    /// Raw daemon properties at snapshot time.
    pub properties: Properties,
    pub characteristics: Vec<GattCharacteristic>,
}

/// The fully resolved GATT tree of one device at one point in time.
#[derive(Debug, Clone)]
pub struct ServiceCollection {
    /// Object path of the device this snapshot belongs to.
    pub device_path: String,
    pub services: Vec<GattService>,
}

impl ServiceCollection {
    /// Finds a service by UUID.
    pub fn service(&self, uuid: Uuid) -> Option<&GattService> {
        self.services.iter().find(|s| s.uuid == uuid)
    }

    /// Finds a characteristic by UUID across all services.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.uuid == uuid)
    }

    /// Finds a characteristic by its object path.
    pub fn characteristic_by_path(&self, path: &str) -> Option<&GattCharacteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.path == path)
    }
}
