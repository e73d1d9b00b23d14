//! Constants used throughout the crate
//! This module contains the well-known BlueZ bus names, object-path
//! namespaces and interface names, plus protocol-level defaults.

/// The well-known bus name of the BlueZ daemon.
pub const BLUEZ_SERVICE: &str = "org.bluez";

/// Object-path namespace under which BlueZ publishes all of its objects.
pub const BLUEZ_PATH_NAMESPACE: &str = "/org/bluez";

/// Path prefix used for arg0path match rules (trailing slash required).
pub const BLUEZ_PATH_PREFIX: &str = "/org/bluez/";

/// Standard object-manager and properties interfaces.
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// BlueZ interfaces mirrored by the manager.
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
pub const GATT_SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";

/// Advertisement monitor interfaces used for passive scanning.
pub const ADVERTISEMENT_MONITOR_INTERFACE: &str = "org.bluez.AdvertisementMonitor1";
pub const ADVERTISEMENT_MONITOR_MANAGER_INTERFACE: &str =
    "org.bluez.AdvertisementMonitorManager1";

/// Signal member names handled by the manager's dispatch loop.
pub const INTERFACES_ADDED: &str = "InterfacesAdded";
pub const INTERFACES_REMOVED: &str = "InterfacesRemoved";
pub const PROPERTIES_CHANGED: &str = "PropertiesChanged";

/// Error name returned by the bus when a method does not exist.
pub const UNKNOWN_METHOD_ERROR: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Minimum ATT MTU mandated by the Bluetooth spec, used when the
/// characteristic has not negotiated an "MTU" property (BlueZ < 5.62).
pub const DEFAULT_ATT_MTU: usize = 23;

/// Size of the ATT header subtracted from the MTU to get the usable
/// write-without-response payload size.
pub const ATT_HEADER_SIZE: usize = 3;
