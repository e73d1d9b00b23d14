//! Scan sessions on top of the object-tree manager.
//! A [`BleScanner`] is one caller's view of discovery: it keeps a local
//! map of raw advertising properties per device, shapes them into
//! structured advertisement events, and owns the discovery filter set
//! handed to the daemon.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::manager::{AdvertisementCallback, BluezManager, DeviceRemovedCallback, ScanStopper};
use crate::monitor::OrPattern;
use crate::values::{Properties, Value};

/// How the daemon is asked to discover devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanningMode {
    /// Daemon-driven discovery with server-side property filters.
    Active,
    /// Client-registered advertisement monitor with OR-pattern filters.
    Passive,
}

/// Called for every advertisement event with the shaped device identity
/// and advertisement records.
pub type DetectionCallback = Arc<dyn Fn(&BleDevice, &AdvertisementData) + Send + Sync>;

/// Structured advertisement payload shaped from raw device properties.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AdvertisementData {
    /// Advertised local name, if any.
    pub local_name: Option<String>,
    /// Manufacturer-specific data keyed by company identifier.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<String, Vec<u8>>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<String>,
    /// Advertised transmit power, if any.
    pub tx_power: Option<i16>,
    /// The raw device property set backing this advertisement.
    pub raw_properties: Properties,
}

/// Identity of a discovered device.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BleDevice {
    /// The Bluetooth address of the device.
    pub address: String,
    /// Friendly name (alias), if known.
    pub name: Option<String>,
    /// Object path of the device.
    pub path: String,
    /// Signal strength; zero when the daemon has not reported one.
    pub rssi: i16,
    /// The raw device property set.
    pub properties: Properties,
}

/// The discovery filter set handed to the daemon for active scanning.
///
/// Only the recognized keys below are ever transmitted; anything else a
/// caller supplies is logged and ignored rather than rejected.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilters {
    pub uuids: Option<Vec<String>>,
    pub rssi: Option<i16>,
    pub pathloss: Option<u16>,
    pub transport: Option<String>,
    pub duplicate_data: Option<bool>,
    pub discoverable: Option<bool>,
    pub pattern: Option<String>,
}

impl DiscoveryFilters {
    /// Applies one caller-supplied filter entry. Unrecognized keys and
    /// recognized keys carrying the wrong value type are logged and
    /// ignored.
    fn apply(&mut self, key: &str, value: &Value) {
        match key {
            "UUIDs" => match value.as_str_list() {
                Some(v) => self.uuids = Some(v),
                None => Self::type_warning(key),
            },
            "RSSI" => match value.as_int().and_then(|v| i16::try_from(v).ok()) {
                Some(v) => self.rssi = Some(v),
                None => Self::type_warning(key),
            },
            "Pathloss" => match value.as_int().and_then(|v| u16::try_from(v).ok()) {
                Some(v) => self.pathloss = Some(v),
                None => Self::type_warning(key),
            },
            "Transport" => match value.as_str() {
                Some(v) => self.transport = Some(v.to_owned()),
                None => Self::type_warning(key),
            },
            "DuplicateData" => match value.as_bool() {
                Some(v) => self.duplicate_data = Some(v),
                None => Self::type_warning(key),
            },
            "Discoverable" => match value.as_bool() {
                Some(v) => self.discoverable = Some(v),
                None => Self::type_warning(key),
            },
            "Pattern" => match value.as_str() {
                Some(v) => self.pattern = Some(v.to_owned()),
                None => Self::type_warning(key),
            },
            other => warn!("filter '{}' is not currently supported", other),
        }
    }

    fn type_warning(key: &str) {
        warn!("ignoring filter '{}' with unexpected value type", key);
    }

    /// Renders the filter set as the property mapping the daemon's
    /// SetDiscoveryFilter method expects.
    fn to_properties(&self) -> Properties {
        let mut props = Properties::new();
        if let Some(uuids) = &self.uuids {
            props.insert("UUIDs".to_owned(), Value::from(uuids.clone()));
        }
        if let Some(rssi) = self.rssi {
            props.insert("RSSI".to_owned(), Value::Int(rssi as i64));
        }
        if let Some(pathloss) = self.pathloss {
            props.insert("Pathloss".to_owned(), Value::Int(pathloss as i64));
        }
        if let Some(transport) = &self.transport {
            props.insert("Transport".to_owned(), Value::Str(transport.clone()));
        }
        if let Some(duplicate_data) = self.duplicate_data {
            props.insert("DuplicateData".to_owned(), Value::Bool(duplicate_data));
        }
        if let Some(discoverable) = self.discoverable {
            props.insert("Discoverable".to_owned(), Value::Bool(discoverable));
        }
        if let Some(pattern) = &self.pattern {
            props.insert("Pattern".to_owned(), Value::Str(pattern.clone()));
        }
        props
    }
}

/// Optional scanner configuration.
#[derive(Debug, Clone, Default)]
pub struct ScannerOptions {
    /// Service UUID allow-list, applied as a discovery filter in active
    /// mode.
    pub service_uuids: Option<Vec<String>>,
    /// Additional discovery filter entries (active mode only).
    pub filters: HashMap<String, Value>,
    /// OR patterns for the advertisement monitor (required in passive
    /// mode).
    pub or_patterns: Vec<OrPattern>,
}

/// One scan session.
pub struct BleScanner {
    manager: Arc<BluezManager>,
    adapter_path: String,
    mode: ScanningMode,
    filters: Mutex<DiscoveryFilters>,
    or_patterns: Vec<OrPattern>,
    detection_callback: Option<DetectionCallback>,
    /// Device path -> last-known raw advertising properties, reset on
    /// every start.
    devices: Arc<Mutex<HashMap<String, Properties>>>,
    stopper: Mutex<Option<ScanStopper>>,
}

impl fmt::Debug for BleScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleScanner")
            .field("adapter_path", &self.adapter_path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl BleScanner {
    /// Creates a scanner for `adapter` (either a name such as "hci0" or a
    /// full object path).
    pub fn new(
        manager: Arc<BluezManager>,
        adapter: &str,
        mode: ScanningMode,
        options: ScannerOptions,
        detection_callback: Option<DetectionCallback>,
    ) -> Result<Self> {
        if mode == ScanningMode::Passive && options.or_patterns.is_empty() {
            return Err(Error::InvalidArguments(
                "passive scanning mode requires or-patterns".to_owned(),
            ));
        }
        if mode == ScanningMode::Passive && options.service_uuids.is_some() {
            warn!(
                "service uuid filtering is not implemented for passive scanning, \
                 use or-patterns as a workaround"
            );
        }

        let adapter_path = if adapter.starts_with('/') {
            adapter.to_owned()
        } else {
            format!("{}/{}", crate::constants::BLUEZ_PATH_NAMESPACE, adapter)
        };

        let mut filters = DiscoveryFilters {
            transport: Some("le".to_owned()),
            duplicate_data: Some(false),
            ..DiscoveryFilters::default()
        };
        if let Some(service_uuids) = options.service_uuids {
            filters.uuids = Some(service_uuids);
        }
        for (key, value) in &options.filters {
            filters.apply(key, value);
        }

        Ok(Self {
            manager,
            adapter_path,
            mode,
            filters: Mutex::new(filters),
            or_patterns: options.or_patterns,
            detection_callback,
            devices: Arc::new(Mutex::new(HashMap::new())),
            stopper: Mutex::new(None),
        })
    }

    /// Merges caller-supplied discovery filter entries into the filter
    /// set used on the next start.
    pub fn set_discovery_filters(&self, filters: HashMap<String, Value>) {
        let mut current = self.filters.lock().unwrap();
        for (key, value) in &filters {
            current.apply(key, value);
        }
    }

    /// Starts the session: initializes the manager if needed, resets the
    /// local device map and registers this session's handlers.
    pub async fn start(&self) -> Result<()> {
        if self.stopper.lock().unwrap().is_some() {
            return Err(Error::InvalidArguments("scanner is already running".to_owned()));
        }

        self.manager.initialize().await?;
        self.devices.lock().unwrap().clear();

        let devices = Arc::clone(&self.devices);
        let callback = self.detection_callback.clone();
        let advertisement_callback: AdvertisementCallback =
            Arc::new(move |path, props, _changed| {
                handle_advertisement(&devices, callback.as_ref(), path, props);
            });

        let removed_devices = Arc::clone(&self.devices);
        let device_removed_callback: DeviceRemovedCallback = Arc::new(move |path| {
            // a device that never advertised is not in the map; fine
            removed_devices.lock().unwrap().remove(path);
        });

        let stopper = match self.mode {
            ScanningMode::Active => {
                let filters = self.filters.lock().unwrap().to_properties();
                self.manager
                    .active_scan(
                        &self.adapter_path,
                        filters,
                        advertisement_callback,
                        device_removed_callback,
                    )
                    .await?
            }
            ScanningMode::Passive => {
                self.manager
                    .passive_scan(
                        &self.adapter_path,
                        self.or_patterns.clone(),
                        advertisement_callback,
                        device_removed_callback,
                    )
                    .await?
            }
        };

        *self.stopper.lock().unwrap() = Some(stopper);
        info!("scan session started on {}", self.adapter_path);
        Ok(())
    }

    /// Stops the session. A second stop (or a stop before start) is a
    /// no-op; the stopper is taken out first to avoid reentrancy.
    pub async fn stop(&self) -> Result<()> {
        let stopper = self.stopper.lock().unwrap().take();
        if let Some(stopper) = stopper {
            stopper.stop().await?;
            info!("scan session stopped on {}", self.adapter_path);
        }
        Ok(())
    }

    /// Devices seen by this session so far, shaped from the last raw
    /// property set received for each.
    pub fn discovered_devices(&self) -> Vec<BleDevice> {
        self.devices
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(path, props)| build_device(path, props))
            .collect()
    }
}

fn handle_advertisement(
    devices: &Mutex<HashMap<String, Properties>>,
    callback: Option<&DetectionCallback>,
    path: &str,
    props: Properties,
) {
    devices.lock().unwrap().insert(path.to_owned(), props.clone());

    let Some(callback) = callback else {
        return;
    };

    let Some(device) = build_device(path, &props) else {
        debug!("skipping advertisement from {} with no address", path);
        return;
    };

    let advertisement = build_advertisement(&props);
    callback(&device, &advertisement);
}

fn build_device(path: &str, props: &Properties) -> Option<BleDevice> {
    let address = props.get("Address").and_then(Value::as_str)?.to_owned();
    let name = props
        .get("Alias")
        .or_else(|| props.get("Name"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let rssi = props
        .get("RSSI")
        .and_then(Value::as_int)
        .and_then(|v| i16::try_from(v).ok())
        .unwrap_or(0);

    Some(BleDevice {
        address,
        name,
        path: path.to_owned(),
        rssi,
        properties: props.clone(),
    })
}

fn build_advertisement(props: &Properties) -> AdvertisementData {
    let manufacturer_data = props
        .get("ManufacturerData")
        .and_then(Value::as_byte_map)
        .map(|m| {
            m.into_iter()
                .filter_map(|(key, bytes)| key.parse::<u16>().ok().map(|id| (id, bytes)))
                .collect()
        })
        .unwrap_or_default();

    AdvertisementData {
        local_name: props
            .get("Name")
            .and_then(Value::as_str)
            .map(str::to_owned),
        manufacturer_data,
        service_data: props
            .get("ServiceData")
            .and_then(Value::as_byte_map)
            .unwrap_or_default(),
        service_uuids: props
            .get("UUIDs")
            .and_then(Value::as_str_list)
            .unwrap_or_default(),
        tx_power: props
            .get("TxPower")
            .and_then(Value::as_int)
            .and_then(|v| i16::try_from(v).ok()),
        raw_properties: props.clone(),
    }
}
