//! BlueZ object-tree manager
//! This module owns the mirrored daemon state: the property table, the
//! derived GATT hierarchy indexes, scan session registration, device
//! watchers, condition waiters and the snapshot builder.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{Bus, BusConnector, MatchRule, MethodCall, Signal};
use crate::constants::{
    ADAPTER_INTERFACE, ADVERTISEMENT_MONITOR_MANAGER_INTERFACE, ATT_HEADER_SIZE, BLUEZ_PATH_NAMESPACE,
    BLUEZ_PATH_PREFIX, BLUEZ_SERVICE, DEFAULT_ATT_MTU, DEVICE_INTERFACE, GATT_CHARACTERISTIC_INTERFACE,
    GATT_DESCRIPTOR_INTERFACE, GATT_SERVICE_INTERFACE, INTERFACES_ADDED, INTERFACES_REMOVED,
    OBJECT_MANAGER_INTERFACE, PROPERTIES_CHANGED, PROPERTIES_INTERFACE, UNKNOWN_METHOD_ERROR,
};
use crate::error::{Error, Result};
use crate::gatt::{GattCharacteristic, GattDescriptor, GattService, ServiceCollection};
use crate::monitor::{AdvertisementMonitor, OrPattern, unique_monitor_path};
use crate::values::{InterfaceProperties, Properties, Value};

/// Called when advertisement data is received for a device. Arguments are
/// the device object path, a deep copy of the device's current property
/// set, and the names of the properties that changed.
pub type AdvertisementCallback = Arc<dyn Fn(&str, Properties, &[String]) + Send + Sync>;

/// Called when a device is removed from the daemon. The argument is the
/// device object path.
pub type DeviceRemovedCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called when a watched device's "Connected" property changes.
pub type ConnectedChangedCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Called when a characteristic under a watched device changes value.
/// Arguments are the characteristic object path and the new value.
pub type CharacteristicValueChangedCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

struct AdvertisementEntry {
    token: u64,
    adapter_path: String,
    callback: AdvertisementCallback,
}

struct DeviceRemovedEntry {
    token: u64,
    adapter_path: String,
    callback: DeviceRemovedCallback,
}

struct WatcherEntry {
    token: u64,
    device_path: String,
    on_connected_changed: ConnectedChangedCallback,
    on_characteristic_value_changed: CharacteristicValueChangedCallback,
}

/// Token returned by [`BluezManager::add_device_watcher`], used to
/// unregister the watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWatcher {
    token: u64,
}

struct ManagerState {
    /// Object path -> interface name -> property name -> value. The
    /// authoritative mirror of the daemon's object tree.
    properties: HashMap<String, InterfaceProperties>,
    /// Device path -> set of service paths.
    service_map: HashMap<String, HashSet<String>>,
    /// Service path -> set of characteristic paths.
    characteristic_map: HashMap<String, HashSet<String>>,
    /// Characteristic path -> set of descriptor paths.
    descriptor_map: HashMap<String, HashSet<String>>,
    advertisement_callbacks: Vec<AdvertisementEntry>,
    device_removed_callbacks: Vec<DeviceRemovedEntry>,
    device_watchers: Vec<WatcherEntry>,
    condition_callbacks: Vec<(u64, Arc<dyn Fn() + Send + Sync>)>,
    services_cache: HashMap<String, Arc<ServiceCollection>>,
    next_token: u64,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            properties: HashMap::new(),
            service_map: HashMap::new(),
            characteristic_map: HashMap::new(),
            descriptor_map: HashMap::new(),
            advertisement_callbacks: Vec::new(),
            device_removed_callbacks: Vec::new(),
            device_watchers: Vec::new(),
            condition_callbacks: Vec::new(),
            services_cache: HashMap::new(),
            next_token: 0,
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Merges one interface's properties into the table and, for GATT
    /// child interfaces, records the path under its declared parent.
    fn insert_interface(&mut self, path: &str, interface: &str, props: Properties) {
        if let Some(parent_prop) = parent_property(interface) {
            if let Some(parent) = props.get(parent_prop).and_then(Value::as_str) {
                self.hierarchy_map_mut(interface)
                    .entry(parent.to_owned())
                    .or_default()
                    .insert(path.to_owned());
            }
        }

        self.properties
            .entry(path.to_owned())
            .or_default()
            .insert(interface.to_owned(), props);
    }

    fn hierarchy_map_mut(&mut self, interface: &str) -> &mut HashMap<String, HashSet<String>> {
        match interface {
            GATT_SERVICE_INTERFACE => &mut self.service_map,
            GATT_CHARACTERISTIC_INTERFACE => &mut self.characteristic_map,
            GATT_DESCRIPTOR_INTERFACE => &mut self.descriptor_map,
            other => unreachable!("no hierarchy index for interface {other}"),
        }
    }

    /// Drops `child` from its parent's index entry. Missing entries are
    /// expected (the parent may already be gone), not errors.
    fn remove_hierarchy_entry(&mut self, interface: &str, parent: &str, child: &str) {
        let map = self.hierarchy_map_mut(interface);
        if let Some(children) = map.get_mut(parent) {
            children.remove(child);
            if children.is_empty() {
                map.remove(parent);
            }
        }
    }

    fn clear_mirror(&mut self) {
        self.properties.clear();
        self.service_map.clear();
        self.characteristic_map.clear();
        self.descriptor_map.clear();
    }
}

/// Property on a GATT child interface that names its parent object.
fn parent_property(interface: &str) -> Option<&'static str> {
    match interface {
        GATT_SERVICE_INTERFACE => Some("Device"),
        GATT_CHARACTERISTIC_INTERFACE => Some("Service"),
        GATT_DESCRIPTOR_INTERFACE => Some("Characteristic"),
        _ => None,
    }
}

struct Connection {
    bus: Arc<dyn Bus>,
    cancel: CancellationToken,
    dispatch_task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.dispatch_task.abort();
    }
}

/// The BlueZ object-tree manager.
///
/// Construct one instance at application start and hand it by reference
/// to every scanner and client that needs it; do not create one per
/// operation. Each manager owns at most one bus connection, replaced
/// (never reused) on reconnect.
pub struct BluezManager {
    connector: Box<dyn BusConnector>,
    state: Arc<Mutex<ManagerState>>,
    /// Serializes initialization and scan start/stop remote-call
    /// sequences, and owns the live connection.
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl BluezManager {
    /// Creates a new manager. No bus connection is opened until
    /// [`BluezManager::initialize`] is called.
    pub fn new(connector: Box<dyn BusConnector>) -> Self {
        Self {
            connector,
            state: Arc::new(Mutex::new(ManagerState::new())),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Connects to the message bus and begins mirroring the daemon's
    /// object tree.
    ///
    /// Safe to call multiple times: when the bus is already connected no
    /// action is performed. Signal subscriptions are installed before the
    /// bulk enumeration so nothing is lost in between, and all mirrored
    /// maps are cleared right before being rebuilt from the bulk reply so
    /// no stale entries survive a reconnect. Any setup failure tears the
    /// fresh connection down before the error is returned.
    pub async fn initialize(&self) -> Result<()> {
        let mut connection = self.connection.lock().await;

        if let Some(existing) = connection.as_ref() {
            if existing.bus.is_connected() {
                return Ok(());
            }
        }

        // A dead connection from a bus reset is replaced, never reused.
        if let Some(stale) = connection.take() {
            stale.bus.disconnect().await;
        }

        self.state.lock().unwrap().services_cache.clear();

        let bus = self.connector.connect().await?;

        let signals = match self.subscribe_and_enumerate(&bus).await {
            Ok(signals) => signals,
            Err(e) => {
                bus.disconnect().await;
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let dispatch_task = tokio::spawn(dispatch_loop(
            Arc::clone(&self.state),
            signals,
            cancel.clone(),
        ));

        *connection = Some(Connection {
            bus,
            cancel,
            dispatch_task,
        });

        Ok(())
    }

    /// Subscribes to the three signal classes and then performs the bulk
    /// enumeration. The signal stream is taken first so that anything
    /// delivered while the bulk call is in flight is buffered rather than
    /// dropped; a duplicate add arriving in that window is overwritten by
    /// the authoritative bulk read.
    async fn subscribe_and_enumerate(&self, bus: &Arc<dyn Bus>) -> Result<BoxStream<'static, Signal>> {
        let signals = bus.signals();

        bus.add_match(
            MatchRule::member(OBJECT_MANAGER_INTERFACE, INTERFACES_ADDED)
                .with_arg0_path(BLUEZ_PATH_PREFIX),
        )
        .await?;
        bus.add_match(
            MatchRule::member(OBJECT_MANAGER_INTERFACE, INTERFACES_REMOVED)
                .with_arg0_path(BLUEZ_PATH_PREFIX),
        )
        .await?;
        bus.add_match(
            MatchRule::member(PROPERTIES_INTERFACE, PROPERTIES_CHANGED)
                .with_path_namespace(BLUEZ_PATH_NAMESPACE),
        )
        .await?;

        let reply = bus
            .call(MethodCall::new(
                BLUEZ_SERVICE,
                "/",
                OBJECT_MANAGER_INTERFACE,
                "GetManagedObjects",
            ))
            .await?;

        let objects = reply
            .body
            .first()
            .and_then(Value::as_map)
            .ok_or_else(|| Error::InvalidReply("GetManagedObjects returned no object mapping".into()))?;

        let mut state = self.state.lock().unwrap();
        state.clear_mirror();

        for (path, interfaces) in objects {
            let Some(interfaces) = interfaces.as_map() else {
                warn!("skipping malformed managed object entry for {}", path);
                continue;
            };
            for (interface, props) in interfaces {
                let props = props.as_map().cloned().unwrap_or_default();
                state.insert_interface(path, interface, props);
            }
        }

        info!("mirrored {} objects from the daemon", state.properties.len());

        Ok(signals)
    }

    /// Configures the discovery filters on an adapter and starts active
    /// scanning.
    ///
    /// The returned [`ScanStopper`] stops discovery, clears the filters
    /// and removes the callback registrations. If either remote call
    /// fails, the registrations are rolled back before the error is
    /// returned.
    pub async fn active_scan(
        self: &Arc<Self>,
        adapter_path: &str,
        filters: Properties,
        advertisement_callback: AdvertisementCallback,
        device_removed_callback: DeviceRemovedCallback,
    ) -> Result<ScanStopper> {
        let connection = self.connection.lock().await;
        let bus = connected_bus(&connection)?;

        let (adv_token, removed_token) = self.register_scan_callbacks(
            adapter_path,
            advertisement_callback,
            device_removed_callback,
        )?;

        let started: Result<()> = async {
            bus.call(
                MethodCall::new(BLUEZ_SERVICE, adapter_path, ADAPTER_INTERFACE, "SetDiscoveryFilter")
                    .with_body(vec![Value::Map(filters)]),
            )
            .await?;

            bus.call(MethodCall::new(
                BLUEZ_SERVICE,
                adapter_path,
                ADAPTER_INTERFACE,
                "StartDiscovery",
            ))
            .await?;

            Ok(())
        }
        .await;

        if let Err(e) = started {
            self.unregister_scan_callbacks(adv_token, removed_token);
            return Err(e);
        }

        info!("started active scan on {}", adapter_path);

        Ok(ScanStopper {
            manager: Arc::clone(self),
            adapter_path: adapter_path.to_owned(),
            adv_token,
            removed_token,
            mode: StopMode::Active,
        })
    }

    /// Registers an advertisement monitor carrying `patterns` with the
    /// daemon and starts passive scanning.
    ///
    /// The monitor object is exported only after the daemon acknowledges
    /// the registration; exporting first makes the daemon miss it. A
    /// daemon without the monitor API surfaces as
    /// [`Error::PassiveScanNotSupported`].
    pub async fn passive_scan(
        self: &Arc<Self>,
        adapter_path: &str,
        patterns: Vec<OrPattern>,
        advertisement_callback: AdvertisementCallback,
        device_removed_callback: DeviceRemovedCallback,
    ) -> Result<ScanStopper> {
        let connection = self.connection.lock().await;
        let bus = connected_bus(&connection)?;

        let (adv_token, removed_token) = self.register_scan_callbacks(
            adapter_path,
            advertisement_callback,
            device_removed_callback,
        )?;

        let started: Result<(Arc<AdvertisementMonitor>, String)> = async {
            let monitor = Arc::new(AdvertisementMonitor::new(patterns));
            let monitor_path = unique_monitor_path();

            let registered = bus
                .call(
                    MethodCall::new(
                        BLUEZ_SERVICE,
                        adapter_path,
                        ADVERTISEMENT_MONITOR_MANAGER_INTERFACE,
                        "RegisterMonitor",
                    )
                    .with_body(vec![Value::Str(monitor_path.clone())]),
                )
                .await;

            match registered {
                Err(Error::RemoteCall { ref name, .. }) if name == UNKNOWN_METHOD_ERROR => {
                    return Err(Error::PassiveScanNotSupported);
                }
                Err(e) => return Err(e),
                Ok(_) => {}
            }

            bus.export_monitor(&monitor_path, Arc::clone(&monitor)).await?;

            Ok((monitor, monitor_path))
        }
        .await;

        match started {
            Ok((monitor, monitor_path)) => {
                info!("started passive scan on {} via {}", adapter_path, monitor_path);
                Ok(ScanStopper {
                    manager: Arc::clone(self),
                    adapter_path: adapter_path.to_owned(),
                    adv_token,
                    removed_token,
                    mode: StopMode::Passive { monitor, monitor_path },
                })
            }
            Err(e) => {
                self.unregister_scan_callbacks(adv_token, removed_token);
                Err(e)
            }
        }
    }

    /// Registers both scan callbacks after checking the adapter is a
    /// known object, so an unknown adapter fails with a readable error
    /// instead of an opaque remote failure.
    fn register_scan_callbacks(
        &self,
        adapter_path: &str,
        advertisement_callback: AdvertisementCallback,
        device_removed_callback: DeviceRemovedCallback,
    ) -> Result<(u64, u64)> {
        let mut state = self.state.lock().unwrap();

        if !state.properties.contains_key(adapter_path) {
            return Err(Error::AdapterNotFound(short_adapter_name(adapter_path)));
        }

        let adv_token = state.token();
        state.advertisement_callbacks.push(AdvertisementEntry {
            token: adv_token,
            adapter_path: adapter_path.to_owned(),
            callback: advertisement_callback,
        });

        let removed_token = state.token();
        state.device_removed_callbacks.push(DeviceRemovedEntry {
            token: removed_token,
            adapter_path: adapter_path.to_owned(),
            callback: device_removed_callback,
        });

        Ok((adv_token, removed_token))
    }

    fn unregister_scan_callbacks(&self, adv_token: u64, removed_token: u64) {
        let mut state = self.state.lock().unwrap();
        state.advertisement_callbacks.retain(|e| e.token != adv_token);
        state.device_removed_callbacks.retain(|e| e.token != removed_token);
    }

    /// Registers a device watcher for post-connection monitoring. The
    /// returned token unregisters it via
    /// [`BluezManager::remove_device_watcher`].
    pub fn add_device_watcher(
        &self,
        device_path: &str,
        on_connected_changed: ConnectedChangedCallback,
        on_characteristic_value_changed: CharacteristicValueChangedCallback,
    ) -> DeviceWatcher {
        let mut state = self.state.lock().unwrap();
        let token = state.token();
        state.device_watchers.push(WatcherEntry {
            token,
            device_path: device_path.to_owned(),
            on_connected_changed,
            on_characteristic_value_changed,
        });
        DeviceWatcher { token }
    }

    /// Unregisters a device watcher. Safe to call from within a watcher
    /// callback.
    pub fn remove_device_watcher(&self, watcher: DeviceWatcher) {
        self.state
            .lock()
            .unwrap()
            .device_watchers
            .retain(|w| w.token != watcher.token);
    }

    /// Waits until `property` of the device interface at `device_path`
    /// equals `value`. Returns immediately when it already does. The
    /// registered re-check callback is removed on every exit path,
    /// including cancellation.
    pub async fn wait_for_condition(
        &self,
        device_path: &str,
        property: &str,
        value: Value,
    ) -> Result<()> {
        let notify = Arc::new(Notify::new());
        let token;

        {
            let mut state = self.state.lock().unwrap();

            let current = state
                .properties
                .get(device_path)
                .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
                .ok_or_else(|| Error::DeviceNotFound(device_path.to_owned()))?;

            if current.get(property) == Some(&value) {
                return Ok(());
            }

            token = state.token();

            let check_state = Arc::clone(&self.state);
            let check_path = device_path.to_owned();
            let check_property = property.to_owned();
            let check_notify = Arc::clone(&notify);
            state.condition_callbacks.push((
                token,
                Arc::new(move || {
                    let state = check_state.lock().unwrap();
                    let matches = state
                        .properties
                        .get(&check_path)
                        .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
                        .and_then(|props| props.get(&check_property))
                        == Some(&value);
                    if matches {
                        check_notify.notify_one();
                    }
                }),
            ));
        }

        let _guard = ConditionGuard {
            state: Arc::clone(&self.state),
            token,
        };

        notify.notified().await;
        Ok(())
    }

    /// Builds (or returns the cached) [`ServiceCollection`] for one
    /// device.
    ///
    /// With `use_cached` set, a cached snapshot is returned immediately
    /// without waiting. Otherwise the call suspends until the device
    /// reports "ServicesResolved" and then walks the hierarchy indexes.
    pub async fn get_services(
        &self,
        device_path: &str,
        use_cached: bool,
    ) -> Result<Arc<ServiceCollection>> {
        if use_cached {
            if let Some(cached) = self.state.lock().unwrap().services_cache.get(device_path) {
                debug!("using cached services for {}", device_path);
                return Ok(Arc::clone(cached));
            }
        }

        self.wait_for_condition(device_path, "ServicesResolved", Value::Bool(true))
            .await?;

        // The device can be removed between the wait resuming and this
        // point. Re-check, build and cache under one critical section so
        // the insert cannot resurrect an entry a removal already evicted.
        let mut state = self.state.lock().unwrap();
        if !state
            .properties
            .get(device_path)
            .is_some_and(|ifaces| ifaces.contains_key(DEVICE_INTERFACE))
        {
            return Err(Error::DeviceNotFound(device_path.to_owned()));
        }

        let collection = Arc::new(build_service_collection(&state, device_path)?);
        state
            .services_cache
            .insert(device_path.to_owned(), Arc::clone(&collection));

        Ok(collection)
    }

    /// Current "Name" property of a device.
    pub fn get_device_name(&self, device_path: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        let props = state
            .properties
            .get(device_path)
            .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
            .ok_or_else(|| Error::DeviceNotFound(device_path.to_owned()))?;
        props
            .get("Name")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .ok_or_else(|| Error::MissingProperty {
                path: device_path.to_owned(),
                property: "Name".to_owned(),
            })
    }

    /// Current "Connected" property of a device; an unknown device or a
    /// missing property reads as not connected.
    pub fn is_connected(&self, device_path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .properties
            .get(device_path)
            .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
            .and_then(|props| props.get("Connected"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn inject_signal(&self, signal: Signal) {
        dispatch_signal(&self.state, signal);
    }

    #[cfg(test)]
    pub(crate) fn registration_counts(&self) -> (usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.advertisement_callbacks.len(),
            state.device_removed_callbacks.len(),
        )
    }
}

/// Removes a condition re-check callback when the waiter completes or is
/// cancelled.
struct ConditionGuard {
    state: Arc<Mutex<ManagerState>>,
    token: u64,
}

impl Drop for ConditionGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            state.condition_callbacks.retain(|(t, _)| *t != self.token);
        }
    }
}

fn connected_bus(connection: &Option<Connection>) -> Result<Arc<dyn Bus>> {
    match connection {
        Some(c) if c.bus.is_connected() => Ok(Arc::clone(&c.bus)),
        _ => Err(Error::NotConnected),
    }
}

fn short_adapter_name(adapter_path: &str) -> String {
    adapter_path
        .rsplit('/')
        .next()
        .unwrap_or(adapter_path)
        .to_owned()
}

enum StopMode {
    Active,
    Passive {
        /// Keeps the exported object alive for the daemon's callbacks.
        monitor: Arc<AdvertisementMonitor>,
        monitor_path: String,
    },
}

/// Reverses a scan session: undoes the remote calls made on start and
/// removes the callback registrations.
pub struct ScanStopper {
    manager: Arc<BluezManager>,
    adapter_path: String,
    adv_token: u64,
    removed_token: u64,
    mode: StopMode,
}

impl fmt::Debug for ScanStopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanStopper")
            .field("adapter_path", &self.adapter_path)
            .finish_non_exhaustive()
    }
}

impl ScanStopper {
    pub async fn stop(self) -> Result<()> {
        let connection = self.manager.connection.lock().await;
        let bus = connected_bus(&connection)?;

        match &self.mode {
            StopMode::Active => {
                bus.call(MethodCall::new(
                    BLUEZ_SERVICE,
                    &self.adapter_path,
                    ADAPTER_INTERFACE,
                    "StopDiscovery",
                ))
                .await?;

                // a filter set on start must not be silently left applied
                bus.call(
                    MethodCall::new(
                        BLUEZ_SERVICE,
                        &self.adapter_path,
                        ADAPTER_INTERFACE,
                        "SetDiscoveryFilter",
                    )
                    .with_body(vec![Value::Map(Properties::new())]),
                )
                .await?;
            }
            StopMode::Passive { monitor, monitor_path } => {
                debug!(
                    "unregistering monitor {} ({} patterns)",
                    monitor_path,
                    monitor.or_patterns().len()
                );
                bus.unexport_monitor(monitor_path).await?;

                bus.call(
                    MethodCall::new(
                        BLUEZ_SERVICE,
                        &self.adapter_path,
                        ADVERTISEMENT_MONITOR_MANAGER_INTERFACE,
                        "UnregisterMonitor",
                    )
                    .with_body(vec![Value::Str(monitor_path.clone())]),
                )
                .await?;
            }
        }

        self.manager
            .unregister_scan_callbacks(self.adv_token, self.removed_token);

        info!("stopped scan on {}", self.adapter_path);
        Ok(())
    }
}

async fn dispatch_loop(
    state: Arc<Mutex<ManagerState>>,
    mut signals: BoxStream<'static, Signal>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = signals.next() => match next {
                Some(signal) => dispatch_signal(&state, signal),
                None => {
                    info!("bus signal stream ended");
                    break;
                }
            },
        }
    }
}

/// Routes one inbound signal. Exactly three members are handled; all
/// other signal types are ignored.
fn dispatch_signal(state: &Mutex<ManagerState>, signal: Signal) {
    match signal.member.as_str() {
        INTERFACES_ADDED => handle_interfaces_added(state, signal),
        INTERFACES_REMOVED => handle_interfaces_removed(state, signal),
        PROPERTIES_CHANGED => handle_properties_changed(state, signal),
        _ => {}
    }
}

fn handle_interfaces_added(state: &Mutex<ManagerState>, signal: Signal) {
    let Some(path) = signal.body.first().and_then(Value::as_str).map(str::to_owned) else {
        warn!("malformed InterfacesAdded signal: missing object path");
        return;
    };
    let Some(interfaces) = signal.body.get(1).and_then(Value::as_map) else {
        warn!("malformed InterfacesAdded signal for {}", path);
        return;
    };

    let mut fanouts = Vec::new();

    {
        let mut st = state.lock().unwrap();
        for (interface, props) in interfaces {
            let props = props.as_map().cloned().unwrap_or_default();
            st.insert_interface(&path, interface, props.clone());

            // An object-add for a device can itself carry first-seen
            // advertising data, so fan out with every property changed.
            if interface == DEVICE_INTERFACE {
                let changed: Vec<String> = props.keys().cloned().collect();
                fanouts.push(advertisement_fanout(&st, &path, changed));
            }
        }
    }

    for fanout in fanouts {
        fanout.run();
    }
}

fn handle_interfaces_removed(state: &Mutex<ManagerState>, signal: Signal) {
    let Some(path) = signal.body.first().and_then(Value::as_str).map(str::to_owned) else {
        warn!("malformed InterfacesRemoved signal: missing object path");
        return;
    };
    let Some(interfaces) = signal.body.get(1).and_then(Value::as_str_list) else {
        warn!("malformed InterfacesRemoved signal for {}", path);
        return;
    };

    let mut removed_callbacks: Vec<DeviceRemovedCallback> = Vec::new();

    {
        let mut st = state.lock().unwrap();
        for interface in &interfaces {
            // Capture the parent reference before the entry disappears so
            // the hierarchy index can be cleaned up exactly.
            let parent = parent_property(interface).and_then(|prop| {
                st.properties
                    .get(&path)
                    .and_then(|ifaces| ifaces.get(interface))
                    .and_then(|props| props.get(prop))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
            });

            if let Some(ifaces) = st.properties.get_mut(&path) {
                ifaces.remove(interface);
                if ifaces.is_empty() {
                    st.properties.remove(&path);
                }
            }

            match interface.as_str() {
                DEVICE_INTERFACE => {
                    st.services_cache.remove(&path);
                    st.service_map.remove(&path);

                    for entry in &st.device_removed_callbacks {
                        if path.starts_with(&entry.adapter_path) {
                            removed_callbacks.push(Arc::clone(&entry.callback));
                        }
                    }
                }
                GATT_SERVICE_INTERFACE => {
                    st.characteristic_map.remove(&path);
                    if let Some(parent) = parent {
                        st.remove_hierarchy_entry(interface, &parent, &path);
                    }
                }
                GATT_CHARACTERISTIC_INTERFACE => {
                    st.descriptor_map.remove(&path);
                    if let Some(parent) = parent {
                        st.remove_hierarchy_entry(interface, &parent, &path);
                    }
                }
                GATT_DESCRIPTOR_INTERFACE => {
                    if let Some(parent) = parent {
                        st.remove_hierarchy_entry(interface, &parent, &path);
                    }
                }
                _ => {}
            }
        }
    }

    for callback in removed_callbacks {
        callback(&path);
    }
}

fn handle_properties_changed(state: &Mutex<ManagerState>, signal: Signal) {
    let path = signal.path.clone();
    let Some(interface) = signal.body.first().and_then(Value::as_str).map(str::to_owned) else {
        warn!("malformed PropertiesChanged signal on {}", path);
        return;
    };
    let changed = signal
        .body
        .get(1)
        .and_then(Value::as_map)
        .cloned()
        .unwrap_or_default();
    let invalidated = signal
        .body
        .get(2)
        .and_then(Value::as_str_list)
        .unwrap_or_default();

    let mut adv_fanout = None;
    let mut condition_callbacks = Vec::new();
    let mut connected_watchers: Vec<(ConnectedChangedCallback, bool)> = Vec::new();
    let mut value_watchers: Vec<(CharacteristicValueChangedCallback, Vec<u8>)> = Vec::new();

    {
        let mut st = state.lock().unwrap();

        // Update the mirror first so callbacks observe post-update state.
        match st
            .properties
            .get_mut(&path)
            .and_then(|ifaces| ifaces.get_mut(&interface))
        {
            None => {
                // Can happen before enumeration completes; the bulk read
                // supplies a newer value, so the change is discarded.
                debug!("discarding property change for unknown object {}", path);
                return;
            }
            Some(entry) => {
                for (name, value) in &changed {
                    entry.insert(name.clone(), value.clone());
                }
                for name in &invalidated {
                    entry.remove(name.as_str());
                }
            }
        }

        if interface == DEVICE_INTERFACE {
            let changed_names: Vec<String> = changed.keys().cloned().collect();
            adv_fanout = Some(advertisement_fanout(&st, &path, changed_names));

            condition_callbacks = st
                .condition_callbacks
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();

            if changed.contains_key("Connected") {
                let connected = st
                    .properties
                    .get(&path)
                    .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
                    .and_then(|props| props.get("Connected"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                // callbacks may mutate the watcher set, hence the snapshot
                connected_watchers = st
                    .device_watchers
                    .iter()
                    .filter(|w| w.device_path == path)
                    .map(|w| (Arc::clone(&w.on_connected_changed), connected))
                    .collect();
            }
        } else if interface == GATT_CHARACTERISTIC_INTERFACE && changed.contains_key("Value") {
            let value = st
                .properties
                .get(&path)
                .and_then(|ifaces| ifaces.get(GATT_CHARACTERISTIC_INTERFACE))
                .and_then(|props| props.get("Value"))
                .and_then(Value::as_bytes)
                .map(<[u8]>::to_vec)
                .unwrap_or_default();

            value_watchers = st
                .device_watchers
                .iter()
                .filter(|w| path.starts_with(&w.device_path))
                .map(|w| (Arc::clone(&w.on_characteristic_value_changed), value.clone()))
                .collect();
        }
    }

    if let Some(fanout) = adv_fanout {
        fanout.run();
    }
    for callback in condition_callbacks {
        callback();
    }
    for (callback, connected) in connected_watchers {
        callback(connected);
    }
    for (callback, value) in value_watchers {
        callback(&path, &value);
    }
}

struct AdvertisementFanout {
    device_path: String,
    device_props: Properties,
    changed: Vec<String>,
    callbacks: Vec<AdvertisementCallback>,
}

impl AdvertisementFanout {
    fn run(self) {
        for callback in &self.callbacks {
            // each callback gets its own deep copy of the property set
            callback(&self.device_path, self.device_props.clone(), &self.changed);
        }
    }
}

/// Snapshots the advertisement callbacks interested in `device_path`
/// (adapter path must prefix the device path) together with the device's
/// post-update property set, for invocation outside the state lock.
fn advertisement_fanout(
    st: &ManagerState,
    device_path: &str,
    changed: Vec<String>,
) -> AdvertisementFanout {
    let device_props = st
        .properties
        .get(device_path)
        .and_then(|ifaces| ifaces.get(DEVICE_INTERFACE))
        .cloned()
        .unwrap_or_default();

    let callbacks = st
        .advertisement_callbacks
        .iter()
        .filter(|entry| device_path.starts_with(&entry.adapter_path))
        .map(|entry| Arc::clone(&entry.callback))
        .collect();

    AdvertisementFanout {
        device_path: device_path.to_owned(),
        device_props,
        changed,
        callbacks,
    }
}

fn build_service_collection(st: &ManagerState, device_path: &str) -> Result<ServiceCollection> {
    let mut services = Vec::new();

    for service_path in sorted_children(st.service_map.get(device_path)) {
        let Some(service_props) = interface_props(st, &service_path, GATT_SERVICE_INTERFACE) else {
            warn!("service {} vanished while building snapshot", service_path);
            continue;
        };

        let mut characteristics = Vec::new();

        for char_path in sorted_children(st.characteristic_map.get(&service_path)) {
            let Some(char_props) = interface_props(st, &char_path, GATT_CHARACTERISTIC_INTERFACE)
            else {
                warn!("characteristic {} vanished while building snapshot", char_path);
                continue;
            };

            let mut descriptors = Vec::new();

            for desc_path in sorted_children(st.descriptor_map.get(&char_path)) {
                let Some(desc_props) = interface_props(st, &desc_path, GATT_DESCRIPTOR_INTERFACE)
                else {
                    warn!("descriptor {} vanished while building snapshot", desc_path);
                    continue;
                };

                descriptors.push(GattDescriptor {
                    path: desc_path.clone(),
                    uuid: parse_uuid(&desc_path, desc_props)?,
                    characteristic_path: char_path.clone(),
                    properties: desc_props.clone(),
                });
            }

            // "MTU" was added in BlueZ 5.62; absent or out-of-range values
            // fall back to the minimum MTU the Bluetooth spec mandates.
            let mtu = char_props
                .get("MTU")
                .and_then(Value::as_int)
                .and_then(|m| usize::try_from(m).ok())
                .unwrap_or(DEFAULT_ATT_MTU);

            characteristics.push(GattCharacteristic {
                path: char_path.clone(),
                uuid: parse_uuid(&char_path, char_props)?,
                service_path: service_path.clone(),
                flags: char_props
                    .get("Flags")
                    .and_then(Value::as_str_list)
                    .unwrap_or_default(),
                max_write_without_response_size: mtu.saturating_sub(ATT_HEADER_SIZE),
                properties: char_props.clone(),
                descriptors,
            });
        }

        services.push(GattService {
            path: service_path.clone(),
            uuid: parse_uuid(&service_path, service_props)?,
            primary: service_props
                .get("Primary")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            device_path: device_path.to_owned(),
            properties: service_props.clone(),
            characteristics,
        });
    }

    Ok(ServiceCollection {
        device_path: device_path.to_owned(),
        services,
    })
}

fn interface_props<'a>(st: &'a ManagerState, path: &str, interface: &str) -> Option<&'a Properties> {
    st.properties
        .get(path)
        .and_then(|ifaces| ifaces.get(interface))
}

fn sorted_children(children: Option<&HashSet<String>>) -> Vec<String> {
    let mut paths: Vec<String> = children.into_iter().flatten().cloned().collect();
    paths.sort();
    paths
}

fn parse_uuid(path: &str, props: &Properties) -> Result<Uuid> {
    let uuid = props
        .get("UUID")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MissingProperty {
            path: path.to_owned(),
            property: "UUID".to_owned(),
        })?;
    Uuid::parse_str(uuid)
        .map_err(|e| Error::InvalidReply(format!("invalid UUID '{}' on {}: {}", uuid, path, e)))
}
