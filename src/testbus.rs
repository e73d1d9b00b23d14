//! Scriptable in-memory bus used by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

use crate::bus::{Bus, BusConnector, MatchRule, MethodCall, Reply, Signal};
use crate::constants::{INTERFACES_ADDED, INTERFACES_REMOVED, OBJECT_MANAGER_INTERFACE,
    PROPERTIES_CHANGED, PROPERTIES_INTERFACE};
use crate::error::{Error, Result};
use crate::monitor::AdvertisementMonitor;
use crate::values::{Properties, Value};

pub struct MockBus {
    pub calls: Mutex<Vec<MethodCall>>,
    pub matches: Mutex<Vec<MatchRule>>,
    pub exported: Mutex<HashMap<String, Arc<AdvertisementMonitor>>>,
    /// Ordered log of calls and monitor exports, for ordering assertions.
    pub events: Mutex<Vec<String>>,
    managed_objects: Mutex<Value>,
    failures: Mutex<HashMap<String, (String, String)>>,
    fail_add_match: AtomicBool,
    connected: AtomicBool,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            matches: Mutex::new(Vec::new()),
            exported: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            managed_objects: Mutex::new(Value::Map(HashMap::new())),
            failures: Mutex::new(HashMap::new()),
            fail_add_match: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        })
    }

    pub fn set_managed_objects(&self, objects: Value) {
        *self.managed_objects.lock().unwrap() = objects;
    }

    /// Makes every call to `member` fail with the given error reply.
    pub fn fail_call(&self, member: &str, name: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(member.to_owned(), (name.to_owned(), message.to_owned()));
    }

    pub fn fail_add_match(&self) {
        self.fail_add_match.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, signal: Signal) {
        let _ = self.signal_tx.send(signal);
    }

    pub fn calls_for(&self, member: &str) -> Vec<MethodCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.member == member)
            .cloned()
            .collect()
    }

    pub fn was_disconnected(&self) -> bool {
        !self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Bus for MockBus {
    async fn call(&self, call: MethodCall) -> Result<Reply> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        self.calls.lock().unwrap().push(call.clone());
        self.events
            .lock()
            .unwrap()
            .push(format!("call:{}", call.member));

        if let Some((name, message)) = self.failures.lock().unwrap().get(&call.member) {
            return Err(Error::remote(name.clone(), message.clone()));
        }

        if call.member == "GetManagedObjects" {
            return Ok(Reply {
                body: vec![self.managed_objects.lock().unwrap().clone()],
            });
        }

        Ok(Reply::default())
    }

    async fn add_match(&self, rule: MatchRule) -> Result<()> {
        if self.fail_add_match.load(Ordering::SeqCst) {
            return Err(Error::remote(
                "org.freedesktop.DBus.Error.AccessDenied",
                "match rule rejected",
            ));
        }
        if let Some(member) = &rule.member {
            self.events.lock().unwrap().push(format!("match:{}", member));
        }
        self.matches.lock().unwrap().push(rule);
        Ok(())
    }

    fn signals(&self) -> BoxStream<'static, Signal> {
        let mut rx = self
            .signal_rx
            .lock()
            .unwrap()
            .take()
            .expect("signal stream already taken");
        Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }

    async fn export_monitor(&self, path: &str, monitor: Arc<AdvertisementMonitor>) -> Result<()> {
        self.exported.lock().unwrap().insert(path.to_owned(), monitor);
        self.events.lock().unwrap().push(format!("export:{}", path));
        Ok(())
    }

    async fn unexport_monitor(&self, path: &str) -> Result<()> {
        self.exported.lock().unwrap().remove(path);
        self.events.lock().unwrap().push(format!("unexport:{}", path));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    bus: Mutex<Arc<MockBus>>,
}

impl MockConnector {
    pub fn new(bus: Arc<MockBus>) -> Self {
        Self { bus: Mutex::new(bus) }
    }

    /// Swaps in a fresh bus for the next connect, simulating a bus reset.
    pub fn replace(&self, bus: Arc<MockBus>) {
        *self.bus.lock().unwrap() = bus;
    }
}

#[async_trait]
impl BusConnector for MockConnector {
    async fn connect(&self) -> Result<Arc<dyn Bus>> {
        Ok(Arc::clone(&self.bus.lock().unwrap()) as Arc<dyn Bus>)
    }
}

// Builders for mirrored objects and signals.

pub fn props(pairs: Vec<(&str, Value)>) -> Properties {
    pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
}

pub fn objects(entries: Vec<(&str, Vec<(&str, Properties)>)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(path, ifaces)| {
                (
                    path.to_owned(),
                    Value::Map(
                        ifaces
                            .into_iter()
                            .map(|(iface, props)| (iface.to_owned(), Value::Map(props)))
                            .collect(),
                    ),
                )
            })
            .collect(),
    )
}

pub fn interfaces_added(path: &str, interface: &str, props: Properties) -> Signal {
    Signal {
        interface: OBJECT_MANAGER_INTERFACE.to_owned(),
        member: INTERFACES_ADDED.to_owned(),
        path: "/".to_owned(),
        body: vec![
            Value::Str(path.to_owned()),
            Value::Map(HashMap::from([(interface.to_owned(), Value::Map(props))])),
        ],
    }
}

pub fn interfaces_removed(path: &str, interfaces: Vec<&str>) -> Signal {
    Signal {
        interface: OBJECT_MANAGER_INTERFACE.to_owned(),
        member: INTERFACES_REMOVED.to_owned(),
        path: "/".to_owned(),
        body: vec![
            Value::Str(path.to_owned()),
            Value::List(interfaces.into_iter().map(Value::from).collect()),
        ],
    }
}

pub fn properties_changed(
    path: &str,
    interface: &str,
    changed: Properties,
    invalidated: Vec<&str>,
) -> Signal {
    Signal {
        interface: PROPERTIES_INTERFACE.to_owned(),
        member: PROPERTIES_CHANGED.to_owned(),
        path: path.to_owned(),
        body: vec![
            Value::Str(interface.to_owned()),
            Value::Map(changed),
            Value::List(invalidated.into_iter().map(Value::from).collect()),
        ],
    }
}

/// Yields to the runtime so the dispatch task can drain emitted signals.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
