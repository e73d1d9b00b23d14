//! Abstract message-bus boundary.
//!
//! The manager never talks to a concrete IPC transport. It is handed a
//! [`BusConnector`] and works against the [`Bus`] trait: typed method
//! calls out, typed replies or errors back, and an ordered stream of
//! asynchronous signals in. Framing, authentication and connection
//! lifecycle all live behind these traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::monitor::AdvertisementMonitor;
use crate::values::Value;

/// An outbound method call.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// Well-known name of the destination service.
    pub destination: String,
    /// Object path the call is addressed to.
    pub path: String,
    /// Interface that declares the method.
    pub interface: String,
    /// Method name.
    pub member: String,
    /// Typed argument list.
    pub body: Vec<Value>,
}

impl MethodCall {
    pub fn new(destination: &str, path: &str, interface: &str, member: &str) -> Self {
        Self {
            destination: destination.to_owned(),
            path: path.to_owned(),
            interface: interface.to_owned(),
            member: member.to_owned(),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.body = body;
        self
    }
}

/// A successful typed reply to a [`MethodCall`]. Error replies surface as
/// [`crate::Error::RemoteCall`] instead.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    pub body: Vec<Value>,
}

/// An inbound signal. The manager filters these by `member`; anything it
/// does not recognize is ignored.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Interface that emitted the signal.
    pub interface: String,
    /// Signal name.
    pub member: String,
    /// Object path the signal originates from.
    pub path: String,
    /// Typed signal payload.
    pub body: Vec<Value>,
}

/// A subscription rule scoping which signals the bus should deliver.
#[derive(Debug, Clone, Default)]
pub struct MatchRule {
    pub interface: Option<String>,
    pub member: Option<String>,
    /// Restrict to signals whose first argument is a path under this prefix.
    pub arg0_path: Option<String>,
    /// Restrict to signals emitted by objects under this path namespace.
    pub path_namespace: Option<String>,
}

impl MatchRule {
    pub fn member(interface: &str, member: &str) -> Self {
        Self {
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
            ..Self::default()
        }
    }

    pub fn with_arg0_path(mut self, prefix: &str) -> Self {
        self.arg0_path = Some(prefix.to_owned());
        self
    }

    pub fn with_path_namespace(mut self, namespace: &str) -> Self {
        self.path_namespace = Some(namespace.to_owned());
        self
    }
}

/// One live connection to the message bus.
///
/// A connection is never reused: the manager asks its [`BusConnector`] for
/// a fresh one on every (re)initialization and disconnects the old one.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Sends a method call and waits for the typed reply. Error replies
    /// are returned as [`crate::Error::RemoteCall`] carrying the
    /// machine-readable error name.
    async fn call(&self, call: MethodCall) -> Result<Reply>;

    /// Subscribes to signals matching `rule`.
    async fn add_match(&self, rule: MatchRule) -> Result<()>;

    /// Takes the inbound signal stream. Signals are delivered one at a
    /// time in arrival order. May only be taken once per connection.
    fn signals(&self) -> BoxStream<'static, Signal>;

    /// Publishes a local advertisement monitor object at `path` so the
    /// daemon can invoke its callbacks.
    async fn export_monitor(&self, path: &str, monitor: Arc<AdvertisementMonitor>) -> Result<()>;

    /// Removes a previously exported monitor object.
    async fn unexport_monitor(&self, path: &str) -> Result<()>;

    /// Whether the connection is still alive.
    fn is_connected(&self) -> bool;

    /// Tears the connection down. Idempotent.
    async fn disconnect(&self);
}

/// Factory for [`Bus`] connections, injected into the manager.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Opens a new connection to the bus.
    async fn connect(&self) -> Result<Arc<dyn Bus>>;
}
