//! Error types for the BlueZ bridge.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the object-tree manager and scan sessions.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested adapter is not present in the mirrored object tree.
    #[error("adapter '{0}' not found")]
    AdapterNotFound(String),

    /// The requested device is not present in the mirrored object tree.
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    /// The daemon replied to a method call with an error. The
    /// machine-readable error name is preserved alongside the message.
    #[error("{name}: {message}")]
    RemoteCall { name: String, message: String },

    /// The daemon does not implement the advertisement monitor API.
    #[error(
        "passive scanning on Linux requires BlueZ >= 5.55 with --experimental \
         enabled and Linux kernel >= 5.10"
    )]
    PassiveScanNotSupported,

    /// An operation was attempted before the bus was connected, or after
    /// it was torn down.
    #[error("not connected to the message bus")]
    NotConnected,

    /// A reply from the daemon did not have the expected shape.
    #[error("malformed reply: {0}")]
    InvalidReply(String),

    /// A mirrored object is missing a property the operation requires.
    #[error("object '{path}' has no '{property}' property")]
    MissingProperty { path: String, property: String },

    /// The caller supplied arguments that can never work.
    #[error("{0}")]
    InvalidArguments(String),
}

impl Error {
    /// Remote-call error constructor used by bus implementations.
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::RemoteCall {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Returns the machine-readable error name for remote-call failures.
    pub fn error_name(&self) -> Option<&str> {
        match self {
            Error::RemoteCall { name, .. } => Some(name),
            _ => None,
        }
    }
}
