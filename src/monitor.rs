//! Advertisement monitor objects for passive scanning.
//!
//! For passive scanning the daemon does not filter advertisements itself;
//! instead the client exports a monitor object carrying a set of
//! "or patterns" and the daemon calls back into it. This module defines
//! the pattern triples and the exported object.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

/// One advertisement filter pattern. An advertisement matches the monitor
/// when it matches any registered pattern.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct OrPattern {
    /// AD structure type to match against, e.g. 0x16 for service data.
    pub data_type: u8,
    /// Byte offset into the AD structure where `content` must appear.
    pub start_position: u8,
    /// Bytes that must appear at `start_position`.
    pub content: Vec<u8>,
}

impl OrPattern {
    pub fn new(data_type: u8, start_position: u8, content: Vec<u8>) -> Self {
        Self {
            data_type,
            start_position,
            content,
        }
    }
}

/// The locally exported `org.bluez.AdvertisementMonitor1` object.
///
/// The daemon drives the lifecycle methods; this crate only logs them.
/// Matched advertisements still arrive through the regular device
/// property signals, so `device_found` needs no bookkeeping here.
#[derive(Debug)]
pub struct AdvertisementMonitor {
    patterns: Vec<OrPattern>,
}

impl AdvertisementMonitor {
    pub fn new(patterns: Vec<OrPattern>) -> Self {
        Self { patterns }
    }

    /// The patterns this monitor was registered with, exactly as supplied.
    pub fn or_patterns(&self) -> &[OrPattern] {
        &self.patterns
    }

    /// Monitor type reported to the daemon.
    pub fn monitor_type(&self) -> &'static str {
        "or_patterns"
    }

    /// Called by the daemon when the monitor is no longer needed.
    pub fn release(&self) {
        debug!("advertisement monitor released");
    }

    /// Called by the daemon when the monitor becomes active.
    pub fn activate(&self) {
        debug!("advertisement monitor activated");
    }

    /// Called by the daemon when the monitor is deactivated.
    pub fn deactivate(&self) {
        debug!("advertisement monitor deactivated");
    }

    /// Called by the daemon when a device matches one of the patterns.
    pub fn device_found(&self, device_path: &str) {
        debug!("advertisement monitor matched device {}", device_path);
    }
}

static MONITOR_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Derives a process- and instance-unique object path for a monitor, so
/// several processes and several sessions within one process can register
/// monitors without colliding.
pub fn unique_monitor_path() -> String {
    let seq = MONITOR_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("/org/bluez_bridge/{}/{}", std::process::id(), seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_paths_are_unique_per_instance() {
        let a = unique_monitor_path();
        let b = unique_monitor_path();
        assert_ne!(a, b);
        assert!(a.starts_with("/org/bluez_bridge/"));
    }

    #[test]
    fn monitor_keeps_patterns_unmodified() {
        let patterns = vec![OrPattern::new(0x16, 0, vec![0x4c, 0x00])];
        let monitor = AdvertisementMonitor::new(patterns.clone());
        assert_eq!(monitor.or_patterns(), &patterns[..]);
        assert_eq!(monitor.monitor_type(), "or_patterns");
    }
}
