//! Shared API type definitions
//!
//! This crate contains the types that make up the monitor's external contract:
//! device classes and the report schema emitted on every poll. Report sinks
//! serialize these types directly, so field names here are the wire names.

use chrono::DateTime;
use chrono::Local;
use serde::Deserialize;
use serde::Serialize;

/// Module identifier assigned by the resource pool, unique within a device class.
pub type ModuleId = i32;

/// Category of accelerator module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Decoder,
    Encoder,
}

impl DeviceClass {
    /// All classes, in report order.
    pub const ALL: [DeviceClass; 2] = [DeviceClass::Decoder, DeviceClass::Encoder];

    /// Stable slot used to index per-class storage.
    pub const fn slot(self) -> usize {
        match self {
            DeviceClass::Decoder => 0,
            DeviceClass::Encoder => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DeviceClass::Decoder => "decoder",
            DeviceClass::Encoder => "encoder",
        }
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rendered row of a class report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRow {
    /// Whether this device is the one a scheduler would pick next
    pub best: bool,
    /// Module identifier
    pub identifier: ModuleId,
    /// Realtime load
    pub current_load: u32,
    /// Estimated load based on framerate and resolution
    pub model_load: u32,
    /// Video memory usage
    pub memory_usage: u32,
    /// Number of active job instances
    pub instance_count: u32,
    /// Path to the device file handle
    pub device_path: String,
    /// Path to the namespace (block) file handle
    pub namespace_path: String,
}

/// Report for one device class in one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub class: DeviceClass,
    /// Devices registered in the pool for this class, including ones that did not respond
    pub device_count: usize,
    /// Rows sorted ascending by identifier
    pub rows: Vec<ReportRow>,
}

impl ClassReport {
    /// Row currently marked best, if any.
    pub fn best(&self) -> Option<&ReportRow> {
        self.rows.iter().find(|row| row.best)
    }
}

/// Everything rendered for a single poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollReport {
    pub timestamp: DateTime<Local>,
    /// Seconds since the monitor started
    pub uptime_secs: u64,
    pub version: String,
    pub classes: Vec<ClassReport>,
}
