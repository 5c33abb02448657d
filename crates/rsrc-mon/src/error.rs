use core::error::Error;
use std::io;

use api_types::DeviceClass;
use api_types::ModuleId;
use error_stack::Report;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, Report<PoolError>>;

/// Pool-level failures. Fatal during initialization, degraded-mode afterwards.
#[derive(Debug, derive_more::Display)]
pub enum PoolError {
    #[display("no compatible device found within {seconds}s")]
    InitTimeout { seconds: u64 },
    #[display("resource pool unavailable")]
    PoolUnavailable,
    #[display("resource pool records might be corrupted")]
    RefreshCorruption,
    #[display("pool lock not acquired within {timeout_ms}ms")]
    LockUnavailable { timeout_ms: u64 },
    #[display("pool initialization cancelled")]
    Cancelled,
}

impl PoolError {
    /// Another process held the pool lock; the pool itself may be fine.
    pub fn is_lock_busy(&self) -> bool {
        matches!(self, PoolError::LockUnavailable { .. })
    }
}

impl Error for PoolError {}

/// Failures that cost exactly one report row.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("{class} module {module_id} is no longer registered in the pool")]
    UnknownDevice {
        class: DeviceClass,
        module_id: ModuleId,
    },

    #[error("failed to open device {dev_name}, blk device {blk_name}")]
    OpenFailed {
        dev_name: String,
        blk_name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to query {class} {dev_name} {blk_name}.{hw_id}")]
    QueryFailed {
        class: DeviceClass,
        dev_name: String,
        blk_name: String,
        hw_id: i32,
        #[source]
        source: io::Error,
    },
}
