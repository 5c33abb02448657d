//! Device descriptors and scoped access to live device handles.

use std::io;

use api_types::DeviceClass;
use api_types::ModuleId;
use utils::shared_memory::DeviceRecord;

use crate::error::DeviceError;

pub mod block;
#[cfg(test)]
pub mod mock;

/// Static metadata of one registered module, copied out of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub module_id: ModuleId,
    pub dev_name: String,
    pub blk_name: String,
    pub hw_id: i32,
}

impl From<&DeviceRecord> for DeviceDescriptor {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            module_id: record.module_id,
            dev_name: record.dev_name().to_string(),
            blk_name: record.blk_name().to_string(),
            hw_id: record.hw_id,
        }
    }
}

/// Modules of one class as copied out of the pool in one lock scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSnapshot {
    pub class: DeviceClass,
    /// Descriptors in raw (load priority) order
    pub devices: Vec<DeviceDescriptor>,
}

impl ClassSnapshot {
    pub fn copy_from(class: DeviceClass, records: &[DeviceRecord]) -> Self {
        Self {
            class,
            devices: records.iter().map(DeviceDescriptor::from).collect(),
        }
    }

    /// Module ids in raw order.
    pub fn identifiers(&self) -> Vec<ModuleId> {
        self.devices.iter().map(|d| d.module_id).collect()
    }

    /// Looks up the descriptor of `module_id` in this copy.
    pub fn resolve(&self, module_id: ModuleId) -> Result<&DeviceDescriptor, DeviceError> {
        self.devices
            .iter()
            .find(|d| d.module_id == module_id)
            .ok_or(DeviceError::UnknownDevice {
                class: self.class,
                module_id,
            })
    }
}

/// Status record as reported by the device firmware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawStatus {
    pub current_load: u32,
    pub fw_model_load: u32,
    pub fw_video_mem_usage: u32,
    pub total_contexts: u32,
}

/// Normalized load metrics of one module for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub current_load: u32,
    pub model_load: u32,
    pub memory_usage: u32,
    pub instance_count: u32,
}

impl From<RawStatus> for LoadSnapshot {
    fn from(raw: RawStatus) -> Self {
        // idle modules can still report residual load
        let current_load = if raw.total_contexts == 0 {
            0
        } else {
            raw.current_load
        };

        Self {
            current_load,
            model_load: raw.fw_model_load,
            memory_usage: raw.fw_video_mem_usage,
            instance_count: raw.total_contexts,
        }
    }
}

/// An open device. Dropping the handle closes it.
pub trait DeviceHandle {
    fn query_status(&mut self, class: DeviceClass, hw_id: i32) -> io::Result<RawStatus>;
}

/// Opens devices described by the pool.
pub trait DeviceApi {
    type Handle: DeviceHandle;

    fn open(&self, descriptor: &DeviceDescriptor) -> io::Result<Self::Handle>;
}

/// Runs `scope` against an open handle for `descriptor`.
///
/// The handle is dropped, and therefore closed, before this returns on every
/// path.
pub fn with_device<A, R, F>(
    api: &A,
    class: DeviceClass,
    descriptor: &DeviceDescriptor,
    scope: F,
) -> Result<R, DeviceError>
where
    A: DeviceApi + ?Sized,
    F: FnOnce(&mut A::Handle) -> io::Result<R>,
{
    let mut handle = api
        .open(descriptor)
        .map_err(|source| DeviceError::OpenFailed {
            dev_name: descriptor.dev_name.clone(),
            blk_name: descriptor.blk_name.clone(),
            source,
        })?;

    let result = scope(&mut handle);
    drop(handle);

    result.map_err(|source| DeviceError::QueryFailed {
        class,
        dev_name: descriptor.dev_name.clone(),
        blk_name: descriptor.blk_name.clone(),
        hw_id: descriptor.hw_id,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::mock::FailureMode;
    use super::mock::MockDeviceApi;
    use super::*;

    fn descriptor(module_id: ModuleId, blk_name: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            module_id,
            dev_name: "/dev/nvme0".to_string(),
            blk_name: blk_name.to_string(),
            hw_id: 0,
        }
    }

    #[test]
    fn descriptor_copies_record_fields() {
        let record = DeviceRecord::new(3, 1, "/dev/nvme2", "/dev/nvme2n1", "2701a30");
        let descriptor = DeviceDescriptor::from(&record);

        assert_eq!(descriptor.module_id, 3);
        assert_eq!(descriptor.hw_id, 1);
        assert_eq!(descriptor.dev_name, "/dev/nvme2");
        assert_eq!(descriptor.blk_name, "/dev/nvme2n1");
    }

    #[test]
    fn zero_contexts_force_zero_load() {
        let snapshot = LoadSnapshot::from(RawStatus {
            current_load: 42,
            fw_model_load: 10,
            fw_video_mem_usage: 5,
            total_contexts: 0,
        });

        assert_eq!(snapshot.current_load, 0);
        assert_eq!(snapshot.model_load, 10);
        assert_eq!(snapshot.memory_usage, 5);
        assert_eq!(snapshot.instance_count, 0);
    }

    #[test]
    fn active_contexts_keep_raw_load() {
        let snapshot = LoadSnapshot::from(RawStatus {
            current_load: 42,
            total_contexts: 2,
            ..RawStatus::default()
        });
        assert_eq!(snapshot.current_load, 42);
        assert_eq!(snapshot.instance_count, 2);
    }

    #[test]
    fn class_snapshot_keeps_raw_order_and_resolves_ids() {
        let records = [
            DeviceRecord::new(4, 0, "/dev/nvme4", "/dev/nvme4n1", "2701a30"),
            DeviceRecord::new(1, 0, "/dev/nvme1", "/dev/nvme1n1", "2701a30"),
        ];
        let snapshot = ClassSnapshot::copy_from(DeviceClass::Decoder, &records);

        assert_eq!(snapshot.identifiers(), vec![4, 1]);
        assert_eq!(snapshot.resolve(1).unwrap().blk_name, "/dev/nvme1n1");
        assert!(matches!(
            snapshot.resolve(7),
            Err(DeviceError::UnknownDevice {
                class: DeviceClass::Decoder,
                module_id: 7
            })
        ));
    }

    #[test]
    fn handle_is_closed_on_success_and_failure() {
        let api = MockDeviceApi::new();
        api.set_status("/dev/nvme0n1", RawStatus::default());
        api.set_failure("/dev/nvme1n1", FailureMode::Query);
        api.set_failure("/dev/nvme2n1", FailureMode::Open);

        let ok = with_device(&api, DeviceClass::Encoder, &descriptor(0, "/dev/nvme0n1"), |h| {
            h.query_status(DeviceClass::Encoder, 0)
        });
        assert!(ok.is_ok());

        let query_failed =
            with_device(&api, DeviceClass::Encoder, &descriptor(1, "/dev/nvme1n1"), |h| {
                h.query_status(DeviceClass::Encoder, 0)
            });
        assert!(matches!(query_failed, Err(DeviceError::QueryFailed { .. })));

        let open_failed =
            with_device(&api, DeviceClass::Encoder, &descriptor(2, "/dev/nvme2n1"), |h| {
                h.query_status(DeviceClass::Encoder, 0)
            });
        assert!(matches!(open_failed, Err(DeviceError::OpenFailed { .. })));

        assert_eq!(api.opened(), 2);
        assert_eq!(api.closed(), 2);
    }
}
