use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use api_types::DeviceClass;
use api_types::ModuleId;
use tracing::warn;

use crate::shared_memory::mutex::ShmMutex;

pub mod handle;
pub mod mutex;

/// Maximum number of modules of one class held in the pool
pub const MAX_DEVICES_PER_CLASS: usize = 32;
/// Maximum length of a device path (including null terminator)
pub const MAX_PATH_LEN: usize = 64;
/// Maximum length of a firmware revision string (including null terminator)
pub const MAX_FW_REV_LEN: usize = 16;
/// Layout version of [`SharedDevicePool`]; bumped on any layout change.
pub const POOL_LAYOUT_VERSION: u32 = 2;

const POOL_MAGIC: u64 = u64::from_le_bytes(*b"RSRCPOOL");

/// Errors raised while mutating a [`ClassQueue`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("{class} queue is full ({capacity} modules)")]
    Full { class: DeviceClass, capacity: usize },

    #[error("{class} queue holds {count} modules, capacity is {capacity}")]
    CountOutOfRange {
        class: DeviceClass,
        count: usize,
        capacity: usize,
    },

    #[error("{class} module id {module_id} registered twice")]
    DuplicateModule {
        class: DeviceClass,
        module_id: ModuleId,
    },

    #[error("{class} module path {path} does not fit in {max_len} bytes")]
    PathTooLong {
        class: DeviceClass,
        path: String,
        max_len: usize,
    },

    #[error("queue slot {found} found where the {class} queue belongs")]
    SlotMismatch { class: DeviceClass, found: u32 },

    #[error("{class} module id {module_id} is not below the next free id {next_module_id}")]
    ModuleIdAhead {
        class: DeviceClass,
        module_id: ModuleId,
        next_module_id: ModuleId,
    },
}

fn write_fixed<const N: usize>(dst: &mut [u8; N], value: &str) {
    // keep room for the terminator and never split a UTF-8 sequence
    let mut len = value.len().min(N - 1);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    dst.fill(0);
    dst[..len].copy_from_slice(&value.as_bytes()[..len]);
}

fn read_fixed(src: &[u8]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or_default()
}

/// Registration of one module in the pool.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRecord {
    pub module_id: ModuleId,
    /// Hardware sub-index of the module on its card
    pub hw_id: i32,
    /// Load as last recorded by a scheduler; drives the pool order
    pub load: u32,
    dev_name: [u8; MAX_PATH_LEN],
    blk_name: [u8; MAX_PATH_LEN],
    fw_rev: [u8; MAX_FW_REV_LEN],
}

impl DeviceRecord {
    pub const EMPTY: DeviceRecord = DeviceRecord {
        module_id: -1,
        hw_id: 0,
        load: 0,
        dev_name: [0; MAX_PATH_LEN],
        blk_name: [0; MAX_PATH_LEN],
        fw_rev: [0; MAX_FW_REV_LEN],
    };

    pub fn new(module_id: ModuleId, hw_id: i32, dev_name: &str, blk_name: &str, fw_rev: &str) -> Self {
        let mut record = Self::EMPTY;
        record.module_id = module_id;
        record.hw_id = hw_id;
        write_fixed(&mut record.dev_name, dev_name);
        write_fixed(&mut record.blk_name, blk_name);
        write_fixed(&mut record.fw_rev, fw_rev);
        record
    }

    /// Path to the controller device, e.g. `/dev/nvme0`
    pub fn dev_name(&self) -> &str {
        read_fixed(&self.dev_name)
    }

    /// Path to the namespace block device, e.g. `/dev/nvme0n1`
    pub fn blk_name(&self) -> &str {
        read_fixed(&self.blk_name)
    }

    pub fn fw_rev(&self) -> &str {
        read_fixed(&self.fw_rev)
    }
}

/// Modules of one class, kept in ascending load order.
///
/// The first record is the module a scheduler hands out next. Writers must
/// call [`ClassQueue::sort_by_load`] (or go through [`ClassQueue::set_load`])
/// after changing loads so that this holds for readers.
#[repr(C)]
pub struct ClassQueue {
    /// [`DeviceClass::slot`] of the class; kept as an integer since other
    /// processes write this memory
    slot: u32,
    count: u32,
    next_module_id: ModuleId,
    records: [DeviceRecord; MAX_DEVICES_PER_CLASS],
}

impl ClassQueue {
    pub fn new(class: DeviceClass) -> Self {
        Self {
            slot: class.slot() as u32,
            count: 0,
            next_module_id: 0,
            records: [DeviceRecord::EMPTY; MAX_DEVICES_PER_CLASS],
        }
    }

    /// Class stored in the slot field. An out of range slot reads as
    /// decoder; [`DeviceQueue::validate`] rejects it.
    pub fn class(&self) -> DeviceClass {
        DeviceClass::ALL
            .get(self.slot as usize)
            .copied()
            .unwrap_or(DeviceClass::Decoder)
    }

    pub fn len(&self) -> usize {
        (self.count as usize).min(MAX_DEVICES_PER_CLASS)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records in pool order.
    pub fn records(&self) -> &[DeviceRecord] {
        &self.records[..self.len()]
    }

    /// Copies the module ids in pool order.
    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.records().iter().map(|r| r.module_id).collect()
    }

    pub fn find(&self, module_id: ModuleId) -> Option<&DeviceRecord> {
        self.records().iter().find(|r| r.module_id == module_id)
    }

    pub fn find_by_blk_name(&self, blk_name: &str) -> Option<&DeviceRecord> {
        self.records().iter().find(|r| r.blk_name() == blk_name)
    }

    /// Registers a module under the next free id and appends it to the queue.
    ///
    /// Paths are matched against later scans, so one that would not be stored
    /// whole is rejected.
    pub fn register(
        &mut self,
        hw_id: i32,
        dev_name: &str,
        blk_name: &str,
        fw_rev: &str,
    ) -> Result<ModuleId, QueueError> {
        let class = self.class();
        if let Some(path) = [dev_name, blk_name]
            .into_iter()
            .find(|path| path.len() >= MAX_PATH_LEN)
        {
            warn!(%class, path, "Device path too long, module not registered");
            return Err(QueueError::PathTooLong {
                class,
                path: path.to_string(),
                max_len: MAX_PATH_LEN - 1,
            });
        }

        let len = self.len();
        if len >= MAX_DEVICES_PER_CLASS {
            warn!(%class, blk_name, "Pool queue full, module not registered");
            return Err(QueueError::Full {
                class,
                capacity: MAX_DEVICES_PER_CLASS,
            });
        }

        let module_id = self.next_module_id;
        self.records[len] = DeviceRecord::new(module_id, hw_id, dev_name, blk_name, fw_rev);
        self.count = (len + 1) as u32;
        self.next_module_id += 1;
        Ok(module_id)
    }

    /// Removes a module, keeping the relative order of the rest.
    pub fn remove(&mut self, module_id: ModuleId) -> Option<DeviceRecord> {
        let len = self.len();
        let index = self.records().iter().position(|r| r.module_id == module_id)?;
        let removed = self.records[index];
        self.records.copy_within(index + 1..len, index);
        self.records[len - 1] = DeviceRecord::EMPTY;
        self.count = (len - 1) as u32;
        Some(removed)
    }

    /// Keeps only the records for which `keep` returns true.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<DeviceRecord>
    where
        F: FnMut(&DeviceRecord) -> bool,
    {
        let removed: Vec<DeviceRecord> = self
            .records()
            .iter()
            .filter(|&r| !keep(r))
            .copied()
            .collect();
        for record in &removed {
            self.remove(record.module_id);
        }
        removed
    }

    /// Records a new load for a module and restores load order.
    pub fn set_load(&mut self, module_id: ModuleId, load: u32) -> bool {
        let len = self.len();
        match self.records[..len]
            .iter_mut()
            .find(|r| r.module_id == module_id)
        {
            Some(record) => {
                record.load = load;
                self.sort_by_load();
                true
            }
            None => false,
        }
    }

    /// Stable sort by recorded load; equal loads keep their current order.
    pub fn sort_by_load(&mut self) {
        let len = self.len();
        self.records[..len].sort_by_key(|r| r.load);
    }

    /// Checks the invariants every writer must uphold.
    pub fn validate(&self) -> Result<(), QueueError> {
        let class = self.class();
        let count = self.count as usize;
        if count > MAX_DEVICES_PER_CLASS {
            return Err(QueueError::CountOutOfRange {
                class,
                count,
                capacity: MAX_DEVICES_PER_CLASS,
            });
        }

        let records = self.records();
        for (i, record) in records.iter().enumerate() {
            if records[..i].iter().any(|r| r.module_id == record.module_id) {
                return Err(QueueError::DuplicateModule {
                    class,
                    module_id: record.module_id,
                });
            }
            if record.module_id >= self.next_module_id {
                return Err(QueueError::ModuleIdAhead {
                    class,
                    module_id: record.module_id,
                    next_module_id: self.next_module_id,
                });
            }
        }
        Ok(())
    }
}

/// Decoder and encoder queues, protected together by the pool lock.
#[repr(C)]
pub struct DeviceQueue {
    queues: [ClassQueue; 2],
}

impl DeviceQueue {
    pub fn new() -> Self {
        Self {
            queues: DeviceClass::ALL.map(ClassQueue::new),
        }
    }

    pub fn class(&self, class: DeviceClass) -> &ClassQueue {
        &self.queues[class.slot()]
    }

    pub fn class_mut(&mut self, class: DeviceClass) -> &mut ClassQueue {
        &mut self.queues[class.slot()]
    }

    /// Validates every class queue and that each sits in its own slot.
    pub fn validate(&self) -> Result<(), QueueError> {
        for class in DeviceClass::ALL {
            let queue = self.class(class);
            if queue.slot as usize != class.slot() {
                return Err(QueueError::SlotMismatch {
                    class,
                    found: queue.slot,
                });
            }
            queue.validate()?;
        }
        Ok(())
    }

    /// Total number of registered modules across classes.
    pub fn device_count(&self) -> usize {
        self.queues.iter().map(ClassQueue::len).sum()
    }
}

impl Default for DeviceQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Device pool shared by every process on the host.
///
/// Only plain data and atomics live here so the struct can be mapped by
/// unrelated processes. The queues are read and written exclusively under
/// [`SharedDevicePool::queue`].
#[repr(C)]
pub struct SharedDevicePool {
    magic: AtomicU64,
    layout_version: AtomicU32,
    attached: AtomicU32,
    last_refresh: AtomicU64,
    queue: ShmMutex<DeviceQueue>,
}

impl SharedDevicePool {
    /// Creates an empty pool; the segment becomes visible as initialized
    /// only after [`SharedDevicePool::publish`].
    pub fn new() -> Self {
        Self {
            magic: AtomicU64::new(0),
            layout_version: AtomicU32::new(POOL_LAYOUT_VERSION),
            attached: AtomicU32::new(0),
            last_refresh: AtomicU64::new(0),
            queue: ShmMutex::new(DeviceQueue::new()),
        }
    }

    pub(crate) fn publish(&self) {
        self.magic.store(POOL_MAGIC, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == POOL_MAGIC
    }

    pub fn layout_version(&self) -> u32 {
        self.layout_version.load(Ordering::Acquire)
    }

    /// The advisory lock and the queues it protects.
    pub fn queue(&self) -> &ShmMutex<DeviceQueue> {
        &self.queue
    }

    /// Registers one more attached process, returning the new count.
    pub fn attach(&self) -> u32 {
        self.attached.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Unregisters an attached process, returning the remaining count.
    pub fn detach(&self) -> u32 {
        let previous = self
            .attached
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn attached_count(&self) -> u32 {
        self.attached.load(Ordering::Acquire)
    }

    pub fn mark_refreshed(&self, timestamp: u64) {
        self.last_refresh.store(timestamp, Ordering::Release);
    }

    /// Unix seconds of the last successful refresh, 0 if never refreshed.
    pub fn last_refresh(&self) -> u64 {
        self.last_refresh.load(Ordering::Acquire)
    }

    /// Releases a pool lock left behind by a crashed process.
    pub fn cleanup_orphaned_locks(&self) {
        self.queue.cleanup_orphaned_lock();
    }
}

impl Default for SharedDevicePool {
    fn default() -> Self {
        Self::new()
    }
}
