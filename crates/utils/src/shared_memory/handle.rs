use std::cell::Cell;
use std::cell::RefCell;

use anyhow::Context;
use anyhow::Result;
use shared_memory::Mode;
use shared_memory::Shmem;
use shared_memory::ShmemConf;
use shared_memory::ShmemError;
use tracing::info;

use super::SharedDevicePool;
use super::POOL_LAYOUT_VERSION;

/// Safely access the device pool segment, automatically handling its lifecycle.
///
/// Every handle counts itself as attached while alive. The creating process
/// unlinks the segment on release only if nobody else is still attached.
pub struct SharedMemoryHandle {
    shmem: RefCell<Shmem>,
    ptr: *mut SharedDevicePool,
    identifier: String,
    released: Cell<bool>,
}

impl SharedMemoryHandle {
    /// Opens an existing, initialized pool segment.
    pub fn open(identifier: &str) -> Result<Self> {
        let shmem = ShmemConf::new()
            .size(std::mem::size_of::<SharedDevicePool>())
            .os_id(identifier)
            .open()
            .context("Failed to open shared memory")?;

        Self::attach(shmem, identifier)
    }

    /// Creates the pool segment, or opens it if another process got there first.
    ///
    /// Only the creating process writes the initial state; an existing segment
    /// is never reinitialized.
    pub fn create(identifier: &str) -> Result<Self> {
        let old_umask = unsafe { libc::umask(0) };

        let created = ShmemConf::new()
            .size(std::mem::size_of::<SharedDevicePool>())
            .os_id(identifier)
            .mode(
                Mode::S_IRUSR
                    | Mode::S_IWUSR
                    | Mode::S_IRGRP
                    | Mode::S_IWGRP
                    | Mode::S_IROTH
                    | Mode::S_IWOTH,
            )
            .create();

        unsafe {
            libc::umask(old_umask);
        }

        let shmem = match created {
            Ok(shmem) => shmem,
            Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {
                return Self::open(identifier);
            }
            Err(e) => return Err(anyhow::anyhow!("Failed to create shared memory: {}", e)),
        };

        let ptr = shmem.as_ptr() as *mut SharedDevicePool;
        unsafe {
            ptr.write(SharedDevicePool::new());
            (*ptr).publish();
        }

        info!(
            identifier = %identifier,
            size = std::mem::size_of::<SharedDevicePool>(),
            "Created device pool segment"
        );

        Self::attach(shmem, identifier)
    }

    fn attach(shmem: Shmem, identifier: &str) -> Result<Self> {
        let ptr = shmem.as_ptr() as *mut SharedDevicePool;
        let handle = Self {
            shmem: RefCell::new(shmem),
            ptr,
            identifier: identifier.to_string(),
            // not attached yet; flipped below once the layout is accepted
            released: Cell::new(true),
        };

        let state = handle.get_state();
        if !state.is_initialized() {
            anyhow::bail!("Device pool segment {identifier} is not initialized yet");
        }
        if state.layout_version() != POOL_LAYOUT_VERSION {
            anyhow::bail!(
                "Device pool segment {identifier} has layout v{}, expected v{}",
                state.layout_version(),
                POOL_LAYOUT_VERSION
            );
        }

        state.cleanup_orphaned_locks();
        let attached = state.attach();
        handle.released.set(false);
        tracing::debug!(identifier = %identifier, attached, "Attached to device pool");

        Ok(handle)
    }

    pub fn is_owner(&self) -> bool {
        self.shmem.borrow().is_owner()
    }

    /// Gets a reference to the shared pool.
    pub fn get_state(&self) -> &SharedDevicePool {
        unsafe { &*self.ptr }
    }

    /// Gets the shared memory identifier.
    pub fn get_identifier(&self) -> &str {
        &self.identifier
    }

    /// Detaches from the segment. Safe to call more than once.
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }

        let remaining = self.get_state().detach();
        let mut shmem = self.shmem.borrow_mut();
        if !shmem.is_owner() {
            return;
        }

        if remaining == 0 {
            info!(
                identifier = %self.identifier,
                "No other processes attached to device pool, allowing cleanup"
            );
        } else {
            info!(
                identifier = %self.identifier,
                attached = remaining,
                "Other processes still attached to device pool, preserving it"
            );
            shmem.set_owner(false);
        }
    }
}

// The pool only holds atomics and the ShmMutex-protected queues.
unsafe impl Send for SharedMemoryHandle {}

impl Drop for SharedMemoryHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::process;

    use api_types::DeviceClass;
    use test_log::test;

    use super::*;

    fn shared_memory_file_exists(identifier: &str) -> bool {
        std::path::Path::new(&format!("/dev/shm/{identifier}")).exists()
    }

    fn unique_identifier(test_name: &str) -> String {
        format!("test_rsrc_pool_{}_{}", test_name, process::id())
    }

    #[test]
    fn create_then_open_share_state() {
        let identifier = unique_identifier("create_open");

        let creator = SharedMemoryHandle::create(&identifier).unwrap();
        assert!(creator.is_owner());
        assert!(shared_memory_file_exists(&identifier));
        assert_eq!(creator.get_state().attached_count(), 1);

        let reader = SharedMemoryHandle::open(&identifier).unwrap();
        assert!(!reader.is_owner());
        assert_eq!(reader.get_state().attached_count(), 2);

        creator
            .get_state()
            .queue()
            .lock()
            .class_mut(DeviceClass::Decoder)
            .register(0, "/dev/nvme0", "/dev/nvme0n1", "2701a30")
            .unwrap();

        let ids = reader
            .get_state()
            .queue()
            .lock()
            .class(DeviceClass::Decoder)
            .module_ids();
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn second_create_does_not_reinitialize() {
        let identifier = unique_identifier("second_create");

        let first = SharedMemoryHandle::create(&identifier).unwrap();
        first
            .get_state()
            .queue()
            .lock()
            .class_mut(DeviceClass::Encoder)
            .register(0, "/dev/nvme0", "/dev/nvme0n1", "")
            .unwrap();

        let second = SharedMemoryHandle::create(&identifier).unwrap();
        assert!(!second.is_owner());
        assert_eq!(
            second
                .get_state()
                .queue()
                .lock()
                .class(DeviceClass::Encoder)
                .len(),
            1
        );
    }

    #[test]
    fn open_missing_segment_fails() {
        assert!(SharedMemoryHandle::open("non_existent_rsrc_pool").is_err());
    }

    #[test]
    fn release_is_idempotent_and_removes_unused_segment() {
        let identifier = unique_identifier("release");

        let handle = SharedMemoryHandle::create(&identifier).unwrap();
        handle.release();
        handle.release();
        assert_eq!(handle.get_state().attached_count(), 0);

        drop(handle);
        assert!(SharedMemoryHandle::open(&identifier).is_err());
    }

    #[test]
    fn owner_preserves_segment_while_others_attached() {
        let identifier = unique_identifier("preserve");

        let creator = SharedMemoryHandle::create(&identifier).unwrap();
        let reader = SharedMemoryHandle::open(&identifier).unwrap();

        drop(creator);
        assert!(shared_memory_file_exists(&identifier));
        assert_eq!(reader.get_state().attached_count(), 1);

        drop(reader);
        std::fs::remove_file(format!("/dev/shm/{identifier}")).unwrap();
    }
}
