use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;

use api_types::DeviceClass;
use api_types::ModuleId;
use error_stack::Report;

use super::discovery::RefreshSummary;
use super::PoolAccess;
use crate::device::ClassSnapshot;
use crate::device::DeviceDescriptor;
use crate::error::PoolError;
use crate::error::PoolResult;

/// In-process pool double holding the raw order of each class directly.
///
/// Module `id` lives on `/dev/nvme{id}` with namespace `/dev/nvme{id}n1`.
#[derive(Default)]
pub struct MockPool {
    order: RefCell<HashMap<DeviceClass, Vec<ModuleId>>>,
    lock_unavailable: Cell<bool>,
    refresh_fails: Cell<bool>,
    refreshes: Cell<usize>,
    lock_attempts: Cell<usize>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blk_name(module_id: ModuleId) -> String {
        format!("/dev/nvme{module_id}n1")
    }

    pub fn set_order(&self, class: DeviceClass, ids: &[ModuleId]) {
        self.order.borrow_mut().insert(class, ids.to_vec());
    }

    pub fn set_lock_unavailable(&self, unavailable: bool) {
        self.lock_unavailable.set(unavailable);
    }

    pub fn set_refresh_fails(&self, fails: bool) {
        self.refresh_fails.set(fails);
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.get()
    }

    /// Times the pool lock was asked for, busy or not.
    pub fn lock_attempts(&self) -> usize {
        self.lock_attempts.get()
    }

    fn check_lock(&self) -> PoolResult<()> {
        self.lock_attempts.set(self.lock_attempts.get() + 1);
        if self.lock_unavailable.get() {
            return Err(Report::new(PoolError::LockUnavailable { timeout_ms: 1000 }));
        }
        Ok(())
    }
}

impl PoolAccess for MockPool {
    fn snapshot_class(&self, class: DeviceClass) -> PoolResult<ClassSnapshot> {
        self.check_lock()?;
        let devices = self
            .order
            .borrow()
            .get(&class)
            .map(|ids| {
                ids.iter()
                    .map(|&module_id| DeviceDescriptor {
                        module_id,
                        dev_name: format!("/dev/nvme{module_id}"),
                        blk_name: Self::blk_name(module_id),
                        hw_id: 0,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(ClassSnapshot { class, devices })
    }

    fn refresh(&self, _match_fw_revision: bool) -> PoolResult<RefreshSummary> {
        self.refreshes.set(self.refreshes.get() + 1);
        if self.refresh_fails.get() {
            return Err(Report::new(PoolError::RefreshCorruption));
        }
        self.check_lock()?;

        let total = self.order.borrow().values().map(Vec::len).sum();
        Ok(RefreshSummary {
            total,
            ..RefreshSummary::default()
        })
    }
}
