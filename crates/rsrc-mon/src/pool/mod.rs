//! Process-side handle on the host-wide device pool.

use std::time::Duration;

use api_types::DeviceClass;
use api_types::ModuleId;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use utils::shared_memory::handle::SharedMemoryHandle;
use utils::shared_memory::DeviceQueue;

use crate::config::DEFAULT_SHM_ID;
use crate::device::ClassSnapshot;
use crate::error::PoolError;
use crate::error::PoolResult;
use crate::pool::discovery::reconcile;
use crate::pool::discovery::DeviceDiscovery;
use crate::pool::discovery::RefreshSummary;

pub mod discovery;
#[cfg(test)]
pub mod mock;

/// Read side of the pool as seen by the monitor.
pub trait PoolAccess {
    /// Copies the raw (load priority) order of a class, together with the
    /// descriptor of every module in it, in a single pool lock scope.
    fn snapshot_class(&self, class: DeviceClass) -> PoolResult<ClassSnapshot>;

    /// Re-scans the host and reconciles the pool with what was found.
    fn refresh(&self, match_fw_revision: bool) -> PoolResult<RefreshSummary>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub shm_id: String,
    pub match_fw_revision: bool,
    /// Zero waits for a device indefinitely
    pub init_timeout: Duration,
    pub lock_timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            shm_id: DEFAULT_SHM_ID.to_string(),
            match_fw_revision: true,
            init_timeout: Duration::ZERO,
            lock_timeout: Duration::from_secs(1),
            retry_interval: Duration::from_secs(1),
        }
    }
}

/// Attachment to the shared device pool plus the discovery used to refresh it.
pub struct ResourcePool {
    handle: Option<SharedMemoryHandle>,
    discovery: Box<dyn DeviceDiscovery>,
    lock_timeout: Duration,
}

impl ResourcePool {
    /// Attaches to (or creates) the pool and waits until it holds at least one
    /// module.
    pub async fn initialize(
        config: &PoolConfig,
        discovery: Box<dyn DeviceDiscovery>,
        cancellation_token: &CancellationToken,
    ) -> PoolResult<Self> {
        let handle = SharedMemoryHandle::create(&config.shm_id).map_err(|e| {
            Report::new(PoolError::PoolUnavailable)
                .attach_printable(format!("shared memory {}: {e:#}", config.shm_id))
        })?;

        let state = handle.get_state();
        let last_refresh = state.last_refresh();
        if last_refresh > 0 {
            info!(
                shm_id = %config.shm_id,
                last_refresh,
                attached = state.attached_count(),
                "Attached to existing resource pool"
            );
        }

        let pool = Self {
            handle: Some(handle),
            discovery,
            lock_timeout: config.lock_timeout,
        };

        let started = Instant::now();
        let deadline = (!config.init_timeout.is_zero()).then(|| started + config.init_timeout);

        loop {
            match pool.refresh(config.match_fw_revision) {
                Ok(summary) if summary.total > 0 => {
                    info!(
                        shm_id = %config.shm_id,
                        devices = summary.total,
                        "Resource pool initialized"
                    );
                    return Ok(pool);
                }
                Ok(_) => debug!("No compatible device registered yet"),
                Err(report) => warn!(error = ?report, "Pool refresh failed during initialization"),
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Report::new(PoolError::InitTimeout {
                            seconds: config.init_timeout.as_secs(),
                        }));
                    }
                    remaining.min(config.retry_interval)
                }
                None => config.retry_interval,
            };

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Pool initialization cancelled");
                    return Err(Report::new(PoolError::Cancelled));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Runs `scope` with the pool lock held. The lock is released when
    /// `scope` returns or unwinds.
    pub fn with_pool_lock<R, F>(&self, scope: F) -> PoolResult<R>
    where
        F: FnOnce(&mut DeviceQueue) -> R,
    {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Report::new(PoolError::PoolUnavailable).attach_printable("pool released"))?;

        let queue = handle.get_state().queue();
        let mut guard = queue.try_lock_for(self.lock_timeout).ok_or_else(|| {
            Report::new(PoolError::LockUnavailable {
                timeout_ms: self.lock_timeout.as_millis() as u64,
            })
            .attach_printable(format!("lock held by pid {:?}", queue.holder()))
        })?;

        Ok(scope(&mut *guard))
    }

    /// Records the load a scheduler assigned to a module and restores load
    /// order. Returns false if the module is not registered.
    pub fn record_load(
        &self,
        class: DeviceClass,
        module_id: ModuleId,
        load: u32,
    ) -> PoolResult<bool> {
        self.with_pool_lock(|queue| queue.class_mut(class).set_load(module_id, load))
    }

    /// Detaches from the shared segment. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!(shm_id = %handle.get_identifier(), "Releasing resource pool");
            handle.release();
        }
    }
}

impl PoolAccess for ResourcePool {
    fn snapshot_class(&self, class: DeviceClass) -> PoolResult<ClassSnapshot> {
        self.with_pool_lock(|queue| ClassSnapshot::copy_from(class, queue.class(class).records()))
    }

    fn refresh(&self, match_fw_revision: bool) -> PoolResult<RefreshSummary> {
        let scanned = self
            .discovery
            .scan(match_fw_revision)
            .change_context(PoolError::RefreshCorruption)?;

        // a busy lock is reported as such, only a failed reconcile is corruption
        let summary = self
            .with_pool_lock(|queue| reconcile(queue, &scanned))?
            .change_context(PoolError::RefreshCorruption)?;

        if let Some(handle) = &self.handle {
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            handle.get_state().mark_refreshed(now);
        }

        if summary.added > 0 || summary.removed > 0 {
            info!(
                added = summary.added,
                removed = summary.removed,
                total = summary.total,
                "Resource pool refreshed"
            );
        }
        Ok(summary)
    }
}

impl Drop for ResourcePool {
    fn drop(&mut self) {
        self.release();
    }
}
