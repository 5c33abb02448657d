use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::yield_now;
use std::time::{Duration, Instant};

/// Spin lock that lives inside a shared memory segment.
///
/// The lock word holds the pid of the owning process (0 when free), so any
/// process mapping the segment can see who holds it and reclaim the lock if
/// that process has died while holding it. Only processes that go through this
/// lock are excluded; it is advisory.
#[repr(C)]
pub struct ShmMutex<T> {
    lock: AtomicUsize,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for ShmMutex<T> {}
unsafe impl<T: Send> Sync for ShmMutex<T> {}

pub struct ShmMutexGuard<'a, T> {
    mutex: &'a ShmMutex<T>,
}

impl<T> Drop for ShmMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl<T> Deref for ShmMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for ShmMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

fn current_pid() -> usize {
    std::process::id() as usize
}

impl<T> ShmMutex<T> {
    pub fn new(data: T) -> Self {
        ShmMutex {
            lock: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Checks if a process with the given PID exists
    fn is_process_alive(pid: usize) -> bool {
        if pid == 0 {
            return false;
        }

        // kill(pid, 0) fails with ESRCH once the process is gone; EPERM still means alive.
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
            rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
        }

        #[cfg(not(unix))]
        {
            true
        }
    }

    /// Attempts to clean up the lock if the holding process is dead
    fn try_cleanup_dead_lock(&self) -> bool {
        let current_holder = self.lock.load(Ordering::Acquire);
        if current_holder == 0 || Self::is_process_alive(current_holder) {
            return false;
        }

        match self
            .lock
            .compare_exchange(current_holder, 0, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => {
                tracing::warn!(
                    holder_pid = current_holder,
                    "Reclaimed pool lock held by dead process"
                );
                true
            }
            Err(_) => false,
        }
    }

    /// Forcefully cleans up any orphaned locks during startup
    pub fn cleanup_orphaned_lock(&self) {
        let current_holder = self.lock.load(Ordering::Acquire);
        if current_holder != 0 && !Self::is_process_alive(current_holder) {
            self.lock.store(0, Ordering::Release);
            tracing::info!(
                holder_pid = current_holder,
                "Cleaned up orphaned pool lock during startup"
            );
        }
    }

    /// Pid of the process currently holding the lock.
    pub fn holder(&self) -> Option<usize> {
        match self.lock.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Single acquisition attempt, reclaiming a dead holder's lock first.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_, T>> {
        let pid = current_pid();
        loop {
            if self
                .lock
                .compare_exchange(0, pid, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(ShmMutexGuard { mutex: self });
            }
            if !self.try_cleanup_dead_lock() {
                return None;
            }
        }
    }

    /// Spins until the lock is acquired or `timeout` elapses.
    pub fn try_lock_for(&self, timeout: Duration) -> Option<ShmMutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                return None;
            }
            Self::backoff();
        }
    }

    pub fn lock(&self) -> ShmMutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            Self::backoff();
        }
    }

    fn backoff() {
        for _ in 0..100 {
            spin_loop();
        }
        yield_now();
    }

    fn unlock(&self) {
        let pid = current_pid();
        if self
            .lock
            .compare_exchange(pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            tracing::warn!(
                pid,
                holder_pid = self.lock.load(Ordering::Relaxed),
                "process tried to unlock pool lock it does not own"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_basic_lock_unlock() {
        let mutex = ShmMutex::new(42);

        {
            let guard = mutex.lock();
            assert_eq!(*guard, 42);
            assert_eq!(mutex.holder(), Some(current_pid()));
        }

        assert_eq!(mutex.holder(), None);
        let guard = mutex.lock();
        assert_eq!(*guard, 42);
    }

    #[test]
    fn test_concurrent_access() {
        let mutex = Arc::new(ShmMutex::new(0));
        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];

        for _ in 0..4 {
            let mutex_clone = Arc::clone(&mutex);
            let barrier_clone = Arc::clone(&barrier);

            let handle = thread::spawn(move || {
                barrier_clone.wait();

                for _ in 0..100 {
                    let mut guard = mutex_clone.lock();
                    *guard += 1;
                }
            });

            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let guard = mutex.lock();
        assert_eq!(*guard, 400);
    }

    #[test]
    fn test_try_lock_for_times_out_while_held() {
        let mutex = ShmMutex::new(vec![1, 2, 3]);
        let _guard = mutex.lock();

        let start = Instant::now();
        assert!(mutex.try_lock_for(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_dead_holder_is_reclaimed() {
        let mutex = ShmMutex::new(7);

        // Spawn and reap a child so its pid is known to be dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as usize;
        child.wait().unwrap();
        mutex.lock.store(dead_pid, Ordering::Release);

        let guard = mutex
            .try_lock_for(Duration::from_millis(100))
            .expect("lock held by dead process should be reclaimed");
        assert_eq!(*guard, 7);
        assert_eq!(mutex.holder(), Some(current_pid()));
    }

    #[test]
    fn test_cleanup_orphaned_lock() {
        let mutex = ShmMutex::new(());

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as usize;
        child.wait().unwrap();
        mutex.lock.store(dead_pid, Ordering::Release);

        mutex.cleanup_orphaned_lock();
        assert_eq!(mutex.holder(), None);
    }

    #[test]
    fn test_live_foreign_holder_is_respected() {
        let mutex = ShmMutex::new(());
        // pid 1 is always alive
        mutex.lock.store(1, Ordering::Release);

        assert!(mutex.try_lock().is_none());
        mutex.cleanup_orphaned_lock();
        assert_eq!(mutex.holder(), Some(1));
    }

    #[test]
    fn test_panic_during_lock_releases() {
        let mutex = Arc::new(ShmMutex::new(0));
        let mutex_clone = Arc::clone(&mutex);

        let handle = thread::spawn(move || {
            let _guard = mutex_clone.lock();
            panic!("intentional panic");
        });

        let result = handle.join();
        assert!(result.is_err());

        let guard = mutex.lock();
        assert_eq!(*guard, 0);
    }

    #[test]
    fn test_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<ShmMutex<i32>>();
        assert_sync::<ShmMutex<i32>>();
    }
}
