use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{debug, error, trace};

/// Ticket for enqueuing into a group; a batch of the group is not sent while
/// an older ticket is still locked
#[derive(Clone)]
pub struct GroupLock {
    inner: Arc<GroupLockInner>,
}

struct GroupLockInner {
    group_id: String,
    serial: u64,
    owner: String,
    unlock_on_destroy: bool,
    locked: watch::Sender<bool>,
}

impl GroupLock {
    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn unlock_on_destroy(&self) -> bool {
        self.inner.unlock_on_destroy
    }

    pub fn is_locked(&self) -> bool {
        *self.inner.locked.borrow()
    }

    /// Releases the lock; releasing twice is a no-op
    pub fn unlock(&self) {
        if self.inner.locked.send_replace(false) {
            debug!(
                "🔓 Released lock {} for group {} (owner {})",
                self.inner.serial, self.inner.group_id, self.inner.owner
            );
        } else {
            trace!(
                "Lock {} for group {} was already released",
                self.inner.serial, self.inner.group_id
            );
        }
    }

    pub async fn wait_for_unlock(&self) {
        let mut receiver = self.inner.locked.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here
        let _ = receiver.wait_for(|locked| !*locked).await;
    }
}

impl std::fmt::Debug for GroupLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupLock")
            .field("group_id", &self.inner.group_id)
            .field("serial", &self.inner.serial)
            .field("owner", &self.inner.owner)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Hands out group locks and lets a submit wait for older ones
#[derive(Clone, Default)]
pub struct GroupLockManager {
    locks: Arc<Mutex<Vec<GroupLock>>>,
    next_serial: Arc<AtomicU64>,
}

impl GroupLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lock for `group_id`. An unlocked ticket only consumes a serial.
    pub fn lock_group(
        &self,
        group_id: &str,
        owner: &str,
        locked: bool,
        unlock_on_destroy: bool,
    ) -> GroupLock {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, _) = watch::channel(locked);
        let lock = GroupLock {
            inner: Arc::new(GroupLockInner {
                group_id: group_id.to_string(),
                serial,
                owner: owner.to_string(),
                unlock_on_destroy,
                locked: sender,
            }),
        };
        if locked {
            debug!("🔒 Acquired lock {} for group {} (owner {})", serial, group_id, owner);
            let mut locks = self.locks.lock();
            locks.retain(GroupLock::is_locked);
            locks.push(lock.clone());
        }
        lock
    }

    /// Serial of the most recently issued lock
    pub fn current_serial(&self) -> u64 {
        self.next_serial.load(Ordering::SeqCst)
    }

    /// Waits until every lock on `group_id` issued before `serial` is released
    pub async fn wait_for_earlier(&self, group_id: &str, serial: u64) {
        loop {
            let blocking = {
                let mut locks = self.locks.lock();
                locks.retain(GroupLock::is_locked);
                locks
                    .iter()
                    .find(|lock| lock.group_id() == group_id && lock.serial() <= serial)
                    .cloned()
            };
            match blocking {
                Some(lock) => {
                    debug!(
                        "⏳ Submit of group {} waits for lock {} (owner {})",
                        group_id,
                        lock.serial(),
                        lock.owner()
                    );
                    lock.wait_for_unlock().await;
                }
                None => return,
            }
        }
    }

    pub fn is_locked(&self, group_id: &str) -> bool {
        self.locks
            .lock()
            .iter()
            .any(|lock| lock.group_id() == group_id && lock.is_locked())
    }

    /// Releases the locks of a destroyed owner that asked for it
    pub fn unlock_owned_by(&self, owner: &str) {
        let owned: Vec<GroupLock> = self
            .locks
            .lock()
            .iter()
            .filter(|lock| lock.owner() == owner && lock.unlock_on_destroy())
            .cloned()
            .collect();
        for lock in owned {
            lock.unlock();
        }
    }

    /// Locks still held; reported as leaks when the model is disposed
    pub fn leaked_locks(&self) -> Vec<GroupLock> {
        let mut locks = self.locks.lock();
        locks.retain(GroupLock::is_locked);
        locks.clone()
    }

    pub fn report_leaks(&self) -> usize {
        let leaked = self.leaked_locks();
        for lock in &leaked {
            error!(
                "Leaked lock {} for group {} (owner {})",
                lock.serial(),
                lock.group_id(),
                lock.owner()
            );
        }
        leaked.len()
    }

    /// Get the number of currently held locks (for debugging)
    pub fn lock_count(&self) -> usize {
        self.leaked_locks().len()
    }
}
