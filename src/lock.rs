use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reader/writer lock whose acquisitions are tagged with a caller label.
///
/// The label shows up in trace output, which is how lock-ordering mistakes
/// between the scheduler lock and secondary maps get diagnosed. Convention:
/// always acquire the parent-scope lock before a child-scope lock.
#[derive(Debug)]
pub struct NamedRwLock<T> {
    name: &'static str,
    inner: RwLock<T>,
}

impl<T> NamedRwLock<T> {
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: RwLock::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn read(&self, caller: &str) -> RwLockReadGuard<'_, T> {
        tracing::trace!(lock = self.name, caller, "acquiring read lock");
        let guard = self.inner.read().await;
        tracing::trace!(lock = self.name, caller, "read lock acquired");
        guard
    }

    pub async fn write(&self, caller: &str) -> RwLockWriteGuard<'_, T> {
        tracing::trace!(lock = self.name, caller, "acquiring write lock");
        let guard = self.inner.write().await;
        tracing::trace!(lock = self.name, caller, "write lock acquired");
        guard
    }
}
