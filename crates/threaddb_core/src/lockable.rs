//! Per-key read/write locks.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type KeyLock = Arc<RwLock<()>>;

#[derive(Debug)]
struct Inner {
    prefix: String,
    default_timeout: Option<Duration>,
    locks: Mutex<HashMap<String, KeyLock>>,
}

/// A lazily populated map of key paths to reader/writer locks.
///
/// Locks are created on first use and removed again once no holder or
/// waiter references them. Keys must be the configured prefix itself or
/// lie beneath it (`prefix/...`).
///
/// # Example
///
/// ```rust
/// # tokio_test_block_on(async {
/// use threaddb_core::Semaphore;
///
/// let semaphore = Semaphore::new("people", None);
/// let a = semaphore.read_lock("people/a", None).await.unwrap();
/// let b = semaphore.read_lock("people/a", None).await.unwrap();
/// drop((a, b));
/// assert_eq!(semaphore.len(), 0);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

/// A held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    guard: Option<Guard>,
    owner: Arc<Inner>,
}

#[derive(Debug)]
enum Guard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

impl Semaphore {
    /// Creates a semaphore scoped to `prefix`. `default_timeout` applies
    /// when a lock call passes no timeout of its own; `None` waits forever.
    pub fn new(prefix: impl Into<String>, default_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                prefix: prefix.into(),
                default_timeout,
                locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The key prefix this semaphore guards.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    /// Number of live locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.locks.lock().len()
    }

    /// Returns true if no lock is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquires a shared lock on `key`.
    ///
    /// # Errors
    ///
    /// [`CoreError::LockScope`] if `key` is outside the prefix,
    /// [`CoreError::LockTimeout`] if the lock was not acquired in time.
    pub async fn read_lock(&self, key: &str, timeout: Option<Duration>) -> CoreResult<LockHandle> {
        let lock = self.entry(key)?;
        let acquired = self.wait(key, timeout, lock.read_owned()).await;
        self.finish(key, acquired.map(Guard::Read))
    }

    /// Acquires an exclusive lock on `key`.
    ///
    /// # Errors
    ///
    /// [`CoreError::LockScope`] if `key` is outside the prefix,
    /// [`CoreError::LockTimeout`] if the lock was not acquired in time.
    pub async fn write_lock(&self, key: &str, timeout: Option<Duration>) -> CoreResult<LockHandle> {
        let lock = self.entry(key)?;
        let acquired = self.wait(key, timeout, lock.write_owned()).await;
        self.finish(key, acquired.map(Guard::Write))
    }

    /// Releases a lock. Equivalent to dropping the handle.
    pub fn unlock(&self, handle: LockHandle) {
        drop(handle);
    }

    fn entry(&self, key: &str) -> CoreResult<KeyLock> {
        if !self.in_scope(key) {
            return Err(CoreError::LockScope {
                key: key.to_string(),
                prefix: self.inner.prefix.clone(),
            });
        }
        let mut locks = self.inner.locks.lock();
        Ok(Arc::clone(locks.entry(key.to_string()).or_default()))
    }

    fn in_scope(&self, key: &str) -> bool {
        let prefix = &self.inner.prefix;
        prefix.is_empty()
            || key == prefix
            || key
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }

    async fn wait<G>(
        &self,
        key: &str,
        timeout: Option<Duration>,
        acquire: impl std::future::Future<Output = G>,
    ) -> CoreResult<G> {
        match timeout.or(self.inner.default_timeout) {
            None => Ok(acquire.await),
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| CoreError::LockTimeout {
                    key: key.to_string(),
                }),
        }
    }

    fn finish(&self, key: &str, acquired: CoreResult<Guard>) -> CoreResult<LockHandle> {
        match acquired {
            Ok(guard) => Ok(LockHandle {
                key: key.to_string(),
                guard: Some(guard),
                owner: Arc::clone(&self.inner),
            }),
            Err(err) => {
                // The timed-out future and its Arc are gone; collect if idle.
                collect_idle(&self.inner, key);
                tracing::debug!(key, "lock acquisition timed out");
                Err(err)
            }
        }
    }
}

/// A component whose keys are guarded by a [`Semaphore`].
pub trait Lockable {
    /// The semaphore guarding this component's keys.
    fn semaphore(&self) -> &Semaphore;

    /// The lock path for one of this component's keys.
    fn lock_key(&self, key: &str) -> String {
        format!("{}/{}", self.semaphore().prefix(), key)
    }
}

impl LockHandle {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns true for an exclusive lock.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.guard, Some(Guard::Write(_)))
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        drop(self.guard.take());
        collect_idle(&self.owner, &self.key);
    }
}

fn collect_idle(inner: &Inner, key: &str) {
    let mut locks = inner.locks.lock();
    if let Some(lock) = locks.get(key) {
        // Only the map itself still references the lock.
        if Arc::strong_count(lock) == 1 {
            locks.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn readers_share_writers_exclude() {
        let semaphore = Semaphore::new("people", None);
        let r1 = semaphore.read_lock("people/a", None).await.unwrap();
        let _r2 = semaphore.read_lock("people/a", None).await.unwrap();

        let blocked = semaphore
            .write_lock("people/a", Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(blocked, Err(CoreError::LockTimeout { .. })));

        // Other keys are independent.
        let other = semaphore.write_lock("people/b", None).await.unwrap();
        assert!(other.is_write());
        drop(other);

        drop(r1);
        drop(_r2);
        let w = semaphore
            .write_lock("people/a", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(w.key(), "people/a");
    }

    #[tokio::test]
    async fn idle_locks_are_collected() {
        let semaphore = Semaphore::new("p", None);
        let a = semaphore.write_lock("p/a", None).await.unwrap();
        let _ = semaphore
            .read_lock("p/a", Some(Duration::from_millis(5)))
            .await;
        assert_eq!(semaphore.len(), 1);
        semaphore.unlock(a);
        assert!(semaphore.is_empty());
    }

    #[tokio::test]
    async fn keys_outside_prefix_are_rejected() {
        let semaphore = Semaphore::new("people", None);
        assert!(matches!(
            semaphore.read_lock("peoplex/a", None).await,
            Err(CoreError::LockScope { .. })
        ));
        assert!(matches!(
            semaphore.read_lock("pets/a", None).await,
            Err(CoreError::LockScope { .. })
        ));
        assert!(semaphore.read_lock("people", None).await.is_ok());
    }

    #[tokio::test]
    async fn waiting_writer_acquires_after_release() {
        let semaphore = Semaphore::new("", None);
        let held = semaphore.write_lock("k", None).await.unwrap();
        let contender = semaphore.clone();
        let start = Instant::now();
        let task = tokio::spawn(async move {
            let _w = contender.write_lock("k", None).await.unwrap();
            start.elapsed()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(held);
        let waited = task.await.unwrap();
        assert!(waited >= Duration::from_millis(30));
        assert!(semaphore.is_empty());
    }

    #[tokio::test]
    async fn default_timeout_applies() {
        let semaphore = Semaphore::new("", Some(Duration::from_millis(10)));
        let _held = semaphore.write_lock("k", None).await.unwrap();
        assert!(matches!(
            semaphore.read_lock("k", None).await,
            Err(CoreError::LockTimeout { .. })
        ));
    }
}
