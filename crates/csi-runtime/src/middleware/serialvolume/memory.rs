//! The in-process lock provider.
//!
//! Lock entries are reference counted: a request that finds an existing
//! entry increments the count, and the entry is removed from the map once
//! the last locker closes. The provider-level mutex guards only the map
//! itself and is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;

use super::lockprovider::{LockerError, TryLocker, VolumeLockerProvider};

type LockCell = Arc<tokio::sync::Mutex<()>>;

struct Entry {
    cell: LockCell,
    refs: usize,
}

#[derive(Default)]
struct Maps {
    ids: HashMap<String, Entry>,
    names: HashMap<String, Entry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Namespace {
    Id,
    Name,
}

/// A process-local [`VolumeLockerProvider`]. Construction cannot fail and
/// neither can any of its lockers' operations beyond misuse.
pub struct MemoryLockProvider {
    maps: Arc<Mutex<Maps>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        MemoryLockProvider {
            maps: Arc::new(Mutex::new(Maps::default())),
        }
    }

    fn acquire_entry(&self, ns: Namespace, key: &str) -> LockCell {
        let mut maps = match self.maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        let map = match ns {
            Namespace::Id => &mut maps.ids,
            Namespace::Name => &mut maps.names,
        };
        let entry = map.entry(key.to_owned()).or_insert_with(|| Entry {
            cell: Arc::new(tokio::sync::Mutex::new(())),
            refs: 0,
        });
        entry.refs += 1;
        entry.cell.clone()
    }

    fn release_entry(maps: &Arc<Mutex<Maps>>, ns: Namespace, key: &str) {
        let mut maps = match maps.lock() {
            Ok(maps) => maps,
            Err(poisoned) => poisoned.into_inner(),
        };
        let map = match ns {
            Namespace::Id => &mut maps.ids,
            Namespace::Name => &mut maps.names,
        };
        if let Some(entry) = map.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                map.remove(key);
            }
        }
    }

    #[cfg(test)]
    fn entry_counts(&self) -> (usize, usize) {
        let maps = self.maps.lock().expect("maps lock");
        (maps.ids.len(), maps.names.len())
    }
}

impl Default for MemoryLockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeLockerProvider for MemoryLockProvider {
    async fn lock_with_id(&self, id: &str) -> Result<Box<dyn TryLocker>, LockerError> {
        Ok(Box::new(MemoryLocker {
            maps: self.maps.clone(),
            ns: Namespace::Id,
            key: id.to_owned(),
            cell: self.acquire_entry(Namespace::Id, id),
            guard: None,
            closed: false,
        }))
    }

    async fn lock_with_name(&self, name: &str) -> Result<Box<dyn TryLocker>, LockerError> {
        Ok(Box::new(MemoryLocker {
            maps: self.maps.clone(),
            ns: Namespace::Name,
            key: name.to_owned(),
            cell: self.acquire_entry(Namespace::Name, name),
            guard: None,
            closed: false,
        }))
    }
}

struct MemoryLocker {
    maps: Arc<Mutex<Maps>>,
    ns: Namespace,
    key: String,
    cell: LockCell,
    guard: Option<OwnedMutexGuard<()>>,
    closed: bool,
}

#[async_trait]
impl TryLocker for MemoryLocker {
    async fn lock(&mut self) -> Result<(), LockerError> {
        if self.guard.is_some() {
            return Err(LockerError::AlreadyHeld);
        }
        self.guard = Some(self.cell.clone().lock_owned().await);
        Ok(())
    }

    async fn try_lock(&mut self, timeout: Duration) -> Result<bool, LockerError> {
        if self.guard.is_some() {
            return Err(LockerError::AlreadyHeld);
        }
        if timeout.is_zero() {
            return match self.cell.clone().try_lock_owned() {
                Ok(guard) => {
                    self.guard = Some(guard);
                    Ok(true)
                }
                Err(_) => Ok(false),
            };
        }
        match tokio::time::timeout(timeout, self.cell.clone().lock_owned()).await {
            Ok(guard) => {
                self.guard = Some(guard);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    async fn unlock(&mut self) -> Result<(), LockerError> {
        match self.guard.take() {
            Some(_guard) => Ok(()),
            None => Err(LockerError::NotHeld),
        }
    }

    async fn close(&mut self) -> Result<(), LockerError> {
        self.guard.take();
        if !self.closed {
            self.closed = true;
            MemoryLockProvider::release_entry(&self.maps, self.ns, &self.key);
        }
        Ok(())
    }
}

impl Drop for MemoryLocker {
    fn drop(&mut self) {
        if !self.closed {
            MemoryLockProvider::release_entry(&self.maps, self.ns, &self.key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_same_id_excludes() {
        let p = MemoryLockProvider::new();

        let mut a = p.lock_with_id("v1").await.expect("locker a");
        let mut b = p.lock_with_id("v1").await.expect("locker b");

        assert!(a.try_lock(Duration::ZERO).await.expect("try_lock a"));
        assert!(!b
            .try_lock(Duration::from_millis(50))
            .await
            .expect("try_lock b"));

        a.unlock().await.expect("unlock a");
        assert!(b
            .try_lock(Duration::from_millis(200))
            .await
            .expect("retry b"));

        b.unlock().await.expect("unlock b");
        a.close().await.expect("close a");
        b.close().await.expect("close b");
        assert_eq!(p.entry_counts(), (0, 0));
    }

    #[tokio::test]
    async fn test_try_lock_succeeds_when_freed_within_timeout() {
        let p = MemoryLockProvider::new();

        let mut a = p.lock_with_id("v1").await.expect("locker a");
        a.lock().await.expect("lock a");

        let mut b = p.lock_with_id("v1").await.expect("locker b");
        let unlock = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            a.unlock().await.expect("unlock a");
        };
        let (_, acquired) = tokio::join!(unlock, b.try_lock(Duration::from_secs(3)));
        assert!(acquired.expect("try_lock b"), "b should win once a unlocks");
    }

    #[tokio::test]
    async fn test_id_and_name_namespaces_are_disjoint() {
        let p = MemoryLockProvider::new();

        let mut by_id = p.lock_with_id("vol").await.expect("id locker");
        let mut by_name = p.lock_with_name("vol").await.expect("name locker");

        assert!(by_id.try_lock(Duration::ZERO).await.expect("id lock"));
        assert!(by_name.try_lock(Duration::ZERO).await.expect("name lock"));
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let p = Arc::new(MemoryLockProvider::new());

        let start = Instant::now();
        let mut tasks = Vec::new();
        for key in ["a", "b"] {
            let p = p.clone();
            tasks.push(tokio::spawn(async move {
                let mut locker = p.lock_with_id(key).await.expect("locker");
                assert!(locker.try_lock(Duration::ZERO).await.expect("try_lock"));
                tokio::time::sleep(Duration::from_millis(200)).await;
                locker.unlock().await.expect("unlock");
                locker.close().await.expect("close");
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }
        assert!(
            start.elapsed() < Duration::from_millis(390),
            "locks on distinct keys must not serialize"
        );
    }

    #[tokio::test]
    async fn test_drop_releases_entry_and_lock() {
        let p = MemoryLockProvider::new();

        {
            let mut a = p.lock_with_id("v1").await.expect("locker a");
            a.lock().await.expect("lock a");
            // Dropped while held.
        }
        assert_eq!(p.entry_counts(), (0, 0));

        let mut b = p.lock_with_id("v1").await.expect("locker b");
        assert!(b.try_lock(Duration::ZERO).await.expect("try_lock b"));
    }

    #[tokio::test]
    async fn test_misuse_errors() {
        let p = MemoryLockProvider::new();
        let mut a = p.lock_with_id("v1").await.expect("locker");

        assert!(matches!(a.unlock().await, Err(LockerError::NotHeld)));
        a.lock().await.expect("lock");
        assert!(matches!(a.lock().await, Err(LockerError::AlreadyHeld)));
    }
}
