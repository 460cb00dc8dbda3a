//! The volume locker contract shared by the lock providers and the serial
//! volume access middleware. Keeping the traits in their own module lets
//! both sides depend on them without depending on each other.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// The identity a volume is locked under. Id keys and name keys are
/// disjoint namespaces; a name lock does not exclude an id lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeKey {
    /// The volume id issued by the controller.
    Id(String),
    /// The volume name chosen by the requester.
    Name(String),
}

impl VolumeKey {
    pub fn value(&self) -> &str {
        match self {
            VolumeKey::Id(v) | VolumeKey::Name(v) => v,
        }
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeKey::Id(v) => write!(f, "id={}", v),
            VolumeKey::Name(v) => write!(f, "name={}", v),
        }
    }
}

/// Errors surfaced by lockers and providers. The in-memory provider only
/// produces the usage variants; the etcd provider also surfaces transport
/// and session failures.
#[derive(Debug, Error)]
pub enum LockerError {
    #[error("lock is already held by this locker")]
    AlreadyHeld,
    #[error("lock is not held by this locker")]
    NotHeld,
    #[error("etcd: {0}")]
    Etcd(#[from] etcd_client::Error),
}

/// An exclusive lock over one volume key.
///
/// At most one locker holds a given key at a time, `unlock` is only valid
/// for the current holder, and `close` releases whatever resources back the
/// locker (a map entry, a lease session). Implementations release held
/// locks on drop so a cancelled or panicking request cannot strand a
/// volume.
#[async_trait]
pub trait TryLocker: Send {
    /// Acquires the lock, waiting as long as it takes. Dropping the future
    /// abandons the attempt without holding the lock.
    async fn lock(&mut self) -> Result<(), LockerError>;

    /// Attempts to acquire the lock within `timeout`. Returns `true` iff
    /// the lock was acquired.
    async fn try_lock(&mut self, timeout: Duration) -> Result<bool, LockerError>;

    /// Releases the lock.
    async fn unlock(&mut self) -> Result<(), LockerError>;

    /// Releases the underlying resources. Implies `unlock` when the lock is
    /// still held.
    async fn close(&mut self) -> Result<(), LockerError>;
}

/// Yields lockers for volumes addressed by id or by name. Lockers returned
/// for the same key must mutually exclude, whether or not the provider
/// returns the same underlying object.
#[async_trait]
pub trait VolumeLockerProvider: Send + Sync {
    /// Gets a locker for the volume with the given id, creating one if none
    /// exists.
    async fn lock_with_id(&self, id: &str) -> Result<Box<dyn TryLocker>, LockerError>;

    /// Gets a locker for the volume with the given name, creating one if
    /// none exists.
    async fn lock_with_name(&self, name: &str) -> Result<Box<dyn TryLocker>, LockerError>;
}
