//! Serial volume access.
//!
//! Volume-mutating RPCs are serialized per volume key: a request locks the
//! volume it targets before the handler runs and releases it afterwards, on
//! every exit path. Requests that cannot obtain the lock within the
//! configured timeout abort rather than queue indefinitely.

pub mod etcd;
pub mod lockprovider;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use tonic::Status;
use tracing::warn;

use k8s_csi::v1_3_0::*;

pub use lockprovider::{LockerError, TryLocker, VolumeKey, VolumeLockerProvider};

/// Derives the lock key a request must hold, `None` for methods that do not
/// mutate a volume. CreateVolume is the one method keyed by name; the
/// volume does not have an id yet.
pub trait VolumeTarget {
    fn volume_key(&self) -> Option<VolumeKey>;
}

impl VolumeTarget for CreateVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Name(self.name.clone()))
    }
}

impl VolumeTarget for DeleteVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Id(self.volume_id.clone()))
    }
}

impl VolumeTarget for ControllerPublishVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Id(self.volume_id.clone()))
    }
}

impl VolumeTarget for ControllerUnpublishVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Id(self.volume_id.clone()))
    }
}

impl VolumeTarget for NodeStageVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Id(self.volume_id.clone()))
    }
}

impl VolumeTarget for NodeUnstageVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Id(self.volume_id.clone()))
    }
}

impl VolumeTarget for NodePublishVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Id(self.volume_id.clone()))
    }
}

impl VolumeTarget for NodeUnpublishVolumeRequest {
    fn volume_key(&self) -> Option<VolumeKey> {
        Some(VolumeKey::Id(self.volume_id.clone()))
    }
}

macro_rules! not_volume_scoped {
    ($($ty:ty),* $(,)?) => {
        $(
            impl VolumeTarget for $ty {
                fn volume_key(&self) -> Option<VolumeKey> {
                    None
                }
            }
        )*
    };
}

not_volume_scoped!(
    ValidateVolumeCapabilitiesRequest,
    ListVolumesRequest,
    GetCapacityRequest,
    ControllerGetCapabilitiesRequest,
    CreateSnapshotRequest,
    DeleteSnapshotRequest,
    ListSnapshotsRequest,
    ControllerExpandVolumeRequest,
    ControllerGetVolumeRequest,
    NodeGetVolumeStatsRequest,
    NodeExpandVolumeRequest,
    NodeGetCapabilitiesRequest,
    NodeGetInfoRequest,
    GetPluginInfoRequest,
    GetPluginCapabilitiesRequest,
    ProbeRequest,
);

/// The serial volume access middleware.
pub struct SerialVolumeAccess {
    provider: Arc<dyn VolumeLockerProvider>,
    timeout: Duration,
}

impl SerialVolumeAccess {
    /// A zero timeout means a single immediate acquisition attempt.
    pub fn new(provider: Arc<dyn VolumeLockerProvider>, timeout: Duration) -> Self {
        SerialVolumeAccess { provider, timeout }
    }

    /// Locks the volume the request targets, returning a guard that must be
    /// released after the handler runs. `None` when the method is not
    /// volume-scoped.
    pub(crate) async fn acquire<R: VolumeTarget>(
        &self,
        request: &R,
    ) -> Result<Option<LockGuard>, Status> {
        let key = match request.volume_key() {
            Some(key) => key,
            None => return Ok(None),
        };

        let mut locker = match &key {
            VolumeKey::Id(id) => self.provider.lock_with_id(id).await,
            VolumeKey::Name(name) => self.provider.lock_with_name(name).await,
        }
        .map_err(|e| Status::internal(format!("volume lock provider: {}", e)))?;

        let acquired = locker
            .try_lock(self.timeout)
            .await
            .map_err(|e| Status::internal(format!("volume lock: {}", e)))?;
        if !acquired {
            if let Err(error) = locker.close().await {
                warn!(%key, %error, "unable to close unacquired volume locker");
            }
            return Err(Status::aborted(format!(
                "operation pending for volume: {}",
                key.value()
            )));
        }

        Ok(Some(LockGuard {
            locker: Some(locker),
            key,
        }))
    }
}

/// Holds a locked volume for the duration of a handler call. Dropping the
/// guard without [`release`](LockGuard::release) (cancellation, panic)
/// still frees the lock.
pub(crate) struct LockGuard {
    locker: Option<Box<dyn TryLocker>>,
    key: VolumeKey,
}

impl LockGuard {
    pub(crate) async fn release(mut self) {
        if let Some(mut locker) = self.locker.take() {
            if let Err(error) = locker.unlock().await {
                warn!(key = %self.key, %error, "unable to unlock volume");
            }
            if let Err(error) = locker.close().await {
                warn!(key = %self.key, %error, "unable to close volume locker");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(mut locker) = self.locker.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let key = self.key.clone();
                handle.spawn(async move {
                    if let Err(error) = locker.unlock().await {
                        warn!(%key, %error, "unable to unlock volume on drop");
                    }
                    if let Err(error) = locker.close().await {
                        warn!(%key, %error, "unable to close volume locker on drop");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::memory::MemoryLockProvider;
    use super::*;

    fn serializer(timeout: Duration) -> SerialVolumeAccess {
        SerialVolumeAccess::new(Arc::new(MemoryLockProvider::new()), timeout)
    }

    #[test]
    fn test_volume_key_derivation() {
        let req = CreateVolumeRequest {
            name: "v1".to_owned(),
            ..Default::default()
        };
        assert_eq!(req.volume_key(), Some(VolumeKey::Name("v1".to_owned())));

        let req = ControllerPublishVolumeRequest {
            volume_id: "v1".to_owned(),
            ..Default::default()
        };
        assert_eq!(req.volume_key(), Some(VolumeKey::Id("v1".to_owned())));

        assert_eq!(ListVolumesRequest::default().volume_key(), None);
        assert_eq!(ProbeRequest::default().volume_key(), None);
    }

    #[tokio::test]
    async fn test_acquire_aborts_on_contention() {
        let serializer = serializer(Duration::from_millis(50));
        let req = DeleteVolumeRequest {
            volume_id: "v1".to_owned(),
            ..Default::default()
        };

        let guard = serializer
            .acquire(&req)
            .await
            .expect("first acquire succeeds")
            .expect("delete is volume-scoped");

        let status = serializer
            .acquire(&req)
            .await
            .expect_err("second acquire must time out");
        assert_eq!(status.code(), tonic::Code::Aborted);
        assert!(status.message().contains("v1"));

        guard.release().await;

        serializer
            .acquire(&req)
            .await
            .expect("acquire after release succeeds")
            .expect("delete is volume-scoped")
            .release()
            .await;
    }

    #[tokio::test]
    async fn test_acquire_skips_unscoped_methods() {
        let serializer = serializer(Duration::ZERO);
        let guard = serializer
            .acquire(&ListVolumesRequest::default())
            .await
            .expect("acquire succeeds");
        assert!(guard.is_none());
    }

    #[tokio::test]
    async fn test_name_and_id_locks_are_disjoint() {
        let serializer = serializer(Duration::ZERO);

        let create = CreateVolumeRequest {
            name: "v1".to_owned(),
            ..Default::default()
        };
        let delete = DeleteVolumeRequest {
            volume_id: "v1".to_owned(),
            ..Default::default()
        };

        let g1 = serializer.acquire(&create).await.expect("name lock");
        let g2 = serializer.acquire(&delete).await.expect("id lock");
        assert!(g1.is_some() && g2.is_some());
    }

    #[tokio::test]
    async fn test_dropped_guard_frees_lock() {
        let serializer = serializer(Duration::ZERO);
        let req = DeleteVolumeRequest {
            volume_id: "v1".to_owned(),
            ..Default::default()
        };

        drop(serializer.acquire(&req).await.expect("first acquire"));
        // The drop path releases asynchronously.
        tokio::time::sleep(Duration::from_millis(50)).await;

        serializer
            .acquire(&req)
            .await
            .expect("acquire after drop succeeds")
            .expect("delete is volume-scoped")
            .release()
            .await;
    }
}
