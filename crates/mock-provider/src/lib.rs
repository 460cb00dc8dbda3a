//! An in-memory mock storage backend.
//!
//! Implements all three CSI services against a process-local volume table.
//! Used by the `mock-csi-plugin` binary and by the integration tests to
//! exercise the middleware pipeline; nothing here touches real storage.

mod controller;
mod identity;
mod node;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_csi::v1_3_0::Volume;
use tokio::sync::RwLock;

/// The plugin name advertised by the mock Identity service.
pub const DRIVER_NAME: &str = "mock.csi-kit.dev";
/// The vendor version advertised by the mock Identity service.
pub const VENDOR_VERSION: &str = "1.1.0";

const DEFAULT_CAPACITY_BYTES: i64 = 100 * 1024 * 1024 * 1024;

/// The mock backend. Cheap to clone; all clones share the same volume
/// table.
#[derive(Clone)]
pub struct MockPlugin {
    node_name: String,
    volumes: Arc<RwLock<HashMap<String, Volume>>>,
    publish_delay: Arc<RwLock<Option<Duration>>>,
    last_request_id: Arc<RwLock<Option<u64>>>,
    node_publish_called: Arc<RwLock<bool>>,
    node_unpublish_called: Arc<RwLock<bool>>,
}

impl MockPlugin {
    pub fn new(node_name: &str) -> Self {
        MockPlugin {
            node_name: node_name.to_owned(),
            volumes: Arc::new(RwLock::new(HashMap::new())),
            publish_delay: Arc::new(RwLock::new(None)),
            last_request_id: Arc::new(RwLock::new(None)),
            node_publish_called: Default::default(),
            node_unpublish_called: Default::default(),
        }
    }

    /// Makes ControllerPublishVolume sleep before answering. Lets tests
    /// hold a volume lock for a deterministic amount of time.
    pub async fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.write().await = Some(delay);
    }

    /// The request id observed on the most recent CreateVolume call, taken
    /// from the `csi.requestid` metadata the middleware injects.
    pub async fn last_request_id(&self) -> Option<u64> {
        *self.last_request_id.read().await
    }

    /// Whether NodePublishVolume has been called.
    pub async fn node_publish_called(&self) -> bool {
        *self.node_publish_called.read().await
    }

    /// Whether NodeUnpublishVolume has been called.
    pub async fn node_unpublish_called(&self) -> bool {
        *self.node_unpublish_called.read().await
    }

    async fn volume_exists(&self, volume_id: &str) -> bool {
        self.volumes.read().await.contains_key(volume_id)
    }
}
