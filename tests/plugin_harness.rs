//! Full-stack tests: a mock plugin served through the middleware pipeline
//! on a unix socket, exercised with the tonic generated CSI clients.

use std::path::Path;
use std::time::{Duration, Instant};

use csi_runtime::config::{Config, Endpoint, PluginInfo};
use csi_runtime::grpc_sock;
use csi_runtime::plugin::StoragePlugin;
use k8s_csi::v1_3_0::controller_client::ControllerClient;
use k8s_csi::v1_3_0::identity_client::IdentityClient;
use k8s_csi::v1_3_0::node_client::NodeClient;
use k8s_csi::v1_3_0::volume_capability::access_mode::Mode;
use k8s_csi::v1_3_0::volume_capability::{AccessMode, AccessType, MountVolume};
use k8s_csi::v1_3_0::*;
use mock_provider::MockPlugin;
use tonic::transport::Channel;

struct TestPlugin {
    mock: MockPlugin,
    channel: Channel,
    shutdown: tokio::sync::oneshot::Sender<()>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
    _tempdir: tempfile::TempDir,
}

impl TestPlugin {
    fn controller(&self) -> ControllerClient<Channel> {
        ControllerClient::new(self.channel.clone())
    }

    fn identity(&self) -> IdentityClient<Channel> {
        IdentityClient::new(self.channel.clone())
    }

    fn node(&self) -> NodeClient<Channel> {
        NodeClient::new(self.channel.clone())
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        self.server
            .await
            .expect("server task")
            .expect("server should shut down cleanly");
    }
}

async fn start_plugin<F: FnOnce(&mut Config)>(tweak: F) -> TestPlugin {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let path = tempdir.path().join("csi.sock");

    let mut config = Config {
        endpoint: Some(Endpoint::Unix(path.clone())),
        spec_req_validation: true,
        spec_rep_validation: true,
        serial_vol_access: true,
        serial_vol_access_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    tweak(&mut config);

    let mock = MockPlugin::new("test-node");
    let plugin = StoragePlugin {
        controller: Some(mock.clone()),
        identity: Some(mock.clone()),
        node: Some(mock.clone()),
        before_serve: None,
        env_vars: Vec::new(),
    };

    let (shutdown, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(plugin.serve(config, async {
        let _ = rx.await;
    }));

    let channel = connect_with_retry(&path).await;
    TestPlugin {
        mock,
        channel,
        shutdown,
        server,
        _tempdir: tempdir,
    }
}

async fn connect_with_retry(path: &Path) -> Channel {
    for _ in 0..50 {
        if let Ok(channel) = grpc_sock::socket_channel(path).await {
            return channel;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("unable to connect to {}", path.display());
}

fn mount_capability() -> VolumeCapability {
    VolumeCapability {
        access_type: Some(AccessType::Mount(MountVolume::default())),
        access_mode: Some(AccessMode {
            mode: Mode::SingleNodeWriter as i32,
        }),
    }
}

fn create_volume_request(name: &str) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.to_owned(),
        volume_capabilities: vec![mount_capability()],
        ..Default::default()
    }
}

fn publish_request(volume_id: &str) -> ControllerPublishVolumeRequest {
    ControllerPublishVolumeRequest {
        volume_id: volume_id.to_owned(),
        node_id: "test-node".to_owned(),
        volume_capability: Some(mount_capability()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_volume() {
    let plugin = start_plugin(|_| {}).await;
    let mut controller = plugin.controller();

    let response = controller
        .create_volume(create_volume_request("v1"))
        .await
        .expect("valid create should succeed");
    assert_eq!(
        response
            .get_ref()
            .volume
            .as_ref()
            .map(|v| v.volume_id.as_str()),
        Some("v1")
    );

    plugin.stop().await;
}

#[tokio::test]
async fn test_create_volume_missing_name() {
    let plugin = start_plugin(|_| {}).await;
    let mut controller = plugin.controller();

    let status = controller
        .create_volume(CreateVolumeRequest::default())
        .await
        .expect_err("empty name must be rejected");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(status.message().contains("name"));

    plugin.stop().await;
}

#[tokio::test]
async fn test_delete_volume_missing_secrets() {
    let plugin = start_plugin(|config| {
        config.require_secrets.delete_volume = true;
    })
    .await;
    let mut controller = plugin.controller();

    controller
        .create_volume(create_volume_request("v1"))
        .await
        .expect("create should succeed");

    let status = controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: "v1".to_owned(),
            ..Default::default()
        })
        .await
        .expect_err("missing secrets must be rejected");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);

    let mut secrets = std::collections::BTreeMap::new();
    secrets.insert("key".to_owned(), "value".to_owned());
    controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: "v1".to_owned(),
            secrets,
        })
        .await
        .expect("delete with secrets should succeed");

    plugin.stop().await;
}

#[tokio::test]
async fn test_serial_volume_contention() {
    let plugin = start_plugin(|_| {}).await;
    let mut controller = plugin.controller();

    controller
        .create_volume(create_volume_request("v1"))
        .await
        .expect("create should succeed");

    // The first publish to take the lock holds it well past the other
    // caller's 200ms lock timeout.
    plugin.mock.set_publish_delay(Duration::from_millis(600)).await;

    let mut first = plugin.controller();
    let mut second = plugin.controller();
    let (a, b) = tokio::join!(
        first.controller_publish_volume(publish_request("v1")),
        second.controller_publish_volume(publish_request("v1")),
    );

    let codes: Vec<Option<tonic::Code>> = vec![
        a.as_ref().err().map(|s| s.code()),
        b.as_ref().err().map(|s| s.code()),
    ];
    let aborted = codes
        .iter()
        .filter(|c| **c == Some(tonic::Code::Aborted))
        .count();
    let succeeded = codes.iter().filter(|c| c.is_none()).count();
    assert_eq!(
        (succeeded, aborted),
        (1, 1),
        "one call must win the lock and the other must abort: {:?} {:?}",
        a,
        b
    );

    plugin.stop().await;
}

#[tokio::test]
async fn test_distinct_volumes_run_in_parallel() {
    let plugin = start_plugin(|config| {
        config.serial_vol_access_timeout = Duration::from_secs(2);
    })
    .await;
    let mut controller = plugin.controller();

    for name in ["a", "b"] {
        controller
            .create_volume(create_volume_request(name))
            .await
            .expect("create should succeed");
    }

    plugin.mock.set_publish_delay(Duration::from_millis(300)).await;

    let mut first = plugin.controller();
    let mut second = plugin.controller();
    let start = Instant::now();
    let (a, b) = tokio::join!(
        first.controller_publish_volume(publish_request("a")),
        second.controller_publish_volume(publish_request("b")),
    );
    a.expect("publish of volume a should succeed");
    b.expect("publish of volume b should succeed");
    assert!(
        start.elapsed() < Duration::from_millis(550),
        "operations on distinct volumes must not serialize"
    );

    plugin.stop().await;
}

#[tokio::test]
async fn test_request_ids_increase_across_calls() {
    let plugin = start_plugin(|_| {}).await;
    let mut controller = plugin.controller();

    controller
        .create_volume(create_volume_request("v1"))
        .await
        .expect("create should succeed");
    let first = plugin
        .mock
        .last_request_id()
        .await
        .expect("handler should observe the injected request id");
    assert!(first > 0);

    controller
        .create_volume(create_volume_request("v2"))
        .await
        .expect("create should succeed");
    let second = plugin
        .mock
        .last_request_id()
        .await
        .expect("handler should observe the injected request id");
    assert!(second > first, "ids must increase: {} then {}", first, second);

    plugin.stop().await;
}

#[tokio::test]
async fn test_plugin_info_override() {
    let plugin = start_plugin(|config| {
        config.plugin_info = Some(
            "mock.csi-kit.dev,9.9.9,url=https://csi-kit.dev"
                .parse::<PluginInfo>()
                .expect("plugin info should parse"),
        );
    })
    .await;
    let mut identity = plugin.identity();

    let response = identity
        .get_plugin_info(GetPluginInfoRequest {})
        .await
        .expect("get plugin info should succeed");
    assert_eq!(response.get_ref().name, "mock.csi-kit.dev");
    assert_eq!(response.get_ref().vendor_version, "9.9.9");
    assert_eq!(
        response.get_ref().manifest.get("url").map(String::as_str),
        Some("https://csi-kit.dev")
    );

    plugin.stop().await;
}

#[tokio::test]
async fn test_node_publish_and_unpublish() {
    let plugin = start_plugin(|_| {}).await;
    let mut controller = plugin.controller();
    let mut node = plugin.node();

    controller
        .create_volume(create_volume_request("v1"))
        .await
        .expect("create should succeed");

    node.node_publish_volume(NodePublishVolumeRequest {
        volume_id: "v1".to_owned(),
        target_path: "/mnt/v1".to_owned(),
        volume_capability: Some(mount_capability()),
        ..Default::default()
    })
    .await
    .expect("node publish should succeed");
    assert!(plugin.mock.node_publish_called().await);

    node.node_unpublish_volume(NodeUnpublishVolumeRequest {
        volume_id: "v1".to_owned(),
        target_path: "/mnt/v1".to_owned(),
    })
    .await
    .expect("node unpublish should succeed");
    assert!(plugin.mock.node_unpublish_called().await);

    plugin.stop().await;
}

#[tokio::test]
async fn test_backend_errors_pass_through() {
    let plugin = start_plugin(|_| {}).await;
    let mut controller = plugin.controller();

    let status = controller
        .controller_publish_volume(publish_request("missing"))
        .await
        .expect_err("publishing an unknown volume must fail");
    assert_eq!(status.code(), tonic::Code::NotFound);

    plugin.stop().await;
}
