//! The storage plugin harness.
//!
//! A [`StoragePlugin`] carries the user's Controller/Identity/Node
//! implementations plus startup hooks and serves them behind the middleware
//! pipeline. The Identity service is mandatory and at least one of
//! Controller and Node must be supplied; everything else is optional.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use k8s_csi::v1_3_0::controller_server::{Controller, ControllerServer};
use k8s_csi::v1_3_0::identity_server::{Identity, IdentityServer};
use k8s_csi::v1_3_0::node_server::{Node, NodeServer};
use k8s_csi::v1_3_0::*;

use crate::config::{Config, Endpoint, ENV_ENDPOINT};
use crate::context::{self, RequestContext};
use crate::grpc_sock;
use crate::middleware::logging::LoggingInterceptor;
use crate::middleware::serialvolume::etcd::EtcdLockProvider;
use crate::middleware::serialvolume::memory::MemoryLockProvider;
use crate::middleware::serialvolume::{SerialVolumeAccess, VolumeLockerProvider};
use crate::middleware::specvalidator::SpecValidator;
use crate::middleware::{
    ControllerMiddleware, IdentityMiddleware, MiddlewareStack, NodeMiddleware,
};

/// A callback invoked after configuration is loaded and before the endpoint
/// starts serving. Returning an error aborts startup.
pub type BeforeServe = Box<dyn FnOnce(&Config) -> anyhow::Result<()> + Send>;

/// The three optional CSI handler sets plus startup hooks. Only the
/// services actually supplied are registered with the transport.
pub struct StoragePlugin<C, I, N>
where
    C: Controller,
    I: Identity,
    N: Node,
{
    pub controller: Option<C>,
    pub identity: Option<I>,
    pub node: Option<N>,
    /// Invoked directly before the endpoint starts serving.
    pub before_serve: Option<BeforeServe>,
    /// `KEY=VALUE` defaults applied to the environment at startup for keys
    /// that are not already set.
    pub env_vars: Vec<String>,
}

impl<C, I, N> StoragePlugin<C, I, N>
where
    C: Controller,
    I: Identity,
    N: Node,
{
    /// Loads the configuration from the environment and serves until
    /// SIGINT or SIGTERM. This is the entry point a plugin binary calls;
    /// the process should exit non-zero on an error return.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let ctx = RequestContext::default();
        for pair in std::mem::take(&mut self.env_vars) {
            if let Some((key, value)) = pair.split_once('=') {
                if context::getenv(&ctx, key).is_none() {
                    std::env::set_var(key, value);
                }
            }
        }
        let config = Config::from_env(&ctx)?;
        self.serve(config, shutdown_signal()).await
    }

    /// Serves with the given configuration until the shutdown future
    /// resolves. Exposed separately so embedders and tests can drive the
    /// harness without environment variables or signals.
    pub async fn serve<F>(mut self, config: Config, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let identity = match self.identity.take() {
            Some(identity) => identity,
            None => anyhow::bail!("identity service is required"),
        };
        if self.controller.is_none() && self.node.is_none() {
            anyhow::bail!("one of the controller and node services is required");
        }
        let endpoint = match config.endpoint.clone() {
            Some(endpoint) => endpoint,
            None => anyhow::bail!("{}: required", ENV_ENDPOINT),
        };

        let stack = Arc::new(build_stack(&config).await?);

        if let Some(before_serve) = self.before_serve.take() {
            before_serve(&config).context("BeforeServe failed")?;
        }

        let identity_service = IdentityServer::new(
            IdentityMiddleware::new(identity, stack.clone())
                .with_plugin_info(config.plugin_info.clone()),
        );
        let controller_service = self
            .controller
            .take()
            .map(|c| ControllerServer::new(ControllerMiddleware::new(c, stack.clone())));
        let node_service = self
            .node
            .take()
            .map(|n| NodeServer::new(NodeMiddleware::new(n, stack.clone())));

        let router = Server::builder()
            .add_service(identity_service)
            .add_optional_service(controller_service)
            .add_optional_service(node_service);

        match endpoint {
            Endpoint::Unix(path) => {
                remove_stale_socket(&path).await?;
                let socket = grpc_sock::Socket::bind(&path)
                    .with_context(|| format!("unable to bind {}", path.display()))?;
                #[cfg(target_family = "unix")]
                apply_endpoint_ownership(&path, &config)?;
                info!(endpoint = %path.display(), "serving CSI endpoint");
                router
                    .serve_with_incoming_shutdown(socket, shutdown)
                    .await
                    .context("endpoint failed")?;
            }
            Endpoint::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("unable to bind {}", addr))?;
                let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);
                info!(endpoint = %addr, "serving CSI endpoint");
                router
                    .serve_with_incoming_shutdown(incoming, shutdown)
                    .await
                    .context("endpoint failed")?;
            }
        }

        info!("CSI endpoint shut down");
        Ok(())
    }
}

async fn build_stack(config: &Config) -> anyhow::Result<MiddlewareStack> {
    let mut stack = MiddlewareStack::new();

    if config.req_logging || config.rep_logging {
        let mut logging = LoggingInterceptor::new();
        if config.req_logging {
            logging = logging.with_request_logging(None);
        }
        if config.rep_logging {
            logging = logging.with_response_logging(None);
        }
        if config.logging_disable_vol_ctx {
            logging = logging.with_disable_log_volume_context();
        }
        stack = stack.with_logging(logging);
    }

    if config.spec_req_validation || config.spec_rep_validation {
        let mut validator = SpecValidator::new()
            .with_secret_requirements(config.require_secrets);
        if config.spec_req_validation {
            validator = validator.with_request_validation();
        }
        if config.spec_rep_validation {
            validator = validator.with_response_validation();
        }
        if config.require_staging_target_path {
            validator = validator.with_requires_staging_target_path();
        }
        if config.require_vol_context {
            validator = validator.with_requires_volume_context();
        }
        if config.require_pub_context {
            validator = validator.with_requires_publish_context();
        }
        if config.disable_field_len_check {
            validator = validator.with_disable_field_len_check();
        }
        stack = stack.with_spec_validator(validator);
    }

    if config.serial_vol_access {
        let provider: Arc<dyn VolumeLockerProvider> = match &config.etcd {
            Some(etcd_config) => {
                info!(endpoints = ?etcd_config.endpoints, "using etcd volume lock provider");
                Arc::new(
                    EtcdLockProvider::new(etcd_config.clone())
                        .await
                        .context("unable to initialize the etcd lock provider")?,
                )
            }
            None => Arc::new(MemoryLockProvider::new()),
        };
        stack = stack.with_serial_volume_access(SerialVolumeAccess::new(
            provider,
            config.serial_vol_access_timeout,
        ));
    }

    Ok(stack)
}

async fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "removed stale endpoint socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("unable to remove stale socket {}", path.display()))
        }
    }
}

#[cfg(target_family = "unix")]
fn apply_endpoint_ownership(path: &Path, config: &Config) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = config.endpoint_perms {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("unable to set permissions on {}", path.display()))?;
    }

    if config.endpoint_user.is_some() || config.endpoint_group.is_some() {
        let uid = resolve_uid(config.endpoint_user.as_deref())?;
        let gid = resolve_gid(config.endpoint_group.as_deref())?;
        nix::unistd::chown(path, uid, gid)
            .with_context(|| format!("unable to change ownership of {}", path.display()))?;
    }

    Ok(())
}

#[cfg(target_family = "unix")]
fn resolve_uid(user: Option<&str>) -> anyhow::Result<Option<nix::unistd::Uid>> {
    let name = match user {
        Some(name) => name,
        None => return Ok(None),
    };
    if let Ok(id) = name.parse::<u32>() {
        return Ok(Some(nix::unistd::Uid::from_raw(id)));
    }
    let user = nix::unistd::User::from_name(name)
        .with_context(|| format!("unable to look up user {}", name))?
        .ok_or_else(|| anyhow::anyhow!("unknown user: {}", name))?;
    Ok(Some(user.uid))
}

#[cfg(target_family = "unix")]
fn resolve_gid(group: Option<&str>) -> anyhow::Result<Option<nix::unistd::Gid>> {
    let name = match group {
        Some(name) => name,
        None => return Ok(None),
    };
    if let Ok(id) = name.parse::<u32>() {
        return Ok(Some(nix::unistd::Gid::from_raw(id)));
    }
    let group = nix::unistd::Group::from_name(name)
        .with_context(|| format!("unable to look up group {}", name))?
        .ok_or_else(|| anyhow::anyhow!("unknown group: {}", name))?;
    Ok(Some(group.gid))
}

/// Resolves once the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(target_family = "unix")]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(error) => {
                warn!(%error, "unable to register SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(target_family = "unix"))]
    {
        let _ = ctrl_c.await;
    }
}

/// A placeholder for handler sets a plugin does not supply. Lets callers
/// spell out `None::<Unsupported>` for the missing service; every method
/// answers `Unimplemented` in the unlikely event one is ever registered.
pub struct Unsupported;

macro_rules! unsupported_service {
    ($service:path { $($name:ident($req:ty) -> $rep:ty;)* }) => {
        #[tonic::async_trait]
        impl $service for Unsupported {
            $(
                async fn $name(
                    &self,
                    _request: Request<$req>,
                ) -> Result<Response<$rep>, Status> {
                    Err(Status::unimplemented("service not supported"))
                }
            )*
        }
    };
}

unsupported_service!(Controller {
    create_volume(CreateVolumeRequest) -> CreateVolumeResponse;
    delete_volume(DeleteVolumeRequest) -> DeleteVolumeResponse;
    controller_publish_volume(ControllerPublishVolumeRequest) -> ControllerPublishVolumeResponse;
    controller_unpublish_volume(ControllerUnpublishVolumeRequest) -> ControllerUnpublishVolumeResponse;
    validate_volume_capabilities(ValidateVolumeCapabilitiesRequest) -> ValidateVolumeCapabilitiesResponse;
    list_volumes(ListVolumesRequest) -> ListVolumesResponse;
    get_capacity(GetCapacityRequest) -> GetCapacityResponse;
    controller_get_capabilities(ControllerGetCapabilitiesRequest) -> ControllerGetCapabilitiesResponse;
    create_snapshot(CreateSnapshotRequest) -> CreateSnapshotResponse;
    delete_snapshot(DeleteSnapshotRequest) -> DeleteSnapshotResponse;
    list_snapshots(ListSnapshotsRequest) -> ListSnapshotsResponse;
    controller_expand_volume(ControllerExpandVolumeRequest) -> ControllerExpandVolumeResponse;
    controller_get_volume(ControllerGetVolumeRequest) -> ControllerGetVolumeResponse;
});

unsupported_service!(Identity {
    get_plugin_info(GetPluginInfoRequest) -> GetPluginInfoResponse;
    get_plugin_capabilities(GetPluginCapabilitiesRequest) -> GetPluginCapabilitiesResponse;
    probe(ProbeRequest) -> ProbeResponse;
});

unsupported_service!(Node {
    node_stage_volume(NodeStageVolumeRequest) -> NodeStageVolumeResponse;
    node_unstage_volume(NodeUnstageVolumeRequest) -> NodeUnstageVolumeResponse;
    node_publish_volume(NodePublishVolumeRequest) -> NodePublishVolumeResponse;
    node_unpublish_volume(NodeUnpublishVolumeRequest) -> NodeUnpublishVolumeResponse;
    node_get_volume_stats(NodeGetVolumeStatsRequest) -> NodeGetVolumeStatsResponse;
    node_expand_volume(NodeExpandVolumeRequest) -> NodeExpandVolumeResponse;
    node_get_capabilities(NodeGetCapabilitiesRequest) -> NodeGetCapabilitiesResponse;
    node_get_info(NodeGetInfoRequest) -> NodeGetInfoResponse;
});

#[cfg(test)]
mod test {
    use super::*;

    fn endpoint_config(path: &Path) -> Config {
        Config {
            endpoint: Some(Endpoint::Unix(path.to_owned())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_serve_requires_identity() {
        let plugin: StoragePlugin<Unsupported, Unsupported, Unsupported> = StoragePlugin {
            controller: Some(Unsupported),
            identity: None,
            node: Some(Unsupported),
            before_serve: None,
            env_vars: Vec::new(),
        };
        let tempdir = tempfile::tempdir().expect("tempdir");
        let err = plugin
            .serve(endpoint_config(&tempdir.path().join("csi.sock")), async {})
            .await
            .expect_err("missing identity must fail startup");
        assert!(err.to_string().contains("identity"));
    }

    #[tokio::test]
    async fn test_serve_requires_controller_or_node() {
        let plugin: StoragePlugin<Unsupported, Unsupported, Unsupported> = StoragePlugin {
            controller: None,
            identity: Some(Unsupported),
            node: None,
            before_serve: None,
            env_vars: Vec::new(),
        };
        let tempdir = tempfile::tempdir().expect("tempdir");
        let err = plugin
            .serve(endpoint_config(&tempdir.path().join("csi.sock")), async {})
            .await
            .expect_err("missing controller and node must fail startup");
        assert!(err.to_string().contains("controller"));
    }

    #[tokio::test]
    async fn test_serve_requires_endpoint() {
        let plugin: StoragePlugin<Unsupported, Unsupported, Unsupported> = StoragePlugin {
            controller: Some(Unsupported),
            identity: Some(Unsupported),
            node: Some(Unsupported),
            before_serve: None,
            env_vars: Vec::new(),
        };
        let err = plugin
            .serve(Config::default(), async {})
            .await
            .expect_err("missing endpoint must fail startup");
        assert!(err.to_string().contains(ENV_ENDPOINT));
    }

    #[tokio::test]
    async fn test_serve_fails_on_unbindable_endpoint() {
        let plugin: StoragePlugin<Unsupported, Unsupported, Unsupported> = StoragePlugin {
            controller: Some(Unsupported),
            identity: Some(Unsupported),
            node: Some(Unsupported),
            before_serve: None,
            env_vars: Vec::new(),
        };
        let err = plugin
            .serve(
                endpoint_config(Path::new("/bad/path/does/not/exist/csi.sock")),
                async {},
            )
            .await
            .expect_err("unbindable path must fail startup");
        assert!(err.to_string().contains("unable to bind"));
    }

    #[tokio::test]
    async fn test_before_serve_error_aborts_startup() {
        let plugin: StoragePlugin<Unsupported, Unsupported, Unsupported> = StoragePlugin {
            controller: Some(Unsupported),
            identity: Some(Unsupported),
            node: Some(Unsupported),
            before_serve: Some(Box::new(|_config| {
                Err(anyhow::anyhow!("not ready"))
            })),
            env_vars: Vec::new(),
        };
        let tempdir = tempfile::tempdir().expect("tempdir");
        let err = plugin
            .serve(endpoint_config(&tempdir.path().join("csi.sock")), async {})
            .await
            .expect_err("BeforeServe error must abort startup");
        assert!(format!("{:#}", err).contains("not ready"));
    }

    #[tokio::test]
    async fn test_serve_shuts_down_cleanly() {
        let plugin: StoragePlugin<Unsupported, Unsupported, Unsupported> = StoragePlugin {
            controller: Some(Unsupported),
            identity: Some(Unsupported),
            node: Some(Unsupported),
            before_serve: None,
            env_vars: Vec::new(),
        };
        let tempdir = tempfile::tempdir().expect("tempdir");
        let path = tempdir.path().join("csi.sock");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let config = endpoint_config(&path);
        let server = tokio::spawn(plugin.serve(config, async {
            let _ = rx.await;
        }));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(path.exists(), "socket should be bound while serving");

        tx.send(()).expect("send shutdown");
        server
            .await
            .expect("server task")
            .expect("clean shutdown should not error");
        assert!(!path.exists(), "socket should be cleaned up after shutdown");
    }
}
