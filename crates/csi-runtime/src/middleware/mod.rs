//! The middleware pipeline.
//!
//! Each CSI service gets a wrapper type implementing the generated service
//! trait around the user's implementation. Every unary call runs through
//! the same fixed pipeline: request-id injection, request logging, request
//! validation, serial volume access, the handler, then response validation
//! and response logging. Components other than the request-id injector are
//! optional; a missing component leaves the pipeline intact.

pub mod logging;
pub mod requestid;
pub mod serialvolume;
pub mod specvalidator;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tonic::{Request, Response, Status};

use k8s_csi::v1_3_0::controller_server::Controller;
use k8s_csi::v1_3_0::identity_server::Identity;
use k8s_csi::v1_3_0::node_server::Node;
use k8s_csi::v1_3_0::*;

use crate::config::PluginInfo;
use crate::context;
use logging::LoggingInterceptor;
use requestid::RequestIdInjector;
use serialvolume::{SerialVolumeAccess, VolumeTarget};
use specvalidator::{SpecValidator, ValidateRequest, ValidateResponse};

/// Full gRPC method names, used for log records and error messages.
pub mod methods {
    pub const CREATE_VOLUME: &str = "/csi.v1.Controller/CreateVolume";
    pub const DELETE_VOLUME: &str = "/csi.v1.Controller/DeleteVolume";
    pub const CONTROLLER_PUBLISH_VOLUME: &str = "/csi.v1.Controller/ControllerPublishVolume";
    pub const CONTROLLER_UNPUBLISH_VOLUME: &str = "/csi.v1.Controller/ControllerUnpublishVolume";
    pub const VALIDATE_VOLUME_CAPABILITIES: &str = "/csi.v1.Controller/ValidateVolumeCapabilities";
    pub const LIST_VOLUMES: &str = "/csi.v1.Controller/ListVolumes";
    pub const GET_CAPACITY: &str = "/csi.v1.Controller/GetCapacity";
    pub const CONTROLLER_GET_CAPABILITIES: &str = "/csi.v1.Controller/ControllerGetCapabilities";
    pub const CREATE_SNAPSHOT: &str = "/csi.v1.Controller/CreateSnapshot";
    pub const DELETE_SNAPSHOT: &str = "/csi.v1.Controller/DeleteSnapshot";
    pub const LIST_SNAPSHOTS: &str = "/csi.v1.Controller/ListSnapshots";
    pub const CONTROLLER_EXPAND_VOLUME: &str = "/csi.v1.Controller/ControllerExpandVolume";
    pub const CONTROLLER_GET_VOLUME: &str = "/csi.v1.Controller/ControllerGetVolume";
    pub const GET_PLUGIN_INFO: &str = "/csi.v1.Identity/GetPluginInfo";
    pub const GET_PLUGIN_CAPABILITIES: &str = "/csi.v1.Identity/GetPluginCapabilities";
    pub const PROBE: &str = "/csi.v1.Identity/Probe";
    pub const NODE_STAGE_VOLUME: &str = "/csi.v1.Node/NodeStageVolume";
    pub const NODE_UNSTAGE_VOLUME: &str = "/csi.v1.Node/NodeUnstageVolume";
    pub const NODE_PUBLISH_VOLUME: &str = "/csi.v1.Node/NodePublishVolume";
    pub const NODE_UNPUBLISH_VOLUME: &str = "/csi.v1.Node/NodeUnpublishVolume";
    pub const NODE_GET_VOLUME_STATS: &str = "/csi.v1.Node/NodeGetVolumeStats";
    pub const NODE_EXPAND_VOLUME: &str = "/csi.v1.Node/NodeExpandVolume";
    pub const NODE_GET_CAPABILITIES: &str = "/csi.v1.Node/NodeGetCapabilities";
    pub const NODE_GET_INFO: &str = "/csi.v1.Node/NodeGetInfo";
}

/// The assembled pipeline shared by all three service wrappers.
pub struct MiddlewareStack {
    request_id: RequestIdInjector,
    logging: Option<LoggingInterceptor>,
    validator: Option<SpecValidator>,
    serial: Option<SerialVolumeAccess>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        MiddlewareStack {
            request_id: RequestIdInjector::new(),
            logging: None,
            validator: None,
            serial: None,
        }
    }

    pub fn with_logging(mut self, logging: LoggingInterceptor) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn with_spec_validator(mut self, validator: SpecValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_serial_volume_access(mut self, serial: SerialVolumeAccess) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Drives one unary call through the pipeline. The request record is
    /// emitted strictly before the handler runs and the response record
    /// strictly after it returns; the volume lock, when one applies, is
    /// released on every exit path.
    pub(crate) async fn unary<Req, Res, F, Fut>(
        &self,
        method: &'static str,
        mut request: Request<Req>,
        call: F,
    ) -> Result<Response<Res>, Status>
    where
        Req: ValidateRequest + VolumeTarget + fmt::Debug,
        Res: ValidateResponse + fmt::Debug,
        F: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Res>, Status>>,
    {
        let ctx = self.request_id.assign(&mut request);

        let result: Result<Response<Res>, Status> = context::scope(ctx.clone(), async {
            if let Some(logging) = &self.logging {
                logging.request(&ctx, method, request.get_ref());
            }
            if let Some(validator) = &self.validator {
                validator.request(request.get_ref())?;
            }
            let guard = match &self.serial {
                Some(serial) => serial.acquire(request.get_ref()).await?,
                None => None,
            };

            let result = call(request).await;

            if let Some(guard) = guard {
                guard.release().await;
            }
            let response = result?;
            if let Some(validator) = &self.validator {
                validator.response(response.get_ref())?;
            }
            Ok(response)
        })
        .await;

        if let Some(logging) = &self.logging {
            match &result {
                Ok(response) => logging.response(&ctx, method, response.get_ref()),
                Err(status) => logging.error(&ctx, method, status),
            }
        }
        result
    }
}

impl Default for MiddlewareStack {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps a [`Controller`] implementation in the pipeline.
pub struct ControllerMiddleware<T> {
    inner: T,
    stack: Arc<MiddlewareStack>,
}

impl<T> ControllerMiddleware<T> {
    pub fn new(inner: T, stack: Arc<MiddlewareStack>) -> Self {
        ControllerMiddleware { inner, stack }
    }
}

#[tonic::async_trait]
impl<T: Controller> Controller for ControllerMiddleware<T> {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        self.stack
            .unary(methods::CREATE_VOLUME, request, |request| {
                self.inner.create_volume(request)
            })
            .await
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        self.stack
            .unary(methods::DELETE_VOLUME, request, |request| {
                self.inner.delete_volume(request)
            })
            .await
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        self.stack
            .unary(methods::CONTROLLER_PUBLISH_VOLUME, request, |request| {
                self.inner.controller_publish_volume(request)
            })
            .await
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        self.stack
            .unary(methods::CONTROLLER_UNPUBLISH_VOLUME, request, |request| {
                self.inner.controller_unpublish_volume(request)
            })
            .await
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        self.stack
            .unary(methods::VALIDATE_VOLUME_CAPABILITIES, request, |request| {
                self.inner.validate_volume_capabilities(request)
            })
            .await
    }

    async fn list_volumes(
        &self,
        request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        self.stack
            .unary(methods::LIST_VOLUMES, request, |request| {
                self.inner.list_volumes(request)
            })
            .await
    }

    async fn get_capacity(
        &self,
        request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        self.stack
            .unary(methods::GET_CAPACITY, request, |request| {
                self.inner.get_capacity(request)
            })
            .await
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        self.stack
            .unary(methods::CONTROLLER_GET_CAPABILITIES, request, |request| {
                self.inner.controller_get_capabilities(request)
            })
            .await
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        self.stack
            .unary(methods::CREATE_SNAPSHOT, request, |request| {
                self.inner.create_snapshot(request)
            })
            .await
    }

    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        self.stack
            .unary(methods::DELETE_SNAPSHOT, request, |request| {
                self.inner.delete_snapshot(request)
            })
            .await
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        self.stack
            .unary(methods::LIST_SNAPSHOTS, request, |request| {
                self.inner.list_snapshots(request)
            })
            .await
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        self.stack
            .unary(methods::CONTROLLER_EXPAND_VOLUME, request, |request| {
                self.inner.controller_expand_volume(request)
            })
            .await
    }

    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        self.stack
            .unary(methods::CONTROLLER_GET_VOLUME, request, |request| {
                self.inner.controller_get_volume(request)
            })
            .await
    }
}

/// Wraps an [`Identity`] implementation in the pipeline. When plugin info
/// is configured, GetPluginInfo is answered from it without consulting the
/// backend; the response still passes through response validation.
pub struct IdentityMiddleware<T> {
    inner: T,
    stack: Arc<MiddlewareStack>,
    plugin_info: Option<PluginInfo>,
}

impl<T> IdentityMiddleware<T> {
    pub fn new(inner: T, stack: Arc<MiddlewareStack>) -> Self {
        IdentityMiddleware {
            inner,
            stack,
            plugin_info: None,
        }
    }

    pub fn with_plugin_info(mut self, plugin_info: Option<PluginInfo>) -> Self {
        self.plugin_info = plugin_info;
        self
    }
}

#[tonic::async_trait]
impl<T: Identity> Identity for IdentityMiddleware<T> {
    async fn get_plugin_info(
        &self,
        request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        if let Some(info) = &self.plugin_info {
            let reply = GetPluginInfoResponse {
                name: info.name.clone(),
                vendor_version: info.vendor_version.clone(),
                manifest: info.manifest.clone(),
            };
            return self
                .stack
                .unary(methods::GET_PLUGIN_INFO, request, move |_request| async move {
                    Ok(Response::new(reply))
                })
                .await;
        }
        self.stack
            .unary(methods::GET_PLUGIN_INFO, request, |request| {
                self.inner.get_plugin_info(request)
            })
            .await
    }

    async fn get_plugin_capabilities(
        &self,
        request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        self.stack
            .unary(methods::GET_PLUGIN_CAPABILITIES, request, |request| {
                self.inner.get_plugin_capabilities(request)
            })
            .await
    }

    async fn probe(
        &self,
        request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        self.stack
            .unary(methods::PROBE, request, |request| self.inner.probe(request))
            .await
    }
}

/// Wraps a [`Node`] implementation in the pipeline.
pub struct NodeMiddleware<T> {
    inner: T,
    stack: Arc<MiddlewareStack>,
}

impl<T> NodeMiddleware<T> {
    pub fn new(inner: T, stack: Arc<MiddlewareStack>) -> Self {
        NodeMiddleware { inner, stack }
    }
}

#[tonic::async_trait]
impl<T: Node> Node for NodeMiddleware<T> {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        self.stack
            .unary(methods::NODE_STAGE_VOLUME, request, |request| {
                self.inner.node_stage_volume(request)
            })
            .await
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        self.stack
            .unary(methods::NODE_UNSTAGE_VOLUME, request, |request| {
                self.inner.node_unstage_volume(request)
            })
            .await
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        self.stack
            .unary(methods::NODE_PUBLISH_VOLUME, request, |request| {
                self.inner.node_publish_volume(request)
            })
            .await
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        self.stack
            .unary(methods::NODE_UNPUBLISH_VOLUME, request, |request| {
                self.inner.node_unpublish_volume(request)
            })
            .await
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        self.stack
            .unary(methods::NODE_GET_VOLUME_STATS, request, |request| {
                self.inner.node_get_volume_stats(request)
            })
            .await
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        self.stack
            .unary(methods::NODE_EXPAND_VOLUME, request, |request| {
                self.inner.node_expand_volume(request)
            })
            .await
    }

    async fn node_get_capabilities(
        &self,
        request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        self.stack
            .unary(methods::NODE_GET_CAPABILITIES, request, |request| {
                self.inner.node_get_capabilities(request)
            })
            .await
    }

    async fn node_get_info(
        &self,
        request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        self.stack
            .unary(methods::NODE_GET_INFO, request, |request| {
                self.inner.node_get_info(request)
            })
            .await
    }
}
