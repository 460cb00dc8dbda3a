//! The mock Controller service.

use k8s_csi::v1_3_0::controller_server::Controller;
use k8s_csi::v1_3_0::controller_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::controller_service_capability::{Rpc, Type};
use k8s_csi::v1_3_0::list_volumes_response::Entry;
use k8s_csi::v1_3_0::*;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::{MockPlugin, DEFAULT_CAPACITY_BYTES};

#[async_trait::async_trait]
impl Controller for MockPlugin {
    /// Creates (or finds) a volume keyed by the requested name. The name
    /// doubles as the volume id.
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let request_id = request
            .metadata()
            .get("csi.requestid")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        *self.last_request_id.write().await = request_id;

        let req = request.into_inner();
        let capacity_bytes = req
            .capacity_range
            .as_ref()
            .map(|range| range.required_bytes)
            .filter(|bytes| *bytes > 0)
            .unwrap_or(DEFAULT_CAPACITY_BYTES);

        let mut volumes = self.volumes.write().await;
        let volume = volumes
            .entry(req.name.clone())
            .or_insert_with(|| Volume {
                volume_id: req.name.clone(),
                capacity_bytes,
                ..Default::default()
            })
            .clone();
        debug!(volume_id = %volume.volume_id, "created volume");

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(volume),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        self.volumes.write().await.remove(&req.volume_id);
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if !self.volume_exists(&req.volume_id).await {
            return Err(Status::not_found(req.volume_id));
        }

        // Deterministic slowness hook for lock contention tests.
        let delay = *self.publish_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut publish_context = std::collections::BTreeMap::new();
        publish_context.insert("device".to_owned(), "/dev/mock".to_owned());
        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context,
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if !self.volume_exists(&req.volume_id).await {
            return Err(Status::not_found(req.volume_id));
        }
        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        if !self.volume_exists(&req.volume_id).await {
            return Err(Status::not_found(req.volume_id));
        }
        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self.volumes.read().await;
        // Pagination is ignored; the mock table stays small.
        Ok(Response::new(ListVolumesResponse {
            next_token: String::new(),
            entries: volumes
                .values()
                .cloned()
                .map(|volume| Entry {
                    volume: Some(volume),
                    ..Default::default()
                })
                .collect(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<GetCapacityRequest>,
    ) -> Result<Response<GetCapacityResponse>, Status> {
        Ok(Response::new(GetCapacityResponse {
            available_capacity: DEFAULT_CAPACITY_BYTES,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = [
            RpcType::CreateDeleteVolume,
            RpcType::PublishUnpublishVolume,
            RpcType::ListVolumes,
            RpcType::GetCapacity,
        ]
        .iter()
        .map(|rpc| ControllerServiceCapability {
            r#type: Some(Type::Rpc(Rpc {
                r#type: *rpc as i32,
            })),
        })
        .collect();
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("snapshots not supported"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("expand volume not supported"))
    }

    async fn controller_get_volume(
        &self,
        request: Request<ControllerGetVolumeRequest>,
    ) -> Result<Response<ControllerGetVolumeResponse>, Status> {
        let req = request.into_inner();
        match self.volumes.read().await.get(&req.volume_id) {
            Some(volume) => Ok(Response::new(ControllerGetVolumeResponse {
                volume: Some(volume.clone()),
                status: Some(controller_get_volume_response::VolumeStatus {
                    published_node_ids: vec![self.node_name.clone()],
                    volume_condition: Some(VolumeCondition {
                        abnormal: false,
                        message: String::from("volume is healthy"),
                    }),
                }),
            })),
            None => Err(Status::not_found(req.volume_id)),
        }
    }
}
