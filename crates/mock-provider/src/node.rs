//! The mock Node service.

use k8s_csi::v1_3_0::node_server::Node;
use k8s_csi::v1_3_0::node_service_capability::rpc::Type as RpcType;
use k8s_csi::v1_3_0::node_service_capability::{Rpc, Type};
use k8s_csi::v1_3_0::*;
use tonic::{Request, Response, Status};

use crate::MockPlugin;

#[async_trait::async_trait]
impl Node for MockPlugin {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        if !self.volume_exists(&req.volume_id).await {
            return Err(Status::not_found(req.volume_id));
        }
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        if !self.volume_exists(&req.volume_id).await {
            return Err(Status::not_found(req.volume_id));
        }
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    /// Publishes nothing; checks that the volume exists and records the
    /// call.
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if !self.volume_exists(&req.volume_id).await {
            return Err(Status::not_found(req.volume_id));
        }
        *self.node_publish_called.write().await = true;
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        if !self.volume_exists(&req.volume_id).await {
            return Err(Status::not_found(req.volume_id));
        }
        *self.node_unpublish_called.write().await = true;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("volume stats not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented("expand volume not supported"))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![NodeServiceCapability {
                r#type: Some(Type::Rpc(Rpc {
                    r#type: RpcType::StageUnstageVolume as i32,
                })),
            }],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let mut segments = std::collections::BTreeMap::new();
        segments.insert(
            "topology.mock.csi-kit.dev/node".to_owned(),
            self.node_name.clone(),
        );
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_name.clone(),
            max_volumes_per_node: 128,
            accessible_topology: Some(Topology { segments }),
        }))
    }
}
