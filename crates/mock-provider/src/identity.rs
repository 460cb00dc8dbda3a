//! The mock Identity service.

use k8s_csi::v1_3_0::identity_server::Identity;
use k8s_csi::v1_3_0::plugin_capability::service::Type as ServiceType;
use k8s_csi::v1_3_0::plugin_capability::{Service, Type};
use k8s_csi::v1_3_0::*;
use tonic::{Request, Response, Status};

use crate::{MockPlugin, DRIVER_NAME, VENDOR_VERSION};

#[async_trait::async_trait]
impl Identity for MockPlugin {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: DRIVER_NAME.to_owned(),
            vendor_version: VENDOR_VERSION.to_owned(),
            ..Default::default()
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: vec![PluginCapability {
                r#type: Some(Type::Service(Service {
                    r#type: ServiceType::ControllerService as i32,
                })),
            }],
        }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}
