//! Request-side validation rules, one impl per CSI request type.

use k8s_csi::v1_3_0::volume_capability::access_mode::Mode;
use k8s_csi::v1_3_0::volume_capability::AccessType;
use k8s_csi::v1_3_0::*;

use super::ValidationOpts;

// Field size limits from the CSI spec: string fields are bounded at 128
// bytes, node ids at 192.
const MAX_FIELD_STRING: usize = 128;
const MAX_FIELD_NODE_ID: usize = 192;

/// Checks a request against the CSI spec. The error string becomes an
/// `InvalidArgument` status.
pub trait ValidateRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String>;
}

fn required(field: &str) -> String {
    format!("required: {}", field)
}

fn check_string(
    opts: &ValidationOpts,
    field: &str,
    value: &str,
    max: usize,
) -> Result<(), String> {
    if value.is_empty() {
        return Err(required(field));
    }
    if !opts.disable_field_len && value.len() > max {
        return Err(format!(
            "exceeds size limit: {}: max={}, size={}",
            field,
            max,
            value.len()
        ));
    }
    Ok(())
}

fn check_volume_capability(capability: &VolumeCapability) -> Result<(), String> {
    match &capability.access_type {
        None => return Err(required("volume_capability.access_type")),
        Some(AccessType::Mount(_)) | Some(AccessType::Block(_)) => {}
    }
    let access_mode = capability
        .access_mode
        .as_ref()
        .ok_or_else(|| required("volume_capability.access_mode"))?;
    if access_mode.mode == Mode::Unknown as i32 {
        return Err(required("volume_capability.access_mode.mode"));
    }
    Ok(())
}

fn check_volume_capabilities(capabilities: &[VolumeCapability]) -> Result<(), String> {
    if capabilities.is_empty() {
        return Err(required("volume_capabilities"));
    }
    for capability in capabilities {
        check_volume_capability(capability)?;
    }
    Ok(())
}

fn check_secrets(
    required_by_config: bool,
    secrets: &std::collections::BTreeMap<String, String>,
) -> Result<(), String> {
    if required_by_config && secrets.is_empty() {
        return Err(required("secrets"));
    }
    Ok(())
}

impl ValidateRequest for CreateVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "name", &self.name, MAX_FIELD_STRING)?;
        check_volume_capabilities(&self.volume_capabilities)?;
        check_secrets(opts.require_secrets.create_volume, &self.secrets)
    }
}

impl ValidateRequest for DeleteVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_secrets(opts.require_secrets.delete_volume, &self.secrets)
    }
}

impl ValidateRequest for ControllerPublishVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_string(opts, "node_id", &self.node_id, MAX_FIELD_NODE_ID)?;
        match &self.volume_capability {
            None => return Err(required("volume_capability")),
            Some(capability) => check_volume_capability(capability)?,
        }
        if opts.require_vol_context && self.volume_context.is_empty() {
            return Err(required("volume_context"));
        }
        check_secrets(
            opts.require_secrets.controller_publish_volume,
            &self.secrets,
        )
    }
}

impl ValidateRequest for ControllerUnpublishVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_secrets(
            opts.require_secrets.controller_unpublish_volume,
            &self.secrets,
        )
    }
}

impl ValidateRequest for ValidateVolumeCapabilitiesRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_volume_capabilities(&self.volume_capabilities)
    }
}

impl ValidateRequest for GetCapacityRequest {
    fn validate_request(&self, _opts: &ValidationOpts) -> Result<(), String> {
        // Capabilities are optional here, but any provided entry must be
        // well formed.
        for capability in &self.volume_capabilities {
            check_volume_capability(capability)?;
        }
        Ok(())
    }
}

impl ValidateRequest for CreateSnapshotRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "name", &self.name, MAX_FIELD_STRING)?;
        check_string(
            opts,
            "source_volume_id",
            &self.source_volume_id,
            MAX_FIELD_STRING,
        )
    }
}

impl ValidateRequest for DeleteSnapshotRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "snapshot_id", &self.snapshot_id, MAX_FIELD_STRING)
    }
}

impl ValidateRequest for ControllerExpandVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)
    }
}

impl ValidateRequest for ControllerGetVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)
    }
}

impl ValidateRequest for NodeStageVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_string(
            opts,
            "staging_target_path",
            &self.staging_target_path,
            MAX_FIELD_STRING,
        )?;
        match &self.volume_capability {
            None => return Err(required("volume_capability")),
            Some(capability) => check_volume_capability(capability)?,
        }
        if opts.require_pub_context && self.publish_context.is_empty() {
            return Err(required("publish_context"));
        }
        if opts.require_vol_context && self.volume_context.is_empty() {
            return Err(required("volume_context"));
        }
        check_secrets(opts.require_secrets.node_stage_volume, &self.secrets)
    }
}

impl ValidateRequest for NodeUnstageVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_string(
            opts,
            "staging_target_path",
            &self.staging_target_path,
            MAX_FIELD_STRING,
        )
    }
}

impl ValidateRequest for NodePublishVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_string(opts, "target_path", &self.target_path, MAX_FIELD_STRING)?;
        if opts.require_staging_target_path && self.staging_target_path.is_empty() {
            return Err(required("staging_target_path"));
        }
        match &self.volume_capability {
            None => return Err(required("volume_capability")),
            Some(capability) => check_volume_capability(capability)?,
        }
        if opts.require_pub_context && self.publish_context.is_empty() {
            return Err(required("publish_context"));
        }
        if opts.require_vol_context && self.volume_context.is_empty() {
            return Err(required("volume_context"));
        }
        check_secrets(opts.require_secrets.node_publish_volume, &self.secrets)
    }
}

impl ValidateRequest for NodeUnpublishVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_string(opts, "target_path", &self.target_path, MAX_FIELD_STRING)
    }
}

impl ValidateRequest for NodeExpandVolumeRequest {
    fn validate_request(&self, opts: &ValidationOpts) -> Result<(), String> {
        check_string(opts, "volume_id", &self.volume_id, MAX_FIELD_STRING)?;
        check_string(opts, "volume_path", &self.volume_path, MAX_FIELD_STRING)
    }
}

macro_rules! unchecked_requests {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ValidateRequest for $ty {
                fn validate_request(&self, _opts: &ValidationOpts) -> Result<(), String> {
                    Ok(())
                }
            }
        )*
    };
}

unchecked_requests!(
    ListVolumesRequest,
    ListSnapshotsRequest,
    ControllerGetCapabilitiesRequest,
    NodeGetVolumeStatsRequest,
    NodeGetCapabilitiesRequest,
    NodeGetInfoRequest,
    GetPluginInfoRequest,
    GetPluginCapabilitiesRequest,
    ProbeRequest,
);
