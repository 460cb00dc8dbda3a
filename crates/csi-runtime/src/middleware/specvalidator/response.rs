//! Response-side validation rules, one impl per CSI response type.
//!
//! A failure here means the backend produced a reply the CSI spec forbids,
//! so the caller sees `Internal` rather than the malformed message.

use k8s_csi::v1_3_0::*;
use lazy_static::lazy_static;
use regex::Regex;

use super::ValidationOpts;

// The plugin name rules from the CSI spec: a reverse-DNS name of at most 63
// bytes built from alphanumerics, dots, dashes, and underscores.
const MAX_PLUGIN_NAME: usize = 63;

lazy_static! {
    static ref PLUGIN_NAME: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*[A-Za-z0-9]$").expect("plugin name pattern");
    static ref SEM_VER: Regex = Regex::new(
        r"^v?(\d+)\.(\d+)\.(\d+)(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$"
    )
    .expect("semver pattern");
}

/// Checks a response against the CSI spec. The error string becomes an
/// `Internal` status.
pub trait ValidateResponse {
    fn validate_response(&self, opts: &ValidationOpts) -> Result<(), String>;
}

fn check_volume(volume: &Option<Volume>, field: &str) -> Result<(), String> {
    match volume {
        None => Err(format!("nil: {}", field)),
        Some(volume) if volume.volume_id.is_empty() => {
            Err(format!("empty: {}.volume_id", field))
        }
        Some(_) => Ok(()),
    }
}

impl ValidateResponse for CreateVolumeResponse {
    fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
        check_volume(&self.volume, "volume")
    }
}

impl ValidateResponse for ControllerGetVolumeResponse {
    fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
        check_volume(&self.volume, "volume")
    }
}

impl ValidateResponse for ListVolumesResponse {
    fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
        for (i, entry) in self.entries.iter().enumerate() {
            check_volume(&entry.volume, &format!("entries[{}].volume", i))?;
        }
        Ok(())
    }
}

impl ValidateResponse for ControllerPublishVolumeResponse {
    fn validate_response(&self, opts: &ValidationOpts) -> Result<(), String> {
        if opts.require_pub_context && self.publish_context.is_empty() {
            return Err("empty: publish_context".to_owned());
        }
        Ok(())
    }
}

impl ValidateResponse for ControllerGetCapabilitiesResponse {
    fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
        if self.capabilities.is_empty() {
            return Err("empty: capabilities".to_owned());
        }
        Ok(())
    }
}

impl ValidateResponse for NodeGetCapabilitiesResponse {
    fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
        if self.capabilities.is_empty() {
            return Err("empty: capabilities".to_owned());
        }
        Ok(())
    }
}

impl ValidateResponse for NodeGetInfoResponse {
    fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
        if self.node_id.is_empty() {
            return Err("empty: node_id".to_owned());
        }
        Ok(())
    }
}

impl ValidateResponse for CreateSnapshotResponse {
    fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
        match &self.snapshot {
            None => Err("nil: snapshot".to_owned()),
            Some(snapshot) if snapshot.snapshot_id.is_empty() => {
                Err("empty: snapshot.snapshot_id".to_owned())
            }
            Some(snapshot) if snapshot.source_volume_id.is_empty() => {
                Err("empty: snapshot.source_volume_id".to_owned())
            }
            Some(_) => Ok(()),
        }
    }
}

impl ValidateResponse for GetPluginInfoResponse {
    fn validate_response(&self, opts: &ValidationOpts) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("empty: name".to_owned());
        }
        if self.name.len() > MAX_PLUGIN_NAME {
            return Err(format!(
                "exceeds size limit: name: max={}, size={}",
                MAX_PLUGIN_NAME,
                self.name.len()
            ));
        }
        if !self.name.contains('.') || !PLUGIN_NAME.is_match(&self.name) {
            return Err(format!("invalid: name: {}", self.name));
        }
        if self.vendor_version.is_empty() {
            return Err("empty: vendor_version".to_owned());
        }
        if !SEM_VER.is_match(&self.vendor_version) {
            return Err(format!("invalid: vendor_version: {}", self.vendor_version));
        }
        if opts.require_plugin_manifest && self.manifest.is_empty() {
            return Err("empty: manifest".to_owned());
        }
        Ok(())
    }
}

macro_rules! unchecked_responses {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ValidateResponse for $ty {
                fn validate_response(&self, _opts: &ValidationOpts) -> Result<(), String> {
                    Ok(())
                }
            }
        )*
    };
}

unchecked_responses!(
    DeleteVolumeResponse,
    ControllerUnpublishVolumeResponse,
    ValidateVolumeCapabilitiesResponse,
    GetCapacityResponse,
    DeleteSnapshotResponse,
    ListSnapshotsResponse,
    ControllerExpandVolumeResponse,
    NodeStageVolumeResponse,
    NodeUnstageVolumeResponse,
    NodePublishVolumeResponse,
    NodeUnpublishVolumeResponse,
    NodeGetVolumeStatsResponse,
    NodeExpandVolumeResponse,
    GetPluginCapabilitiesResponse,
    ProbeResponse,
);
