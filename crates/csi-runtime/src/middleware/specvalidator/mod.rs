//! CSI spec validation.
//!
//! Requests are checked before the handler runs, responses after it
//! returns; a request-side failure maps to `InvalidArgument` and never
//! reaches the handler, a response-side failure maps to `Internal`. Every
//! check is a pure function of the message and the configured options.

mod request;
mod response;

use tonic::Status;

use crate::config::SecretRequirements;

pub use request::ValidateRequest;
pub use response::ValidateResponse;

/// Options controlling which checks are active. Everything defaults off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOpts {
    pub request: bool,
    pub response: bool,
    pub require_secrets: SecretRequirements,
    pub require_staging_target_path: bool,
    pub require_vol_context: bool,
    pub require_pub_context: bool,
    pub disable_field_len: bool,
    pub require_plugin_manifest: bool,
}

/// The spec validation middleware. Constructed with builder-style options:
///
/// ```
/// use csi_runtime::middleware::specvalidator::SpecValidator;
///
/// let validator = SpecValidator::new()
///     .with_request_validation()
///     .with_response_validation()
///     .with_requires_controller_delete_volume_secrets();
/// ```
#[derive(Debug, Clone, Default)]
pub struct SpecValidator {
    opts: ValidationOpts,
}

impl SpecValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables request-side validation.
    pub fn with_request_validation(mut self) -> Self {
        self.opts.request = true;
        self
    }

    /// Enables response-side validation.
    pub fn with_response_validation(mut self) -> Self {
        self.opts.response = true;
        self
    }

    /// Requires secrets on every secret-bearing request.
    pub fn with_requires_secrets(mut self) -> Self {
        self.opts.require_secrets = SecretRequirements::all();
        self
    }

    /// Requires secrets on CreateVolume.
    pub fn with_requires_create_volume_secrets(mut self) -> Self {
        self.opts.require_secrets.create_volume = true;
        self
    }

    /// Requires secrets on DeleteVolume.
    pub fn with_requires_controller_delete_volume_secrets(mut self) -> Self {
        self.opts.require_secrets.delete_volume = true;
        self
    }

    /// Requires secrets on ControllerPublishVolume.
    pub fn with_requires_controller_publish_volume_secrets(mut self) -> Self {
        self.opts.require_secrets.controller_publish_volume = true;
        self
    }

    /// Requires secrets on ControllerUnpublishVolume.
    pub fn with_requires_controller_unpublish_volume_secrets(mut self) -> Self {
        self.opts.require_secrets.controller_unpublish_volume = true;
        self
    }

    /// Requires secrets on NodeStageVolume.
    pub fn with_requires_node_stage_volume_secrets(mut self) -> Self {
        self.opts.require_secrets.node_stage_volume = true;
        self
    }

    /// Requires secrets on NodePublishVolume.
    pub fn with_requires_node_publish_volume_secrets(mut self) -> Self {
        self.opts.require_secrets.node_publish_volume = true;
        self
    }

    /// Replaces the whole secret requirement set.
    pub fn with_secret_requirements(mut self, require_secrets: SecretRequirements) -> Self {
        self.opts.require_secrets = require_secrets;
        self
    }

    /// Requires the staging target path on NodePublishVolume.
    pub fn with_requires_staging_target_path(mut self) -> Self {
        self.opts.require_staging_target_path = true;
        self
    }

    /// Requires a volume context on publish-style requests.
    pub fn with_requires_volume_context(mut self) -> Self {
        self.opts.require_vol_context = true;
        self
    }

    /// Requires a publish context on node requests and on the
    /// ControllerPublishVolume response.
    pub fn with_requires_publish_context(mut self) -> Self {
        self.opts.require_pub_context = true;
        self
    }

    /// Disables field-length checks against the CSI spec size limits.
    pub fn with_disable_field_len_check(mut self) -> Self {
        self.opts.disable_field_len = true;
        self
    }

    /// Requires a non-empty manifest on the GetPluginInfo response.
    pub fn with_requires_plugin_manifest(mut self) -> Self {
        self.opts.require_plugin_manifest = true;
        self
    }

    pub(crate) fn request<R: ValidateRequest>(&self, request: &R) -> Result<(), Status> {
        if !self.opts.request {
            return Ok(());
        }
        request
            .validate_request(&self.opts)
            .map_err(Status::invalid_argument)
    }

    pub(crate) fn response<R: ValidateResponse>(&self, response: &R) -> Result<(), Status> {
        if !self.opts.response {
            return Ok(());
        }
        response.validate_response(&self.opts).map_err(Status::internal)
    }
}
