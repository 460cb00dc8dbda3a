//! Environment-driven configuration for the plugin harness.
//!
//! Everything is keyed under the `X_CSI_` prefix and parsed once at startup.
//! Lookups go through the [`context`](crate::context) environment chain so a
//! test or sub-command can override single values without mutating process
//! state.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::context::{self, RequestContext};
use crate::middleware::serialvolume::etcd::EtcdConfig;

/// The endpoint the plugin listens on, `unix://<path>` or `tcp://<addr>`.
/// Required.
pub const ENV_ENDPOINT: &str = "X_CSI_ENDPOINT";
/// Octal file mode applied to a unix endpoint, e.g. `0755`.
pub const ENV_ENDPOINT_PERMS: &str = "X_CSI_ENDPOINT_PERMS";
/// User name or uid that owns a unix endpoint.
pub const ENV_ENDPOINT_USER: &str = "X_CSI_ENDPOINT_USER";
/// Group name or gid that owns a unix endpoint.
pub const ENV_ENDPOINT_GROUP: &str = "X_CSI_ENDPOINT_GROUP";
/// Shorthand that sets the log level to debug and enables request and
/// response logging.
pub const ENV_DEBUG: &str = "X_CSI_DEBUG";
/// Log level for the plugin's diagnostic logging.
pub const ENV_LOG_LEVEL: &str = "X_CSI_LOG_LEVEL";
/// Enables logging of request messages.
pub const ENV_REQ_LOGGING: &str = "X_CSI_REQ_LOGGING";
/// Enables logging of response messages.
pub const ENV_REP_LOGGING: &str = "X_CSI_REP_LOGGING";
/// Suppresses volume context fields in logged messages.
pub const ENV_LOGGING_DISABLE_VOL_CTX: &str = "X_CSI_LOGGING_DISABLE_VOL_CTX";
/// Enables request and response validation together.
pub const ENV_SPEC_VALIDATION: &str = "X_CSI_SPEC_VALIDATION";
/// Enables request validation only.
pub const ENV_SPEC_REQ_VALIDATION: &str = "X_CSI_SPEC_REQ_VALIDATION";
/// Enables response validation only.
pub const ENV_SPEC_REP_VALIDATION: &str = "X_CSI_SPEC_REP_VALIDATION";
/// Treats the staging target path of NodePublishVolume as required.
pub const ENV_REQUIRE_STAGING_TARGET_PATH: &str = "X_CSI_REQUIRE_STAGING_TARGET_PATH";
/// Treats volume contexts as required on publish-style requests.
pub const ENV_REQUIRE_VOL_CONTEXT: &str = "X_CSI_REQUIRE_VOL_CONTEXT";
/// Treats publish contexts as required on node requests and controller
/// publish responses.
pub const ENV_REQUIRE_PUB_CONTEXT: &str = "X_CSI_REQUIRE_PUB_CONTEXT";
/// Disables field-length checks against the CSI spec size limits.
pub const ENV_DISABLE_FIELD_LEN: &str = "X_CSI_DISABLE_FIELD_LEN";
/// Requires secrets on every secret-bearing request.
pub const ENV_REQUIRE_CREDS: &str = "X_CSI_REQUIRE_CREDS";
/// Requires secrets on CreateVolume.
pub const ENV_REQUIRE_CREDS_CREATE_VOL: &str = "X_CSI_REQUIRE_CREDS_CREATE_VOL";
/// Requires secrets on DeleteVolume.
pub const ENV_REQUIRE_CREDS_DELETE_VOL: &str = "X_CSI_REQUIRE_CREDS_DELETE_VOL";
/// Requires secrets on ControllerPublishVolume.
pub const ENV_REQUIRE_CREDS_CTRLR_PUB_VOL: &str = "X_CSI_REQUIRE_CREDS_CTRLR_PUB_VOL";
/// Requires secrets on ControllerUnpublishVolume.
pub const ENV_REQUIRE_CREDS_CTRLR_UNPUB_VOL: &str = "X_CSI_REQUIRE_CREDS_CTRLR_UNPUB_VOL";
/// Requires secrets on NodeStageVolume.
pub const ENV_REQUIRE_CREDS_NODE_STG_VOL: &str = "X_CSI_REQUIRE_CREDS_NODE_STG_VOL";
/// Requires secrets on NodePublishVolume.
pub const ENV_REQUIRE_CREDS_NODE_PUB_VOL: &str = "X_CSI_REQUIRE_CREDS_NODE_PUB_VOL";
/// Enables the serial volume access middleware.
pub const ENV_SERIAL_VOL_ACCESS: &str = "X_CSI_SERIAL_VOL_ACCESS";
/// How long a request waits for a busy volume before aborting, e.g. `10s`.
pub const ENV_SERIAL_VOL_ACCESS_TIMEOUT: &str = "X_CSI_SERIAL_VOL_ACCESS_TIMEOUT";
/// Plugin info served for GetPluginInfo without consulting the backend:
/// `name,vendor-version[,key=value...]`.
pub const ENV_PLUGIN_INFO: &str = "X_CSI_PLUGIN_INFO";

/// Errors produced while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}: required")]
    Required(&'static str),
    #[error("{var}: invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// A parsed listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err("empty unix socket path".to_owned());
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://") {
            return addr
                .parse::<SocketAddr>()
                .map(Endpoint::Tcp)
                .map_err(|e| e.to_string());
        }
        // A bare path is accepted as a unix endpoint.
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        Err(format!("unsupported endpoint scheme: {}", s))
    }
}

/// Plugin info served for GetPluginInfo when configured via
/// [`ENV_PLUGIN_INFO`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
    /// Matches the `manifest` map of `GetPluginInfoResponse`.
    pub manifest: BTreeMap<String, String>,
}

impl FromStr for PluginInfo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(',').map(str::trim);
        let name = match parts.next() {
            Some(n) if !n.is_empty() => n.to_owned(),
            _ => return Err("plugin name is required".to_owned()),
        };
        let vendor_version = parts.next().unwrap_or("").to_owned();
        let mut manifest = BTreeMap::new();
        for entry in parts {
            match entry.split_once('=') {
                Some((k, v)) => {
                    manifest.insert(k.to_owned(), v.to_owned());
                }
                None if entry.is_empty() => {}
                None => return Err(format!("manifest entry is not key=value: {}", entry)),
            }
        }
        Ok(PluginInfo {
            name,
            vendor_version,
            manifest,
        })
    }
}

/// Per-request secret requirements enforced by the spec validator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecretRequirements {
    pub create_volume: bool,
    pub delete_volume: bool,
    pub controller_publish_volume: bool,
    pub controller_unpublish_volume: bool,
    pub node_stage_volume: bool,
    pub node_publish_volume: bool,
}

impl SecretRequirements {
    /// Requires secrets on every secret-bearing request.
    pub fn all() -> Self {
        SecretRequirements {
            create_volume: true,
            delete_volume: true,
            controller_publish_volume: true,
            controller_unpublish_volume: true,
            node_stage_volume: true,
            node_publish_volume: true,
        }
    }
}

/// The full harness configuration, normally produced by
/// [`Config::from_env`] but constructible directly for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub endpoint: Option<Endpoint>,
    pub endpoint_perms: Option<u32>,
    pub endpoint_user: Option<String>,
    pub endpoint_group: Option<String>,
    pub log_level: Option<String>,
    pub req_logging: bool,
    pub rep_logging: bool,
    pub logging_disable_vol_ctx: bool,
    pub spec_req_validation: bool,
    pub spec_rep_validation: bool,
    pub require_staging_target_path: bool,
    pub require_vol_context: bool,
    pub require_pub_context: bool,
    pub disable_field_len_check: bool,
    pub require_secrets: SecretRequirements,
    pub serial_vol_access: bool,
    pub serial_vol_access_timeout: Duration,
    pub etcd: Option<EtcdConfig>,
    pub plugin_info: Option<PluginInfo>,
}

impl Config {
    /// Loads the configuration from the environment through the context's
    /// lookup chain.
    pub fn from_env(ctx: &RequestContext) -> Result<Self, ConfigError> {
        let debug = env_bool(ctx, ENV_DEBUG);

        let endpoint = match context::getenv(ctx, ENV_ENDPOINT) {
            Some(value) => Some(value.parse::<Endpoint>().map_err(|reason| {
                ConfigError::Invalid {
                    var: ENV_ENDPOINT,
                    value,
                    reason,
                }
            })?),
            None => None,
        };

        let endpoint_perms = match context::getenv(ctx, ENV_ENDPOINT_PERMS) {
            Some(value) => Some(u32::from_str_radix(value.trim_start_matches("0o"), 8).map_err(
                |e| ConfigError::Invalid {
                    var: ENV_ENDPOINT_PERMS,
                    value,
                    reason: e.to_string(),
                },
            )?),
            None => None,
        };

        let spec_validation = env_bool(ctx, ENV_SPEC_VALIDATION);

        let require_all_secrets = env_bool(ctx, ENV_REQUIRE_CREDS);
        let require_secrets = if require_all_secrets {
            SecretRequirements::all()
        } else {
            SecretRequirements {
                create_volume: env_bool(ctx, ENV_REQUIRE_CREDS_CREATE_VOL),
                delete_volume: env_bool(ctx, ENV_REQUIRE_CREDS_DELETE_VOL),
                controller_publish_volume: env_bool(ctx, ENV_REQUIRE_CREDS_CTRLR_PUB_VOL),
                controller_unpublish_volume: env_bool(ctx, ENV_REQUIRE_CREDS_CTRLR_UNPUB_VOL),
                node_stage_volume: env_bool(ctx, ENV_REQUIRE_CREDS_NODE_STG_VOL),
                node_publish_volume: env_bool(ctx, ENV_REQUIRE_CREDS_NODE_PUB_VOL),
            }
        };

        let plugin_info = match context::getenv(ctx, ENV_PLUGIN_INFO) {
            Some(value) => Some(value.parse::<PluginInfo>().map_err(|reason| {
                ConfigError::Invalid {
                    var: ENV_PLUGIN_INFO,
                    value,
                    reason,
                }
            })?),
            None => None,
        };

        Ok(Config {
            endpoint,
            endpoint_perms,
            endpoint_user: context::getenv(ctx, ENV_ENDPOINT_USER),
            endpoint_group: context::getenv(ctx, ENV_ENDPOINT_GROUP),
            log_level: context::getenv(ctx, ENV_LOG_LEVEL)
                .or_else(|| debug.then(|| "debug".to_owned())),
            req_logging: debug || env_bool(ctx, ENV_REQ_LOGGING),
            rep_logging: debug || env_bool(ctx, ENV_REP_LOGGING),
            logging_disable_vol_ctx: env_bool(ctx, ENV_LOGGING_DISABLE_VOL_CTX),
            spec_req_validation: spec_validation || env_bool(ctx, ENV_SPEC_REQ_VALIDATION),
            spec_rep_validation: spec_validation || env_bool(ctx, ENV_SPEC_REP_VALIDATION),
            require_staging_target_path: env_bool(ctx, ENV_REQUIRE_STAGING_TARGET_PATH),
            require_vol_context: env_bool(ctx, ENV_REQUIRE_VOL_CONTEXT),
            require_pub_context: env_bool(ctx, ENV_REQUIRE_PUB_CONTEXT),
            disable_field_len_check: env_bool(ctx, ENV_DISABLE_FIELD_LEN),
            require_secrets,
            serial_vol_access: env_bool(ctx, ENV_SERIAL_VOL_ACCESS),
            serial_vol_access_timeout: env_duration(ctx, ENV_SERIAL_VOL_ACCESS_TIMEOUT)?
                .unwrap_or(Duration::ZERO),
            etcd: EtcdConfig::from_env(ctx)?,
            plugin_info,
        })
    }
}

/// Parses a boolean the way Go's `strconv.ParseBool` does; anything
/// unrecognized counts as false.
pub(crate) fn parse_bool(s: &str) -> bool {
    matches!(s, "1" | "t" | "T" | "true" | "TRUE" | "True")
}

pub(crate) fn env_bool(ctx: &RequestContext, var: &'static str) -> bool {
    context::getenv(ctx, var)
        .map(|v| parse_bool(v.trim()))
        .unwrap_or(false)
}

pub(crate) fn env_duration(
    ctx: &RequestContext,
    var: &'static str,
) -> Result<Option<Duration>, ConfigError> {
    match context::getenv(ctx, var) {
        Some(value) => {
            // Accept both bare seconds ("0") and humantime forms ("10s").
            if let Ok(secs) = value.trim().parse::<u64>() {
                return Ok(Some(Duration::from_secs(secs)));
            }
            humantime::parse_duration(value.trim())
                .map(Some)
                .map_err(|e| ConfigError::Invalid {
                    var,
                    value,
                    reason: e.to_string(),
                })
        }
        None => Ok(None),
    }
}
