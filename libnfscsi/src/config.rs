//! Controller configuration.
//!
//! Defaults can be overridden from a YAML document or from environment
//! variables:
//! - `NFS_CSI_DRIVER_NAME`: plugin name reported to the orchestrator.
//! - `NFS_CSI_NODE_ID`: identifier of the host running the controller.
//! - `NFS_CSI_MOUNT_ROOT`: where exports are mounted while provisioning.
//!   Defaults to `/persistentvolumes`.
//! - `NFS_CSI_MOUNT_TIMEOUT_SECS`: upper bound for one mount or unmount call.
//!   Defaults to `120`.
//! - `NFS_CSI_MOUNT_OPTIONS`: comma-separated NFS mount options.
//! - `NFS_CSI_SERVER` / `NFS_CSI_SHARE`: export mounted by `DeleteVolume` for
//!   volumes this process did not create.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::params::NfsParameters;

pub const DEFAULT_DRIVER_NAME: &str = "csi-nfsplugin";
pub const DEFAULT_MOUNT_ROOT: &str = "/persistentvolumes";
pub const DEFAULT_MOUNT_TIMEOUT_SECS: u64 = 120;

/// Export used when a request does not name one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendConfig {
    pub server: String,
    pub share: String,
}

impl BackendConfig {
    pub fn parameters(&self) -> NfsParameters {
        NfsParameters::new(&self.server, &self.share)
    }
}

/// Settings for one controller instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub driver_name: String,
    pub node_id: String,
    pub mount_root: PathBuf,
    pub mount_timeout_secs: u64,
    pub mount_options: Vec<String>,
    pub default_backend: Option<BackendConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_owned(),
            node_id: String::new(),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            mount_timeout_secs: DEFAULT_MOUNT_TIMEOUT_SECS,
            mount_options: Vec::new(),
            default_backend: None,
        }
    }
}

impl ControllerConfig {
    /// Defaults overlaid with the `NFS_CSI_*` environment variables.
    pub fn from_env() -> Result<Self, CsiError> {
        Self::default().with_env()
    }

    /// Overlay the `NFS_CSI_*` environment variables on top of `self`.
    pub fn with_env(self) -> Result<Self, CsiError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, CsiError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CsiError::invalid_argument(format!("parse controller config: {e}")))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CsiError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            CsiError::invalid_argument(format!(
                "read controller config {}: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn mount_timeout(&self) -> Duration {
        Duration::from_secs(self.mount_timeout_secs)
    }

    /// Overlay values looked up through `var` on top of `self`.
    fn apply_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self, CsiError> {
        if let Some(name) = var("NFS_CSI_DRIVER_NAME") {
            self.driver_name = name;
        }
        if let Some(node_id) = var("NFS_CSI_NODE_ID") {
            self.node_id = node_id;
        }
        if let Some(root) = var("NFS_CSI_MOUNT_ROOT") {
            self.mount_root = PathBuf::from(root);
        }
        if let Some(secs) = var("NFS_CSI_MOUNT_TIMEOUT_SECS") {
            self.mount_timeout_secs = secs.trim().parse().map_err(|e| {
                CsiError::InvalidArgument(format!("NFS_CSI_MOUNT_TIMEOUT_SECS={secs}: {e}"))
            })?;
        }
        if let Some(options) = var("NFS_CSI_MOUNT_OPTIONS") {
            self.mount_options = options
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_owned)
                .collect();
        }
        match (var("NFS_CSI_SERVER"), var("NFS_CSI_SHARE")) {
            (Some(server), Some(share)) => {
                self.default_backend = Some(BackendConfig { server, share });
            }
            (None, None) => {}
            _ => {
                return Err(CsiError::InvalidArgument(
                    "NFS_CSI_SERVER and NFS_CSI_SHARE must be set together".into(),
                ));
            }
        }
        Ok(self)
    }
}
