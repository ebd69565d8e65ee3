//! CSI Identity service trait and the driver's static description.
//!
//! The Identity service allows callers to discover plugin metadata and check
//! plugin health.  [`DriverInfo`] holds the data it reports together with the
//! access modes and controller capabilities the driver advertises.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{AccessMode, ControllerServiceCapability, PluginCapability, PluginInfo};

/// Longest driver name the orchestrator accepts.
const MAX_DRIVER_NAME_LEN: usize = 63;

/// Identity service: plugin discovery and health probing.
#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Return the plugin name and version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// Liveness probe.  Returns `true` when the plugin is healthy.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Advertise the capabilities supported by this plugin.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}

/// Static description of the running driver.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    name: String,
    vendor_version: String,
    node_id: String,
    access_modes: Vec<AccessMode>,
    controller_capabilities: Vec<ControllerServiceCapability>,
}

impl DriverInfo {
    /// Describe the NFS driver.  Fails if `name` is not a valid driver name.
    pub fn new(name: &str, node_id: &str) -> Result<Self, CsiError> {
        validate_driver_name(name)?;
        Ok(Self {
            name: name.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
            node_id: node_id.to_owned(),
            access_modes: vec![AccessMode::MultiNodeMultiWriter],
            controller_capabilities: vec![
                ControllerServiceCapability::CreateDeleteVolume,
                ControllerServiceCapability::PublishUnpublishVolume,
                ControllerServiceCapability::ListVolumes,
            ],
        })
    }

    /// Replace the advertised controller capabilities.
    pub fn with_controller_capabilities(mut self, caps: Vec<ControllerServiceCapability>) -> Self {
        self.controller_capabilities = caps;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn plugin_info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            vendor_version: self.vendor_version.clone(),
        }
    }

    pub fn access_modes(&self) -> &[AccessMode] {
        &self.access_modes
    }

    pub fn controller_capabilities(&self) -> &[ControllerServiceCapability] {
        &self.controller_capabilities
    }

    /// Reject requests for an RPC the driver does not advertise.
    pub fn validate_controller_service_request(
        &self,
        cap: ControllerServiceCapability,
    ) -> Result<(), CsiError> {
        if self.controller_capabilities.contains(&cap) {
            Ok(())
        } else {
            Err(CsiError::InvalidArgument(format!("unsupported capability {cap}")))
        }
    }
}

/// A driver name must be a DNS-1123 subdomain of at most 63 characters.
pub fn validate_driver_name(name: &str) -> Result<(), CsiError> {
    if name.is_empty() {
        return Err(CsiError::InvalidArgument("driver name is empty".into()));
    }
    if name.len() > MAX_DRIVER_NAME_LEN {
        return Err(CsiError::InvalidArgument(format!(
            "driver name length should be at most {MAX_DRIVER_NAME_LEN} chars"
        )));
    }

    let lower = name.to_ascii_lowercase();
    for label in lower.split('.') {
        let valid = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(CsiError::InvalidArgument(format!(
                "driver name {name:?} is not a valid DNS-1123 subdomain"
            )));
        }
    }
    Ok(())
}
