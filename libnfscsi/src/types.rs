//! Core CSI types: volumes, capabilities and controller requests.
//!
//! These types form the data model shared by the CSI traits and the NFS
//! backend.  They are all [`Serialize`]/[`Deserialize`] so a hosting RPC layer
//! can carry them as-is.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One gibibyte, the capacity assigned when a request carries no hint.
pub const ONE_GIB: i64 = 1_073_741_824;

/// Prefix carried by every volume id this driver generates.
pub const VOLUME_ID_PREFIX: &str = "csi-nfs-vol-";

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.
///
/// The id doubles as the name of the volume's subdirectory on the export.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Generate a fresh id: [`VOLUME_ID_PREFIX`] followed by a random UUID.
    ///
    /// Ids are never derived from the requested name, so name and id always
    /// differ.
    pub fn generate() -> Self {
        Self(format!("{VOLUME_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Read-write on a single node.
    SingleNodeWriter,
    /// Read-only on a single node.
    SingleNodeReaderOnly,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Many readers, one writer.
    MultiNodeSingleWriter,
    /// Read-write on many nodes.
    MultiNodeMultiWriter,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"nfsvers=4.1"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
    /// Filesystem type, `"nfs"` for every volume this driver serves.
    #[serde(default = "default_fs_type")]
    pub fs_type: String,
}

fn default_fs_type() -> String {
    "nfs".to_owned()
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::MultiNodeMultiWriter,
            mount_flags: Vec::new(),
            fs_type: default_fs_type(),
        }
    }
}

/// Requested capacity bounds.  Zero means "unset" for either bound.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    #[serde(default)]
    pub required_bytes: i64,
    #[serde(default)]
    pub limit_bytes: i64,
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// A provisioned volume as returned by `CreateVolume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes.  Advisory: the export enforces no quota.
    pub capacity_bytes: i64,
    /// Backend parameters with `share` narrowed to the volume's subdirectory.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Caller-chosen name, unique per intent but not globally.
    pub name: String,
    /// Optional capacity hint.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities; must not be empty.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Backend parameters; must contain `server` and `share`.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to attach a volume to a node at the controller level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Response to a controller publish; NFS volumes need no publish context.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerPublishVolumeResponse {
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

/// Request to detach a volume from a node at the controller level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
}

/// Request to grow a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
}

// ---------------------------------------------------------------------------
// Plugin info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"csi-nfsplugin"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
}

/// RPCs the controller service advertises.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ControllerServiceCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    ExpandVolume,
}

impl fmt::Display for ControllerServiceCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateDeleteVolume => "CREATE_DELETE_VOLUME",
            Self::PublishUnpublishVolume => "PUBLISH_UNPUBLISH_VOLUME",
            Self::ListVolumes => "LIST_VOLUMES",
            Self::ExpandVolume => "EXPAND_VOLUME",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("csi-nfs-vol-abc".into());
        assert_eq!(id.to_string(), "csi-nfs-vol-abc");
    }

    #[test]
    fn generated_ids_are_prefixed_and_distinct() {
        let a = VolumeId::generate();
        let b = VolumeId::generate();
        assert!(a.as_str().starts_with(VOLUME_ID_PREFIX));
        assert!(b.as_str().starts_with(VOLUME_ID_PREFIX));
        assert_ne!(a, b);
    }

    #[test]
    fn create_volume_request_default() {
        let req = CreateVolumeRequest::default();
        assert!(req.name.is_empty());
        assert!(req.capacity_range.is_none());
        assert!(req.volume_capabilities.is_empty());
    }

    #[test]
    fn volume_capability_default() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::MultiNodeMultiWriter);
        assert_eq!(cap.fs_type, "nfs");
    }

    #[test]
    fn capability_deserializes_without_optional_fields() {
        let cap: VolumeCapability =
            serde_json::from_str(r#"{"access_mode":"SingleNodeWriter"}"#).expect("deserialize");
        assert_eq!(cap.access_mode, AccessMode::SingleNodeWriter);
        assert!(cap.mount_flags.is_empty());
        assert_eq!(cap.fs_type, "nfs");
    }
}
