//! CSI Controller service trait.
//!
//! The Controller service manages the centralized volume lifecycle: creation
//! and deletion, plus the attach-level publish/unpublish and expand RPCs the
//! protocol requires.  It is invoked by the orchestrator's provisioner.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerExpandVolumeRequest, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, Volume, VolumeId,
};

/// Controller service: centralized volume management.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume.
    ///
    /// The returned [`Volume`] contains the assigned `volume_id` and the
    /// `volume_context` that must be forwarded to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a previously provisioned volume.  Deleting a volume that does
    /// not exist succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// List the volumes this controller provisioned.
    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError>;

    /// Make a volume available to a node.
    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, CsiError>;

    /// Reverse of [`Self::controller_publish_volume`].
    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError>;

    /// Grow a volume.
    async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<Volume, CsiError>;

    /// RPCs this controller supports.
    async fn controller_get_capabilities(
        &self,
    ) -> Result<Vec<ControllerServiceCapability>, CsiError>;
}
