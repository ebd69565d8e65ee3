//! NFS storage backend for CSI.
//!
//! [`NfsController`] implements [`CsiIdentity`] and [`CsiController`] on top
//! of a single NFS export.  A volume is a subdirectory of the export named by
//! its volume id; provisioning mounts the export on the local mount root,
//! creates (or removes) that subdirectory and unmounts again.
//!
//! # On-disk layout
//!
//! ```text
//! <mount_root>/            # export mounted here while an operation runs
//!   <volume-id>/           # one directory per volume, mode 0777
//! ```
//!
//! Concurrent operations on the same volume are serialized through a
//! [`KeyLocks`] table: `CreateVolume` holds the name key for its whole run and
//! the id key once the id exists; `DeleteVolume` holds the id key.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ControllerConfig;
use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::{CsiIdentity, DriverInfo};
use crate::keylock::{KeyLockGuard, KeyLocks};
use crate::mount::{Mounter, SharedMount, SystemMounter};
use crate::params::NfsParameters;
use crate::types::*;

/// Permission bits of every volume directory.
const VOLUME_DIR_MODE: u32 = 0o777;

/// What the controller remembers about a volume it provisioned.
///
/// Held in memory only; a restarted controller starts with an empty registry.
#[derive(Debug, Clone)]
struct VolumeRecord {
    name: String,
    volume: Volume,
    /// Parameter bag exactly as requested, compared on retries.
    parameters: HashMap<String, String>,
    backend: NfsParameters,
}

/// Concrete CSI controller backed by an NFS export.
///
/// # Thread safety
///
/// All mutable state is behind concurrent maps ([`DashMap`]) and the key-lock
/// table, so independent requests can run on separate Tokio tasks.
pub struct NfsController {
    driver: DriverInfo,
    mount: Arc<SharedMount>,
    locks: KeyLocks,
    /// Volumes provisioned by this process, keyed by volume id.
    volume_meta: DashMap<VolumeId, VolumeRecord>,
    /// Maps the caller-supplied volume name to the assigned [`VolumeId`].
    volume_names: DashMap<String, VolumeId>,
    /// Export mounted by `DeleteVolume` for volumes missing from the registry.
    default_backend: Option<NfsParameters>,
    /// Parent of every per-request cancellation token.
    shutdown: CancellationToken,
}

impl NfsController {
    /// Build a controller that mounts through the host's mount tooling.
    pub fn from_config(config: &ControllerConfig) -> Result<Self, CsiError> {
        Self::new(config, Arc::new(SystemMounter))
    }

    /// Build a controller that mounts through `mounter`.
    pub fn new(config: &ControllerConfig, mounter: Arc<dyn Mounter>) -> Result<Self, CsiError> {
        let driver = DriverInfo::new(&config.driver_name, &config.node_id)?;
        info!(
            driver = driver.name(),
            version = env!("CARGO_PKG_VERSION"),
            mount_root = %config.mount_root.display(),
            "NFS controller initialised",
        );
        Ok(Self {
            driver,
            mount: Arc::new(SharedMount::new(
                &config.mount_root,
                config.mount_options.clone(),
                config.mount_timeout(),
                mounter,
            )),
            locks: KeyLocks::new(),
            volume_meta: DashMap::new(),
            volume_names: DashMap::new(),
            default_backend: config.default_backend.as_ref().map(|b| b.parameters()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replace the driver description, e.g. to advertise other capabilities.
    pub fn with_driver(mut self, driver: DriverInfo) -> Self {
        self.driver = driver;
        self
    }

    pub fn driver(&self) -> &DriverInfo {
        &self.driver
    }

    /// Cancel every in-flight and future request issued through the trait.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Resolve the directory of a volume under the mount root.
    fn volume_path(&self, volume_id: &VolumeId) -> PathBuf {
        self.mount.target().join(volume_id.as_str())
    }

    async fn lock_key(
        &self,
        key: String,
        cancel: &CancellationToken,
    ) -> Result<KeyLockGuard<'_>, CsiError> {
        tokio::select! {
            guard = self.locks.lock(&key) => Ok(guard),
            _ = cancel.cancelled() => Err(CsiError::Cancelled(format!("waiting for lock {key}"))),
        }
    }

    /// Provision a volume, aborting when `cancel` fires.
    #[instrument(skip(self, req, cancel), fields(name = %req.name))]
    pub async fn create_volume_with_cancel(
        &self,
        req: CreateVolumeRequest,
        cancel: &CancellationToken,
    ) -> Result<Volume, CsiError> {
        if let Err(e) = self
            .driver
            .validate_controller_service_request(ControllerServiceCapability::CreateDeleteVolume)
        {
            info!(error = %e, "invalid create volume request");
            return Err(e);
        }
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("Volume Name cannot be empty".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "Volume Capabilities cannot be empty".into(),
            ));
        }
        let capacity_bytes = resolve_capacity(req.capacity_range)?;
        let backend = NfsParameters::parse(&req.parameters)?;

        let _name_lock = self.lock_key(name_key(&req.name), cancel).await?;

        if let Some(existing) = self
            .existing_volume(&req.name, capacity_bytes, &req.parameters, cancel)
            .await?
        {
            debug!(volume_id = %existing.volume_id, "returning existing volume for idempotent create");
            return Ok(existing);
        }

        let volume_id = VolumeId::generate();
        let _id_lock = self.lock_key(id_key(&volume_id), cancel).await?;

        let lease = self.mount.acquire(&backend.source(), cancel).await?;
        let provisioned = self.provision_dir(&volume_id).await;
        let released = lease.release(cancel).await;

        if let Err(e) = provisioned {
            if let Err(unmount) = released {
                warn!(error = %unmount, "unmount after failed provisioning also failed");
            }
            return Err(e);
        }

        let volume = Volume {
            volume_id: volume_id.clone(),
            capacity_bytes,
            volume_context: backend.volume_context(&volume_id),
        };

        // The directory now exists on the export even if the unmount below
        // failed, so record it: a retry with the same name finds it instead of
        // provisioning a duplicate.
        self.volume_meta.insert(
            volume_id.clone(),
            VolumeRecord {
                name: req.name.clone(),
                volume: volume.clone(),
                parameters: req.parameters,
                backend,
            },
        );
        self.volume_names.insert(req.name, volume_id.clone());

        released?;
        info!(%volume_id, capacity_bytes, "volume created");
        Ok(volume)
    }

    /// Look up a previous create with the same name.
    ///
    /// A match with the same size and parameters is returned as-is; any other
    /// match is a conflict.
    async fn existing_volume(
        &self,
        name: &str,
        capacity_bytes: i64,
        parameters: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<Option<Volume>, CsiError> {
        let Some(id) = self.volume_names.get(name).map(|r| r.clone()) else {
            return Ok(None);
        };

        // Serialize against a DeleteVolume of the same id before trusting the
        // record.
        let _id_lock = self.lock_key(id_key(&id), cancel).await?;
        let Some(record) = self.volume_meta.get(&id).map(|r| r.clone()) else {
            self.volume_names.remove_if(name, |_, v| *v == id);
            return Ok(None);
        };

        if record.volume.capacity_bytes == capacity_bytes && record.parameters == *parameters {
            Ok(Some(record.volume))
        } else {
            Err(CsiError::AlreadyExists(format!(
                "{name} ({id}) with different capacity or parameters"
            )))
        }
    }

    async fn provision_dir(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let path = self.volume_path(volume_id);
        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            CsiError::internal(format!(
                "unable to create directory {} to provision new volume: {e}",
                path.display()
            ))
        })?;
        // create_dir_all honours the umask; widen explicitly.
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(VOLUME_DIR_MODE))
            .await
            .map_err(|e| {
                CsiError::internal(format!("set permissions on {}: {e}", path.display()))
            })?;
        debug!(path = %path.display(), "volume directory created");
        Ok(())
    }

    /// Delete a volume, aborting when `cancel` fires.
    #[instrument(skip(self, cancel))]
    pub async fn delete_volume_with_cancel(
        &self,
        volume_id: &VolumeId,
        cancel: &CancellationToken,
    ) -> Result<(), CsiError> {
        if let Err(e) = self
            .driver
            .validate_controller_service_request(ControllerServiceCapability::CreateDeleteVolume)
        {
            warn!(error = %e, "invalid delete volume request");
            return Err(e);
        }
        validate_volume_id(volume_id)?;

        let _id_lock = self.lock_key(id_key(volume_id), cancel).await?;

        let backend = self
            .volume_meta
            .get(volume_id)
            .map(|r| r.backend.clone())
            .or_else(|| self.default_backend.clone());

        let lease = match &backend {
            Some(backend) => Some(self.mount.acquire(&backend.source(), cancel).await?),
            None => {
                debug!("no export known for volume, using mount root as-is");
                None
            }
        };
        let removed = self.remove_dir(volume_id).await;
        let released = match lease {
            Some(lease) => lease.release(cancel).await,
            None => Ok(()),
        };

        if let Err(e) = removed {
            if let Err(unmount) = released {
                warn!(error = %unmount, "unmount after failed removal also failed");
            }
            return Err(e);
        }

        if let Some((_, record)) = self.volume_meta.remove(volume_id) {
            self.volume_names
                .remove_if(&record.name, |_, id| id == volume_id);
        }

        released?;
        info!(%volume_id, "volume deleted");
        Ok(())
    }

    async fn remove_dir(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let path = self.volume_path(volume_id);
        match tokio::fs::symlink_metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "path does not exist, deletion skipped");
                return Ok(());
            }
            Err(e) => {
                return Err(CsiError::internal(format!("stat {}: {e}", path.display())));
            }
        }

        tokio::fs::remove_dir_all(&path).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "volume path can not be removed");
            CsiError::internal(format!("remove {}: {e}", path.display()))
        })
    }
}

fn name_key(name: &str) -> String {
    format!("name/{name}")
}

fn id_key(id: &VolumeId) -> String {
    format!("id/{id}")
}

/// Requested size in bytes: the required size when given, otherwise the
/// limit when it is below the default, otherwise [`ONE_GIB`].
fn resolve_capacity(range: Option<CapacityRange>) -> Result<i64, CsiError> {
    let Some(range) = range else {
        return Ok(ONE_GIB);
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(CsiError::InvalidArgument(
            "capacity range must not be negative".into(),
        ));
    }
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(CsiError::InvalidArgument(format!(
            "required bytes {} exceed limit bytes {}",
            range.required_bytes, range.limit_bytes
        )));
    }
    Ok(match (range.required_bytes, range.limit_bytes) {
        (0, 0) => ONE_GIB,
        (0, limit) => limit.min(ONE_GIB),
        (required, _) => required,
    })
}

/// A volume id names exactly one directory under the mount root.
fn validate_volume_id(id: &VolumeId) -> Result<(), CsiError> {
    if id.is_empty() {
        return Err(CsiError::invalid_argument("Volume ID cannot be empty"));
    }
    let raw = id.as_str();
    if raw == "." || raw == ".." || raw.contains('/') || raw.contains('\0') {
        return Err(CsiError::InvalidArgument(format!(
            "volume id {raw:?} is not a valid directory name"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CsiIdentity
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiIdentity for NfsController {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(self.driver.plugin_info())
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // The mount root is created on first use, so an existing parent is
        // enough.
        let root = self.mount.target();
        let probe_path = match tokio::fs::metadata(root).await {
            Ok(meta) => return Ok(meta.is_dir()),
            Err(_) => root.parent().unwrap_or(root),
        };
        let healthy = tokio::fs::metadata(probe_path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        Ok(healthy)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        Ok(vec![PluginCapability::ControllerService])
    }
}

// ---------------------------------------------------------------------------
// CsiController
// ---------------------------------------------------------------------------

#[async_trait]
impl CsiController for NfsController {
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        let cancel = self.shutdown.child_token();
        self.create_volume_with_cancel(req, &cancel).await
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        let cancel = self.shutdown.child_token();
        self.delete_volume_with_cancel(volume_id, &cancel).await
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>, CsiError> {
        let vols = self
            .volume_meta
            .iter()
            .map(|entry| entry.value().volume.clone())
            .collect();
        Ok(vols)
    }

    async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, CsiError> {
        // Attach is a no-op for NFS; nodes mount the export themselves.
        debug!(volume_id = %req.volume_id, node_id = %req.node_id, "controller publish");
        Ok(ControllerPublishVolumeResponse::default())
    }

    async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        debug!(volume_id = %req.volume_id, node_id = %req.node_id, "controller unpublish");
        Ok(())
    }

    async fn controller_expand_volume(
        &self,
        _req: ControllerExpandVolumeRequest,
    ) -> Result<Volume, CsiError> {
        Err(CsiError::Unimplemented("ControllerExpandVolume".into()))
    }

    async fn controller_get_capabilities(
        &self,
    ) -> Result<Vec<ControllerServiceCapability>, CsiError> {
        Ok(self.driver.controller_capabilities().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::error::ErrorCode;
    use crate::mount::testing::{Call, Failure, RecordingMounter};
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn make_controller(root: &Path, mounter: Arc<RecordingMounter>) -> NfsController {
        let config = ControllerConfig {
            mount_root: root.to_path_buf(),
            mount_timeout_secs: 5,
            ..Default::default()
        };
        NfsController::new(&config, mounter).unwrap()
    }

    fn create_request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.into(),
            capacity_range: None,
            volume_capabilities: vec![VolumeCapability::default()],
            parameters: HashMap::from([
                ("server".to_owned(), "10.0.0.1".to_owned()),
                ("share".to_owned(), "/export".to_owned()),
            ]),
        }
    }

    fn entries(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    #[tokio::test]
    async fn create_and_delete_volume() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));

        let vol = controller.create_volume(create_request("a")).await.unwrap();

        assert!(vol.volume_id.as_str().starts_with("csi-nfs-vol-"));
        assert_eq!(vol.capacity_bytes, ONE_GIB);
        assert_eq!(
            vol.volume_context["share"],
            format!("/export/{}", vol.volume_id)
        );
        assert_eq!(vol.volume_context["server"], "10.0.0.1");

        let dir = tmp.path().join(vol.volume_id.as_str());
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        assert_eq!(
            mounter.calls(),
            vec![
                Call::Mount {
                    source: "10.0.0.1:/export".into(),
                    target: tmp.path().to_path_buf(),
                },
                Call::Unmount {
                    target: tmp.path().to_path_buf(),
                },
            ]
        );
        assert_eq!(controller.list_volumes().await.unwrap().len(), 1);

        controller.delete_volume(&vol.volume_id).await.unwrap();
        assert!(!dir.exists());
        assert_eq!(entries(tmp.path()), 0);
        assert!(controller.list_volumes().await.unwrap().is_empty());

        // Second delete of the same id is still a success.
        controller.delete_volume(&vol.volume_id).await.unwrap();
        assert_eq!(entries(tmp.path()), 0);
        assert!(controller.locks.is_empty());
        assert_eq!(mounter.mounted(), 0);
    }

    #[tokio::test]
    async fn capacity_hint_and_default() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(tmp.path(), Arc::new(RecordingMounter::new()));

        let mut req = create_request("big");
        req.capacity_range = Some(CapacityRange {
            required_bytes: 5_000_000_000,
            limit_bytes: 0,
        });
        let vol = controller.create_volume(req).await.unwrap();
        assert_eq!(vol.capacity_bytes, 5_000_000_000);

        let vol = controller.create_volume(create_request("small")).await.unwrap();
        assert_eq!(vol.capacity_bytes, 1_073_741_824);
    }

    #[test]
    fn capacity_resolution() {
        assert_eq!(resolve_capacity(None).unwrap(), ONE_GIB);
        assert_eq!(
            resolve_capacity(Some(CapacityRange::default())).unwrap(),
            ONE_GIB
        );
        assert_eq!(
            resolve_capacity(Some(CapacityRange {
                required_bytes: 0,
                limit_bytes: 1024,
            }))
            .unwrap(),
            1024
        );
        assert!(matches!(
            resolve_capacity(Some(CapacityRange {
                required_bytes: 2048,
                limit_bytes: 1024,
            })),
            Err(CsiError::InvalidArgument(_))
        ));
        assert!(matches!(
            resolve_capacity(Some(CapacityRange {
                required_bytes: -1,
                limit_bytes: 0,
            })),
            Err(CsiError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn invalid_create_requests_touch_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));

        let mut missing_server = create_request("a");
        missing_server.parameters.remove("server");
        let err = controller.create_volume(missing_server).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let mut missing_share = create_request("a");
        missing_share.parameters.remove("share");
        let err = controller.create_volume(missing_share).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        let err = controller.create_volume(create_request("")).await.unwrap_err();
        assert_eq!(
            err,
            CsiError::InvalidArgument("Volume Name cannot be empty".into())
        );

        let mut no_caps = create_request("a");
        no_caps.volume_capabilities.clear();
        let err = controller.create_volume(no_caps).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        assert!(mounter.calls().is_empty());
        assert_eq!(entries(tmp.path()), 0);
        assert!(controller.locks.is_empty());
    }

    #[tokio::test]
    async fn invalid_delete_requests_touch_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));
        std::fs::create_dir(tmp.path().join("keep")).unwrap();

        for id in ["", ".", "..", "../keep", "a/b"] {
            let err = controller
                .delete_volume(&VolumeId::from(id))
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{id:?}");
        }

        assert!(mounter.calls().is_empty());
        assert!(tmp.path().join("keep").is_dir());
    }

    #[tokio::test]
    async fn volume_ids_are_unique() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(tmp.path(), Arc::new(RecordingMounter::new()));

        let mut ids = std::collections::HashSet::new();
        for i in 0..10 {
            let vol = controller
                .create_volume(create_request(&format!("vol-{i}")))
                .await
                .unwrap();
            assert_ne!(vol.volume_id.as_str(), format!("vol-{i}"));
            assert!(ids.insert(vol.volume_id));
        }
        assert_eq!(entries(tmp.path()), 10);
    }

    #[tokio::test]
    async fn retried_create_returns_existing_volume() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));

        let first = controller.create_volume(create_request("pvc-1")).await.unwrap();
        let second = controller.create_volume(create_request("pvc-1")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(mounter.mount_count(), 1);
        assert_eq!(entries(tmp.path()), 1);
    }

    #[tokio::test]
    async fn conflicting_create_with_same_name_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(tmp.path(), Arc::new(RecordingMounter::new()));

        controller.create_volume(create_request("pvc-1")).await.unwrap();

        let mut bigger = create_request("pvc-1");
        bigger.capacity_range = Some(CapacityRange {
            required_bytes: 2 * ONE_GIB,
            limit_bytes: 0,
        });
        let err = controller.create_volume(bigger).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);

        let mut elsewhere = create_request("pvc-1");
        elsewhere
            .parameters
            .insert("share".into(), "/other".into());
        let err = controller.create_volume(elsewhere).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn name_is_reusable_after_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(tmp.path(), Arc::new(RecordingMounter::new()));

        let first = controller.create_volume(create_request("pvc-1")).await.unwrap();
        controller.delete_volume(&first.volume_id).await.unwrap();
        let second = controller.create_volume(create_request("pvc-1")).await.unwrap();

        assert_ne!(first.volume_id, second.volume_id);
        assert_eq!(entries(tmp.path()), 1);
    }

    #[tokio::test]
    async fn mount_failures_are_classified_and_create_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));

        mounter.fail_next_mount(Failure::PermissionDenied);
        let err = controller.create_volume(create_request("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PermissionDenied);

        mounter.fail_next_mount(Failure::InvalidArgument);
        let err = controller.create_volume(create_request("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);

        mounter.fail_next_mount(Failure::Other);
        let err = controller.create_volume(create_request("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);

        assert_eq!(entries(tmp.path()), 0);
        assert!(controller.list_volumes().await.unwrap().is_empty());
        assert!(controller.locks.is_empty());

        // The name is not wedged by the failures.
        controller.create_volume(create_request("a")).await.unwrap();
    }

    #[tokio::test]
    async fn unmount_failure_keeps_directory_and_allows_retry() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));

        mounter.fail_next_unmount(Failure::Other);
        let err = controller.create_volume(create_request("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(entries(tmp.path()), 1);

        let vol = controller.create_volume(create_request("a")).await.unwrap();
        assert!(tmp.path().join(vol.volume_id.as_str()).is_dir());
        assert_eq!(entries(tmp.path()), 1);
    }

    #[tokio::test]
    async fn failed_mkdir_still_unmounts() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("pv");
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(&root, Arc::clone(&mounter));

        // Swap the mounted root for a regular file so the volume directory
        // cannot be created beneath it.
        mounter.after_next_mount(|target| {
            std::fs::remove_dir(target).unwrap();
            std::fs::write(target, b"").unwrap();
        });

        let err = controller.create_volume(create_request("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(mounter.mount_count(), 1);
        assert_eq!(mounter.mounted(), 0);
        assert!(matches!(mounter.calls().last(), Some(Call::Unmount { .. })));
        assert!(controller.list_volumes().await.unwrap().is_empty());
        assert!(controller.volume_names.is_empty());
        assert!(controller.locks.is_empty());
    }

    #[tokio::test]
    async fn failed_removal_is_reported_and_unmounts() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let config = ControllerConfig {
            mount_root: tmp.path().to_path_buf(),
            default_backend: Some(BackendConfig {
                server: "nfs.local".into(),
                share: "/srv".into(),
            }),
            ..Default::default()
        };
        let controller =
            NfsController::new(&config, Arc::clone(&mounter) as Arc<dyn Mounter>).unwrap();

        // A regular file where the volume directory should be cannot be
        // removed as a directory tree.
        let id = VolumeId::from("csi-nfs-vol-not-a-dir");
        std::fs::write(tmp.path().join(id.as_str()), b"data").unwrap();

        let err = controller.delete_volume(&id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(tmp.path().join(id.as_str()).is_file());
        assert_eq!(mounter.mount_count(), 1);
        assert_eq!(mounter.mounted(), 0);
        assert!(controller.locks.is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_volume_uses_mount_root_as_is() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));

        let id = VolumeId::from("csi-nfs-vol-left-over");
        std::fs::create_dir_all(tmp.path().join(id.as_str()).join("data")).unwrap();

        controller.delete_volume(&id).await.unwrap();
        assert_eq!(entries(tmp.path()), 0);
        assert!(mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_volume_mounts_default_backend() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let config = ControllerConfig {
            mount_root: tmp.path().to_path_buf(),
            default_backend: Some(BackendConfig {
                server: "nfs.local".into(),
                share: "/srv".into(),
            }),
            ..Default::default()
        };
        let controller =
            NfsController::new(&config, Arc::clone(&mounter) as Arc<dyn Mounter>).unwrap();

        controller
            .delete_volume(&VolumeId::from("csi-nfs-vol-gone"))
            .await
            .unwrap();
        assert_eq!(
            mounter.calls().first(),
            Some(&Call::Mount {
                source: "nfs.local:/srv".into(),
                target: tmp.path().to_path_buf(),
            })
        );
        assert_eq!(mounter.mounted(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn creates_with_different_names_run_in_parallel() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::with_delay(Duration::from_millis(100)));
        let controller = Arc::new(make_controller(tmp.path(), Arc::clone(&mounter)));

        let started = Instant::now();
        let mut tasks = Vec::new();
        for i in 0..4 {
            let controller = Arc::clone(&controller);
            tasks.push(tokio::spawn(async move {
                controller
                    .create_volume(create_request(&format!("pvc-{i}")))
                    .await
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap().unwrap().volume_id);
        }

        // Serialized, four mount/unmount pairs would take 800ms.
        assert!(started.elapsed() < Duration::from_millis(600));
        assert_eq!(ids.len(), 4);
        assert_eq!(entries(tmp.path()), 4);
        assert_eq!(mounter.max_mounted(), 1);
        assert_eq!(mounter.mounted(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn creates_with_same_name_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::with_delay(Duration::from_millis(50)));
        let controller = Arc::new(make_controller(tmp.path(), Arc::clone(&mounter)));

        // Every request asks for a different size, so only the first one
        // through the name lock may provision; each later one must see its
        // record and conflict.
        let mut tasks = Vec::new();
        for i in 1..=4 {
            let controller = Arc::clone(&controller);
            tasks.push(tokio::spawn(async move {
                let mut req = create_request("shared");
                req.capacity_range = Some(CapacityRange {
                    required_bytes: i * ONE_GIB,
                    limit_bytes: 0,
                });
                controller.create_volume(req).await
            }));
        }

        let (mut created, mut conflicts) = (0, 0);
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => {
                    assert_eq!(e.code(), ErrorCode::AlreadyExists);
                    conflicts += 1;
                }
            }
        }

        assert_eq!((created, conflicts), (1, 3));
        assert_eq!(entries(tmp.path()), 1);
        assert_eq!(
            mounter.calls(),
            vec![
                Call::Mount {
                    source: "10.0.0.1:/export".into(),
                    target: tmp.path().to_path_buf(),
                },
                Call::Unmount {
                    target: tmp.path().to_path_buf(),
                },
            ]
        );
        assert_eq!(controller.list_volumes().await.unwrap().len(), 1);
        assert!(controller.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_cancels_stuck_create() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::with_delay(Duration::from_millis(500)));
        let controller = Arc::new(make_controller(tmp.path(), mounter));

        let task = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.create_volume(create_request("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        assert!(controller.locks.is_empty());
    }

    #[tokio::test]
    async fn create_requires_advertised_capability() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let driver = DriverInfo::new("csi-nfsplugin", "")
            .unwrap()
            .with_controller_capabilities(vec![ControllerServiceCapability::ListVolumes]);
        let controller = make_controller(tmp.path(), Arc::clone(&mounter)).with_driver(driver);

        let err = controller.create_volume(create_request("a")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        let err = controller
            .delete_volume(&VolumeId::from("csi-nfs-vol-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
        assert!(mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn inert_controller_rpcs() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::new());
        let controller = make_controller(tmp.path(), Arc::clone(&mounter));

        let published = controller
            .controller_publish_volume(ControllerPublishVolumeRequest {
                volume_id: "csi-nfs-vol-1".into(),
                node_id: "node-01".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(published.publish_context.is_empty());

        controller
            .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
                volume_id: "csi-nfs-vol-1".into(),
                node_id: "node-01".into(),
            })
            .await
            .unwrap();

        let err = controller
            .controller_expand_volume(ControllerExpandVolumeRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unimplemented);

        let caps = controller.controller_get_capabilities().await.unwrap();
        assert!(caps.contains(&ControllerServiceCapability::CreateDeleteVolume));
        assert!(mounter.calls().is_empty());
    }

    #[tokio::test]
    async fn identity() {
        let tmp = tempfile::tempdir().unwrap();
        let controller = make_controller(tmp.path(), Arc::new(RecordingMounter::new()));

        let info = controller.get_plugin_info().await.unwrap();
        assert_eq!(info.name, "csi-nfsplugin");
        assert!(controller.probe().await.unwrap());
        assert_eq!(
            controller.get_plugin_capabilities().await.unwrap(),
            vec![PluginCapability::ControllerService]
        );

        let missing = make_controller(
            Path::new("/nonexistent/path/for/test/root"),
            Arc::new(RecordingMounter::new()),
        );
        assert!(!missing.probe().await.unwrap());
    }
}
