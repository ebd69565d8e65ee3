//! # libnfscsi: NFS volume provisioning for CSI
//!
//! `libnfscsi` implements the controller side of a [Container Storage
//! Interface][csi] driver whose volumes are subdirectories of a shared NFS
//! export.  Creating a volume mounts the export on a local mount root, creates
//! the volume's directory and unmounts again; deleting removes the directory.
//! It follows the usual conventions: Tokio async runtime, `tracing` for
//! observability, `thiserror` for structured errors.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and its status codes; mount failure classes. |
//! | [`config`] | [`ControllerConfig`] from defaults, YAML or environment. |
//! | [`params`] | Typed view of the `server`/`share` parameter bag. |
//! | [`keylock`] | Per-key locks serializing work on one volume. |
//! | [`mount`] | Mount primitive and the shared, timeout-bounded mount root. |
//! | [`identity`] | [`CsiIdentity`] trait and the driver description. |
//! | [`controller`] | [`CsiController`] trait for the volume lifecycle. |
//! | [`backend`] | The NFS implementation of both traits. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod keylock;
pub mod mount;
pub mod params;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::nfs::NfsController;
pub use config::ControllerConfig;
pub use controller::CsiController;
pub use error::{CsiError, ErrorCode};
pub use identity::{CsiIdentity, DriverInfo};
pub use types::*;
