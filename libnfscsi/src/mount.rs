//! Backend mount primitive and the shared mount root.
//!
//! [`Mounter`] is the raw mount/unmount contract.  [`SystemMounter`] drives
//! the host's `mount(8)` for NFS and `umount(2)` via `nix`.
//!
//! [`SharedMount`] owns the single fixed mount root.  Operations that target
//! the same export share one mount; an operation that needs a different
//! export waits until the root is idle.  Every blocking call runs on the
//! blocking pool, bounded by a timeout and the caller's cancellation token,
//! so a stuck backend fails the request instead of pinning it forever.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{CsiError, MountError};

/// Filesystem type passed to every mount.
pub const NFS_FS_TYPE: &str = "nfs";

/// Raw, blocking mount operations against the host.
pub trait Mounter: Send + Sync {
    /// Mount `source` (e.g. `10.0.0.1:/export`) on `target`.
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    /// Unmount whatever is mounted on `target`.
    fn unmount(&self, target: &Path) -> Result<(), MountError>;
}

/// [`Mounter`] backed by the host's mount tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let mut cmd = Command::new("mount");
        cmd.arg("-t").arg(fstype);
        if !options.is_empty() {
            cmd.arg("-o").arg(options.join(","));
        }
        cmd.arg(source).arg(target);

        let output = cmd.output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_mount_failure(output.status.code(), stderr.trim()))
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        nix::mount::umount(target).map_err(|errno| classify_errno(errno, target))
    }
}

/// Classify a failed `mount(8)` run by its diagnostic output.
fn classify_mount_failure(code: Option<i32>, stderr: &str) -> MountError {
    let lower = stderr.to_ascii_lowercase();
    let msg = match code {
        Some(code) => format!("mount failed (exit status {code}): {stderr}"),
        None => format!("mount terminated by signal: {stderr}"),
    };
    if lower.contains("permission denied")
        || lower.contains("access denied")
        || lower.contains("operation not permitted")
    {
        MountError::PermissionDenied(msg)
    } else if lower.contains("invalid argument") || lower.contains("bad option") {
        MountError::InvalidArgument(msg)
    } else {
        MountError::Other(msg)
    }
}

fn classify_errno(errno: Errno, target: &Path) -> MountError {
    let msg = format!("unmount {}: {errno}", target.display());
    match errno {
        Errno::EPERM | Errno::EACCES => MountError::PermissionDenied(msg),
        Errno::EINVAL => MountError::InvalidArgument(msg),
        _ => MountError::Other(msg),
    }
}

// ---------------------------------------------------------------------------
// Shared mount root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum RootState {
    /// Nothing is mounted on the root.
    Idle,
    /// `source` is mounted on the root.
    Mounted(String),
    /// A mount or unmount was abandoned mid-flight; the root may or may not
    /// carry a mount.
    Unknown,
}

/// A mounter call that outlived its deadline and still runs on the blocking
/// pool.
#[derive(Debug)]
struct PendingCall {
    what: &'static str,
    task: JoinHandle<Result<(), MountError>>,
}

#[derive(Debug)]
struct MountState {
    root: RootState,
    users: usize,
    /// Must finish before anything else touches the root.
    pending: Option<PendingCall>,
}

/// Reference-counted owner of the fixed mount root.
pub struct SharedMount {
    target: PathBuf,
    options: Vec<String>,
    timeout: Duration,
    mounter: Arc<dyn Mounter>,
    state: Mutex<MountState>,
    idle: Notify,
}

impl SharedMount {
    pub fn new(
        target: impl Into<PathBuf>,
        options: Vec<String>,
        timeout: Duration,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            target: target.into(),
            options,
            timeout,
            mounter,
            state: Mutex::new(MountState {
                root: RootState::Idle,
                users: 0,
                pending: None,
            }),
            idle: Notify::new(),
        }
    }

    /// The local directory exports are mounted on.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Make `source` available under the mount root.
    ///
    /// Joins an existing mount of the same export, otherwise waits for the
    /// root to become idle and mounts it.  The returned lease must be handed
    /// back through [`MountLease::release`].
    #[instrument(skip(self, cancel), fields(target = %self.target.display()))]
    pub async fn acquire(
        self: &Arc<Self>,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<MountLease, CsiError> {
        loop {
            let idle = self.idle.notified();
            {
                let mut state = tokio::select! {
                    state = self.state.lock() => state,
                    _ = cancel.cancelled() => {
                        return Err(CsiError::Cancelled("waiting for mount root".into()));
                    }
                };

                if state.root == RootState::Mounted(source.to_owned()) {
                    state.users += 1;
                    debug!(source, users = state.users, "joined existing mount");
                    return Ok(self.lease());
                }

                if state.users == 0 {
                    self.settle_pending(&mut state, cancel).await?;
                    self.clear_root(&mut state, cancel).await?;
                    self.mount_root(&mut state, source, cancel).await?;
                    state.users = 1;
                    return Ok(self.lease());
                }

                debug!(source, "mount root busy with another export, waiting");
            }

            tokio::select! {
                _ = idle => {}
                _ = cancel.cancelled() => {
                    return Err(CsiError::Cancelled("waiting for mount root".into()));
                }
            }
        }
    }

    fn lease(self: &Arc<Self>) -> MountLease {
        MountLease {
            mount: Arc::clone(self),
            released: false,
        }
    }

    /// Remove a mount left behind by an earlier failure before mounting a
    /// different export.
    async fn clear_root(
        &self,
        state: &mut MountState,
        cancel: &CancellationToken,
    ) -> Result<(), CsiError> {
        match state.root.clone() {
            RootState::Idle => Ok(()),
            RootState::Unknown => {
                match self.unmount(state, cancel).await {
                    Ok(()) => {}
                    Err(e @ (CsiError::DeadlineExceeded(_) | CsiError::Cancelled(_))) => {
                        return Err(e);
                    }
                    // Usually "not mounted", which is what we want.
                    Err(e) => debug!(error = %e, "cleanup unmount of uncertain root failed"),
                }
                state.root = RootState::Idle;
                Ok(())
            }
            RootState::Mounted(stale) => {
                self.unmount(state, cancel).await.map_err(|e| match e {
                    CsiError::DeadlineExceeded(_) | CsiError::Cancelled(_) => e,
                    e => CsiError::internal(format!(
                        "mount root {} still carries {stale}: {e}",
                        self.target.display()
                    )),
                })?;
                state.root = RootState::Idle;
                Ok(())
            }
        }
    }

    async fn mount_root(
        &self,
        state: &mut MountState,
        source: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CsiError> {
        tokio::fs::create_dir_all(&self.target).await.map_err(|e| {
            CsiError::Internal(format!(
                "create mount root {}: {e}",
                self.target.display()
            ))
        })?;

        let target = self.target.clone();
        let options = self.options.clone();
        let owned_source = source.to_owned();
        let result = self
            .run_blocking(state, "mount", cancel, move |m| {
                m.mount(&owned_source, &target, NFS_FS_TYPE, &options)
            })
            .await;

        match result {
            Ok(()) => {
                state.root = RootState::Mounted(source.to_owned());
                info!(source, target = %self.target.display(), "export mounted");
                Ok(())
            }
            Err(e) => {
                warn!(source, error = %e, "mount failed");
                Err(e)
            }
        }
    }

    async fn unmount(
        &self,
        state: &mut MountState,
        cancel: &CancellationToken,
    ) -> Result<(), CsiError> {
        let target = self.target.clone();
        self.run_blocking(state, "unmount", cancel, move |m| m.unmount(&target))
            .await
    }

    /// Wait for a call abandoned by an earlier timeout or cancellation.
    ///
    /// The root stays [`RootState::Unknown`]; only the wait is bounded here.
    async fn settle_pending(
        &self,
        state: &mut MountState,
        cancel: &CancellationToken,
    ) -> Result<(), CsiError> {
        let Some(PendingCall { what, task }) = state.pending.take() else {
            return Ok(());
        };
        debug!(what, "waiting for abandoned mounter call");
        match self.await_call(state, what, cancel, task).await {
            Ok(()) => Ok(()),
            Err(e @ (CsiError::DeadlineExceeded(_) | CsiError::Cancelled(_))) => Err(e),
            Err(e) => {
                debug!(what, error = %e, "abandoned mounter call failed");
                Ok(())
            }
        }
    }

    /// Drop one user; the last user unmounts the root.
    async fn release_one(&self, cancel: &CancellationToken) -> Result<(), CsiError> {
        let mut state = self.state.lock().await;
        state.users = state.users.saturating_sub(1);
        if state.users > 0 {
            return Ok(());
        }

        let result = match self.settle_pending(&mut state, cancel).await {
            Ok(()) => self.unmount(&mut state, cancel).await,
            Err(e) => Err(e),
        };
        if result.is_ok() {
            state.root = RootState::Idle;
            info!(target = %self.target.display(), "export unmounted");
        }
        // On any other failure the root is still mounted and the next user
        // of the same export reuses it.
        drop(state);
        self.idle.notify_waiters();
        result
    }

    /// Run a blocking [`Mounter`] call under the timeout and `cancel`.
    async fn run_blocking<F>(
        &self,
        state: &mut MountState,
        what: &'static str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<(), CsiError>
    where
        F: FnOnce(&dyn Mounter) -> Result<(), MountError> + Send + 'static,
    {
        let mounter = Arc::clone(&self.mounter);
        let task = tokio::task::spawn_blocking(move || f(mounter.as_ref()));
        self.await_call(state, what, cancel, task).await
    }

    /// Wait for `task` under the timeout and `cancel`.
    ///
    /// A call that is given up on keeps running; it is parked in
    /// `state.pending` and the root becomes [`RootState::Unknown`].
    async fn await_call(
        &self,
        state: &mut MountState,
        what: &'static str,
        cancel: &CancellationToken,
        mut task: JoinHandle<Result<(), MountError>>,
    ) -> Result<(), CsiError> {
        let abandoned = tokio::select! {
            res = tokio::time::timeout(self.timeout, &mut task) => match res {
                Ok(Ok(outcome)) => return outcome.map_err(CsiError::from),
                Ok(Err(join)) => {
                    return Err(CsiError::internal(format!("{what} task failed: {join}")));
                }
                Err(_) => CsiError::DeadlineExceeded(format!(
                    "{what} of {} did not finish within {:?}",
                    self.target.display(),
                    self.timeout
                )),
            },
            _ = cancel.cancelled() => CsiError::Cancelled(format!(
                "{what} of {}",
                self.target.display()
            )),
        };

        warn!(what, error = %abandoned, "abandoning mounter call");
        state.root = RootState::Unknown;
        state.pending = Some(PendingCall { what, task });
        Err(abandoned)
    }

    #[cfg(test)]
    async fn users(&self) -> usize {
        self.state.lock().await.users
    }
}

/// One user's claim on the mounted root.
pub struct MountLease {
    mount: Arc<SharedMount>,
    released: bool,
}

impl MountLease {
    /// Give the root back, unmounting it if this was the last user.
    pub async fn release(mut self, cancel: &CancellationToken) -> Result<(), CsiError> {
        self.released = true;
        self.mount.release_one(cancel).await
    }
}

impl Drop for MountLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // The owning operation was dropped mid-flight; hand the root back in
        // the background so the user count stays accurate.
        let mount = Arc::clone(&self.mount);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = mount.release_one(&CancellationToken::new()).await {
                        warn!(error = %e, "background release of mount root failed");
                    }
                });
            }
            Err(_) => warn!("mount lease dropped outside a runtime; root left mounted"),
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------
