use drm::{control::Device as ControlDevice, Device as BasicDevice};
use rustix::fs::{Mode, OFlags};
use std::{
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{error, info, warn};

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    path: PathBuf,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.path);
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for DrmDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl DrmDeviceFd {
    /// Open the device node at `path`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never open the same node twice, but instead
    /// clone the `DrmDeviceFd`.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<DrmDeviceFd> {
        let path = path.as_ref();
        let fd = rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;
        let mut dev = InternalDrmDeviceFd {
            fd,
            path: path.to_path_buf(),
            privileged: false,
        };

        // Composition does not need to be the master, writeback commits do.
        // Newer kernels grant this permission, if no other process is already the *master*.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        Ok(DrmDeviceFd(Arc::new(dev)))
    }

    /// Returns whether this fd holds the master lock
    pub fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// Returns the path the device was opened from
    pub fn path(&self) -> &Path {
        &self.0.path
    }

    /// Returns the `dev_t` of the underlying device
    pub fn dev_id(&self) -> rustix::io::Result<rustix::fs::Dev> {
        Ok(rustix::fs::fstat(&self.0.fd)?.st_rdev)
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}
