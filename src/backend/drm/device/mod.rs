use std::fmt;
use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::sync::Arc;

use rustix::fs::{Mode, OFlags};

use super::{ConnectorInfo, CrtcInfo, DisplayId, Error, Importer, PlaneInfo, PlatformPolicy};

#[cfg(feature = "backend_drm")]
mod fd;
#[cfg(feature = "backend_drm")]
mod kms;

#[cfg(feature = "backend_drm")]
pub use self::fd::DrmDeviceFd;
#[cfg(feature = "backend_drm")]
pub use self::kms::{DrmBackend, DrmDevice};

/// Identity of the kernel driver behind a device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverInfo {
    /// Driver name, e.g. `rockchip`
    pub name: String,
    /// Human readable description
    pub description: String,
    /// Driver date, used as its version tag
    pub version: String,
}

impl DriverInfo {
    /// Identifier of the platform the driver runs on
    ///
    /// This is the driver name without any `-drm` style suffix.
    pub fn platform_id(&self) -> &str {
        self.name
            .split(|c: char| c == '-' || c == '_')
            .next()
            .unwrap_or(&self.name)
    }
}

/// An opened display device
///
/// The crtc, plane and display lists are fixed once the device is opened.
/// Connector state is queried on demand, since modes change at runtime.
pub trait DisplayDevice: fmt::Debug + Send + Sync {
    /// Path of the device node
    fn path(&self) -> &Path;

    /// Driver of the device
    fn driver(&self) -> &DriverInfo;

    /// Displays driven by this device
    fn displays(&self) -> &[DisplayId];

    /// Crtcs of this device, in kernel order
    fn crtcs(&self) -> &[CrtcInfo];

    /// All planes of this device
    fn planes(&self) -> &[PlaneInfo];

    /// Query the connector of the given display
    fn connector_for_display(&self, display: DisplayId) -> Option<ConnectorInfo>;

    /// Find a writeback connector able to capture the given display
    fn available_writeback_connector(&self, display: DisplayId) -> Option<ConnectorInfo>;

    /// Returns true if the display is driven by this device
    fn handles_display(&self, display: DisplayId) -> bool {
        self.displays().contains(&display)
    }

    /// Crtc currently driving the given display
    fn crtc_for_display(&self, display: DisplayId) -> Option<&CrtcInfo> {
        self.crtcs().iter().find(|crtc| crtc.display == Some(display))
    }
}

/// Opens devices and creates the objects bound to them
pub trait DeviceBackend {
    /// Open the device node at `path`, numbering its displays from `first_display`
    fn open(&mut self, path: &Path, first_display: u32) -> Result<Arc<dyn DisplayDevice>, Error>;

    /// Create the importer for an opened device
    fn importer(&mut self, device: &Arc<dyn DisplayDevice>) -> Result<Arc<dyn Importer>, Error>;

    /// Create the platform policy bound to an opened device
    fn platform(&mut self, device: &Arc<dyn DisplayDevice>) -> Result<Box<dyn PlatformPolicy>, Error>;

    /// Open the framebuffer console
    fn open_console(&mut self, path: &Path) -> std::io::Result<OwnedFd> {
        Ok(rustix::fs::open(path, OFlags::RDWR, Mode::empty())?)
    }
}
