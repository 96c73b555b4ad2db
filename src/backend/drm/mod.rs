//! Display resource management
//!
//! This module contains everything needed to decide what the display hardware scans out:
//!
//! - The [`ResourceManager`] opens all display devices, resolves displays to the device
//!   driving them, owns one [`DisplayCompositor`] per crtc, partitions planes across active
//!   displays and runs the writeback capture session.
//! - The [`Planner`] decides per frame which [`Layer`]s are scanned out directly by a plane
//!   and which are precomposed.
//! - [`PlatformPolicy`] implementations split the plane inventory of a device across the
//!   crtcs of the active displays.
//!
//! ## Hardware access
//!
//! The hardware is reached through the [`DisplayDevice`], [`DeviceBackend`] and [`Importer`]
//! traits. With the `backend_drm` feature, [`DrmBackend`] implements them on top of kernel
//! mode setting. Everything else in this module does not care how they are implemented.
//!
//! ## Displays
//!
//! Displays are numbered across all devices in the order the devices were opened.
//! A [`DisplayId`] may carry split-mode bits ([`SPLIT_MODE_MASK`]), which are ignored
//! when resolving the display to its device.

use std::fmt;

mod compositor;
pub(crate) mod connector;
mod device;
mod error;
pub mod importer;
mod manager;
pub(crate) mod plane;
mod planner;
mod platform;
mod writeback;

pub use self::compositor::DisplayCompositor;
pub use self::connector::{ConnectorInfo, ConnectorState, DisplayMode};
#[cfg(feature = "backend_drm")]
pub use self::device::{DrmBackend, DrmDevice, DrmDeviceFd};
pub use self::device::{DeviceBackend, DisplayDevice, DriverInfo};
pub use self::error::{Error, ProvisionError};
pub use self::importer::{ImportError, ImportedBuffer, Importer};
pub use self::manager::{PlaneGroupStatus, ResourceManager};
pub use self::plane::{PlaneInfo, PlaneType};
pub use self::planner::{CompositionKind, CompositionPlane, Layer, Planner, ProvisionStage};
pub use self::platform::{DefaultPlatform, PlatformPolicy};
pub use self::writeback::{
    WritebackBuffer, WritebackState, RESET_BUFFER_SIZE, WRITEBACK_ALIGN, WRITEBACK_FORMAT,
};

/// Bits of a display id that select a split mode of the display
pub const SPLIT_MODE_MASK: u32 = 0xf000;

/// Logical identifier of a display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(u32);

impl DisplayId {
    /// Create a display id from its raw value
    pub const fn new(raw: u32) -> DisplayId {
        DisplayId(raw)
    }

    /// Raw value including split-mode bits
    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The display id with the split-mode bits cleared
    pub fn base(&self) -> DisplayId {
        DisplayId(self.0 & !SPLIT_MODE_MASK)
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! object_id {
    ($(#[$attr:meta])* $name:ident $(, $handle:path)?) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        $(
            #[cfg(feature = "backend_drm")]
            impl From<$handle> for $name {
                fn from(handle: $handle) -> Self {
                    $name(u32::from(handle))
                }
            }
        )?
    };
}

object_id!(
    /// Kernel object id of a crtc
    CrtcId, ::drm::control::crtc::Handle
);
object_id!(
    /// Kernel object id of a plane
    PlaneId, ::drm::control::plane::Handle
);
object_id!(
    /// Kernel object id of a connector
    ConnectorId, ::drm::control::connector::Handle
);

/// A crtc of a display device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrtcInfo {
    /// Kernel object id
    pub id: CrtcId,
    /// Position in the device's crtc list, as referenced by [`PlaneInfo::possible_crtcs`]
    pub index: u32,
    /// Display currently driven by this crtc
    pub display: Option<DisplayId>,
}
