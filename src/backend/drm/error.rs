use std::path::PathBuf;

use super::{ConnectorId, CrtcId, DisplayId};
use crate::backend::allocator::QueueError;

/// Errors thrown by the [`ResourceManager`](super::ResourceManager),
/// the [`Planner`](super::Planner) and the platform policies.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Opening or initializing a device node failed
    #[error("Failed to initialize device `{path:?}`")]
    DeviceInit {
        /// Path of the device node
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Initialization found no display on any device
    #[error("Failed to initialize any displays")]
    NoDisplays,
    /// The platform policy could not be created
    #[error("Failed to create platform policy for device `{path:?}`")]
    PlatformInit {
        /// Path of the device the policy was created for
        path: PathBuf,
        /// Underlying error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// No plane can be used with the given crtc
    #[error("Crtc `{0}` has no usable planes")]
    NoUsablePlanes(CrtcId),
    /// A provisioning stage of the planner failed
    #[error("Failed provision stage")]
    Provision(#[from] ProvisionError),
    /// An active display is not driven by any crtc
    #[error("Display `{0}` has no crtc")]
    NoCrtcForDisplay(DisplayId),
    /// Writeback is already bound to a different display
    #[error("Writeback is bound to display `{bound:?}`, request of display `{requested}` can't be handled")]
    WritebackConflict {
        /// Display currently holding the writeback session, if any
        bound: Option<DisplayId>,
        /// Display that issued the request
        requested: DisplayId,
    },
    /// The display has no connector
    #[error("Display `{0}` has no connector")]
    ConnectorUnavailable(DisplayId),
    /// The connector of the display is not connected
    #[error("Connector `{connector}` of display `{display}` is not connected")]
    ConnectorNotConnected {
        /// Display in question
        display: DisplayId,
        /// Its connector
        connector: ConnectorId,
    },
    /// Allocating a buffer failed
    #[error("Failed to allocate {width}x{height} buffer")]
    BufferAlloc {
        /// Requested width
        width: u32,
        /// Requested height
        height: u32,
        /// Underlying allocator error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Submitting a writeback buffer failed
    #[error("Failed to queue writeback buffer")]
    QueueSubmit(#[from] QueueError),
    /// Writeback is not enabled
    #[error("Writeback is not enabled")]
    NotEnabled,
    /// No device handles the display
    #[error("No device handles display `{0}`")]
    UnknownDisplay(DisplayId),
    /// The device encountered an access error
    #[error("DRM access error: {errmsg} on device `{dev:?}` ({source:})")]
    Access {
        /// Error message associated to the access error
        errmsg: &'static str,
        /// Device on which the error was generated
        dev: Option<PathBuf>,
        /// Underlying device error
        source: std::io::Error,
    },
}

/// Errors of the individual [`ProvisionStage`](super::ProvisionStage)s
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    /// A protected layer found no plane able to scan it out directly
    #[error("Protected layer {layer} has no plane supporting it")]
    ProtectedLayer {
        /// Index of the layer
        layer: usize,
    },
    /// Layers are left for composition, but no plane is left to show the result
    #[error("No plane left for {layers} precomposed layers")]
    NoPlaneForPrecomposition {
        /// Amount of layers left for composition
        layers: usize,
    },
}
