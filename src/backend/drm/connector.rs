use super::{ConnectorId, DisplayId};

/// Connection state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    /// A sink is attached
    Connected,
    /// Nothing is attached
    Disconnected,
    /// The driver could not tell
    Unknown,
}

#[cfg(feature = "backend_drm")]
impl From<drm::control::connector::State> for ConnectorState {
    fn from(state: drm::control::connector::State) -> Self {
        match state {
            drm::control::connector::State::Connected => ConnectorState::Connected,
            drm::control::connector::State::Disconnected => ConnectorState::Disconnected,
            drm::control::connector::State::Unknown => ConnectorState::Unknown,
        }
    }
}

/// Output mode of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisplayMode {
    /// Horizontal resolution
    pub width: u32,
    /// Vertical resolution
    pub height: u32,
    /// Refresh rate in Hz
    pub refresh: u32,
}

impl DisplayMode {
    /// Create a new mode
    pub fn new(width: u32, height: u32, refresh: u32) -> DisplayMode {
        DisplayMode {
            width,
            height,
            refresh,
        }
    }
}

#[cfg(feature = "backend_drm")]
impl From<drm::control::Mode> for DisplayMode {
    fn from(mode: drm::control::Mode) -> Self {
        let (width, height) = mode.size();
        DisplayMode {
            width: width as u32,
            height: height as u32,
            refresh: mode.vrefresh(),
        }
    }
}

/// Snapshot of a connector's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    /// Kernel object id
    pub id: ConnectorId,
    /// Display this connector belongs to
    pub display: DisplayId,
    /// Connection state at the time of the query
    pub state: ConnectorState,
    /// Mode currently programmed, if any
    pub current_mode: Option<DisplayMode>,
    /// Whether this is a writeback connector
    pub writeback: bool,
}

impl ConnectorInfo {
    /// Returns true if a sink is attached
    pub fn is_connected(&self) -> bool {
        self.state == ConnectorState::Connected
    }
}
