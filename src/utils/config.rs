//! Runtime configuration
//!
//! The composer is configured from the environment, read once at startup:
//!
//! - `DRMHWC_DEVICE` selects the display device node. A value ending in `%` is a
//!   pattern: the `%` is replaced by `0`, `1`, `2`, ... and devices are opened until
//!   the first one fails. Defaults to `/dev/dri/card0`.
//! - `DRMHWC_CONSOLE` selects the framebuffer console opened for diagnostics.
//!   Defaults to `/dev/graphics/fb0`. An empty value disables it.

use std::path::{Path, PathBuf};

/// Environment variable selecting the display device node(s)
pub const DEVICE_ENV: &str = "DRMHWC_DEVICE";
/// Environment variable selecting the framebuffer console
pub const CONSOLE_ENV: &str = "DRMHWC_CONSOLE";

const DEFAULT_DEVICE: &str = "/dev/dri/card0";
const DEFAULT_CONSOLE: &str = "/dev/graphics/fb0";

/// Which device node(s) to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DevicePath {
    /// Open exactly this node
    Fixed(PathBuf),
    /// Append an increasing index to this prefix until opening fails
    Pattern(String),
}

impl DevicePath {
    /// Parse a device specification, treating a trailing `%` as a pattern
    pub fn parse(spec: &str) -> DevicePath {
        match spec.strip_suffix('%') {
            Some(prefix) => DevicePath::Pattern(prefix.to_owned()),
            None => DevicePath::Fixed(PathBuf::from(spec)),
        }
    }

    /// Path of the `idx`-th device described by this specification
    ///
    /// A fixed path only has an index `0`.
    pub fn nth(&self, idx: usize) -> Option<PathBuf> {
        match self {
            DevicePath::Fixed(path) if idx == 0 => Some(path.clone()),
            DevicePath::Fixed(_) => None,
            DevicePath::Pattern(prefix) => Some(PathBuf::from(format!("{}{}", prefix, idx))),
        }
    }
}

/// Configuration of the resource manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwcConfig {
    /// Device node(s) to open
    pub device: DevicePath,
    /// Optional framebuffer console, only used for diagnostics
    pub console: Option<PathBuf>,
}

impl Default for HwcConfig {
    fn default() -> Self {
        HwcConfig {
            device: DevicePath::Fixed(PathBuf::from(DEFAULT_DEVICE)),
            console: Some(PathBuf::from(DEFAULT_CONSOLE)),
        }
    }
}

impl HwcConfig {
    /// Read the configuration from the environment
    pub fn from_env() -> HwcConfig {
        let device = std::env::var(DEVICE_ENV)
            .ok()
            .filter(|spec| !spec.is_empty())
            .map(|spec| DevicePath::parse(&spec))
            .unwrap_or_else(|| DevicePath::Fixed(PathBuf::from(DEFAULT_DEVICE)));
        let console = match std::env::var(CONSOLE_ENV) {
            Ok(path) if path.is_empty() => None,
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_CONSOLE)),
        };

        tracing::debug!(?device, ?console, "Loaded composer configuration");
        HwcConfig { device, console }
    }

    /// Configuration opening exactly one device and no console
    pub fn with_device(path: impl AsRef<Path>) -> HwcConfig {
        HwcConfig {
            device: DevicePath::Fixed(path.as_ref().to_path_buf()),
            console: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_path() {
        let path = DevicePath::parse("/dev/dri/card1");
        assert_eq!(path, DevicePath::Fixed("/dev/dri/card1".into()));
        assert_eq!(path.nth(0), Some(PathBuf::from("/dev/dri/card1")));
        assert_eq!(path.nth(1), None);
    }

    #[test]
    fn pattern_path() {
        let path = DevicePath::parse("/dev/dri/card%");
        assert_eq!(path, DevicePath::Pattern("/dev/dri/card".into()));
        assert_eq!(path.nth(0), Some(PathBuf::from("/dev/dri/card0")));
        assert_eq!(path.nth(3), Some(PathBuf::from("/dev/dri/card3")));
    }
}
