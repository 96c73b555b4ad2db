use smallvec::SmallVec;

use super::{CrtcInfo, PlaneId};
use crate::backend::allocator::Fourcc;

/// Type of a plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaneType {
    /// Primary plane, always available for its crtc
    Primary,
    /// Additional overlay plane
    Overlay,
    /// Cursor plane, not used for composition
    Cursor,
}

impl PlaneType {
    /// Map the value of the kernel's `type` plane property
    pub fn from_property(value: u64) -> Option<PlaneType> {
        match value {
            0 => Some(PlaneType::Overlay),
            1 => Some(PlaneType::Primary),
            2 => Some(PlaneType::Cursor),
            _ => None,
        }
    }
}

/// A hardware plane of a display device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaneInfo {
    /// Kernel object id
    pub id: PlaneId,
    /// Type of the plane
    pub kind: PlaneType,
    /// Bitmask of crtc indices this plane can be attached to
    pub possible_crtcs: u32,
    /// Formats the plane can scan out
    pub formats: SmallVec<[Fourcc; 8]>,
}

impl PlaneInfo {
    /// Returns true if the plane can be attached to the given crtc
    pub fn supports_crtc(&self, crtc: &CrtcInfo) -> bool {
        crtc.index < u32::BITS && self.possible_crtcs & (1 << crtc.index) != 0
    }

    /// Returns true if the plane can scan out buffers of the given format
    pub fn supports_format(&self, format: Fourcc) -> bool {
        self.formats.contains(&format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::drm::CrtcId;

    fn crtc(index: u32) -> CrtcInfo {
        CrtcInfo {
            id: CrtcId(40 + index),
            index,
            display: None,
        }
    }

    #[test]
    fn crtc_mask() {
        let plane = PlaneInfo {
            id: PlaneId(31),
            kind: PlaneType::Overlay,
            possible_crtcs: 0b101,
            formats: SmallVec::from_slice(&[Fourcc::Nv12]),
        };

        assert!(plane.supports_crtc(&crtc(0)));
        assert!(!plane.supports_crtc(&crtc(1)));
        assert!(plane.supports_crtc(&crtc(2)));
        assert!(!plane.supports_crtc(&crtc(40)));
        assert!(plane.supports_format(Fourcc::Nv12));
        assert!(!plane.supports_format(Fourcc::Argb8888));
    }

    #[test]
    fn property_types() {
        assert_eq!(PlaneType::from_property(1), Some(PlaneType::Primary));
        assert_eq!(PlaneType::from_property(0), Some(PlaneType::Overlay));
        assert_eq!(PlaneType::from_property(2), Some(PlaneType::Cursor));
        assert_eq!(PlaneType::from_property(7), None);
    }
}
