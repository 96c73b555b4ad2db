//! Plane group assignment across displays
//!
//! Planes of a device can often be attached to more than one crtc. Before composing,
//! a [`PlatformPolicy`] decides which crtc owns which plane, so compositors of different
//! displays never fight over a plane.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};

use super::{CrtcId, CrtcInfo, DisplayDevice, DisplayId, Error, PlaneId, PlaneInfo, PlaneType, Planner};

/// Policy partitioning planes across active displays
pub trait PlatformPolicy: fmt::Debug + Send {
    /// Recompute the plane partition for the given active displays
    ///
    /// On error the previous partition stays in place.
    fn try_assign_planes(&mut self, device: &dyn DisplayDevice, active: &[DisplayId]) -> Result<(), Error>;

    /// Primary and overlay planes currently owned by `crtc`
    fn planes_for_crtc(&self, device: &dyn DisplayDevice, crtc: CrtcId) -> (Vec<PlaneInfo>, Vec<PlaneInfo>);

    /// Planner used for the crtcs of this platform
    fn planner(&self) -> &Planner;
}

/// Default plane partitioning
///
/// Planes usable by exactly one active crtc go to that crtc. Planes usable by more than
/// one are handed to whichever of them owns the fewest planes so far.
#[derive(Debug)]
pub struct DefaultPlatform {
    planner: Planner,
    partition: HashMap<CrtcId, Vec<PlaneId>>,
}

impl DefaultPlatform {
    /// Create the platform policy for the given device
    pub fn new(device: &dyn DisplayDevice) -> Result<DefaultPlatform, Error> {
        DefaultPlatform::with_planner(device, Planner::default())
    }

    /// Create the platform policy using a custom planner
    pub fn with_planner(device: &dyn DisplayDevice, planner: Planner) -> Result<DefaultPlatform, Error> {
        if device.planes().is_empty() {
            return Err(Error::PlatformInit {
                path: device.path().to_path_buf(),
                source: "device exposes no planes".into(),
            });
        }
        info!(
            device = ?device.path(),
            platform = device.driver().platform_id(),
            "Created platform policy"
        );
        Ok(DefaultPlatform {
            planner,
            partition: HashMap::new(),
        })
    }

    fn active_crtcs<'a>(device: &'a dyn DisplayDevice, active: &[DisplayId]) -> Result<Vec<&'a CrtcInfo>, Error> {
        let mut crtcs = Vec::with_capacity(active.len());
        for display in active {
            let display = display.base();
            let crtc = device
                .crtc_for_display(display)
                .ok_or(Error::NoCrtcForDisplay(display))?;
            if !crtcs.iter().any(|c: &&CrtcInfo| c.id == crtc.id) {
                crtcs.push(crtc);
            }
        }
        crtcs.sort_by_key(|crtc| crtc.index);
        Ok(crtcs)
    }
}

impl PlatformPolicy for DefaultPlatform {
    fn try_assign_planes(&mut self, device: &dyn DisplayDevice, active: &[DisplayId]) -> Result<(), Error> {
        let crtcs = Self::active_crtcs(device, active)?;
        let mut partition: HashMap<CrtcId, Vec<PlaneId>> =
            crtcs.iter().map(|crtc| (crtc.id, Vec::new())).collect();

        let planes = device
            .planes()
            .iter()
            .filter(|plane| plane.kind != PlaneType::Cursor)
            .map(|plane| {
                let usable = crtcs
                    .iter()
                    .filter(|crtc| plane.supports_crtc(crtc))
                    .map(|crtc| crtc.id)
                    .collect::<Vec<_>>();
                (plane, usable)
            })
            .collect::<Vec<_>>();

        // exclusive planes first, so shared ones can balance around them
        for (plane, usable) in planes.iter().filter(|(_, usable)| usable.len() == 1) {
            if let Some(owned) = partition.get_mut(&usable[0]) {
                owned.push(plane.id);
            }
        }
        for (plane, usable) in planes.iter().filter(|(_, usable)| usable.len() > 1) {
            let owner = usable
                .iter()
                .min_by_key(|crtc| partition.get(*crtc).map(Vec::len).unwrap_or(0))
                .copied();
            if let Some(owned) = owner.and_then(|crtc| partition.get_mut(&crtc)) {
                owned.push(plane.id);
            }
        }

        for crtc in &crtcs {
            if partition.get(&crtc.id).map(Vec::is_empty).unwrap_or(true) {
                warn!(crtc = %crtc.id, display = ?crtc.display, "No planes left for crtc");
                return Err(Error::NoUsablePlanes(crtc.id));
            }
        }

        for (crtc, planes) in &partition {
            debug!(crtc = %crtc, ?planes, "Assigned plane group");
        }
        self.partition = partition;
        Ok(())
    }

    fn planes_for_crtc(&self, device: &dyn DisplayDevice, crtc: CrtcId) -> (Vec<PlaneInfo>, Vec<PlaneInfo>) {
        let owned = self.partition.get(&crtc);
        let Some(info) = device.crtcs().iter().find(|c| c.id == crtc) else {
            return (Vec::new(), Vec::new());
        };

        let mut primary = Vec::new();
        let mut overlay = Vec::new();
        for plane in device.planes() {
            let usable = match owned {
                Some(owned) => owned.contains(&plane.id),
                // nothing assigned yet, every compatible plane is fair game
                None => self.partition.is_empty() && plane.supports_crtc(info),
            };
            if !usable {
                continue;
            }
            match plane.kind {
                PlaneType::Primary => primary.push(plane.clone()),
                PlaneType::Overlay => overlay.push(plane.clone()),
                PlaneType::Cursor => {}
            }
        }
        (primary, overlay)
    }

    fn planner(&self) -> &Planner {
        &self.planner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test::DummyDevice;

    #[test]
    fn exclusive_and_shared_planes() {
        // two crtcs, each with its own primary, two overlays usable by both
        let device = DummyDevice::builder()
            .display()
            .display()
            .plane(PlaneType::Primary, 0b01)
            .plane(PlaneType::Primary, 0b10)
            .plane(PlaneType::Overlay, 0b11)
            .plane(PlaneType::Overlay, 0b11)
            .plane(PlaneType::Cursor, 0b11)
            .build();
        let mut platform = DefaultPlatform::new(&device).unwrap();
        platform
            .try_assign_planes(&device, &[DisplayId::new(0), DisplayId::new(1)])
            .unwrap();

        let crtcs = device.crtcs();
        let (primary, overlay) = platform.planes_for_crtc(&device, crtcs[0].id);
        assert_eq!(primary.len(), 1);
        assert_eq!(overlay.len(), 1);
        let (primary, overlay) = platform.planes_for_crtc(&device, crtcs[1].id);
        assert_eq!(primary.len(), 1);
        assert_eq!(overlay.len(), 1);
    }

    #[test]
    fn single_display_gets_everything() {
        let device = DummyDevice::builder()
            .display()
            .display()
            .plane(PlaneType::Primary, 0b01)
            .plane(PlaneType::Primary, 0b10)
            .plane(PlaneType::Overlay, 0b11)
            .build();
        let mut platform = DefaultPlatform::new(&device).unwrap();
        platform.try_assign_planes(&device, &[DisplayId::new(1)]).unwrap();

        let crtcs = device.crtcs();
        let (primary, overlay) = platform.planes_for_crtc(&device, crtcs[1].id);
        assert_eq!((primary.len(), overlay.len()), (1, 1));
        let (primary, overlay) = platform.planes_for_crtc(&device, crtcs[0].id);
        assert!(primary.is_empty() && overlay.is_empty());
    }

    #[test]
    fn failed_assignment_keeps_partition() {
        let device = DummyDevice::builder()
            .display()
            .display()
            .plane(PlaneType::Primary, 0b01)
            .build();
        let mut platform = DefaultPlatform::new(&device).unwrap();
        platform.try_assign_planes(&device, &[DisplayId::new(0)]).unwrap();

        let crtcs = device.crtcs();
        let result = platform.try_assign_planes(&device, &[DisplayId::new(0), DisplayId::new(1)]);
        assert!(matches!(result, Err(Error::NoUsablePlanes(crtc)) if crtc == crtcs[1].id));
        assert_eq!(platform.planes_for_crtc(&device, crtcs[0].id).0.len(), 1);

        let result = platform.try_assign_planes(&device, &[DisplayId::new(7)]);
        assert!(matches!(result, Err(Error::NoCrtcForDisplay(d)) if d == DisplayId::new(7)));
    }

    #[test]
    fn split_bits_are_ignored() {
        let device = DummyDevice::builder().display().plane(PlaneType::Primary, 0b1).build();
        let mut platform = DefaultPlatform::new(&device).unwrap();
        platform
            .try_assign_planes(&device, &[DisplayId::new(0x1000)])
            .unwrap();
        assert_eq!(platform.planes_for_crtc(&device, device.crtcs()[0].id).0.len(), 1);
    }

    #[test]
    fn planeless_device_is_rejected() {
        let device = DummyDevice::builder().display().build();
        assert!(matches!(
            DefaultPlatform::new(&device),
            Err(Error::PlatformInit { .. })
        ));
    }
}
