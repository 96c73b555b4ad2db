use std::collections::HashMap;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drm::control::{connector, crtc, plane, Device as ControlDevice, ResourceHandles};
use drm::{ClientCapability, Device as BasicDevice};
use smallvec::SmallVec;
use tracing::{debug, info, info_span, trace, warn};

use super::fd::DrmDeviceFd;
use super::{DeviceBackend, DisplayDevice, DriverInfo};
use crate::backend::allocator::{dumb::DumbAllocator, Fourcc};
use crate::backend::drm::{
    importer::DrmImporter, ConnectorInfo, CrtcInfo, DefaultPlatform, DisplayId, Error, Importer, PlaneInfo,
    PlaneType, PlatformPolicy,
};

/// An open drm device
#[derive(Debug)]
pub struct DrmDevice {
    fd: DrmDeviceFd,
    driver: DriverInfo,
    resources: ResourceHandles,
    displays: Vec<DisplayId>,
    connectors: Vec<connector::Handle>,
    writeback: Vec<connector::Handle>,
    crtcs: Vec<CrtcInfo>,
    planes: Vec<PlaneInfo>,
    span: tracing::Span,
}

impl DrmDevice {
    /// Open the device node at `path` and enumerate its resources
    ///
    /// Displays are numbered from `first_display` in connector order.
    pub fn open(path: &Path, first_display: u32) -> Result<DrmDevice, Error> {
        let span = info_span!("drmhwc", module = "backend_drm", device = ?path);
        let _guard = span.enter();

        let fd = DrmDeviceFd::open(path).map_err(|source| Error::DeviceInit {
            path: path.to_path_buf(),
            source,
        })?;
        let access = |errmsg: &'static str| {
            let dev = Some(path.to_path_buf());
            move |source| Error::Access { errmsg, dev, source }
        };

        // enable the features we need, writeback connectors are only exposed to atomic clients
        if fd.set_client_capability(ClientCapability::UniversalPlanes, true).is_err() {
            warn!("Failed to enable universal planes, only primary planes are usable");
        }
        // drm has no variant for the writeback capability
        if fd.set_client_capability(ClientCapability::Atomic, true).is_ok()
            && drm_ffi::set_capability(
                fd.as_fd(),
                drm_ffi::DRM_CLIENT_CAP_WRITEBACK_CONNECTORS as u64,
                true,
            )
            .is_err()
        {
            debug!("Device does not support writeback connectors");
        }

        let driver = fd.get_driver().map_err(access("Error loading driver info"))?;
        let driver = DriverInfo {
            name: driver.name().to_string_lossy().into_owned(),
            description: driver.description().to_string_lossy().into_owned(),
            version: driver.date().to_string_lossy().into_owned(),
        };
        info!(driver = %driver.name, version = %driver.version, "Opened device");

        let resources = fd
            .resource_handles()
            .map_err(access("Error loading drm resources"))?;

        let mut connectors = Vec::new();
        let mut writeback = Vec::new();
        for &handle in resources.connectors() {
            let info = fd
                .get_connector(handle, false)
                .map_err(access("Error loading connector info"))?;
            if info.interface() == connector::Interface::Writeback {
                writeback.push(handle);
            } else {
                connectors.push(handle);
            }
        }
        let displays = (0..connectors.len() as u32)
            .map(|idx| DisplayId::new(first_display + idx))
            .collect::<Vec<_>>();

        let crtcs = Self::map_crtcs(&fd, &resources, &connectors, &displays);
        let planes = Self::load_planes(&fd, &resources).map_err(access("Error loading plane info"))?;
        debug!(
            displays = displays.len(),
            crtcs = crtcs.len(),
            planes = planes.len(),
            writeback = writeback.len(),
            "Enumerated resources"
        );

        drop(_guard);
        Ok(DrmDevice {
            fd,
            driver,
            resources,
            displays,
            connectors,
            writeback,
            crtcs,
            planes,
            span,
        })
    }

    /// Returns the underlying file descriptor
    pub fn device_fd(&self) -> &DrmDeviceFd {
        &self.fd
    }

    fn map_crtcs(
        fd: &DrmDeviceFd,
        resources: &ResourceHandles,
        connectors: &[connector::Handle],
        displays: &[DisplayId],
    ) -> Vec<CrtcInfo> {
        let mut bound: HashMap<crtc::Handle, DisplayId> = HashMap::new();

        // keep what the kernel currently drives first
        for (conn, display) in connectors.iter().zip(displays) {
            let current = fd
                .get_connector(*conn, false)
                .ok()
                .and_then(|info| info.current_encoder())
                .and_then(|encoder| fd.get_encoder(encoder).ok())
                .and_then(|encoder| encoder.crtc());
            if let Some(crtc) = current {
                bound.entry(crtc).or_insert(*display);
            }
        }

        // then hand out free crtcs to the remaining displays
        for (conn, display) in connectors.iter().zip(displays) {
            if bound.values().any(|d| d == display) {
                continue;
            }
            let Ok(info) = fd.get_connector(*conn, false) else {
                continue;
            };
            let free = info
                .encoders()
                .iter()
                .filter_map(|encoder| fd.get_encoder(*encoder).ok())
                .flat_map(|encoder| resources.filter_crtcs(encoder.possible_crtcs()))
                .find(|crtc| !bound.contains_key(crtc));
            if let Some(crtc) = free {
                bound.insert(crtc, *display);
            }
        }

        resources
            .crtcs()
            .iter()
            .enumerate()
            .map(|(index, crtc)| CrtcInfo {
                id: (*crtc).into(),
                index: index as u32,
                display: bound.get(crtc).copied(),
            })
            .collect()
    }

    fn load_planes(fd: &DrmDeviceFd, resources: &ResourceHandles) -> std::io::Result<Vec<PlaneInfo>> {
        let mut planes = Vec::new();
        for handle in fd.plane_handles()? {
            let info = fd.get_plane(handle)?;
            let possible_crtcs = resources
                .filter_crtcs(info.possible_crtcs())
                .iter()
                .filter_map(|crtc| resources.crtcs().iter().position(|c| c == crtc))
                .fold(0u32, |mask, index| mask | (1 << index));
            let formats = info
                .formats()
                .iter()
                .filter_map(|code| Fourcc::try_from(*code).ok())
                .collect::<SmallVec<_>>();
            let kind = Self::plane_type(fd, handle).unwrap_or(PlaneType::Overlay);

            trace!(plane = ?handle, ?kind, possible_crtcs, "Found plane");
            planes.push(PlaneInfo {
                id: handle.into(),
                kind,
                possible_crtcs,
                formats,
            });
        }
        Ok(planes)
    }

    fn plane_type(fd: &DrmDeviceFd, plane: plane::Handle) -> Option<PlaneType> {
        let props = fd.get_properties(plane).ok()?;
        let (ids, vals) = props.as_props_and_values();
        for (&id, &val) in ids.iter().zip(vals.iter()) {
            if let Ok(info) = fd.get_property(id) {
                if info.name().to_str().map(|x| x == "type").unwrap_or(false) {
                    return PlaneType::from_property(val);
                }
            }
        }
        None
    }

    fn connector_handle(&self, display: DisplayId) -> Option<connector::Handle> {
        let idx = self.displays.iter().position(|d| *d == display)?;
        self.connectors.get(idx).copied()
    }

    fn connector_info(&self, handle: connector::Handle, display: DisplayId, writeback: bool) -> Option<ConnectorInfo> {
        let info = match self.fd.get_connector(handle, false) {
            Ok(info) => info,
            Err(err) => {
                warn!(parent: &self.span, connector = ?handle, "Failed to query connector: {}", err);
                return None;
            }
        };
        let current_mode = info
            .current_encoder()
            .and_then(|encoder| self.fd.get_encoder(encoder).ok())
            .and_then(|encoder| encoder.crtc())
            .and_then(|crtc| self.fd.get_crtc(crtc).ok())
            .and_then(|crtc| crtc.mode())
            .map(Into::into);

        Some(ConnectorInfo {
            id: handle.into(),
            display,
            state: info.state().into(),
            current_mode,
            writeback,
        })
    }
}

impl DisplayDevice for DrmDevice {
    fn path(&self) -> &Path {
        self.fd.path()
    }

    fn driver(&self) -> &DriverInfo {
        &self.driver
    }

    fn displays(&self) -> &[DisplayId] {
        &self.displays
    }

    fn crtcs(&self) -> &[CrtcInfo] {
        &self.crtcs
    }

    fn planes(&self) -> &[PlaneInfo] {
        &self.planes
    }

    fn connector_for_display(&self, display: DisplayId) -> Option<ConnectorInfo> {
        let handle = self.connector_handle(display)?;
        self.connector_info(handle, display, false)
    }

    fn available_writeback_connector(&self, display: DisplayId) -> Option<ConnectorInfo> {
        let crtc = self
            .crtc_for_display(display)
            .and_then(|crtc| self.resources.crtcs().get(crtc.index as usize).copied());

        self.writeback.iter().find_map(|handle| {
            let info = self.fd.get_connector(*handle, false).ok()?;
            if let Some(crtc) = crtc {
                let compatible = info
                    .encoders()
                    .iter()
                    .filter_map(|encoder| self.fd.get_encoder(*encoder).ok())
                    .any(|encoder| self.resources.filter_crtcs(encoder.possible_crtcs()).contains(&crtc));
                if !compatible {
                    return None;
                }
            }
            self.connector_info(*handle, display, true)
        })
    }
}

/// [`DeviceBackend`] opening kernel mode setting devices
#[derive(Debug, Default)]
pub struct DrmBackend {
    opened: Vec<(PathBuf, DrmDeviceFd)>,
}

impl DrmBackend {
    /// Create a new backend
    pub fn new() -> DrmBackend {
        DrmBackend::default()
    }

    /// Dumb buffer allocator on the device opened from `path`
    ///
    /// Suitable for the writeback buffers of a [`ResourceManager`](crate::backend::drm::ResourceManager).
    pub fn allocator(&self, path: &Path) -> Option<DumbAllocator> {
        self.opened
            .iter()
            .find(|(opened, _)| opened == path)
            .map(|(_, fd)| DumbAllocator::new(fd.clone()))
    }

    fn fd_for(&self, device: &Arc<dyn DisplayDevice>) -> Option<&DrmDeviceFd> {
        self.opened
            .iter()
            .find(|(path, _)| path == device.path())
            .map(|(_, fd)| fd)
    }
}

impl DeviceBackend for DrmBackend {
    fn open(&mut self, path: &Path, first_display: u32) -> Result<Arc<dyn DisplayDevice>, Error> {
        let device = DrmDevice::open(path, first_display)?;
        self.opened.push((path.to_path_buf(), device.device_fd().clone()));
        Ok(Arc::new(device))
    }

    fn importer(&mut self, device: &Arc<dyn DisplayDevice>) -> Result<Arc<dyn Importer>, Error> {
        let fd = self.fd_for(device).ok_or_else(|| Error::DeviceInit {
            path: device.path().to_path_buf(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })?;
        Ok(Arc::new(DrmImporter::new(fd.clone())))
    }

    fn platform(&mut self, device: &Arc<dyn DisplayDevice>) -> Result<Box<dyn PlatformPolicy>, Error> {
        Ok(Box::new(DefaultPlatform::new(device.as_ref())?))
    }
}
