use std::os::unix::io::OwnedFd;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use indexmap::IndexMap;
use tracing::{debug, error, info, info_span, instrument, warn};

use super::{
    CompositionPlane, ConnectorInfo, CrtcId, DeviceBackend, DisplayCompositor, DisplayDevice, DisplayId,
    DisplayMode, DriverInfo, Error, Importer, Layer, PlaneInfo, PlatformPolicy, WritebackBuffer, WritebackState,
};
use crate::backend::allocator::{Allocator, Fourcc};
use crate::backend::blit::Blitter;
use crate::utils::config::{DevicePath, HwcConfig};

/// Result of [`ResourceManager::assign_plane_group`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneGroupStatus {
    /// No display is active, nothing was assigned
    Skipped,
    /// Planes were partitioned across the active displays
    Assigned,
}

/// Owner of all display resources
///
/// The device and importer lists are built by [`ResourceManager::init`] and never change
/// afterwards, so resolving displays takes no lock. Plane partitioning, the set of active
/// displays and the writeback session each sit behind their own lock.
pub struct ResourceManager<A: Allocator> {
    devices: Vec<Arc<dyn DisplayDevice>>,
    importers: Vec<Arc<dyn Importer>>,
    num_displays: u32,
    displays: Vec<DisplayId>,
    driver: DriverInfo,
    console: Option<OwnedFd>,
    compositors: IndexMap<CrtcId, Arc<DisplayCompositor>>,
    platform: Mutex<Box<dyn PlatformPolicy>>,
    active: RwLock<Vec<DisplayId>>,
    writeback: Mutex<WritebackState<A>>,
    span: tracing::Span,
}

impl<A: Allocator> std::fmt::Debug for ResourceManager<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("devices", &self.devices)
            .field("num_displays", &self.num_displays)
            .field("displays", &self.displays)
            .field("driver", &self.driver)
            .field("console", &self.console)
            .field("compositors", &self.compositors)
            .field("platform", &self.platform)
            .field("active", &self.active)
            .field("writeback", &self.writeback)
            .finish_non_exhaustive()
    }
}

struct Registry {
    devices: Vec<Arc<dyn DisplayDevice>>,
    importers: Vec<Arc<dyn Importer>>,
    num_displays: u32,
    driver: DriverInfo,
}

impl Registry {
    fn add_device<B: DeviceBackend>(&mut self, backend: &mut B, path: &Path) -> Result<u32, Error> {
        let device = backend.open(path, self.num_displays)?;
        let driver = device.driver().clone();
        let importer = backend.importer(&device)?;

        let added = device.displays().len() as u32;
        info!(
            device = ?path,
            platform = driver.platform_id(),
            version = %driver.version,
            displays = added,
            "Added device"
        );
        self.driver = driver;
        self.importers.push(importer);
        self.devices.push(device);
        self.num_displays += added;
        Ok(added)
    }
}

impl<A: Allocator + Clone> ResourceManager<A> {
    /// Open all configured devices and set up compositors and the platform policy
    ///
    /// Writeback and reset buffers are allocated from `allocator`.
    pub fn init<B: DeviceBackend>(config: &HwcConfig, backend: &mut B, allocator: A) -> Result<Self, Error> {
        let span = info_span!("drmhwc", module = "resource_manager");
        let _guard = span.enter();

        let mut registry = Registry {
            devices: Vec::new(),
            importers: Vec::new(),
            num_displays: 0,
            driver: DriverInfo::default(),
        };
        match &config.device {
            DevicePath::Fixed(path) => {
                registry.add_device(backend, path)?;
            }
            pattern @ DevicePath::Pattern(_) => {
                for idx in 0.. {
                    let Some(path) = pattern.nth(idx) else {
                        break;
                    };
                    if let Err(err) = registry.add_device(backend, &path) {
                        if registry.devices.is_empty() {
                            error!(device = ?path, "Failed to open first device: {}", err);
                            return Err(err);
                        }
                        debug!(device = ?path, "Stopping device enumeration: {}", err);
                        break;
                    }
                }
            }
        }

        if registry.num_displays == 0 {
            error!("Failed to initialize any displays");
            return Err(Error::NoDisplays);
        }

        let console = config.console.as_ref().and_then(|path| match backend.open_console(path) {
            Ok(fd) => Some(fd),
            Err(err) => {
                warn!(console = ?path, "Failed to open framebuffer console: {}", err);
                None
            }
        });

        let first = registry.devices[0].clone();
        let compositors = first
            .crtcs()
            .iter()
            .map(|crtc| {
                info!(crtc = %crtc.id, "Create display compositor");
                (crtc.id, Arc::new(DisplayCompositor::new(crtc.id)))
            })
            .collect::<IndexMap<_, _>>();

        let displays = first.displays().to_vec();
        if displays.is_empty() {
            error!(device = ?first.path(), "Failed to initialize any displays");
            return Err(Error::NoDisplays);
        }

        let platform = backend.platform(&first).map_err(|err| {
            error!(device = ?first.path(), "Failed to create platform policy: {}", err);
            match err {
                err @ Error::PlatformInit { .. } => err,
                err => Error::PlatformInit {
                    path: first.path().to_path_buf(),
                    source: Box::new(err),
                },
            }
        })?;

        drop(_guard);
        Ok(ResourceManager {
            devices: registry.devices,
            importers: registry.importers,
            num_displays: registry.num_displays,
            displays,
            driver: registry.driver,
            console,
            compositors,
            platform: Mutex::new(platform),
            active: RwLock::new(Vec::new()),
            writeback: Mutex::new(WritebackState::new(allocator)),
            span,
        })
    }

    /// All opened devices, in the order they were opened
    pub fn devices(&self) -> &[Arc<dyn DisplayDevice>] {
        &self.devices
    }

    /// Displays of the first device
    pub fn displays(&self) -> &[DisplayId] {
        &self.displays
    }

    /// Amount of displays across all devices
    pub fn num_displays(&self) -> u32 {
        self.num_displays
    }

    /// Driver of the last opened device
    pub fn driver_info(&self) -> &DriverInfo {
        &self.driver
    }

    /// Platform identifier of the last opened device
    pub fn platform_id(&self) -> &str {
        self.driver.platform_id()
    }

    /// Returns true if the framebuffer console could be opened
    pub fn has_console(&self) -> bool {
        self.console.is_some()
    }

    fn device_index(&self, display: DisplayId) -> Option<usize> {
        let display = display.base();
        self.devices.iter().position(|device| device.handles_display(display))
    }

    /// Device driving `display`
    ///
    /// Split-mode bits of `display` are ignored.
    pub fn get_device(&self, display: DisplayId) -> Option<&Arc<dyn DisplayDevice>> {
        self.device_index(display).map(|idx| &self.devices[idx])
    }

    /// Importer of the device driving `display`
    ///
    /// Split-mode bits of `display` are ignored.
    pub fn get_importer(&self, display: DisplayId) -> Option<Arc<dyn Importer>> {
        self.device_index(display).map(|idx| self.importers[idx].clone())
    }

    /// Compositor of `crtc`
    pub fn compositor_for_crtc(&self, crtc: CrtcId) -> Option<Arc<DisplayCompositor>> {
        if self.compositors.is_empty() {
            error!(parent: &self.span, %crtc, "No display compositors");
            return None;
        }
        self.compositors.get(&crtc).cloned()
    }

    /// All compositors, in crtc order
    pub fn compositors(&self) -> impl Iterator<Item = &Arc<DisplayCompositor>> {
        self.compositors.values()
    }

    /// Find a writeback connector for `display`
    ///
    /// The device driving the display is asked first, then all others.
    pub fn available_writeback_connector(&self, display: DisplayId) -> Option<ConnectorInfo> {
        let own = self.device_index(display);
        if let Some(connector) = own.and_then(|idx| self.devices[idx].available_writeback_connector(display)) {
            return Some(connector);
        }
        self.devices
            .iter()
            .enumerate()
            .filter(|(idx, _)| Some(*idx) != own)
            .find_map(|(_, device)| device.available_writeback_connector(display))
    }

    /// Mark `display` as active or inactive
    ///
    /// Returns true if the set of active displays changed. Planes need to be reassigned
    /// with [`ResourceManager::assign_plane_group`] afterwards.
    pub fn set_display_active(&self, display: DisplayId, active: bool) -> bool {
        let display = display.base();
        let mut displays = self.active.write().unwrap();
        let present = displays.contains(&display);
        match (active, present) {
            (true, false) => {
                displays.push(display);
                displays.sort();
                true
            }
            (false, true) => {
                displays.retain(|d| *d != display);
                true
            }
            _ => false,
        }
    }

    /// Currently active displays
    pub fn active_displays(&self) -> Vec<DisplayId> {
        self.active.read().unwrap().clone()
    }

    /// Partition the planes of the first device across the active displays
    #[instrument(level = "debug", parent = &self.span, skip(self))]
    pub fn assign_plane_group(&self) -> Result<PlaneGroupStatus, Error> {
        let active = self.active_displays();
        if active.is_empty() {
            info!("No active display, not assigning planes");
            return Ok(PlaneGroupStatus::Skipped);
        }

        let mut platform = self.platform.lock().unwrap();
        if let Err(err) = platform.try_assign_planes(self.devices[0].as_ref(), &active) {
            info!(?active, "Plane assignment failed: {}", err);
            return Err(err);
        }
        Ok(PlaneGroupStatus::Assigned)
    }

    /// Primary and overlay planes `crtc` may use
    pub fn planes_for_crtc(&self, crtc: CrtcId) -> (Vec<PlaneInfo>, Vec<PlaneInfo>) {
        self.platform
            .lock()
            .unwrap()
            .planes_for_crtc(self.devices[0].as_ref(), crtc)
    }

    /// Compose a frame of `display`, which must be driven by the first device
    ///
    /// Runs the planner over the planes currently assigned to the display's crtc and
    /// records the result on its compositor.
    pub fn compose(&self, display: DisplayId, layers: &[Layer]) -> Result<Vec<CompositionPlane>, Error> {
        let display = display.base();
        // compositors only exist for the crtcs of the first device
        let device = &self.devices[0];
        if !device.handles_display(display) {
            return Err(Error::UnknownDisplay(display));
        }
        let crtc = device
            .crtc_for_display(display)
            .ok_or(Error::NoCrtcForDisplay(display))?;
        let compositor = self
            .compositor_for_crtc(crtc.id)
            .ok_or(Error::UnknownDisplay(display))?;

        let (planner, (primary, overlay)) = {
            let platform = self.platform.lock().unwrap();
            (
                platform.planner().clone(),
                platform.planes_for_crtc(self.devices[0].as_ref(), crtc.id),
            )
        };
        compositor.compose(&planner, crtc, layers, &primary, &overlay)
    }

    fn writeback_device(&self, output: DisplayId, bound: bool) -> Result<&Arc<dyn DisplayDevice>, Error> {
        match self.get_device(output) {
            Some(device) => Ok(device),
            // an active session rejects foreign displays before touching the device
            None if bound => Ok(&self.devices[0]),
            None => {
                error!(parent: &self.span, display = %output, "No device handles writeback display");
                Err(Error::UnknownDisplay(output))
            }
        }
    }

    /// Enable writeback capture of `display`
    pub fn enable_writeback(&self, display: DisplayId) -> Result<(), Error> {
        let mut writeback = self.writeback.lock().unwrap();
        let device = self.writeback_device(display, writeback.is_enabled())?;
        writeback.enable(device.as_ref(), display)
    }

    /// Follow a mode change of the display captured by writeback
    pub fn update_writeback_resolution(&self, display: DisplayId) -> Result<(), Error> {
        let mut writeback = self.writeback.lock().unwrap();
        // unknown displays are never bound, the session reports the conflict
        let device = self.writeback_device(display, true)?;
        writeback.update_resolution(device.as_ref(), display)
    }

    /// Drop a writeback reference of `display`
    pub fn disable_writeback(&self, display: DisplayId) {
        self.writeback.lock().unwrap().disable(display)
    }

    /// Advance the writeback capture slots
    pub fn swap_writeback(&self) -> Result<(), Error> {
        self.writeback.lock().unwrap().swap()
    }

    /// Cleared buffer to attach while no capture is wanted
    pub fn reset_writeback_buffer(&self, blitter: &dyn Blitter) -> Result<WritebackBuffer<A::Buffer>, Error> {
        self.writeback.lock().unwrap().reset_buffer(blitter)
    }

    /// Writeback buffer attached to the upcoming commit
    pub fn writeback_next(&self) -> Option<WritebackBuffer<A::Buffer>> {
        self.writeback.lock().unwrap().next()
    }

    /// Writeback buffer of the commit in flight
    pub fn writeback_drawing(&self) -> Option<WritebackBuffer<A::Buffer>> {
        self.writeback.lock().unwrap().drawing()
    }

    /// Writeback buffer of the last completed commit
    pub fn writeback_finish(&self) -> Option<WritebackBuffer<A::Buffer>> {
        self.writeback.lock().unwrap().finish()
    }

    /// Mode of the display captured by writeback
    pub fn writeback_mode(&self) -> Option<DisplayMode> {
        self.writeback.lock().unwrap().mode()
    }

    /// Capture resolution and format
    pub fn writeback_format(&self) -> (u32, u32, Fourcc) {
        let writeback = self.writeback.lock().unwrap();
        let (width, height) = writeback.resolution();
        (width, height, writeback.format())
    }

    /// Returns true while a writeback session is active
    pub fn is_writeback_enabled(&self) -> bool {
        self.writeback.lock().unwrap().is_enabled()
    }

    /// Display captured by writeback
    pub fn writeback_display(&self) -> Option<DisplayId> {
        self.writeback.lock().unwrap().bound_display()
    }
}
