#![allow(missing_docs)]
//! In-memory implementations of the hardware seams, for tests

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rustix::fs::{Mode, OFlags};
use smallvec::{smallvec, SmallVec};

use crate::backend::allocator::dmabuf::{Dmabuf, DmabufFlags};
use crate::backend::allocator::{Allocator, Buffer, Format, Fourcc, Modifier};
use crate::backend::blit::{check_fill, BlitError, Blitter};
use crate::backend::drm::importer::check_buffer;
use crate::backend::drm::{
    ConnectorId, ConnectorInfo, ConnectorState, CrtcId, CrtcInfo, DefaultPlatform, DeviceBackend,
    DisplayDevice, DisplayId, DisplayMode, DriverInfo, Error, ImportError, ImportedBuffer, Importer, PlaneId,
    PlaneInfo, PlaneType, PlatformPolicy,
};
use crate::utils::{Buffer as BufferCoords, Rectangle, Size};

const DEFAULT_MODE: DisplayMode = DisplayMode {
    width: 1920,
    height: 1080,
    refresh: 60,
};

/// Single-plane dmabuf backed by `/dev/null`
pub fn dmabuf(size: impl Into<Size<i32, BufferCoords>>, fourcc: Fourcc, flags: DmabufFlags) -> Dmabuf {
    let size = size.into();
    let fd = rustix::fs::open("/dev/null", OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
        .expect("failed to open /dev/null");
    let mut builder = Dmabuf::builder(size, fourcc, flags);
    builder.add_plane(fd, 0, 0, size.w.max(0) as u32, Modifier::Linear);
    builder.build().expect("dmabuf without planes")
}

#[derive(Debug)]
pub struct DummyDevice {
    path: PathBuf,
    driver: DriverInfo,
    displays: Vec<DisplayId>,
    crtcs: Vec<CrtcInfo>,
    planes: Vec<PlaneInfo>,
    connectors: Mutex<Vec<ConnectorInfo>>,
    writeback: Vec<ConnectorId>,
}

#[derive(Debug, Default)]
pub struct DummyDeviceBuilder {
    driver: Option<String>,
    modes: Vec<DisplayMode>,
    planes: Vec<(PlaneType, u32)>,
    writeback: usize,
}

impl DummyDeviceBuilder {
    pub fn display(self) -> Self {
        self.display_with_mode(DEFAULT_MODE)
    }

    pub fn display_with_mode(mut self, mode: DisplayMode) -> Self {
        self.modes.push(mode);
        self
    }

    pub fn plane(mut self, kind: PlaneType, possible_crtcs: u32) -> Self {
        self.planes.push((kind, possible_crtcs));
        self
    }

    pub fn writeback(mut self) -> Self {
        self.writeback += 1;
        self
    }

    pub fn driver(mut self, name: &str) -> Self {
        self.driver = Some(name.to_owned());
        self
    }

    pub fn build(self) -> DummyDevice {
        let displays = (0..self.modes.len() as u32).map(DisplayId::new).collect::<Vec<_>>();
        let crtcs = displays
            .iter()
            .enumerate()
            .map(|(index, display)| CrtcInfo {
                id: CrtcId(100 + index as u32),
                index: index as u32,
                display: Some(*display),
            })
            .collect();
        let planes = self
            .planes
            .iter()
            .enumerate()
            .map(|(idx, (kind, possible_crtcs))| PlaneInfo {
                id: PlaneId(200 + idx as u32),
                kind: *kind,
                possible_crtcs: *possible_crtcs,
                formats: SmallVec::from_slice(&[Fourcc::Argb8888, Fourcc::Xrgb8888, Fourcc::Nv12]),
            })
            .collect();
        let connectors = displays
            .iter()
            .zip(&self.modes)
            .enumerate()
            .map(|(idx, (display, mode))| ConnectorInfo {
                id: ConnectorId(300 + idx as u32),
                display: *display,
                state: ConnectorState::Connected,
                current_mode: Some(*mode),
                writeback: false,
            })
            .collect();

        DummyDevice {
            path: PathBuf::from("/dev/dri/card0"),
            driver: DriverInfo {
                name: self.driver.unwrap_or_else(|| String::from("dummy")),
                description: String::from("dummy display device"),
                version: String::from("20240101"),
            },
            displays,
            crtcs,
            planes,
            connectors: Mutex::new(connectors),
            writeback: (0..self.writeback as u32).map(|idx| ConnectorId(400 + idx)).collect(),
        }
    }
}

impl DummyDevice {
    pub fn builder() -> DummyDeviceBuilder {
        DummyDeviceBuilder::default()
    }

    pub fn set_connector_state(&self, display: DisplayId, state: ConnectorState) {
        let mut connectors = self.connectors.lock().unwrap();
        if let Some(connector) = connectors.iter_mut().find(|c| c.display == display) {
            connector.state = state;
        }
    }

    pub fn set_mode(&self, display: DisplayId, mode: DisplayMode) {
        let mut connectors = self.connectors.lock().unwrap();
        if let Some(connector) = connectors.iter_mut().find(|c| c.display == display) {
            connector.current_mode = Some(mode);
        }
    }

    // moves the device to `path` and renumbers its displays from `first_display`
    fn rebase(mut self, path: &Path, first_display: u32) -> DummyDevice {
        let shift = |display: DisplayId| DisplayId::new(display.raw() + first_display);
        self.path = path.to_path_buf();
        for display in &mut self.displays {
            *display = shift(*display);
        }
        for crtc in &mut self.crtcs {
            crtc.display = crtc.display.map(shift);
        }
        for connector in self.connectors.get_mut().unwrap().iter_mut() {
            connector.display = shift(connector.display);
        }
        self
    }
}

impl DisplayDevice for DummyDevice {
    fn path(&self) -> &Path {
        &self.path
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
        self.connectors
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.display == display)
            .cloned()
    }

    fn available_writeback_connector(&self, display: DisplayId) -> Option<ConnectorInfo> {
        self.writeback.first().map(|id| ConnectorInfo {
            id: *id,
            display,
            state: ConnectorState::Connected,
            current_mode: None,
            writeback: true,
        })
    }
}

#[derive(Debug, Default)]
pub struct DummyBackend {
    devices: Vec<(PathBuf, DummyDevice)>,
}

impl DummyBackend {
    pub fn new() -> DummyBackend {
        DummyBackend::default()
    }

    pub fn with_device(mut self, path: impl AsRef<Path>, device: DummyDevice) -> Self {
        self.devices.push((path.as_ref().to_path_buf(), device));
        self
    }
}

impl DeviceBackend for DummyBackend {
    fn open(&mut self, path: &Path, first_display: u32) -> Result<Arc<dyn DisplayDevice>, Error> {
        let Some(idx) = self.devices.iter().position(|(p, _)| p == path) else {
            return Err(Error::DeviceInit {
                path: path.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        };
        let (_, device) = self.devices.remove(idx);
        Ok(Arc::new(device.rebase(path, first_display)))
    }

    fn importer(&mut self, _device: &Arc<dyn DisplayDevice>) -> Result<Arc<dyn Importer>, Error> {
        Ok(Arc::new(DummyImporter::default()))
    }

    fn platform(&mut self, device: &Arc<dyn DisplayDevice>) -> Result<Box<dyn PlatformPolicy>, Error> {
        Ok(Box::new(DefaultPlatform::new(device.as_ref())?))
    }

    fn open_console(&mut self, _path: &Path) -> io::Result<std::os::unix::io::OwnedFd> {
        Err(io::Error::from(io::ErrorKind::NotFound))
    }
}

#[derive(Debug)]
pub struct DummyBuffer {
    size: Size<i32, BufferCoords>,
    format: Format,
}

impl Buffer for DummyBuffer {
    fn size(&self) -> Size<i32, BufferCoords> {
        self.size
    }

    fn format(&self) -> Format {
        self.format
    }
}

/// Allocator handing out memory-less buffers
///
/// Clones share the failure switch.
#[derive(Debug, Clone, Default)]
pub struct DummyAllocator {
    failing: Arc<AtomicBool>,
}

impl DummyAllocator {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl Allocator for DummyAllocator {
    type Buffer = DummyBuffer;
    type Error = io::Error;

    fn create_buffer(
        &mut self,
        width: u32,
        height: u32,
        fourcc: Fourcc,
        modifiers: &[Modifier],
    ) -> Result<DummyBuffer, io::Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }
        Ok(DummyBuffer {
            size: (width as i32, height as i32).into(),
            format: Format {
                code: fourcc,
                modifier: modifiers.first().copied().unwrap_or(Modifier::Linear),
            },
        })
    }
}

#[derive(Debug, Default)]
pub struct DummyImporter {
    imports: AtomicUsize,
    releases: AtomicUsize,
}

impl DummyImporter {
    pub fn imports(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl Importer for DummyImporter {
    fn import(&self, buffer: &Dmabuf) -> Result<ImportedBuffer, ImportError> {
        check_buffer(buffer)?;
        let handle = self.imports.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        Ok(ImportedBuffer {
            handles: smallvec![handle],
            size: buffer.size(),
            format: buffer.format().code,
        })
    }

    fn release(&self, _buffer: &ImportedBuffer) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct DummyBlitter {
    fills: AtomicUsize,
    failing: bool,
}

impl DummyBlitter {
    pub fn failing() -> DummyBlitter {
        DummyBlitter {
            fills: AtomicUsize::new(0),
            failing: true,
        }
    }

    pub fn fills(&self) -> usize {
        self.fills.load(Ordering::SeqCst)
    }
}

impl Blitter for DummyBlitter {
    fn fill(&self, buffer: &dyn Buffer, rect: Rectangle<i32, BufferCoords>, _value: u32) -> Result<(), BlitError> {
        check_fill(buffer, rect)?;
        if self.failing {
            return Err(BlitError::Failed("dummy blitter failure".into()));
        }
        self.fills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
