use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{trace, warn};

use super::{CompositionPlane, CrtcId, CrtcInfo, Error, Layer, PlaneInfo, Planner};

/// Compositor of a single crtc
///
/// Keeps the plane assignment of the last composed frame. Compositors are shared between
/// the threads touching a crtc, all state is behind interior locks.
#[derive(Debug)]
pub struct DisplayCompositor {
    crtc: CrtcId,
    frames: AtomicU64,
    current: Mutex<Vec<CompositionPlane>>,
    span: tracing::Span,
}

impl DisplayCompositor {
    /// Create a compositor for the given crtc
    pub fn new(crtc: CrtcId) -> DisplayCompositor {
        DisplayCompositor {
            crtc,
            frames: AtomicU64::new(0),
            current: Mutex::new(Vec::new()),
            span: tracing::info_span!("drmhwc_compositor", crtc = %crtc),
        }
    }

    /// Crtc this compositor is bound to
    pub fn crtc(&self) -> CrtcId {
        self.crtc
    }

    /// Amount of frames successfully composed
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Plane assignment of the last composed frame
    ///
    /// Empty if the last frame failed to compose, in which case everything is left to the GPU.
    pub fn current(&self) -> Vec<CompositionPlane> {
        self.current.lock().unwrap().clone()
    }

    /// Compose a frame
    pub fn compose(
        &self,
        planner: &Planner,
        crtc: &CrtcInfo,
        layers: &[Layer],
        primary_planes: &[PlaneInfo],
        overlay_planes: &[PlaneInfo],
    ) -> Result<Vec<CompositionPlane>, Error> {
        let _guard = self.span.enter();
        debug_assert_eq!(crtc.id, self.crtc);

        let mut current = self.current.lock().unwrap();
        match planner.assign_planes(layers, crtc, primary_planes, overlay_planes) {
            Ok(composition) => {
                let frame = self.frames.fetch_add(1, Ordering::AcqRel) + 1;
                trace!(frame, planes = composition.len(), "Composed frame");
                *current = composition.clone();
                Ok(composition)
            }
            Err(err) => {
                warn!("Falling back to GPU composition: {}", err);
                current.clear();
                Err(err)
            }
        }
    }
}
