//! Per-frame plane assignment
//!
//! The [`Planner`] runs a fixed pipeline of [`ProvisionStage`]s over the planes usable by a
//! crtc. Every stage takes planes out of a shared pool and records what it assigned, later
//! stages only see the planes earlier stages declined.

use tracing::{debug, error, trace};

use super::{CrtcInfo, Error, PlaneId, PlaneInfo, ProvisionError};
use crate::backend::allocator::Fourcc;

/// A layer to be shown on a crtc
///
/// Layers are passed bottom to top, a layer is referenced by its index in that list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    /// Format of the layer's buffer
    pub format: Fourcc,
    /// Whether the buffer content is protected and must be scanned out directly
    pub protected: bool,
}

impl Layer {
    /// Create an unprotected layer
    pub fn new(format: Fourcc) -> Layer {
        Layer {
            format,
            protected: false,
        }
    }

    /// Create a protected layer
    pub fn protected(format: Fourcc) -> Layer {
        Layer {
            format,
            protected: true,
        }
    }
}

/// What a plane shows
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompositionKind {
    /// The layer with this index, scanned out directly
    Layer(usize),
    /// The result of composing these layers on the GPU
    Precomposition(Vec<usize>),
}

/// A plane and what is assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositionPlane {
    /// The assigned plane
    pub plane: PlaneId,
    /// What the plane shows
    pub kind: CompositionKind,
}

/// One step of the provisioning pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStage {
    /// Gives every protected layer its own plane
    Protected,
    /// Assigns remaining layers to the first free plane able to show them
    Greedy,
    /// Packs all unassigned layers into one precomposed plane
    Precomposition,
}

struct Provisioning<'a> {
    layers: &'a [Layer],
    planes: Vec<&'a PlaneInfo>,
    assigned: Vec<bool>,
    composition: Vec<CompositionPlane>,
}

impl<'a> Provisioning<'a> {
    fn take_plane(&mut self, format: Fourcc) -> Option<PlaneId> {
        let idx = self.planes.iter().position(|plane| plane.supports_format(format))?;
        Some(self.planes.remove(idx).id)
    }

    fn assign(&mut self, layer: usize, plane: PlaneId) {
        self.assigned[layer] = true;
        self.composition.push(CompositionPlane {
            plane,
            kind: CompositionKind::Layer(layer),
        });
    }
}

impl ProvisionStage {
    fn provision(&self, state: &mut Provisioning<'_>) -> Result<(), ProvisionError> {
        match self {
            ProvisionStage::Protected => {
                let layers = state.layers;
                for (idx, layer) in layers.iter().enumerate() {
                    if !layer.protected || state.assigned[idx] {
                        continue;
                    }
                    let plane = state
                        .take_plane(layer.format)
                        .ok_or(ProvisionError::ProtectedLayer { layer: idx })?;
                    state.assign(idx, plane);
                }
                Ok(())
            }
            ProvisionStage::Greedy => {
                let layers = state.layers;
                for (idx, layer) in layers.iter().enumerate() {
                    if state.assigned[idx] {
                        continue;
                    }
                    if let Some(plane) = state.take_plane(layer.format) {
                        state.assign(idx, plane);
                    }
                }
                Ok(())
            }
            ProvisionStage::Precomposition => {
                let remaining = (0..state.layers.len())
                    .filter(|idx| !state.assigned[*idx])
                    .collect::<Vec<_>>();
                if remaining.is_empty() {
                    return Ok(());
                }
                if state.planes.is_empty() {
                    return Err(ProvisionError::NoPlaneForPrecomposition {
                        layers: remaining.len(),
                    });
                }

                let plane = state.planes.remove(0).id;
                for idx in &remaining {
                    state.assigned[*idx] = true;
                }
                state.composition.push(CompositionPlane {
                    plane,
                    kind: CompositionKind::Precomposition(remaining),
                });
                Ok(())
            }
        }
    }
}

/// Decides which planes show which layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Planner {
    stages: Vec<ProvisionStage>,
}

impl Default for Planner {
    fn default() -> Self {
        Planner::new(vec![
            ProvisionStage::Protected,
            ProvisionStage::Greedy,
            ProvisionStage::Precomposition,
        ])
    }
}

impl Planner {
    /// Create a planner running the given stages in order
    pub fn new(stages: Vec<ProvisionStage>) -> Planner {
        Planner { stages }
    }

    /// Planes out of both pools usable with `crtc`, primary planes first
    pub fn usable_planes<'a>(
        crtc: &CrtcInfo,
        primary_planes: &'a [PlaneInfo],
        overlay_planes: &'a [PlaneInfo],
    ) -> Vec<&'a PlaneInfo> {
        primary_planes
            .iter()
            .chain(overlay_planes.iter())
            .filter(|plane| plane.supports_crtc(crtc))
            .collect()
    }

    /// Assign `layers` to the planes usable by `crtc`
    ///
    /// Either every layer ends up on a plane, directly or as part of a precomposition,
    /// or an error is returned and nothing is assigned.
    #[profiling::function]
    pub fn assign_planes(
        &self,
        layers: &[Layer],
        crtc: &CrtcInfo,
        primary_planes: &[PlaneInfo],
        overlay_planes: &[PlaneInfo],
    ) -> Result<Vec<CompositionPlane>, Error> {
        let planes = Self::usable_planes(crtc, primary_planes, overlay_planes);
        if planes.is_empty() {
            error!(crtc = %crtc.id, display = ?crtc.display, "Crtc has no usable planes");
            return Err(Error::NoUsablePlanes(crtc.id));
        }
        trace!(crtc = %crtc.id, planes = planes.len(), layers = layers.len(), "Assigning planes");

        let mut state = Provisioning {
            layers,
            planes,
            assigned: vec![false; layers.len()],
            composition: Vec::with_capacity(layers.len()),
        };
        for stage in &self.stages {
            if let Err(err) = stage.provision(&mut state) {
                debug!(crtc = %crtc.id, ?stage, "Failed provision stage: {}", err);
                return Err(err.into());
            }
        }

        Ok(state.composition)
    }
}
