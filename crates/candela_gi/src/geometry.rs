//! Geometry inputs to the GI core
//!
//! The renderer hands over immutable snapshots of mesh data ([`MeshGeometry`],
//! [`OcclusionGeometry`]) plus two traits it implements on its own scene
//! types: [`GiComponent`] for anything placed in the world and [`GiWorld`]
//! for the box query the content tracker runs.

use std::sync::Arc;

use candela_math::{AABB, DAABB, DMat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};

/// A single triangle of a mesh, indices into the owning geometry's vertex
/// and texcoord arrays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshFace {
    pub vertices: [u32; 3],
    /// Texture slot this face renders with; selects the instance material
    pub texture: u32,
}

/// Immutable triangle mesh snapshot shared between instances.
///
/// `weight_count` is the number of skinning weight sets; a rigid mesh has
/// zero and is the only kind eligible for the static scene structure.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MeshGeometry {
    /// Engine-wide unique identifier, keys the mesh structure cache
    pub id: u64,
    pub positions: Vec<Vec3>,
    pub faces: Vec<MeshFace>,
    pub texcoords: Vec<Vec2>,
    pub weight_count: usize,
}

impl MeshGeometry {
    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// Bounding box of one face in mesh-local space
    pub fn face_bounds(&self, face: usize) -> AABB {
        let f = &self.faces[face];
        AABB::from_points(&[
            self.positions[f.vertices[0] as usize],
            self.positions[f.vertices[1] as usize],
            self.positions[f.vertices[2] as usize],
        ])
    }
}

/// Simplified occluder mesh used for ray cache tracing.
///
/// `corners` holds triangle corner triples; the first
/// `single_sided_face_count` faces are single sided, the rest double sided.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OcclusionGeometry {
    pub id: u64,
    pub positions: Vec<Vec3>,
    pub corners: Vec<u16>,
    pub single_sided_face_count: usize,
}

impl OcclusionGeometry {
    pub fn face_count(&self) -> usize {
        self.corners.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.corners.is_empty()
    }

    pub fn is_double_sided(&self, face: usize) -> bool {
        face >= self.single_sided_face_count
    }

    /// Bounding box of one face in mesh-local space
    pub fn face_bounds(&self, face: usize) -> AABB {
        let first = face * 3;
        AABB::from_points(&[
            self.positions[self.corners[first] as usize],
            self.positions[self.corners[first + 1] as usize],
            self.positions[self.corners[first + 2] as usize],
        ])
    }
}

/// Per-texture-slot material values sampled by the probe trace shader
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstanceMaterial {
    pub tint: Vec3,
    pub gamma: f32,
    pub reflectivity: Vec3,
    pub roughness: f32,
    pub emissivity: Vec3,
    /// Rows of the 3x2 texture coordinate transform
    pub texcoord_matrix: [[f32; 4]; 2],
    /// Index into the renderer's material atlas, 14 bits
    pub material_index: u32,
    /// Skip material sampling entirely, treat as plain occluder
    pub ignore: bool,
    /// Clamp instead of wrap texture coordinates
    pub texcoord_clamp: bool,
}

impl Default for InstanceMaterial {
    fn default() -> Self {
        Self {
            tint: Vec3::ONE,
            gamma: 2.2,
            reflectivity: Vec3::ZERO,
            roughness: 1.0,
            emissivity: Vec3::ZERO,
            texcoord_matrix: [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]],
            material_index: 0,
            ignore: false,
            texcoord_clamp: false,
        }
    }
}

/// Scene element the GI core can track. Implemented by the renderer on its
/// component type; all methods are snapshots valid for the current frame.
pub trait GiComponent: Send + Sync {
    /// Engine-wide unique identifier, stable for the component's lifetime
    fn id(&self) -> u64;
    fn world_matrix(&self) -> DMat4;
    fn world_extents(&self) -> DAABB;
    fn layer_mask(&self) -> u64;
    fn importance(&self) -> f32;

    /// Render mode hint: true if the component renders as static geometry
    fn render_static(&self) -> bool;
    /// True if no texture on the component animates
    fn textures_static(&self) -> bool;
    /// Physics hint: true if the component never moves
    fn movement_stationary(&self) -> bool;

    fn mesh(&self) -> Option<Arc<MeshGeometry>>;
    fn occlusion_geometry(&self) -> Option<Arc<OcclusionGeometry>> {
        None
    }
    fn materials(&self) -> Vec<InstanceMaterial>;

    /// Write the current skinned vertex positions in component-local space.
    /// Returns false if the component has no skinned state, in which case
    /// the rest positions from the mesh apply.
    fn skinned_positions(&self, out: &mut Vec<Vec3>) -> bool {
        let _ = out;
        false
    }
}

/// Box query into the hosting world, used to find components touching the
/// detection area around the camera
pub trait GiWorld {
    fn components_in(&self, bounds: &DAABB, out: &mut Vec<Arc<dyn GiComponent>>);
}
