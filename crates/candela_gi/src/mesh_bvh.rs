//! Per-mesh triangle hierarchies and their shared cache
//!
//! Rigid meshes get one [`MeshBvh`] shared by every instance through
//! [`MeshBvhCache`]; usage counts free an entry when the last instance
//! releases it. Skinned meshes keep a private [`DynamicMeshBvh`] whose
//! topology is built once from the rest pose and refitted as vertices move.

use std::collections::HashMap;
use std::sync::Arc;

use candela_math::{Vec3, AABB};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::bvh::Bvh;
use crate::error::{GiError, GiResult};
use crate::geometry::{MeshFace, MeshGeometry, OcclusionGeometry};

fn face_boxes(positions: &[Vec3], faces: &[MeshFace], out: &mut Vec<AABB>) {
    out.clear();
    out.reserve(faces.len());
    for face in faces {
        out.push(AABB::from_points(&[
            positions[face.vertices[0] as usize],
            positions[face.vertices[1] as usize],
            positions[face.vertices[2] as usize],
        ]));
    }
}

/// Triangle hierarchy over an immutable mesh
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MeshBvh {
    bvh: Bvh,
}

impl MeshBvh {
    pub fn from_mesh(mesh: &MeshGeometry, max_depth: u32) -> Self {
        let mut boxes = Vec::new();
        face_boxes(&mesh.positions, &mesh.faces, &mut boxes);
        let mut bvh = Bvh::new();
        bvh.build(&boxes, max_depth);
        Self { bvh }
    }

    pub fn from_occlusion(occlusion: &OcclusionGeometry, max_depth: u32) -> Self {
        let boxes: Vec<AABB> = (0..occlusion.face_count())
            .map(|face| occlusion.face_bounds(face))
            .collect();
        let mut bvh = Bvh::new();
        bvh.build(&boxes, max_depth);
        Self { bvh }
    }

    #[inline]
    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bvh.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshBvhCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry {
    mesh_bvh: Arc<MeshBvh>,
    usage: u32,
}

/// Usage-counted cache of mesh hierarchies keyed by geometry id
pub struct MeshBvhCache {
    max_depth: u32,
    entries: HashMap<u64, CacheEntry>,
    hits: u64,
    misses: u64,
}

impl MeshBvhCache {
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Fetch or build the hierarchy for a rigid mesh, bumping its usage count
    pub fn retain_mesh(&mut self, mesh: &MeshGeometry) -> Arc<MeshBvh> {
        if let Some(entry) = self.entries.get_mut(&mesh.id) {
            entry.usage += 1;
            self.hits += 1;
            return Arc::clone(&entry.mesh_bvh);
        }
        self.misses += 1;
        let mesh_bvh = Arc::new(MeshBvh::from_mesh(mesh, self.max_depth));
        self.entries.insert(mesh.id, CacheEntry {
            mesh_bvh: Arc::clone(&mesh_bvh),
            usage: 1,
        });
        mesh_bvh
    }

    /// Fetch or build the hierarchy for an occluder mesh
    pub fn retain_occlusion(&mut self, occlusion: &OcclusionGeometry) -> Arc<MeshBvh> {
        if let Some(entry) = self.entries.get_mut(&occlusion.id) {
            entry.usage += 1;
            self.hits += 1;
            return Arc::clone(&entry.mesh_bvh);
        }
        self.misses += 1;
        let mesh_bvh = Arc::new(MeshBvh::from_occlusion(occlusion, self.max_depth));
        self.entries.insert(occlusion.id, CacheEntry {
            mesh_bvh: Arc::clone(&mesh_bvh),
            usage: 1,
        });
        mesh_bvh
    }

    /// Drop one usage; the entry is evicted when the count reaches zero
    pub fn release(&mut self, id: u64) {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.usage > 1 => entry.usage -= 1,
            Some(_) => {
                self.entries.remove(&id);
            }
            None => warn!("mesh bvh cache: release of untracked geometry {}", id),
        }
    }

    pub fn usage(&self, id: u64) -> u32 {
        self.entries.get(&id).map(|entry| entry.usage).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> MeshBvhCacheStats {
        MeshBvhCacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

/// Refittable hierarchy for a skinned mesh instance.
///
/// Topology comes from the rest pose and never changes; vertex updates only
/// move node extents, which keeps per-frame cost linear in node count.
#[derive(Clone, Debug)]
pub struct DynamicMeshBvh {
    mesh: Arc<MeshGeometry>,
    positions: Vec<Vec3>,
    boxes: Vec<AABB>,
    bvh: Bvh,
}

impl DynamicMeshBvh {
    pub fn new(mesh: Arc<MeshGeometry>, max_depth: u32) -> Self {
        let positions = mesh.positions.clone();
        let mut boxes = Vec::new();
        face_boxes(&positions, &mesh.faces, &mut boxes);
        let mut bvh = Bvh::new();
        bvh.build(&boxes, max_depth);
        Self { mesh, positions, boxes, bvh }
    }

    /// Replace the vertex positions with the current skinned pose
    pub fn update_vertices(&mut self, positions: &[Vec3]) -> GiResult<()> {
        if positions.len() != self.positions.len() {
            return Err(GiError::InvalidArgument(format!(
                "skinned position count {} does not match mesh vertex count {}",
                positions.len(),
                self.positions.len()
            )));
        }
        self.positions.copy_from_slice(positions);
        Ok(())
    }

    /// Recompute face boxes from the current positions and refit the tree
    pub fn update_extents(&mut self) {
        face_boxes(&self.positions, &self.mesh.faces, &mut self.boxes);
        self.bvh.refit(&self.boxes);
    }

    #[inline]
    pub fn mesh(&self) -> &Arc<MeshGeometry> {
        &self.mesh
    }

    #[inline]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    #[inline]
    pub fn bvh(&self) -> &Bvh {
        &self.bvh
    }

    /// Mesh-local bounds of the current pose
    pub fn extents(&self) -> AABB {
        self.bvh
            .root()
            .map(|root| root.bounds())
            .unwrap_or(AABB::EMPTY)
    }
}
