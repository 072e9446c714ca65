//! Scene-level BVH assembly into GPU-facing buffers
//!
//! [`SceneBvh`] collects mesh and occluder instances each frame and flattens
//! them into the linear buffers the probe trace shaders walk: a shared node
//! array holding mesh-level trees plus one top-level tree over instances,
//! deduplicated per-mesh geometry, inverse instance transforms and packed
//! materials.
//!
//! Buffer layout invariants the shaders rely on:
//! - faces of a mesh are stored in its BVH primitive order, so leaf runs are
//!   contiguous face ranges
//! - texcoords hold three entries per stored face
//! - instance entries and matrices are stored in top-level BVH primitive
//!   order, so top-level leaf runs index them directly
//! - internal node children are adjacent, rebased by the owning tree's first
//!   node index

use bytemuck::{Pod, Zeroable};
use candela_math::{Vec3d, AABB, DMat4, Mat4};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::bvh::Bvh;
use crate::geometry::{InstanceMaterial, MeshGeometry, OcclusionGeometry};

/// Marks a face as double sided in the face record's last component
pub const FACE_FLAG_DOUBLE_SIDED: u32 = 0x8000_0000;
/// Instance material base for occluders, which sample no material
pub const MATERIAL_NONE: u32 = u32::MAX;

/// Material index payload width; bits above carry flags
pub const MATERIAL_INDEX_BITS: u32 = 14;
pub const MATERIAL_FLAG_TEXCOORD_CLAMP: u32 = 1 << 14;
pub const MATERIAL_FLAG_IGNORE: u32 = 1 << 15;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuNodeBox {
    pub min_extend: [f32; 4],
    pub max_extend: [f32; 4],
}

impl GpuNodeBox {
    pub const SIZE: usize = 32;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuNodeIndex {
    /// Child node index (internal) or first primitive (leaf)
    pub first_index: u32,
    /// Zero for internal nodes
    pub primitive_count: u32,
}

impl GpuNodeIndex {
    pub const SIZE: usize = 8;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuInstance {
    /// Root node of the instance's mesh tree
    pub first_node: u32,
    /// Base index into the material buffers, [`MATERIAL_NONE`] for occluders
    pub first_material: u32,
}

impl GpuInstance {
    pub const SIZE: usize = 8;
}

/// Inverse instance transform as a row-major 3x4 block; rays transform from
/// the field-local frame into mesh space with it
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuInstanceMatrix {
    pub rows: [[f32; 4]; 3],
}

impl GpuInstanceMatrix {
    pub const SIZE: usize = 48;
}

/// Face record: three rebased vertex indices plus the texture slot with
/// [`FACE_FLAG_DOUBLE_SIDED`] in the last component
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuFace {
    pub indices: [u32; 4],
}

impl GpuFace {
    pub const SIZE: usize = 16;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuVertex {
    pub position: [f32; 4],
}

impl GpuVertex {
    pub const SIZE: usize = 16;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuTexCoord {
    pub uv: [f32; 2],
}

impl GpuTexCoord {
    pub const SIZE: usize = 8;
}

/// Packed material words, see [`pack_material`]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuMaterial {
    pub params: [u32; 4],
}

impl GpuMaterial {
    pub const SIZE: usize = 16;
}

/// Texture coordinate transform rows plus emissivity
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuMaterialExtra {
    pub rows: [[f32; 4]; 3],
}

impl GpuMaterialExtra {
    pub const SIZE: usize = 48;
}

#[inline]
fn pack_unit8(value: f32) -> u32 {
    (value.clamp(0.0, 1.0).powf(2.2) * 255.0 + 0.5) as u32
}

#[inline]
fn pack_linear8(value: f32) -> u32 {
    (value.clamp(0.0, 1.0) * 255.0 + 0.5) as u32
}

#[inline]
fn pack_gamma8(gamma: f32) -> u32 {
    (((gamma.clamp(0.4, 2.2) - 0.4) / 1.8) * 255.0 + 0.5) as u32
}

/// Pack a material into the two GPU records. Tint and reflectivity are
/// linearized to 8 bits per channel, gammas map over [0.4, 2.2], the last
/// word carries the atlas index and flag bits.
pub fn pack_material(material: &InstanceMaterial) -> (GpuMaterial, GpuMaterialExtra) {
    let mut flags = material.material_index & ((1 << MATERIAL_INDEX_BITS) - 1);
    if material.texcoord_clamp {
        flags |= MATERIAL_FLAG_TEXCOORD_CLAMP;
    }
    if material.ignore {
        flags |= MATERIAL_FLAG_IGNORE;
    }

    let params = GpuMaterial {
        params: [
            (pack_unit8(material.tint.x) << 24)
                | (pack_unit8(material.tint.y) << 16)
                | (pack_unit8(material.tint.z) << 8)
                | pack_gamma8(material.gamma),
            (pack_unit8(material.reflectivity.x) << 24)
                | (pack_unit8(material.reflectivity.y) << 16)
                | (pack_unit8(material.reflectivity.z) << 8)
                | pack_linear8(material.roughness),
            0,
            flags,
        ],
    };
    let extra = GpuMaterialExtra {
        rows: [
            material.texcoord_matrix[0],
            material.texcoord_matrix[1],
            [
                material.emissivity.x,
                material.emissivity.y,
                material.emissivity.z,
                0.0,
            ],
        ],
    };
    (params, extra)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneBvhStats {
    pub model_count: usize,
    pub instance_count: usize,
    pub vertex_count: usize,
    pub face_count: usize,
    pub node_count: usize,
    pub material_count: usize,
}

struct Model {
    id: u64,
    first_node: u32,
    root_bounds: AABB,
}

struct PendingInstance {
    model: usize,
    first_material: u32,
    matrix: Mat4,
    bounds: AABB,
}

/// Per-frame scene flattener. Static and dynamic content each keep their own
/// instance so the static side only rebuilds when content changes.
#[derive(Default)]
pub struct SceneBvh {
    position: Vec3d,
    max_depth: u32,

    models: Vec<Model>,
    pending: Vec<PendingInstance>,
    top_bvh: Bvh,
    index_root_node: i32,

    node_boxes: Vec<GpuNodeBox>,
    node_indices: Vec<GpuNodeIndex>,
    instances: Vec<GpuInstance>,
    instance_matrices: Vec<GpuInstanceMatrix>,
    faces: Vec<GpuFace>,
    vertices: Vec<GpuVertex>,
    texcoords: Vec<GpuTexCoord>,
    materials: Vec<GpuMaterial>,
    material_extras: Vec<GpuMaterialExtra>,
}

impl SceneBvh {
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            index_root_node: -1,
            ..Self::default()
        }
    }

    /// World-space anchor of the field-local frame
    pub fn set_position(&mut self, position: Vec3d) {
        self.position = position;
    }

    pub fn position(&self) -> Vec3d {
        self.position
    }

    /// Rebase a world transform into the field-local frame
    pub fn rebase_matrix(&self, world: &DMat4) -> Mat4 {
        (DMat4::from_translation(-self.position) * *world).to_mat4()
    }

    /// Drop all collected content; the anchor position is kept
    pub fn clear(&mut self) {
        self.models.clear();
        self.pending.clear();
        self.top_bvh.clear();
        self.index_root_node = -1;
        self.node_boxes.clear();
        self.node_indices.clear();
        self.instances.clear();
        self.instance_matrices.clear();
        self.faces.clear();
        self.vertices.clear();
        self.texcoords.clear();
        self.materials.clear();
        self.material_extras.clear();
    }

    /// Add one mesh instance. The mesh geometry is deduplicated by id; its
    /// tree, vertices and faces upload once no matter how many instances
    /// share it. Instances of empty meshes are skipped.
    pub fn add_mesh_instance(
        &mut self,
        matrix: Mat4,
        mesh: &MeshGeometry,
        mesh_bvh: &Bvh,
        materials: &[InstanceMaterial],
    ) {
        if mesh_bvh.is_empty() {
            debug!("scene bvh: skipping empty mesh {}", mesh.id);
            return;
        }
        let model = match self.find_model(mesh.id) {
            Some(model) => model,
            None => self.add_mesh_model(mesh, mesh_bvh),
        };

        let first_material = self.materials.len() as u32;
        for material in materials {
            let (params, extra) = pack_material(material);
            self.materials.push(params);
            self.material_extras.push(extra);
        }

        let bounds = self.models[model].root_bounds.transform(&matrix);
        self.pending.push(PendingInstance {
            model,
            first_material,
            matrix,
            bounds,
        });
    }

    /// Add one occluder instance. Occluders carry no materials; their faces
    /// keep the double-sided split of the source geometry.
    pub fn add_occlusion_instance(
        &mut self,
        matrix: Mat4,
        occlusion: &OcclusionGeometry,
        mesh_bvh: &Bvh,
    ) {
        if mesh_bvh.is_empty() {
            debug!("scene bvh: skipping empty occluder {}", occlusion.id);
            return;
        }
        let model = match self.find_model(occlusion.id) {
            Some(model) => model,
            None => self.add_occlusion_model(occlusion, mesh_bvh),
        };

        let bounds = self.models[model].root_bounds.transform(&matrix);
        self.pending.push(PendingInstance {
            model,
            first_material: MATERIAL_NONE,
            matrix,
            bounds,
        });
    }

    fn find_model(&self, id: u64) -> Option<usize> {
        self.models.iter().position(|model| model.id == id)
    }

    fn add_mesh_model(&mut self, mesh: &MeshGeometry, mesh_bvh: &Bvh) -> usize {
        let first_vertex = self.vertices.len() as u32;
        for position in &mesh.positions {
            self.vertices.push(GpuVertex {
                position: [position.x, position.y, position.z, 1.0],
            });
        }

        // faces and texcoords in BVH primitive order, leaf runs stay
        // contiguous face ranges
        let first_face = self.faces.len() as u32;
        for &prim in mesh_bvh.primitives() {
            let face = &mesh.faces[prim as usize];
            self.faces.push(GpuFace {
                indices: [
                    first_vertex + face.vertices[0],
                    first_vertex + face.vertices[1],
                    first_vertex + face.vertices[2],
                    face.texture,
                ],
            });
            for &vertex in &face.vertices {
                let uv = mesh.texcoords[vertex as usize];
                self.texcoords.push(GpuTexCoord { uv: [uv.x, uv.y] });
            }
        }

        self.append_nodes(mesh_bvh, first_face);
        let first_node = (self.node_indices.len() - mesh_bvh.node_count()) as u32;
        let root = mesh_bvh.nodes()[0];
        self.models.push(Model {
            id: mesh.id,
            first_node,
            root_bounds: root.bounds(),
        });
        self.models.len() - 1
    }

    fn add_occlusion_model(&mut self, occlusion: &OcclusionGeometry, mesh_bvh: &Bvh) -> usize {
        let first_vertex = self.vertices.len() as u32;
        for position in &occlusion.positions {
            self.vertices.push(GpuVertex {
                position: [position.x, position.y, position.z, 1.0],
            });
        }

        let first_face = self.faces.len() as u32;
        for &prim in mesh_bvh.primitives() {
            let face = prim as usize;
            let corner = face * 3;
            let mut flags = 0;
            if occlusion.is_double_sided(face) {
                flags = FACE_FLAG_DOUBLE_SIDED;
            }
            self.faces.push(GpuFace {
                indices: [
                    first_vertex + occlusion.corners[corner] as u32,
                    first_vertex + occlusion.corners[corner + 1] as u32,
                    first_vertex + occlusion.corners[corner + 2] as u32,
                    flags,
                ],
            });
            // keep the three-per-face texcoord alignment
            for _ in 0..3 {
                self.texcoords.push(GpuTexCoord::default());
            }
        }

        self.append_nodes(mesh_bvh, first_face);
        let first_node = (self.node_indices.len() - mesh_bvh.node_count()) as u32;
        let root = mesh_bvh.nodes()[0];
        self.models.push(Model {
            id: occlusion.id,
            first_node,
            root_bounds: root.bounds(),
        });
        self.models.len() - 1
    }

    /// Copy a mesh tree into the shared node buffer, rebasing child indices
    /// to the buffer and leaf runs to the appended faces
    fn append_nodes(&mut self, mesh_bvh: &Bvh, first_face: u32) {
        let first_node = self.node_indices.len() as u32;
        for node in mesh_bvh.nodes() {
            self.node_boxes.push(GpuNodeBox {
                min_extend: [node.min_extend.x, node.min_extend.y, node.min_extend.z, 0.0],
                max_extend: [node.max_extend.x, node.max_extend.y, node.max_extend.z, 0.0],
            });
            if node.is_leaf() {
                self.node_indices.push(GpuNodeIndex {
                    first_index: first_face + node.first_index,
                    primitive_count: node.primitive_count,
                });
            } else {
                self.node_indices.push(GpuNodeIndex {
                    first_index: first_node + node.first_index,
                    primitive_count: 0,
                });
            }
        }
    }

    /// Build the top-level tree over all collected instances and flatten it
    /// behind the mesh trees. Instance entries and inverse matrices are
    /// written in top-level primitive order so leaves index them directly.
    pub fn build(&mut self) {
        if self.pending.is_empty() {
            self.index_root_node = -1;
            return;
        }

        let boxes: Vec<AABB> = self.pending.iter().map(|instance| instance.bounds).collect();
        self.top_bvh.build(&boxes, self.max_depth);

        for &prim in self.top_bvh.primitives() {
            let instance = &self.pending[prim as usize];
            self.instances.push(GpuInstance {
                first_node: self.models[instance.model].first_node,
                first_material: instance.first_material,
            });
            self.instance_matrices.push(GpuInstanceMatrix {
                rows: instance.matrix.inverse().to_rows_3x4(),
            });
        }

        let first_node = self.node_indices.len() as u32;
        self.index_root_node = first_node as i32;
        for node in self.top_bvh.nodes() {
            self.node_boxes.push(GpuNodeBox {
                min_extend: [node.min_extend.x, node.min_extend.y, node.min_extend.z, 0.0],
                max_extend: [node.max_extend.x, node.max_extend.y, node.max_extend.z, 0.0],
            });
            if node.is_leaf() {
                self.node_indices.push(GpuNodeIndex {
                    first_index: node.first_index,
                    primitive_count: node.primitive_count,
                });
            } else {
                self.node_indices.push(GpuNodeIndex {
                    first_index: first_node + node.first_index,
                    primitive_count: 0,
                });
            }
        }
    }

    /// Root node of the top-level tree in the shared node buffer, -1 when
    /// the scene is empty
    pub fn index_root_node(&self) -> i32 {
        self.index_root_node
    }

    pub fn instance_count(&self) -> usize {
        self.pending.len()
    }

    pub fn node_boxes(&self) -> &[GpuNodeBox] {
        &self.node_boxes
    }

    pub fn node_indices(&self) -> &[GpuNodeIndex] {
        &self.node_indices
    }

    pub fn instances(&self) -> &[GpuInstance] {
        &self.instances
    }

    pub fn instance_matrices(&self) -> &[GpuInstanceMatrix] {
        &self.instance_matrices
    }

    pub fn faces(&self) -> &[GpuFace] {
        &self.faces
    }

    pub fn vertices(&self) -> &[GpuVertex] {
        &self.vertices
    }

    pub fn texcoords(&self) -> &[GpuTexCoord] {
        &self.texcoords
    }

    pub fn materials(&self) -> &[GpuMaterial] {
        &self.materials
    }

    pub fn material_extras(&self) -> &[GpuMaterialExtra] {
        &self.material_extras
    }

    pub fn stats(&self) -> SceneBvhStats {
        SceneBvhStats {
            model_count: self.models.len(),
            instance_count: self.pending.len(),
            vertex_count: self.vertices.len(),
            face_count: self.faces.len(),
            node_count: self.node_indices.len(),
            material_count: self.materials.len(),
        }
    }

    /// Log buffer layout for render debugging
    pub fn debug_print(&self) {
        let stats = self.stats();
        debug!(
            "scene bvh: root={} models={} instances={} vertices={} faces={} nodes={} materials={}",
            self.index_root_node,
            stats.model_count,
            stats.instance_count,
            stats.vertex_count,
            stats.face_count,
            stats.node_count,
            stats.material_count,
        );
        for (index, (node_box, node_index)) in
            self.node_boxes.iter().zip(&self.node_indices).enumerate()
        {
            debug!(
                "  node {}: first={} count={} min=({:.3},{:.3},{:.3}) max=({:.3},{:.3},{:.3})",
                index,
                node_index.first_index,
                node_index.primitive_count,
                node_box.min_extend[0],
                node_box.min_extend[1],
                node_box.min_extend[2],
                node_box.max_extend[0],
                node_box.max_extend[1],
                node_box.max_extend[2],
            );
        }
    }
}
