//! Dynamic global illumination probe field
//!
//! CPU side of a probe-based GI pipeline: a set of toroidal probe grid
//! cascades follows the camera, scene content inside the detection area is
//! tracked and compiled into flat BVH buffers for GPU ray tracing, and probe
//! lifecycle (validation, relocation, ray caching, invalidation) is managed
//! per pass.
//!
//! The crate stops at the GPU boundary. It produces tightly packed buffers
//! ([`bytemuck`] plain-old-data) and consumes readbacks; it never talks to a
//! graphics API.
//!
//! Typical frame:
//!
//! ```ignore
//! field.apply_probe_offsets(&offsets_readback);
//! field.apply_probe_extends(&extends_readback);
//! field.update(&world, camera_position, &view_frustum)?;
//! let params = field.field_params();
//! // upload params + buffers, dispatch trace, read back next frame
//! ```

pub mod area;
pub mod bvh;
pub mod config;
pub mod error;
pub mod geometry;
pub mod instance;
pub mod mesh_bvh;
pub mod probe;
pub mod scene;

pub use area::AreaTracker;
pub use bvh::{Bvh, BvhNode, BvhStats};
pub use config::{GiConfig, GiQuality};
pub use error::{GiError, GiResult};
pub use geometry::{
    GiComponent, GiWorld, InstanceMaterial, MeshFace, MeshGeometry, OcclusionGeometry,
};
pub use instance::{
    is_component_static, InstanceEvent, InstanceEventKind, InstanceId, InstanceListener,
    InstanceTracker, RegionChange, TrackedInstance, TrackedKind,
};
pub use mesh_bvh::{DynamicMeshBvh, MeshBvh, MeshBvhCache};
pub use probe::{
    Cascade, CascadeState, FieldParams, FieldState, GpuProbeExtends, GpuProbeOffset,
    GpuProbePosition, Probe, ProbeField,
};
pub use scene::{
    pack_material, GpuFace, GpuInstance, GpuInstanceMatrix, GpuMaterial, GpuMaterialExtra,
    GpuNodeBox, GpuNodeIndex, GpuTexCoord, GpuVertex, SceneBvh, FACE_FLAG_DOUBLE_SIDED,
    MATERIAL_FLAG_IGNORE, MATERIAL_FLAG_TEXCOORD_CLAMP, MATERIAL_NONE,
};

pub mod prelude {
    pub use crate::config::{GiConfig, GiQuality};
    pub use crate::error::{GiError, GiResult};
    pub use crate::geometry::{GiComponent, GiWorld, InstanceMaterial, MeshGeometry};
    pub use crate::probe::{FieldParams, ProbeField};
    pub use crate::scene::SceneBvh;
}
