//! The probe field orchestrator
//!
//! [`ProbeField`] ties the subsystem together: it follows the camera, keeps
//! the tracked content in sync with the world, rebuilds the trace scenes,
//! activates one cascade per pass and prepares everything the GPU trace
//! needs. The caller drives it with one [`ProbeField::update`] per frame and
//! feeds relocation and extents readbacks in between.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use candela_math::{Frustum, Vec3, Vec3d};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::area::AreaTracker;
use crate::config::GiConfig;
use crate::error::{GiError, GiResult};
use crate::geometry::{GiComponent, GiWorld};
use crate::instance::{InstanceListener, InstanceTracker, InstanceTrackerStats, RegionChange, TrackedKind};
use crate::mesh_bvh::MeshBvhCache;
use crate::probe::cascade::{
    Cascade, CascadeState, CascadeStats, GpuProbeExtends, GpuProbeOffset,
};
use crate::scene::SceneBvh;

/// Golden ratio, drives the spherical Fibonacci spiral
const PHI: f32 = 1.618_034;

#[inline]
fn madfrac(a: f32, b: f32) -> f32 {
    a * b - (a * b).floor()
}

/// Direction `i` of `n` on the unit sphere, spherical Fibonacci spiral
pub fn spherical_fibonacci(i: f32, n: f32) -> Vec3 {
    let phi = std::f32::consts::TAU * madfrac(i, PHI - 1.0);
    let z = 1.0 - (2.0 * i + 1.0) / n;
    let sin_theta = (1.0 - z * z).max(0.0).sqrt();
    Vec3::new(phi.cos() * sin_theta, phi.sin() * sin_theta, z)
}

/// Per-pass trace parameters, std140 uniform block layout
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FieldParams {
    pub sample_image_scale: [f32; 2],
    pub probe_count: i32,
    pub rays_per_probe: i32,

    pub grid_probe_count: [i32; 3],
    pub probes_per_line: i32,

    pub grid_origin: [f32; 3],
    pub irradiance_map_size: i32,

    pub grid_coord_unshift: [i32; 3],
    pub distance_map_size: i32,

    pub field_size: [f32; 3],
    pub depth_sharpness: f32,

    pub grid_probe_spacing: [f32; 3],
    pub blend_update_probe: f32,

    pub irradiance_map_scale: [f32; 2],
    pub distance_map_scale: [f32; 2],

    pub detection_box: [f32; 3],
    pub max_probe_distance: f32,

    pub move_max_offset: [f32; 3],
    pub move_min_dist_to_surface: f32,

    pub normal_bias: f32,
    pub irradiance_gamma: f32,
    pub inv_irradiance_gamma: f32,
    pub self_shadow_bias: f32,

    pub cascade: i32,
    pub bvh_instance_root_node: i32,
    pub padding: [i32; 2],
}

impl FieldParams {
    pub const SIZE: usize = 176;
}

/// Serializable snapshot of a running field
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldState {
    pub config: GiConfig,
    pub cascades: Vec<CascadeState>,
    pub active_cascade: usize,
    pub cycle_index: usize,
    pub layer_mask: u64,
    pub frame: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldStats {
    pub frame: u64,
    pub active_cascade: usize,
    pub instances: InstanceTrackerStats,
    pub cascades: Vec<CascadeStats>,
}

/// A camera-following multi-cascade probe field
pub struct ProbeField {
    config: GiConfig,
    cascades: Vec<Cascade>,
    active_cascade: usize,
    last_pass_cascade: usize,
    update_cycle: Vec<usize>,
    cycle_index: usize,

    area: AreaTracker,
    instances: InstanceTracker,
    cache: MeshBvhCache,
    static_scene: SceneBvh,
    dynamic_scene: SceneBvh,

    ray_directions: Vec<Vec3>,
    layer_mask: u64,

    pending_offsets: Vec<GpuProbeOffset>,
    pending_extends: Vec<GpuProbeExtends>,
    skin_scratch: Vec<Vec3>,
    frame: u64,
}

impl ProbeField {
    pub fn new(config: GiConfig) -> GiResult<Self> {
        config.validate()?;

        let spacings = config.cascade_spacings();
        let cascades: Vec<Cascade> = spacings
            .iter()
            .enumerate()
            .map(|(index, &spacing)| Cascade::new(index, spacing, &config))
            .collect();

        // outer cascades change slowly; the cycle visits the inner ones
        // more often
        let update_cycle = match cascades.len() {
            1 => vec![0],
            2 => vec![0, 1],
            3 => vec![0, 1, 0, 2],
            _ => vec![0, 1, 2, 0, 1, 3],
        };

        // the detection area covers the largest cascade
        let area_half = {
            let outer = &cascades[cascades.len() - 1];
            Vec3d::from_vec3(outer.detection_box())
        };
        let area = AreaTracker::new(area_half, config.update_threshold, config.min_importance);

        let rays = config.quality.rays_per_probe();
        let ray_directions: Vec<Vec3> = (0..rays)
            .map(|i| spherical_fibonacci(i as f32, rays as f32))
            .collect();

        Ok(Self {
            instances: InstanceTracker::new(config.max_instances, config.bvh_max_depth),
            cache: MeshBvhCache::new(config.bvh_max_depth),
            static_scene: SceneBvh::new(config.bvh_max_depth),
            dynamic_scene: SceneBvh::new(config.bvh_max_depth),
            cascades,
            active_cascade: 0,
            last_pass_cascade: 0,
            update_cycle,
            cycle_index: 0,
            area,
            ray_directions,
            layer_mask: 0,
            pending_offsets: Vec::new(),
            pending_extends: Vec::new(),
            skin_scratch: Vec::new(),
            frame: 0,
            config,
        })
    }

    /// Sink for renderer-side component change hooks
    pub fn listener(&self) -> InstanceListener {
        self.instances.listener()
    }

    /// Restrict tracked content to matching layers; zero matches everything
    pub fn set_layer_mask(&mut self, layer_mask: u64) {
        if self.layer_mask != layer_mask {
            self.layer_mask = layer_mask;
            self.area.invalidate();
        }
    }

    pub fn layer_mask(&self) -> u64 {
        self.layer_mask
    }

    /// Queue relocation feedback for the probes traced last pass
    pub fn apply_probe_offsets(&mut self, offsets: &[GpuProbeOffset]) {
        self.pending_offsets.clear();
        self.pending_offsets.extend_from_slice(offsets);
    }

    /// Queue geometry extents for the ray cache probes traced last pass
    pub fn apply_probe_extends(&mut self, extends: &[GpuProbeExtends]) {
        self.pending_extends.clear();
        self.pending_extends.extend_from_slice(extends);
    }

    /// Advance the field one pass: absorb GPU feedback, follow the camera,
    /// sync tracked content, rebuild the trace scenes and select the probes
    /// to trace.
    pub fn update(
        &mut self,
        world: &dyn GiWorld,
        camera: Vec3d,
        frustum: &Frustum,
    ) -> GiResult<()> {
        self.absorb_feedback()?;
        self.activate_next_cascade();

        for cascade in &mut self.cascades {
            cascade.update_position(camera);
        }

        self.area.set_position(camera);
        self.area.update(world, self.layer_mask);

        if self.area.all_leaving() {
            // teleport: nothing tracked survives, start the field over
            debug!("probe field: detection area teleported, full restart");
            self.instances.clear(&mut self.cache);
            for cascade in &mut self.cascades {
                cascade.invalidate_all();
            }
        } else if self.area.has_changed() {
            self.instances.remove_missing(self.area.inside(), &mut self.cache);
        }

        if self.area.has_changed() || self.area.all_leaving() {
            for component in self.area.entering() {
                let kind = Self::tracked_kind(&**component);
                let result = self.instances.add(
                    Arc::clone(component),
                    kind,
                    &mut self.cache,
                    !self.area.all_leaving(),
                );
                if let Err(err) = result {
                    warn!("probe field: cannot track component: {}", err);
                }
            }
            self.area.clear_changes();
        }

        self.instances.apply_changes(&mut self.cache);
        for change in self.instances.take_region_changes() {
            for cascade in &mut self.cascades {
                match change {
                    RegionChange::Invalidate { bounds, hard } => {
                        cascade.invalidate_area(&bounds, hard)
                    }
                    RegionChange::Touch { bounds } => cascade.touch_dynamic_area(&bounds),
                }
            }
        }

        let anchor = self.cascades[self.active_cascade].position();
        if self.instances.take_static_dirty() || self.static_scene.position() != anchor {
            self.rebuild_static_scene(anchor);
        }
        self.rebuild_dynamic_scene(anchor);

        let cascade = &mut self.cascades[self.active_cascade];
        cascade.find_probes_to_update(frustum);
        cascade.prepare_ray_cache_probes();
        self.last_pass_cascade = self.active_cascade;
        self.frame += 1;
        Ok(())
    }

    fn absorb_feedback(&mut self) -> GiResult<()> {
        let cascade = &mut self.cascades[self.last_pass_cascade];
        if !self.pending_extends.is_empty() {
            cascade.apply_probe_extends(&self.pending_extends)?;
            cascade.validated_ray_caches();
            self.pending_extends.clear();
        }
        if !self.pending_offsets.is_empty() {
            cascade.apply_probe_offsets(&self.pending_offsets)?;
            self.pending_offsets.clear();
        }
        Ok(())
    }

    fn activate_next_cascade(&mut self) {
        // cascades demanding a full pass win; cascades with untraced probes
        // on screen jump the queue; otherwise follow the cycle
        if let Some(index) = self
            .cascades
            .iter()
            .position(|c| c.requires_full_update_inside_view())
        {
            self.active_cascade = index;
            return;
        }
        if let Some(index) = self
            .cascades
            .iter()
            .position(|c| c.has_invalid_probes_inside_view())
        {
            self.active_cascade = index;
            return;
        }
        self.active_cascade = self.update_cycle[self.cycle_index];
        self.cycle_index = (self.cycle_index + 1) % self.update_cycle.len();
    }

    /// Renderer hook: a component spawned inside the detection area between
    /// updates. Rejected components (layer, importance, out of range) are
    /// ignored; re-announcing a tracked component is harmless.
    pub fn component_entered_world(&mut self, component: Arc<dyn GiComponent>) {
        if !self.accepts_component(&*component) {
            return;
        }
        let kind = Self::tracked_kind(&*component);
        if let Err(err) = self.instances.add(component, kind, &mut self.cache, true) {
            warn!("probe field: cannot track entering component: {}", err);
        }
    }

    /// Renderer hook: a component's layer mask changed, which may pull it
    /// into or out of the tracked set
    pub fn component_changed_layer_mask(&mut self, component: Arc<dyn GiComponent>) {
        if self.accepts_component(&*component) {
            self.component_entered_world(component);
        } else if let Some(id) = self.instances.id_for_component(component.id()) {
            if let Err(err) = self.instances.remove(id, &mut self.cache) {
                warn!("probe field: cannot drop masked component: {}", err);
            }
        }
    }

    fn accepts_component(&self, component: &dyn GiComponent) -> bool {
        if self.layer_mask != 0 && component.layer_mask() & self.layer_mask == 0 {
            return false;
        }
        if component.importance() < self.config.min_importance {
            return false;
        }
        self.area.detection_box().intersects(&component.world_extents())
    }

    fn tracked_kind(component: &dyn GiComponent) -> TrackedKind {
        if component.mesh().is_some() {
            TrackedKind::Component
        } else if component.occlusion_geometry().is_some() {
            TrackedKind::OcclusionMesh
        } else {
            TrackedKind::Decal
        }
    }

    fn rebuild_static_scene(&mut self, anchor: Vec3d) {
        self.static_scene.set_position(anchor);
        self.static_scene.clear();
        for (_, entry) in self.instances.iter() {
            if entry.dynamic {
                continue;
            }
            let matrix = self
                .static_scene
                .rebase_matrix(&entry.component.world_matrix());
            match entry.kind {
                TrackedKind::Component => {
                    if let (Some(mesh), Some(mesh_bvh)) =
                        (entry.component.mesh(), entry.mesh_bvh.as_ref())
                    {
                        let materials = entry.component.materials();
                        self.static_scene
                            .add_mesh_instance(matrix, &mesh, mesh_bvh.bvh(), &materials);
                    }
                }
                TrackedKind::OcclusionMesh => {
                    if let (Some(occlusion), Some(mesh_bvh)) =
                        (entry.component.occlusion_geometry(), entry.mesh_bvh.as_ref())
                    {
                        self.static_scene
                            .add_occlusion_instance(matrix, &occlusion, mesh_bvh.bvh());
                    }
                }
                TrackedKind::Decal => {}
            }
        }
        self.static_scene.build();
        debug!(
            "probe field: static scene rebuilt, {} instances",
            self.static_scene.instance_count()
        );
    }

    fn rebuild_dynamic_scene(&mut self, anchor: Vec3d) {
        self.dynamic_scene.set_position(anchor);
        self.dynamic_scene.clear();
        for (_, entry) in self.instances.iter_mut() {
            if !entry.dynamic {
                continue;
            }
            let Some(dynamic_bvh) = entry.dynamic_bvh.as_mut() else {
                continue;
            };
            self.skin_scratch.clear();
            if entry.component.skinned_positions(&mut self.skin_scratch) {
                match dynamic_bvh.update_vertices(&self.skin_scratch) {
                    Ok(()) => dynamic_bvh.update_extents(),
                    Err(err) => warn!("probe field: skinned pose rejected: {}", err),
                }
            }
            let matrix = self
                .dynamic_scene
                .rebase_matrix(&entry.component.world_matrix());
            let materials = entry.component.materials();
            self.dynamic_scene
                .add_mesh_instance(matrix, dynamic_bvh.mesh(), dynamic_bvh.bvh(), &materials);
        }
        self.dynamic_scene.build();
    }

    /// Trace parameters for the cascade selected by the last update
    pub fn field_params(&self) -> FieldParams {
        let cascade = &self.cascades[self.active_cascade];
        let quality = self.config.quality;
        let rays = quality.rays_per_probe() as i32;
        let probes_per_line = quality.probes_per_line();
        let sample_width = (probes_per_line * quality.rays_per_probe()) as f32;
        let sample_height =
            ((cascade.max_update_count() + probes_per_line - 1) / probes_per_line) as f32;

        let count = cascade.probe_count();
        let irradiance_size = self.config.irradiance_map_size as i32;
        let distance_size = self.config.distance_map_size as i32;
        // octahedral maps carry a one texel border on every side
        let irradiance_width = ((irradiance_size + 2) * count.x * count.y) as f32;
        let irradiance_height = ((irradiance_size + 2) * count.z) as f32;
        let distance_width = ((distance_size + 2) * count.x * count.y) as f32;
        let distance_height = ((distance_size + 2) * count.z) as f32;

        let unshift = (count - cascade.grid_coord_shift()).rem_euclid(count);

        FieldParams {
            sample_image_scale: [1.0 / sample_width, 1.0 / sample_height],
            probe_count: cascade.update_probes().len() as i32,
            rays_per_probe: rays,
            grid_probe_count: count.to_array(),
            probes_per_line: probes_per_line as i32,
            grid_origin: cascade.field_origin().to_array(),
            irradiance_map_size: irradiance_size,
            grid_coord_unshift: unshift.to_array(),
            distance_map_size: distance_size,
            field_size: cascade.field_size().to_array(),
            depth_sharpness: self.config.depth_sharpness,
            grid_probe_spacing: cascade.probe_spacing().to_array(),
            blend_update_probe: self.config.hysteresis,
            irradiance_map_scale: [1.0 / irradiance_width, 1.0 / irradiance_height],
            distance_map_scale: [1.0 / distance_width, 1.0 / distance_height],
            detection_box: cascade.detection_box().to_array(),
            max_probe_distance: cascade.max_probe_distance(),
            move_max_offset: cascade.move_max_offset().to_array(),
            move_min_dist_to_surface: cascade.move_min_dist_to_surface(),
            normal_bias: self.config.normal_bias,
            irradiance_gamma: self.config.irradiance_gamma,
            inv_irradiance_gamma: 1.0 / self.config.irradiance_gamma,
            self_shadow_bias: cascade.self_shadow_bias(self.config.self_shadow_bias),
            cascade: self.active_cascade as i32,
            bvh_instance_root_node: self.static_scene.index_root_node(),
            padding: [0; 2],
        }
    }

    /// Trace directions packed for a vec4 array uniform
    pub fn write_ray_directions(&self, out: &mut Vec<[f32; 4]>) {
        out.clear();
        for direction in &self.ray_directions {
            out.push([direction.x, direction.y, direction.z, 0.0]);
        }
    }

    pub fn ray_directions(&self) -> &[Vec3] {
        &self.ray_directions
    }

    pub fn config(&self) -> &GiConfig {
        &self.config
    }

    pub fn cascades(&self) -> &[Cascade] {
        &self.cascades
    }

    pub fn cascade(&self, index: usize) -> &Cascade {
        &self.cascades[index]
    }

    pub fn active_cascade_index(&self) -> usize {
        self.active_cascade
    }

    pub fn active_cascade(&self) -> &Cascade {
        &self.cascades[self.active_cascade]
    }

    pub fn active_cascade_mut(&mut self) -> &mut Cascade {
        &mut self.cascades[self.active_cascade]
    }

    pub fn static_scene(&self) -> &SceneBvh {
        &self.static_scene
    }

    pub fn dynamic_scene(&self) -> &SceneBvh {
        &self.dynamic_scene
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Drop every traced probe in every cascade
    pub fn invalidate_all(&mut self) {
        for cascade in &mut self.cascades {
            cascade.invalidate_all();
        }
    }

    /// Drop cached static rays in every cascade; needed when lighting
    /// changes without geometry changing
    pub fn invalidate_all_ray_caches(&mut self) {
        for cascade in &mut self.cascades {
            cascade.invalidate_all_ray_caches();
        }
    }

    pub fn stats(&self) -> FieldStats {
        FieldStats {
            frame: self.frame,
            active_cascade: self.active_cascade,
            instances: self.instances.stats(),
            cascades: self.cascades.iter().map(Cascade::stats).collect(),
        }
    }

    // --- persistence -----------------------------------------------------

    pub fn to_state(&self) -> FieldState {
        FieldState {
            config: self.config.clone(),
            cascades: self.cascades.iter().map(Cascade::to_state).collect(),
            active_cascade: self.active_cascade,
            cycle_index: self.cycle_index,
            layer_mask: self.layer_mask,
            frame: self.frame,
        }
    }

    /// Rebuild a field from a snapshot. Tracked content and trace scenes
    /// are rebuilt from the world on the first update.
    pub fn from_state(state: FieldState) -> GiResult<Self> {
        let mut field = Self::new(state.config)?;
        if state.cascades.len() != field.cascades.len() {
            return Err(GiError::InvalidArgument(format!(
                "state holds {} cascades, config builds {}",
                state.cascades.len(),
                field.cascades.len()
            )));
        }
        for (cascade, cascade_state) in field.cascades.iter_mut().zip(state.cascades) {
            cascade.apply_state(cascade_state)?;
        }
        field.active_cascade = state.active_cascade.min(field.cascades.len() - 1);
        field.cycle_index = state.cycle_index % field.update_cycle.len();
        field.layer_mask = state.layer_mask;
        field.frame = state.frame;
        Ok(field)
    }
}
