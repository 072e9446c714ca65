//! One cascade of the probe grid
//!
//! A cascade is a toroidal grid of probes riding along with the camera. The
//! probe array never moves in memory; repositioning only rotates the mapping
//! between storage slots and grid cells, so probes that stay inside the field
//! keep their traced state. Each probe carries lifecycle flags, a relocation
//! offset fed back from the GPU and the geometry extents its cached rays
//! cover.
//!
//! Storage and grid cells are linked through `grid_coord_shift`:
//! `storage = (shifted + shift) mod count`. The shifted coordinate is the
//! spatially stable label, (0,0,0) being the minimum corner of the current
//! field.

use bytemuck::{Pod, Zeroable};
use candela_math::{Frustum, IVec3, Vec3, Vec3d, DAABB};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::GiConfig;
use crate::error::{GiError, GiResult};

/// Probe has been traced at least once and holds usable irradiance
pub const PROBE_FLAG_VALID: u8 = 1 << 0;
/// Probe lies inside the view frustum (with backoff margin)
pub const PROBE_FLAG_INSIDE_VIEW: u8 = 1 << 1;
/// Probe sits inside solid geometry and stopped relocating
pub const PROBE_FLAG_DISABLED: u8 = 1 << 2;
/// Geometry within relocation range
pub const PROBE_FLAG_NEAR_GEOMETRY: u8 = 1 << 3;
/// Static-geometry rays are cached; retraces are cheap
pub const PROBE_FLAG_RAY_CACHE_VALID: u8 = 1 << 4;
/// Probe ended up inside dynamic geometry and waits for it to pass
pub const PROBE_FLAG_DYNAMIC_DISABLE: u8 = 1 << 5;
/// Blend the next trace result instead of replacing it
pub const PROBE_FLAG_SMOOTH_UPDATE: u8 = 1 << 6;

/// Minimum offset feedback movement accepted as a real relocation, meters
const OFFSET_ACCEPT_DISTANCE: f32 = 0.05;

/// One probe of a cascade
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Probe {
    /// Storage slot, also the GPU probe index
    pub index: u16,
    pub flags: u8,
    /// Relocation feedback iterations so far, saturates at the settle count
    pub count_offset_moved: u8,
    /// Relocation offset away from the grid position
    pub offset: Vec3,
    /// Grid-local position without offset
    pub position: Vec3,
    /// Spatially stable grid cell of this slot
    pub shifted_coord: IVec3,
    /// Cascade-local extents of geometry the cached rays cover
    pub min_extend: Vec3,
    pub max_extend: Vec3,
}

/// Probe position row for the trace shader
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuProbePosition {
    pub position: [f32; 3],
    pub flags: u32,
}

impl GpuProbePosition {
    pub const SIZE: usize = 16;
}

/// Per-probe relocation feedback read back from the GPU
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuProbeOffset {
    pub offset: [f32; 3],
    pub flags: u32,
}

impl GpuProbeOffset {
    pub const SIZE: usize = 16;
}

/// Per-probe geometry extents read back after a full trace
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Pod, Zeroable)]
pub struct GpuProbeExtends {
    pub min_extend: [f32; 3],
    pub max_extend: [f32; 3],
}

impl GpuProbeExtends {
    pub const SIZE: usize = 24;
}

/// Snapshot of a cascade's probe bookkeeping
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CascadeState {
    pub position: Vec3d,
    pub last_ref_position: Vec3d,
    pub grid_coord_shift: IVec3,
    pub probes: Vec<Probe>,
    pub aged_probes: Vec<u16>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeStats {
    pub update_probe_count: usize,
    pub ray_cache_probe_count: usize,
    pub valid_probe_count: usize,
    pub disabled_probe_count: usize,
    pub inside_view_count: usize,
}

pub struct Cascade {
    index: usize,

    probe_count: IVec3,
    grid_coord_clamp: IVec3,
    stride: i32,
    real_probe_count: usize,

    probe_spacing: Vec3,
    field_size: Vec3,
    field_origin: Vec3,
    detection_box: Vec3,
    max_probe_distance: f32,
    move_max_offset: Vec3,
    move_min_dist_to_surface: f32,
    dynamic_half_enlarge: Vec3,
    static_half_enlarge: Vec3,

    max_update_count: usize,
    offset_settle_count: u8,
    frustum_backoff: f32,
    reposition_hysteresis: f32,
    fill_up_with_expensive: bool,

    position: Vec3d,
    last_ref_position: Vec3d,
    grid_coord_shift: IVec3,

    probes: Vec<Probe>,
    aged_probes: Vec<u16>,
    update_probes: Vec<u16>,
    ray_cache_probes: Vec<u16>,
    clear_probes: Vec<u32>,
    has_clear_probes: bool,

    has_invalid_probes_inside_view: bool,
    requires_full_update_inside_view: bool,
    probes_moved: bool,
    probes_extends_changed: bool,
}

impl Cascade {
    pub fn new(index: usize, spacing: Vec3, config: &GiConfig) -> Self {
        let probe_count = config.probe_count;
        let grid_coord_clamp = probe_count - IVec3::ONE;
        let stride = probe_count.x * probe_count.z;
        let real_probe_count = config.real_probe_count();

        let field_size = spacing * grid_coord_clamp.to_vec3();
        let field_origin = field_size * -0.5;
        let detection_box = field_size * 0.5 + Vec3::splat(config.max_detection_range);

        let mut cascade = Self {
            index,
            probe_count,
            grid_coord_clamp,
            stride,
            real_probe_count,
            probe_spacing: spacing,
            field_size,
            field_origin,
            detection_box,
            max_probe_distance: spacing.length() * 1.5,
            move_max_offset: spacing * 0.49,
            move_min_dist_to_surface: spacing.min_component() * 0.25,
            dynamic_half_enlarge: spacing * (1.9 * 0.5),
            static_half_enlarge: Vec3::splat(0.05),
            max_update_count: config.quality.probe_budget().min(real_probe_count),
            offset_settle_count: config.offset_settle_count,
            frustum_backoff: spacing.length() * config.frustum_backoff_factor,
            reposition_hysteresis: config.reposition_hysteresis,
            // the innermost cascade is cheap enough to always use its
            // full budget
            fill_up_with_expensive: index == 0,
            position: Vec3d::ZERO,
            last_ref_position: Vec3d::ZERO,
            grid_coord_shift: IVec3::ZERO,
            probes: Vec::with_capacity(real_probe_count),
            aged_probes: (0..real_probe_count).map(|i| i as u16).collect(),
            update_probes: Vec::new(),
            ray_cache_probes: Vec::new(),
            clear_probes: vec![0; (real_probe_count + 31) / 32],
            has_clear_probes: false,
            has_invalid_probes_inside_view: false,
            requires_full_update_inside_view: true,
            probes_moved: false,
            probes_extends_changed: false,
        };

        for i in 0..real_probe_count {
            let shifted = cascade.storage_to_shifted(cascade.grid_coord_from_index(i));
            let position = cascade.grid_position(shifted);
            cascade.probes.push(Probe {
                index: i as u16,
                flags: 0,
                count_offset_moved: 0,
                offset: Vec3::ZERO,
                position,
                shifted_coord: shifted,
                min_extend: position - cascade.detection_box,
                max_extend: position + cascade.detection_box,
            });
        }
        cascade
    }

    // --- coordinates -----------------------------------------------------

    #[inline]
    pub fn grid_coord_from_index(&self, index: usize) -> IVec3 {
        let index = index as i32;
        let y = index / self.stride;
        let rem = index % self.stride;
        IVec3::new(rem % self.probe_count.x, y, rem / self.probe_count.x)
    }

    #[inline]
    pub fn index_from_grid_coord(&self, coord: IVec3) -> usize {
        (self.stride * coord.y + self.probe_count.x * coord.z + coord.x) as usize
    }

    /// Stable grid cell of a storage coordinate
    #[inline]
    pub fn storage_to_shifted(&self, storage: IVec3) -> IVec3 {
        (storage - self.grid_coord_shift).rem_euclid(self.probe_count)
    }

    /// Storage coordinate holding a stable grid cell
    #[inline]
    pub fn shifted_to_storage(&self, shifted: IVec3) -> IVec3 {
        (shifted + self.grid_coord_shift).rem_euclid(self.probe_count)
    }

    /// Cascade-local position of a grid cell, without relocation offset
    #[inline]
    pub fn grid_position(&self, shifted: IVec3) -> Vec3 {
        self.field_origin + self.probe_spacing * shifted.to_vec3()
    }

    /// Nearest grid cell to a cascade-local position
    pub fn grid_coord_at(&self, local: Vec3) -> IVec3 {
        let scaled = (local - self.field_origin) / self.probe_spacing;
        IVec3::new(
            (scaled.x + 0.5).floor() as i32,
            (scaled.y + 0.5).floor() as i32,
            (scaled.z + 0.5).floor() as i32,
        )
        .clamp(IVec3::ZERO, self.grid_coord_clamp)
    }

    // --- repositioning ---------------------------------------------------

    /// Follow the camera. Each axis moves only after the camera wanders past
    /// the hysteresis fraction of the spacing, and always snaps to whole
    /// grid cells. Returns true when the grid shifted.
    pub fn update_position(&mut self, camera: Vec3d) -> bool {
        let spacing = [
            self.probe_spacing.x as f64,
            self.probe_spacing.y as f64,
            self.probe_spacing.z as f64,
        ];
        let camera = camera.to_array();
        let reference = self.last_ref_position.to_array();
        let current = self.position.to_array();

        let mut goal = [0.0f64; 3];
        let mut moved_axis = [false; 3];
        for axis in 0..3 {
            let threshold = spacing[axis] * self.reposition_hysteresis as f64;
            if (camera[axis] - reference[axis]).abs() > threshold {
                goal[axis] = (camera[axis] / spacing[axis]).round() * spacing[axis];
                moved_axis[axis] = true;
            } else {
                goal[axis] = current[axis];
            }
        }

        let shift = IVec3::new(
            ((goal[0] - current[0]) / spacing[0]).round() as i32,
            ((goal[1] - current[1]) / spacing[1]).round() as i32,
            ((goal[2] - current[2]) / spacing[2]).round() as i32,
        );
        if shift == IVec3::ZERO {
            return false;
        }

        let new_position = Vec3d::new(goal[0], goal[1], goal[2]);
        let extends_offset = (new_position - self.position).to_vec3();
        self.grid_coord_shift = (self.grid_coord_shift + shift).rem_euclid(self.probe_count);

        // probes whose cell left the field lose their state, survivors keep
        // it with extents rebased to the new anchor
        for i in 0..self.real_probe_count {
            let shifted = self.storage_to_shifted(self.grid_coord_from_index(i));
            let probe = &mut self.probes[i];
            let unwrapped = probe.shifted_coord - shift;
            let survives = unwrapped == shifted;
            probe.shifted_coord = shifted;
            probe.position = self.field_origin + self.probe_spacing * shifted.to_vec3();
            if survives {
                probe.min_extend -= extends_offset;
                probe.max_extend -= extends_offset;
            } else {
                probe.flags = 0;
                probe.offset = Vec3::ZERO;
                probe.count_offset_moved = 0;
                probe.min_extend = probe.position - self.detection_box;
                probe.max_extend = probe.position + self.detection_box;
                self.clear_probes[i / 32] |= 1 << (i % 32);
                self.has_clear_probes = true;
            }
        }

        self.position = new_position;
        for axis in 0..3 {
            if moved_axis[axis] {
                match axis {
                    0 => self.last_ref_position.x = goal[0],
                    1 => self.last_ref_position.y = goal[1],
                    _ => self.last_ref_position.z = goal[2],
                }
            }
        }
        debug!(
            "cascade {}: shifted by ({},{},{})",
            self.index, shift.x, shift.y, shift.z
        );
        true
    }

    // --- selection -------------------------------------------------------

    /// Pick the probes to trace this pass.
    ///
    /// Tier order, strict precedence: invalid probes before stale valid ones
    /// before cheap cached retraces, inside-view before outside at every
    /// tier with roughly an 80/20 budget split. The aged queue keeps
    /// selection fair within a tier; selected probes move to its tail.
    pub fn find_probes_to_update(&mut self, frustum: &Frustum) {
        self.update_inside_view_flags(frustum);
        self.update_probes.clear();

        let full_update = std::mem::replace(&mut self.requires_full_update_inside_view, false);
        let mask = PROBE_FLAG_VALID
            | PROBE_FLAG_INSIDE_VIEW
            | PROBE_FLAG_DISABLED
            | PROBE_FLAG_DYNAMIC_DISABLE
            | PROBE_FLAG_RAY_CACHE_VALID;

        if full_update {
            let mut quota = self.max_update_count;
            // everything in view regardless of state, cheapest last
            self.add_update_probes(mask, PROBE_FLAG_INSIDE_VIEW, &mut quota);
            self.add_update_probes(mask, PROBE_FLAG_VALID | PROBE_FLAG_INSIDE_VIEW, &mut quota);
            self.add_update_probes(
                mask,
                PROBE_FLAG_VALID | PROBE_FLAG_INSIDE_VIEW | PROBE_FLAG_RAY_CACHE_VALID,
                &mut quota,
            );
        } else {
            // invalid probes
            let (mut inside, mut outside) = self.split_quota();
            self.add_update_probes(mask, PROBE_FLAG_INSIDE_VIEW, &mut inside);
            self.add_update_probes(mask, 0, &mut outside);

            // valid probes without cached rays
            let (mut inside, mut outside) = self.split_quota();
            self.add_update_probes(mask, PROBE_FLAG_VALID | PROBE_FLAG_INSIDE_VIEW, &mut inside);
            self.add_update_probes(mask, PROBE_FLAG_VALID, &mut outside);

            // cheap retraces from the ray cache
            let (mut inside, _) = self.split_quota();
            self.add_update_probes(
                mask,
                PROBE_FLAG_VALID | PROBE_FLAG_INSIDE_VIEW | PROBE_FLAG_RAY_CACHE_VALID,
                &mut inside,
            );
            let mut rest = self.max_update_count - self.update_probes.len();
            self.add_update_probes(
                mask,
                PROBE_FLAG_VALID | PROBE_FLAG_RAY_CACHE_VALID,
                &mut rest,
            );

            if self.fill_up_with_expensive {
                // spend leftover budget on expensive traces, view or not
                let grouped = PROBE_FLAG_VALID
                    | PROBE_FLAG_DISABLED
                    | PROBE_FLAG_DYNAMIC_DISABLE
                    | PROBE_FLAG_RAY_CACHE_VALID;
                let mut rest = self.max_update_count - self.update_probes.len();
                self.add_update_probes(grouped, 0, &mut rest);
                let mut rest = self.max_update_count - self.update_probes.len();
                self.add_update_probes(grouped, PROBE_FLAG_VALID, &mut rest);
            }
        }

        // selection fixup: fresh probes trace hard, probes amid relocation
        // skip blending for one pass
        for &index in &self.update_probes {
            let probe = &mut self.probes[index as usize];
            probe.flags |= PROBE_FLAG_SMOOTH_UPDATE;
            if probe.flags & PROBE_FLAG_VALID == 0 {
                probe.flags |= PROBE_FLAG_VALID;
                probe.flags &= !PROBE_FLAG_SMOOTH_UPDATE;
                probe.offset = Vec3::ZERO;
                probe.count_offset_moved = 0;
            } else if probe.count_offset_moved == 1 {
                probe.flags &= !PROBE_FLAG_SMOOTH_UPDATE;
            }
        }
    }

    fn split_quota(&self) -> (usize, usize) {
        let remaining = self.max_update_count - self.update_probes.len();
        let outside = remaining / 5;
        (remaining - outside, outside)
    }

    fn update_inside_view_flags(&mut self, frustum: &Frustum) {
        // rebase the planes into the cascade-local frame, pushed back so
        // probes just outside the view still count
        let planes = frustum.planes();
        let mut normals = [Vec3::ZERO; 5];
        let mut distances = [0.0f32; 5];
        for (i, plane) in planes.iter().enumerate() {
            normals[i] = plane.normal.to_vec3();
            distances[i] =
                (plane.distance - plane.normal.dot(self.position)) as f32 - self.frustum_backoff;
        }

        let mut invalid_inside = false;
        for probe in &mut self.probes {
            let p = probe.position + probe.offset;
            let mut inside = true;
            for i in 0..5 {
                if normals[i].dot(p) < distances[i] {
                    inside = false;
                    break;
                }
            }
            if inside {
                probe.flags |= PROBE_FLAG_INSIDE_VIEW;
                if probe.flags & (PROBE_FLAG_VALID | PROBE_FLAG_DISABLED) == 0 {
                    invalid_inside = true;
                }
            } else {
                probe.flags &= !PROBE_FLAG_INSIDE_VIEW;
            }
        }
        self.has_invalid_probes_inside_view = invalid_inside;
    }

    /// Move matching probes from the aged queue into the update list, oldest
    /// first. Unmatched entries keep their order; selected ones re-enter at
    /// the tail.
    fn add_update_probes(&mut self, mask: u8, flags: u8, quota: &mut usize) {
        if *quota == 0 || self.update_probes.len() >= self.max_update_count {
            return;
        }
        let mut selected: Vec<u16> = Vec::new();
        let mut write = 0;
        for read in 0..self.aged_probes.len() {
            let probe_index = self.aged_probes[read];
            let take = *quota > 0
                && self.update_probes.len() < self.max_update_count
                && self.probes[probe_index as usize].flags & mask == flags;
            if take {
                self.update_probes.push(probe_index);
                selected.push(probe_index);
                *quota -= 1;
            } else {
                self.aged_probes[write] = probe_index;
                write += 1;
            }
        }
        self.aged_probes.truncate(write);
        self.aged_probes.extend_from_slice(&selected);
    }

    /// Subset of the update list needing a full static trace into the ray
    /// cache this pass
    pub fn prepare_ray_cache_probes(&mut self) {
        self.ray_cache_probes.clear();
        for &index in &self.update_probes {
            if self.probes[index as usize].flags & PROBE_FLAG_RAY_CACHE_VALID == 0 {
                self.ray_cache_probes.push(index);
            }
        }
    }

    /// Mark the pending ray cache traces as landed
    pub fn validated_ray_caches(&mut self) {
        for &index in &self.ray_cache_probes {
            self.probes[index as usize].flags |= PROBE_FLAG_RAY_CACHE_VALID;
        }
        self.ray_cache_probes.clear();
    }

    pub fn invalidate_all_ray_caches(&mut self) {
        for probe in &mut self.probes {
            probe.flags &= !PROBE_FLAG_RAY_CACHE_VALID;
        }
        self.ray_cache_probes.clear();
    }

    // --- GPU feedback ----------------------------------------------------

    /// Apply relocation feedback, one entry per probe of the last update
    /// list. A probe accepts an offset only while its settle counter is
    /// below the cap and the move is meaningful; accepted moves drop the
    /// ray cache. Returns true when any probe moved.
    pub fn apply_probe_offsets(&mut self, offsets: &[GpuProbeOffset]) -> GiResult<bool> {
        if offsets.len() != self.update_probes.len() {
            return Err(GiError::InvalidArgument(format!(
                "offset feedback count {} does not match {} update probes",
                offsets.len(),
                self.update_probes.len()
            )));
        }

        let settle = self.offset_settle_count;
        let mut moved_any = false;
        for (data, &index) in offsets.iter().zip(&self.update_probes) {
            let probe = &mut self.probes[index as usize];

            let gpu_flags = (data.flags & 0xff) as u8
                & (PROBE_FLAG_NEAR_GEOMETRY | PROBE_FLAG_DISABLED | PROBE_FLAG_DYNAMIC_DISABLE);
            probe.flags &=
                !(PROBE_FLAG_NEAR_GEOMETRY | PROBE_FLAG_DISABLED | PROBE_FLAG_DYNAMIC_DISABLE);
            probe.flags |= gpu_flags;

            if probe.flags & PROBE_FLAG_DISABLED != 0 {
                probe.count_offset_moved = settle;
                continue;
            }
            if probe.count_offset_moved >= settle {
                continue;
            }

            let offset = Vec3::new(data.offset[0], data.offset[1], data.offset[2]);
            probe.count_offset_moved = probe.count_offset_moved.saturating_add(1);
            if (offset - probe.offset).length() >= OFFSET_ACCEPT_DISTANCE {
                probe.offset = offset;
                probe.flags &= !(PROBE_FLAG_RAY_CACHE_VALID | PROBE_FLAG_DYNAMIC_DISABLE);
                moved_any = true;
            } else {
                // stopped moving, settle immediately
                probe.count_offset_moved = settle;
            }
        }
        if moved_any {
            self.probes_moved = true;
        }
        Ok(moved_any)
    }

    /// Apply traced geometry extents, one entry per pending ray cache probe
    pub fn apply_probe_extends(&mut self, extends: &[GpuProbeExtends]) -> GiResult<()> {
        if extends.len() != self.ray_cache_probes.len() {
            return Err(GiError::InvalidArgument(format!(
                "extends feedback count {} does not match {} ray cache probes",
                extends.len(),
                self.ray_cache_probes.len()
            )));
        }
        for (data, &index) in extends.iter().zip(&self.ray_cache_probes) {
            let probe = &mut self.probes[index as usize];
            probe.min_extend = Vec3::new(data.min_extend[0], data.min_extend[1], data.min_extend[2]);
            probe.max_extend = Vec3::new(data.max_extend[0], data.max_extend[1], data.max_extend[2]);
        }
        self.probes_extends_changed = true;
        Ok(())
    }

    // --- invalidation ----------------------------------------------------

    /// Drop every probe back to untraced state
    pub fn invalidate_all(&mut self) {
        for i in 0..self.real_probe_count {
            let probe = &mut self.probes[i];
            probe.flags = 0;
            probe.offset = Vec3::ZERO;
            probe.count_offset_moved = 0;
            probe.min_extend = probe.position - self.detection_box;
            probe.max_extend = probe.position + self.detection_box;
        }
        for word in &mut self.clear_probes {
            *word = u32::MAX;
        }
        self.has_clear_probes = true;
        self.requires_full_update_inside_view = true;
        self.update_probes.clear();
        self.ray_cache_probes.clear();
        self.aged_probes.clear();
        self.aged_probes.extend((0..self.real_probe_count).map(|i| i as u16));
    }

    /// Invalidate probes whose cached geometry extents overlap a world-space
    /// region of changed static content. Soft invalidation leaves disabled
    /// probes alone; hard invalidation resets them so vacated space can
    /// revalidate.
    pub fn invalidate_area(&mut self, area: &DAABB, hard: bool) {
        let local = area.to_local(self.position);
        let min = local.min - self.static_half_enlarge;
        let max = local.max + self.static_half_enlarge;

        for i in 0..self.real_probe_count {
            let probe = &mut self.probes[i];
            if !hard && probe.flags & PROBE_FLAG_DISABLED != 0 {
                continue;
            }
            let overlaps = probe.min_extend.x <= max.x
                && probe.max_extend.x >= min.x
                && probe.min_extend.y <= max.y
                && probe.max_extend.y >= min.y
                && probe.min_extend.z <= max.z
                && probe.max_extend.z >= min.z;
            if !overlaps {
                continue;
            }
            probe.flags &= !(PROBE_FLAG_VALID | PROBE_FLAG_RAY_CACHE_VALID | PROBE_FLAG_SMOOTH_UPDATE);
            if hard {
                probe.flags &=
                    !(PROBE_FLAG_DISABLED | PROBE_FLAG_DYNAMIC_DISABLE | PROBE_FLAG_NEAR_GEOMETRY);
                probe.offset = Vec3::ZERO;
                probe.count_offset_moved = 0;
            }
            self.clear_probes[i / 32] |= 1 << (i % 32);
            self.has_clear_probes = true;
        }
    }

    /// Re-enable dynamically disabled probes inside a region dynamic
    /// geometry moved through. Only probes whose position lies in the
    /// enlarged box are touched; cached rays stay valid.
    pub fn touch_dynamic_area(&mut self, area: &DAABB) {
        let local = area.to_local(self.position);
        let min = local.min - self.dynamic_half_enlarge;
        let max = local.max + self.dynamic_half_enlarge;

        let from = IVec3::new(
            ((min.x - self.field_origin.x) / self.probe_spacing.x).ceil() as i32,
            ((min.y - self.field_origin.y) / self.probe_spacing.y).ceil() as i32,
            ((min.z - self.field_origin.z) / self.probe_spacing.z).ceil() as i32,
        )
        .clamp(IVec3::ZERO, self.grid_coord_clamp);
        let to = IVec3::new(
            ((max.x - self.field_origin.x) / self.probe_spacing.x).floor() as i32,
            ((max.y - self.field_origin.y) / self.probe_spacing.y).floor() as i32,
            ((max.z - self.field_origin.z) / self.probe_spacing.z).floor() as i32,
        )
        .clamp(IVec3::ZERO, self.grid_coord_clamp);

        for y in from.y..=to.y {
            for z in from.z..=to.z {
                for x in from.x..=to.x {
                    let storage = self.shifted_to_storage(IVec3::new(x, y, z));
                    let index = self.index_from_grid_coord(storage);
                    let probe = &mut self.probes[index];
                    let p = probe.position + probe.offset;
                    if p.x >= min.x
                        && p.x <= max.x
                        && p.y >= min.y
                        && p.y <= max.y
                        && p.z >= min.z
                        && p.z <= max.z
                    {
                        probe.flags &= !PROBE_FLAG_DYNAMIC_DISABLE;
                    }
                }
            }
        }
    }

    // --- GPU publication -------------------------------------------------

    /// Positions and flags of the probes to trace, update-list order
    pub fn write_update_probe_positions(&self, out: &mut Vec<GpuProbePosition>) {
        out.clear();
        for &index in &self.update_probes {
            let probe = &self.probes[index as usize];
            let p = probe.position + probe.offset;
            out.push(GpuProbePosition {
                position: [p.x, p.y, p.z],
                flags: probe.flags as u32,
            });
        }
    }

    /// Update-list probe indices packed four per row
    pub fn write_update_probe_indices(&self, out: &mut Vec<[u32; 4]>) {
        Self::write_packed_indices(&self.update_probes, out);
    }

    /// Pending ray cache probe indices packed four per row
    pub fn write_ray_cache_probe_indices(&self, out: &mut Vec<[u32; 4]>) {
        Self::write_packed_indices(&self.ray_cache_probes, out);
    }

    fn write_packed_indices(indices: &[u16], out: &mut Vec<[u32; 4]>) {
        out.clear();
        for chunk in indices.chunks(4) {
            let mut row = [0u32; 4];
            for (slot, &index) in chunk.iter().enumerate() {
                row[slot] = index as u32;
            }
            out.push(row);
        }
    }

    /// Bitfield of probes whose GPU state must clear before tracing, packed
    /// four words per row
    pub fn write_clear_probes(&self, out: &mut Vec<[u32; 4]>) {
        out.clear();
        for chunk in self.clear_probes.chunks(4) {
            let mut row = [0u32; 4];
            row[..chunk.len()].copy_from_slice(chunk);
            out.push(row);
        }
    }

    pub fn clear_clear_probes(&mut self) {
        for word in &mut self.clear_probes {
            *word = 0;
        }
        self.has_clear_probes = false;
    }

    // --- accessors -------------------------------------------------------

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn position(&self) -> Vec3d {
        self.position
    }

    pub fn probe_spacing(&self) -> Vec3 {
        self.probe_spacing
    }

    pub fn probe_count(&self) -> IVec3 {
        self.probe_count
    }

    pub fn real_probe_count(&self) -> usize {
        self.real_probe_count
    }

    pub fn field_size(&self) -> Vec3 {
        self.field_size
    }

    pub fn field_origin(&self) -> Vec3 {
        self.field_origin
    }

    pub fn detection_box(&self) -> Vec3 {
        self.detection_box
    }

    /// World-space box the cascade can detect geometry in
    pub fn detection_bounds(&self) -> DAABB {
        let half = Vec3d::from_vec3(self.detection_box);
        DAABB::new(self.position - half, self.position + half)
    }

    pub fn max_probe_distance(&self) -> f32 {
        self.max_probe_distance
    }

    pub fn move_max_offset(&self) -> Vec3 {
        self.move_max_offset
    }

    pub fn move_min_dist_to_surface(&self) -> f32 {
        self.move_min_dist_to_surface
    }

    /// Shadow acne bias scaled to this cascade's probe density
    pub fn self_shadow_bias(&self, bias: f32) -> f32 {
        bias * self.probe_spacing.min_component()
    }

    pub fn grid_coord_shift(&self) -> IVec3 {
        self.grid_coord_shift
    }

    pub fn probes(&self) -> &[Probe] {
        &self.probes
    }

    pub fn probe(&self, index: usize) -> &Probe {
        &self.probes[index]
    }

    pub fn update_probes(&self) -> &[u16] {
        &self.update_probes
    }

    pub fn ray_cache_probes(&self) -> &[u16] {
        &self.ray_cache_probes
    }

    pub fn max_update_count(&self) -> usize {
        self.max_update_count
    }

    pub fn has_clear_probes(&self) -> bool {
        self.has_clear_probes
    }

    pub fn has_invalid_probes_inside_view(&self) -> bool {
        self.has_invalid_probes_inside_view
    }

    pub fn requires_full_update_inside_view(&self) -> bool {
        self.requires_full_update_inside_view
    }

    pub fn set_requires_full_update_inside_view(&mut self) {
        self.requires_full_update_inside_view = true;
    }

    /// True when offset feedback moved probes since the last check
    pub fn take_probes_moved(&mut self) -> bool {
        std::mem::replace(&mut self.probes_moved, false)
    }

    pub fn take_probes_extends_changed(&mut self) -> bool {
        std::mem::replace(&mut self.probes_extends_changed, false)
    }

    pub fn stats(&self) -> CascadeStats {
        let mut stats = CascadeStats {
            update_probe_count: self.update_probes.len(),
            ray_cache_probe_count: self.ray_cache_probes.len(),
            ..CascadeStats::default()
        };
        for probe in &self.probes {
            if probe.flags & PROBE_FLAG_VALID != 0 {
                stats.valid_probe_count += 1;
            }
            if probe.flags & PROBE_FLAG_DISABLED != 0 {
                stats.disabled_probe_count += 1;
            }
            if probe.flags & PROBE_FLAG_INSIDE_VIEW != 0 {
                stats.inside_view_count += 1;
            }
        }
        stats
    }

    // --- persistence -----------------------------------------------------

    pub fn to_state(&self) -> CascadeState {
        CascadeState {
            position: self.position,
            last_ref_position: self.last_ref_position,
            grid_coord_shift: self.grid_coord_shift,
            probes: self.probes.clone(),
            aged_probes: self.aged_probes.clone(),
        }
    }

    pub fn apply_state(&mut self, state: CascadeState) -> GiResult<()> {
        if state.probes.len() != self.real_probe_count
            || state.aged_probes.len() != self.real_probe_count
        {
            return Err(GiError::InvalidArgument(format!(
                "cascade state holds {} probes, expected {}",
                state.probes.len(),
                self.real_probe_count
            )));
        }
        self.position = state.position;
        self.last_ref_position = state.last_ref_position;
        self.grid_coord_shift = state.grid_coord_shift.rem_euclid(self.probe_count);
        self.probes = state.probes;
        self.aged_probes = state.aged_probes;
        self.update_probes.clear();
        self.ray_cache_probes.clear();
        self.requires_full_update_inside_view = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GiQuality;

    fn small_config() -> GiConfig {
        GiConfig {
            probe_count: IVec3::new(8, 4, 8),
            quality: GiQuality::VeryLow,
            ..GiConfig::default()
        }
    }

    fn cascade() -> Cascade {
        Cascade::new(0, Vec3::splat(1.0), &small_config())
    }

    fn everything() -> Frustum {
        Frustum::everything()
    }

    #[test]
    fn test_coordinate_roundtrip() {
        let c = cascade();
        for index in [0usize, 1, 7, 8, 63, 64, 255] {
            let coord = c.grid_coord_from_index(index);
            assert_eq!(c.index_from_grid_coord(coord), index);
        }
        let coord = IVec3::new(3, 2, 5);
        assert_eq!(c.storage_to_shifted(c.shifted_to_storage(coord)), coord);
    }

    #[test]
    fn test_initial_probe_layout() {
        let c = cascade();
        assert_eq!(c.real_probe_count(), 8 * 4 * 8);
        // corner probe sits at the field origin
        let first = c.probe(0);
        assert_eq!(first.shifted_coord, IVec3::ZERO);
        assert!((first.position - c.field_origin()).length() < 1e-6);
        // center of the grid is near local zero
        let mid = c.grid_position(IVec3::new(3, 1, 3)) + c.probe_spacing() * 0.5;
        assert!(mid.length() < c.probe_spacing().length());
    }

    #[test]
    fn test_probe_indices_at_grid_limit() {
        let config = GiConfig {
            probe_count: IVec3::new(64, 16, 64),
            quality: GiQuality::VeryLow,
            ..GiConfig::default()
        };
        config.validate().unwrap();
        let mut c = Cascade::new(0, Vec3::splat(1.0), &config);
        assert_eq!(c.real_probe_count(), 65_536);
        // every probe keeps a distinct index up to the u16 limit
        assert_eq!(c.probe(65_535).index, 65_535);
        assert_ne!(c.probe(65_535).index, c.probe(0).index);
        // the aged queue covers the whole grid, selection stays funded
        c.find_probes_to_update(&everything());
        assert_eq!(c.update_probes().len(), c.max_update_count());
    }

    #[test]
    fn test_reposition_hysteresis() {
        let mut c = cascade();
        // wander within 80% of spacing: no shift
        assert!(!c.update_position(Vec3d::new(0.7, 0.0, 0.0)));
        assert!(!c.update_position(Vec3d::new(-0.7, 0.0, 0.3)));
        assert_eq!(c.position(), Vec3d::ZERO);

        // cross the threshold: grid snaps
        assert!(c.update_position(Vec3d::new(1.2, 0.0, 0.0)));
        assert_eq!(c.position(), Vec3d::new(1.0, 0.0, 0.0));
        assert_eq!(c.grid_coord_shift(), IVec3::new(1, 0, 0));
    }

    #[test]
    fn test_reposition_invalidates_boundary_layer() {
        let mut c = cascade();
        for probe in &mut c.probes {
            probe.flags = PROBE_FLAG_VALID | PROBE_FLAG_RAY_CACHE_VALID;
        }
        assert!(c.update_position(Vec3d::new(1.0, 0.0, 0.0)));

        // exactly one yz-plane of probes entered the field and lost state
        let invalidated = c.probes().iter().filter(|p| p.flags == 0).count();
        assert_eq!(invalidated, 4 * 8);
        assert!(c.has_clear_probes());

        // the invalidated probes sit on the new max-x boundary
        for probe in c.probes() {
            if probe.flags == 0 {
                assert_eq!(probe.shifted_coord.x, 7);
            } else {
                assert_eq!(probe.flags, PROBE_FLAG_VALID | PROBE_FLAG_RAY_CACHE_VALID);
            }
        }
    }

    #[test]
    fn test_survivor_extents_rebased() {
        let mut c = cascade();
        for probe in &mut c.probes {
            probe.flags = PROBE_FLAG_VALID;
            probe.min_extend = Vec3::ZERO;
            probe.max_extend = Vec3::ONE;
        }
        c.update_position(Vec3d::new(1.0, 0.0, 0.0));
        let survivor = c
            .probes()
            .iter()
            .find(|p| p.flags & PROBE_FLAG_VALID != 0)
            .unwrap();
        // anchor moved +1 in x, local extents move -1
        assert!((survivor.min_extend - Vec3::new(-1.0, 0.0, 0.0)).length() < 1e-6);
        assert!((survivor.max_extend - Vec3::new(0.0, 1.0, 1.0)).length() < 1e-6);
    }

    #[test]
    fn test_full_update_selects_inside_view_only_once() {
        let mut c = cascade();
        assert!(c.requires_full_update_inside_view());
        c.find_probes_to_update(&everything());
        assert!(!c.requires_full_update_inside_view());
        assert_eq!(c.update_probes().len(), c.max_update_count());
    }

    #[test]
    fn test_selection_budget_respected() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        assert!(c.update_probes().len() <= c.max_update_count());
        for window in c.update_probes().windows(2) {
            assert_ne!(window[0], window[1]);
        }
    }

    #[test]
    fn test_invalid_probes_selected_before_stale() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        // everything valid now except a handful we invalidate by hand
        for probe in &mut c.probes {
            probe.flags |= PROBE_FLAG_VALID | PROBE_FLAG_INSIDE_VIEW;
        }
        for i in 0..10 {
            c.probes[i * 3].flags &= !(PROBE_FLAG_VALID | PROBE_FLAG_RAY_CACHE_VALID);
        }
        c.find_probes_to_update(&everything());
        let selected = c.update_probes();
        let invalid_positions: Vec<usize> = (0..10).map(|i| i * 3).collect();
        // all ten invalid probes are in the selection, ahead of any valid one
        for &probe_index in &selected[..10] {
            assert!(invalid_positions.contains(&(probe_index as usize)));
        }
    }

    #[test]
    fn test_selection_marks_probes_valid() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        for &index in c.update_probes() {
            let probe = c.probe(index as usize);
            assert!(probe.flags & PROBE_FLAG_VALID != 0);
            // fresh probes trace without blending
            assert!(probe.flags & PROBE_FLAG_SMOOTH_UPDATE == 0);
        }
    }

    #[test]
    fn test_aged_queue_rotates_selection() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());

        // pin every probe to the cheap retrace tier
        for probe in &mut c.probes {
            probe.flags = PROBE_FLAG_VALID | PROBE_FLAG_RAY_CACHE_VALID;
        }
        c.find_probes_to_update(&everything());
        let first: Vec<u16> = c.update_probes().to_vec();
        c.find_probes_to_update(&everything());
        let second: Vec<u16> = c.update_probes().to_vec();

        assert!(!first.is_empty());
        assert_eq!(first.len(), second.len());
        // within one tier, consecutive passes walk disjoint batches until
        // the queue wraps
        for index in &second {
            assert!(!first.contains(index));
        }
    }

    #[test]
    fn test_ray_cache_probe_flow() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        c.prepare_ray_cache_probes();
        assert_eq!(c.ray_cache_probes().len(), c.update_probes().len());

        c.validated_ray_caches();
        assert!(c.ray_cache_probes().is_empty());
        for &index in c.update_probes() {
            assert!(c.probe(index as usize).flags & PROBE_FLAG_RAY_CACHE_VALID != 0);
        }

        c.invalidate_all_ray_caches();
        assert!(c.probes().iter().all(|p| p.flags & PROBE_FLAG_RAY_CACHE_VALID == 0));
    }

    #[test]
    fn test_offset_feedback_settles() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        let count = c.update_probes().len();
        let probe_index = c.update_probes()[0] as usize;

        let mut feedback = vec![GpuProbeOffset::default(); count];
        feedback[0] = GpuProbeOffset { offset: [0.2, 0.0, 0.0], flags: 0 };
        assert!(c.apply_probe_offsets(&feedback).unwrap());
        assert_eq!(c.probe(probe_index).count_offset_moved, 1);
        assert!((c.probe(probe_index).offset.x - 0.2).abs() < 1e-6);

        // sub-threshold movement settles the probe immediately
        feedback[0] = GpuProbeOffset { offset: [0.21, 0.0, 0.0], flags: 0 };
        assert!(!c.apply_probe_offsets(&feedback).unwrap());
        assert_eq!(c.probe(probe_index).count_offset_moved, 5);

        // settled probes ignore further feedback
        feedback[0] = GpuProbeOffset { offset: [1.0, 0.0, 0.0], flags: 0 };
        c.apply_probe_offsets(&feedback).unwrap();
        assert!((c.probe(probe_index).offset.x - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_offset_feedback_disabled_jumps_to_cap() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        let count = c.update_probes().len();
        let probe_index = c.update_probes()[0] as usize;

        let mut feedback = vec![GpuProbeOffset::default(); count];
        feedback[0] = GpuProbeOffset {
            offset: [0.0, 0.0, 0.0],
            flags: PROBE_FLAG_DISABLED as u32,
        };
        c.apply_probe_offsets(&feedback).unwrap();
        let probe = c.probe(probe_index);
        assert!(probe.flags & PROBE_FLAG_DISABLED != 0);
        assert_eq!(probe.count_offset_moved, 5);
    }

    #[test]
    fn test_offset_feedback_wrong_length() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        assert!(c.apply_probe_offsets(&[]).is_err());
    }

    #[test]
    fn test_accepted_move_drops_ray_cache() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        c.prepare_ray_cache_probes();
        c.validated_ray_caches();
        let count = c.update_probes().len();
        let probe_index = c.update_probes()[0] as usize;

        let mut feedback = vec![GpuProbeOffset::default(); count];
        feedback[0] = GpuProbeOffset { offset: [0.0, 0.3, 0.0], flags: 0 };
        c.apply_probe_offsets(&feedback).unwrap();
        assert!(c.probe(probe_index).flags & PROBE_FLAG_RAY_CACHE_VALID == 0);
    }

    #[test]
    fn test_invalidate_area_overlap_only() {
        let mut c = cascade();
        for probe in &mut c.probes {
            probe.flags = PROBE_FLAG_VALID | PROBE_FLAG_RAY_CACHE_VALID;
            probe.min_extend = probe.position - Vec3::splat(0.4);
            probe.max_extend = probe.position + Vec3::splat(0.4);
        }
        // box overlapping the extents of probes near the origin only
        let area = DAABB::new(Vec3d::new(-0.5, -0.5, -0.5), Vec3d::new(0.5, 0.5, 0.5));
        c.invalidate_area(&area, false);

        let invalid = c
            .probes()
            .iter()
            .filter(|p| p.flags & PROBE_FLAG_VALID == 0)
            .count();
        assert!(invalid > 0);
        assert!(invalid < c.real_probe_count());
        // far probes untouched
        let far = c.index_from_grid_coord(c.shifted_to_storage(IVec3::ZERO));
        assert!(c.probe(far).flags & PROBE_FLAG_VALID != 0);
        assert!(c.has_clear_probes());
    }

    #[test]
    fn test_invalidate_area_soft_skips_disabled() {
        let mut c = cascade();
        for probe in &mut c.probes {
            probe.flags = PROBE_FLAG_DISABLED;
            probe.min_extend = probe.position - Vec3::splat(0.4);
            probe.max_extend = probe.position + Vec3::splat(0.4);
            probe.count_offset_moved = 5;
        }
        let area = DAABB::new(Vec3d::splat(-10.0), Vec3d::splat(10.0));
        c.invalidate_area(&area, false);
        assert!(c.probes().iter().all(|p| p.flags & PROBE_FLAG_DISABLED != 0));

        c.invalidate_area(&area, true);
        assert!(c.probes().iter().all(|p| p.flags == 0));
        assert!(c.probes().iter().all(|p| p.count_offset_moved == 0));
    }

    #[test]
    fn test_touch_dynamic_area() {
        let mut c = cascade();
        for probe in &mut c.probes {
            probe.flags = PROBE_FLAG_VALID | PROBE_FLAG_DYNAMIC_DISABLE | PROBE_FLAG_RAY_CACHE_VALID;
        }
        let area = DAABB::new(Vec3d::new(-0.5, -0.5, -0.5), Vec3d::new(0.5, 0.5, 0.5));
        c.touch_dynamic_area(&area);

        let touched = c
            .probes()
            .iter()
            .filter(|p| p.flags & PROBE_FLAG_DYNAMIC_DISABLE == 0)
            .count();
        assert!(touched > 0);
        assert!(touched < c.real_probe_count());
        // touched probes keep their ray cache
        for probe in c.probes() {
            assert!(probe.flags & PROBE_FLAG_RAY_CACHE_VALID != 0);
        }
    }

    #[test]
    fn test_invalidate_all() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        c.invalidate_all();
        assert!(c.probes().iter().all(|p| p.flags == 0));
        assert!(c.requires_full_update_inside_view());
        assert!(c.has_clear_probes());
        assert!(c.update_probes().is_empty());
    }

    #[test]
    fn test_write_buffers() {
        let mut c = cascade();
        c.find_probes_to_update(&everything());
        c.prepare_ray_cache_probes();

        let mut positions = Vec::new();
        c.write_update_probe_positions(&mut positions);
        assert_eq!(positions.len(), c.update_probes().len());

        let mut indices = Vec::new();
        c.write_update_probe_indices(&mut indices);
        assert_eq!(indices.len(), (c.update_probes().len() + 3) / 4);
        assert_eq!(indices[0][0], c.update_probes()[0] as u32);

        let mut clear = Vec::new();
        c.write_clear_probes(&mut clear);
        assert_eq!(clear.len(), (c.real_probe_count() / 32 + 3) / 4);
    }

    #[test]
    fn test_state_roundtrip() {
        let mut c = cascade();
        c.update_position(Vec3d::new(5.0, 2.0, -3.0));
        c.find_probes_to_update(&everything());
        let state = c.to_state();

        let bytes = bincode::serialize(&state).unwrap();
        let restored: CascadeState = bincode::deserialize(&bytes).unwrap();

        let mut fresh = cascade();
        fresh.apply_state(restored).unwrap();
        assert_eq!(fresh.position(), c.position());
        assert_eq!(fresh.grid_coord_shift(), c.grid_coord_shift());
        assert_eq!(fresh.probes().len(), c.probes().len());
        for (a, b) in fresh.probes().iter().zip(c.probes()) {
            assert_eq!(a.flags, b.flags);
            assert_eq!(a.shifted_coord, b.shifted_coord);
        }
    }

    #[test]
    fn test_state_rejects_wrong_size() {
        let mut c = cascade();
        let mut state = c.to_state();
        state.probes.pop();
        assert!(c.apply_state(state).is_err());
    }

    #[test]
    fn test_derived_tuning_values() {
        let c = Cascade::new(1, Vec3::new(2.0, 1.0, 2.0), &small_config());
        assert!((c.max_probe_distance() - Vec3::new(2.0, 1.0, 2.0).length() * 1.5).abs() < 1e-6);
        assert!((c.move_max_offset().x - 0.98).abs() < 1e-6);
        assert!((c.move_min_dist_to_surface() - 0.25).abs() < 1e-6);
        assert!((c.self_shadow_bias(0.35) - 0.35).abs() < 1e-6);
        assert!(!c.requires_full_update_inside_view() || c.index() == 1);
    }
}
