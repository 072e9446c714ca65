//! Configuration for the probe field
//!
//! All tunables live here so a running field can be snapshotted and rebuilt
//! with identical behavior. Defaults mirror the values the renderer ships
//! with; [`GiQuality`] scales the per-frame probe budget and ray counts.

use candela_math::{IVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::error::{GiError, GiResult};

/// Quality presets scaling per-frame probe update budget and rays per probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GiQuality {
    VeryLow,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl GiQuality {
    /// Maximum number of probes traced per update pass
    pub fn probe_budget(self) -> usize {
        match self {
            GiQuality::VeryLow => 128,
            GiQuality::Low => 256,
            GiQuality::Medium => 512,
            GiQuality::High => 1024,
            GiQuality::VeryHigh => 2048,
        }
    }

    /// Rays traced per probe per update
    pub fn rays_per_probe(self) -> usize {
        match self {
            GiQuality::VeryLow => 32,
            GiQuality::Low => 64,
            GiQuality::Medium => 128,
            GiQuality::High => 192,
            GiQuality::VeryHigh => 256,
        }
    }

    /// Probes per row in the trace sample image. The row width times
    /// rays-per-probe stays within a 8192 texel line.
    pub fn probes_per_line(self) -> usize {
        (8192 / self.rays_per_probe()).min(self.probe_budget()).max(1)
    }
}

/// Probe field configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GiConfig {
    /// Probes along each grid axis, identical for every cascade
    pub probe_count: IVec3,
    /// Number of cascades (1 to 4)
    pub cascade_count: usize,
    /// World-space size of the largest cascade field
    pub field_size: Vec3,
    pub quality: GiQuality,

    /// Cap applied to per-probe geometry detection range, in meters
    pub max_detection_range: f32,
    /// Camera travel distance before the tracked area recomputes content
    pub update_threshold: f64,
    /// Components below this importance are ignored entirely
    pub min_importance: f32,
    /// Instance slot capacity
    pub max_instances: usize,
    pub bvh_max_depth: u32,

    /// Per-probe irradiance octahedral map edge length, texels
    pub irradiance_map_size: u32,
    /// Per-probe distance octahedral map edge length, texels
    pub distance_map_size: u32,
    pub depth_sharpness: f32,
    /// Temporal blend weight for re-traced probes
    pub hysteresis: f32,
    pub normal_bias: f32,
    pub irradiance_gamma: f32,
    pub self_shadow_bias: f32,

    /// Offset feedback iterations before a probe stops relocating
    pub offset_settle_count: u8,
    /// Frustum planes are pushed back by this fraction of the grid spacing
    /// diagonal, so probes just outside the view still count as inside
    pub frustum_backoff_factor: f32,
    /// Fraction of the probe spacing the camera must cross before the grid
    /// shifts along that axis
    pub reposition_hysteresis: f32,
}

impl Default for GiConfig {
    fn default() -> Self {
        Self {
            probe_count: IVec3::new(32, 8, 32),
            cascade_count: 4,
            field_size: Vec3::new(124.0, 28.0, 124.0),
            quality: GiQuality::Medium,
            max_detection_range: 50.0,
            update_threshold: 8.0,
            min_importance: 0.0,
            max_instances: 4096,
            bvh_max_depth: 12,
            irradiance_map_size: 8,
            distance_map_size: 16,
            depth_sharpness: 50.0,
            hysteresis: 0.9,
            normal_bias: 0.25,
            irradiance_gamma: 5.0,
            self_shadow_bias: 0.35,
            offset_settle_count: 5,
            frustum_backoff_factor: 0.5,
            reposition_hysteresis: 0.8,
        }
    }
}

impl GiConfig {
    pub fn validate(&self) -> GiResult<()> {
        let count = self.probe_count;
        if count.x < 2 || count.y < 2 || count.z < 2 {
            return Err(GiError::InvalidArgument(
                "probe count must be at least 2 per axis".into(),
            ));
        }
        // probe indices travel as u16 through the update lists and GPU
        // buffers
        let total = count.x as usize * count.y as usize * count.z as usize;
        if total > u16::MAX as usize + 1 {
            return Err(GiError::InvalidArgument(format!(
                "probe grid holds {} probes, the limit is {}",
                total,
                u16::MAX as usize + 1
            )));
        }
        if self.cascade_count < 1 || self.cascade_count > 4 {
            return Err(GiError::InvalidArgument(
                "cascade count must be between 1 and 4".into(),
            ));
        }
        if self.field_size.x <= 0.0 || self.field_size.y <= 0.0 || self.field_size.z <= 0.0 {
            return Err(GiError::InvalidArgument("field size must be positive".into()));
        }
        if self.hysteresis <= 0.0 || self.hysteresis > 1.0 {
            return Err(GiError::InvalidArgument("hysteresis must be in (0, 1]".into()));
        }
        if self.reposition_hysteresis <= 0.0 || self.reposition_hysteresis >= 1.0 {
            return Err(GiError::InvalidArgument(
                "reposition hysteresis must be in (0, 1)".into(),
            ));
        }
        if self.offset_settle_count == 0 {
            return Err(GiError::InvalidArgument(
                "offset settle count must be at least 1".into(),
            ));
        }
        if self.max_instances == 0 {
            return Err(GiError::InvalidArgument("instance capacity must be positive".into()));
        }
        if self.bvh_max_depth == 0 {
            return Err(GiError::InvalidArgument("BVH depth must be at least 1".into()));
        }
        Ok(())
    }

    /// Total probes per cascade
    pub fn real_probe_count(&self) -> usize {
        (self.probe_count.x * self.probe_count.y * self.probe_count.z) as usize
    }

    /// Probe spacing of the largest cascade
    pub fn largest_spacing(&self) -> Vec3 {
        let clamp = (self.probe_count - IVec3::ONE).to_vec3();
        self.field_size / clamp
    }

    /// Probe spacings from the innermost cascade outward.
    ///
    /// The smallest spacing is an eighth of the largest, capped at one meter,
    /// the in-between cascades fan out from there to the full field.
    pub fn cascade_spacings(&self) -> Vec<Vec3> {
        let largest = self.largest_spacing();
        let smallest = (largest * (1.0 / 8.0)).min(Vec3::ONE);
        let second = smallest * 2.0;
        let third = second.lerp(largest, 1.0 / 3.0);
        match self.cascade_count {
            1 => vec![largest],
            2 => vec![smallest, largest],
            3 => vec![smallest, third, largest],
            _ => vec![smallest, second, third, largest],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = GiConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.real_probe_count(), 8192);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = GiConfig::default();
        config.probe_count = IVec3::new(32, 1, 32);
        assert!(config.validate().is_err());

        let mut config = GiConfig::default();
        config.cascade_count = 5;
        assert!(config.validate().is_err());

        let mut config = GiConfig::default();
        config.reposition_hysteresis = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_probe_grid_past_index_range() {
        // 262144 probes cannot be addressed by the u16 probe index
        let mut config = GiConfig::default();
        config.probe_count = IVec3::new(64, 64, 64);
        assert!(config.validate().is_err());

        // exactly 65536 probes still fits, indices run 0..=65535
        let mut config = GiConfig::default();
        config.probe_count = IVec3::new(64, 16, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cascade_spacings_ordered() {
        let config = GiConfig::default();
        let spacings = config.cascade_spacings();
        assert_eq!(spacings.len(), 4);
        for pair in spacings.windows(2) {
            assert!(pair[0].x <= pair[1].x);
            assert!(pair[0].y <= pair[1].y);
            assert!(pair[0].z <= pair[1].z);
        }
        // largest cascade spans the configured field
        let clamp = (config.probe_count - IVec3::ONE).to_vec3();
        let span = spacings[3] * clamp;
        assert!((span - config.field_size).length() < 1e-4);
    }

    #[test]
    fn test_smallest_spacing_capped_at_one_meter() {
        let mut config = GiConfig::default();
        config.field_size = Vec3::new(620.0, 140.0, 620.0);
        let spacings = config.cascade_spacings();
        assert!(spacings[0].x <= 1.0);
        assert!(spacings[0].y <= 1.0);
    }

    #[test]
    fn test_quality_budgets_monotonic() {
        let qualities = [
            GiQuality::VeryLow,
            GiQuality::Low,
            GiQuality::Medium,
            GiQuality::High,
            GiQuality::VeryHigh,
        ];
        for pair in qualities.windows(2) {
            assert!(pair[0].probe_budget() < pair[1].probe_budget());
            assert!(pair[0].rays_per_probe() < pair[1].rays_per_probe());
        }
    }

    #[test]
    fn test_config_serialization() {
        let config = GiConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: GiConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, restored);
    }
}
