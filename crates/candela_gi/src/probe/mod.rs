//! Probe grid cascades and the field driving them

pub mod cascade;
pub mod field;

pub use cascade::{
    Cascade, CascadeState, CascadeStats, GpuProbeExtends, GpuProbeOffset, GpuProbePosition, Probe,
    PROBE_FLAG_DISABLED, PROBE_FLAG_DYNAMIC_DISABLE, PROBE_FLAG_INSIDE_VIEW,
    PROBE_FLAG_NEAR_GEOMETRY, PROBE_FLAG_RAY_CACHE_VALID, PROBE_FLAG_SMOOTH_UPDATE,
    PROBE_FLAG_VALID,
};
pub use field::{spherical_fibonacci, FieldParams, FieldState, FieldStats, ProbeField};
