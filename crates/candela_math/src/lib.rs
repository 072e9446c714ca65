//! # Candela Math
//!
//! Math primitives for the candela global illumination crates.
//!
//! ## Features
//!
//! - **Vectors**: single-precision [`Vec2`]/[`Vec3`]/[`Vec4`], grid-coordinate
//!   [`IVec3`] and double-precision [`Vec3d`] for world-space positions
//! - **Matrices**: column-major [`Mat4`] and [`DMat4`] with the rebasing
//!   helpers the probe field uses to stay near the local origin
//! - **Bounds**: [`AABB`] and [`DAABB`] axis-aligned boxes
//! - **Frustum**: the five near-side view planes used for probe visibility

pub mod vector;
pub mod dvector;
pub mod matrix;
pub mod bounds;
pub mod frustum;

// Vector types
pub use vector::{Vec2, Vec3, Vec4, IVec3};
pub use dvector::Vec3d;

// Matrix types
pub use matrix::{Mat4, DMat4};

// Bounding volumes
pub use bounds::{AABB, DAABB};

// View frustum
pub use frustum::{Frustum, Plane};

/// Linear interpolation between two scalars
#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Commonly used types
pub mod prelude {
    pub use crate::vector::{Vec2, Vec3, Vec4, IVec3};
    pub use crate::dvector::Vec3d;
    pub use crate::matrix::{Mat4, DMat4};
    pub use crate::bounds::{AABB, DAABB};
    pub use crate::frustum::{Frustum, Plane};
    pub use crate::lerp;
}
