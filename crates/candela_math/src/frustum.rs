//! View frustum planes for probe visibility classification
//!
//! The camera subsystem hands the GI core five world-space half-space planes
//! (near, left, right, top, bottom). Plane normals point into the frustum.
//! The far plane is not used: the probe field is far smaller than the view
//! distance, so probes behind the near-side planes are all that matters.

use crate::dvector::Vec3d;

/// A world-space half-space plane, `normal . p >= distance` is the inside
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Plane {
    pub normal: Vec3d,
    pub distance: f64,
}

impl Plane {
    #[inline]
    pub const fn new(normal: Vec3d, distance: f64) -> Self {
        Self { normal, distance }
    }

    /// Plane through `point` with the given inward normal
    #[inline]
    pub fn from_point_normal(point: Vec3d, normal: Vec3d) -> Self {
        Self {
            normal,
            distance: normal.dot(point),
        }
    }

    /// Signed distance, positive on the inside
    #[inline]
    pub fn distance_to_point(&self, point: Vec3d) -> f64 {
        self.normal.dot(point) - self.distance
    }
}

/// The five near-side frustum planes, normals pointing inward
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Frustum {
    pub near: Plane,
    pub left: Plane,
    pub right: Plane,
    pub top: Plane,
    pub bottom: Plane,
}

impl Frustum {
    pub const fn new(near: Plane, left: Plane, right: Plane, top: Plane, bottom: Plane) -> Self {
        Self { near, left, right, top, bottom }
    }

    /// A frustum containing all of space; useful as a neutral default
    pub fn everything() -> Self {
        let all = Plane::new(Vec3d::new(0.0, 1.0, 0.0), f64::MIN);
        Self::new(all, all, all, all, all)
    }

    pub fn planes(&self) -> [Plane; 5] {
        [self.near, self.left, self.right, self.top, self.bottom]
    }

    pub fn contains_point(&self, point: Vec3d) -> bool {
        self.planes()
            .iter()
            .all(|plane| plane.distance_to_point(point) >= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plane_distance() {
        let plane = Plane::from_point_normal(Vec3d::new(0.0, 0.0, 5.0), Vec3d::new(0.0, 0.0, 1.0));
        assert!((plane.distance_to_point(Vec3d::new(0.0, 0.0, 7.0)) - 2.0).abs() < 1e-12);
        assert!(plane.distance_to_point(Vec3d::new(0.0, 0.0, 3.0)) < 0.0);
    }

    #[test]
    fn test_frustum_contains() {
        // axis-aligned box pretending to be a frustum
        let frustum = Frustum::new(
            Plane::from_point_normal(Vec3d::new(0.0, 0.0, -1.0), Vec3d::new(0.0, 0.0, 1.0)),
            Plane::from_point_normal(Vec3d::new(-1.0, 0.0, 0.0), Vec3d::new(1.0, 0.0, 0.0)),
            Plane::from_point_normal(Vec3d::new(1.0, 0.0, 0.0), Vec3d::new(-1.0, 0.0, 0.0)),
            Plane::from_point_normal(Vec3d::new(0.0, 1.0, 0.0), Vec3d::new(0.0, -1.0, 0.0)),
            Plane::from_point_normal(Vec3d::new(0.0, -1.0, 0.0), Vec3d::new(0.0, 1.0, 0.0)),
        );
        assert!(frustum.contains_point(Vec3d::ZERO));
        assert!(!frustum.contains_point(Vec3d::new(2.0, 0.0, 0.0)));
        assert!(frustum.contains_point(Vec3d::new(0.0, 0.0, 100.0)));
    }

    #[test]
    fn test_frustum_everything() {
        let frustum = Frustum::everything();
        assert!(frustum.contains_point(Vec3d::new(1e9, -1e9, 1e9)));
    }
}
