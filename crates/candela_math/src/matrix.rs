//! Matrix types for instance transforms
//!
//! Scene instances arrive with double-precision world matrices; the GI core
//! rebases them against the field origin and works in single precision from
//! there (`DMat4` to `Mat4`).

use crate::vector::{Vec3, Vec4};
use crate::dvector::Vec3d;
use core::ops::Mul;

/// 4x4 single-precision matrix (column-major)
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(C, align(16))]
pub struct Mat4 {
    pub cols: [Vec4; 4],
}

impl Mat4 {
    pub const IDENTITY: Self = Self {
        cols: [Vec4::X, Vec4::Y, Vec4::Z, Vec4::W],
    };

    #[inline]
    pub const fn from_cols(c0: Vec4, c1: Vec4, c2: Vec4, c3: Vec4) -> Self {
        Self { cols: [c0, c1, c2, c3] }
    }

    #[inline]
    pub fn from_translation(translation: Vec3) -> Self {
        Self::from_cols(Vec4::X, Vec4::Y, Vec4::Z, translation.extend(1.0))
    }

    #[inline]
    pub fn from_scale(scale: Vec3) -> Self {
        Self::from_cols(
            Vec4::new(scale.x, 0.0, 0.0, 0.0),
            Vec4::new(0.0, scale.y, 0.0, 0.0),
            Vec4::new(0.0, 0.0, scale.z, 0.0),
            Vec4::W,
        )
    }

    #[inline]
    pub fn from_rotation_y(angle: f32) -> Self {
        let (sin, cos) = angle.sin_cos();
        Self::from_cols(
            Vec4::new(cos, 0.0, -sin, 0.0),
            Vec4::Y,
            Vec4::new(sin, 0.0, cos, 0.0),
            Vec4::W,
        )
    }

    #[inline]
    pub fn transpose(&self) -> Self {
        Self::from_cols(
            Vec4::new(self.cols[0].x, self.cols[1].x, self.cols[2].x, self.cols[3].x),
            Vec4::new(self.cols[0].y, self.cols[1].y, self.cols[2].y, self.cols[3].y),
            Vec4::new(self.cols[0].z, self.cols[1].z, self.cols[2].z, self.cols[3].z),
            Vec4::new(self.cols[0].w, self.cols[1].w, self.cols[2].w, self.cols[3].w),
        )
    }

    /// Get the translation component
    #[inline]
    pub fn translation(&self) -> Vec3 {
        self.cols[3].truncate()
    }

    /// Transform a point (w=1)
    #[inline]
    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        let v = *self * point.extend(1.0);
        v.truncate()
    }

    /// Transform a direction (w=0)
    #[inline]
    pub fn transform_vector(&self, vector: Vec3) -> Vec3 {
        (*self * vector.extend(0.0)).truncate()
    }

    /// Compute the inverse of this matrix
    pub fn inverse(&self) -> Self {
        let a = self.cols[0];
        let b = self.cols[1];
        let c = self.cols[2];
        let d = self.cols[3];

        let s0 = a.x * b.y - b.x * a.y;
        let s1 = a.x * b.z - b.x * a.z;
        let s2 = a.x * b.w - b.x * a.w;
        let s3 = a.y * b.z - b.y * a.z;
        let s4 = a.y * b.w - b.y * a.w;
        let s5 = a.z * b.w - b.z * a.w;

        let c5 = c.z * d.w - d.z * c.w;
        let c4 = c.y * d.w - d.y * c.w;
        let c3 = c.y * d.z - d.y * c.z;
        let c2 = c.x * d.w - d.x * c.w;
        let c1 = c.x * d.z - d.x * c.z;
        let c0 = c.x * d.y - d.x * c.y;

        let det = s0 * c5 - s1 * c4 + s2 * c3 + s3 * c2 - s4 * c1 + s5 * c0;
        let inv_det = 1.0 / det;

        Self::from_cols(
            Vec4::new(
                (b.y * c5 - b.z * c4 + b.w * c3) * inv_det,
                (-a.y * c5 + a.z * c4 - a.w * c3) * inv_det,
                (d.y * s5 - d.z * s4 + d.w * s3) * inv_det,
                (-c.y * s5 + c.z * s4 - c.w * s3) * inv_det,
            ),
            Vec4::new(
                (-b.x * c5 + b.z * c2 - b.w * c1) * inv_det,
                (a.x * c5 - a.z * c2 + a.w * c1) * inv_det,
                (-d.x * s5 + d.z * s2 - d.w * s1) * inv_det,
                (c.x * s5 - c.z * s2 + c.w * s1) * inv_det,
            ),
            Vec4::new(
                (b.x * c4 - b.y * c2 + b.w * c0) * inv_det,
                (-a.x * c4 + a.y * c2 - a.w * c0) * inv_det,
                (d.x * s4 - d.y * s2 + d.w * s0) * inv_det,
                (-c.x * s4 + c.y * s2 - c.w * s0) * inv_det,
            ),
            Vec4::new(
                (-b.x * c3 + b.y * c1 - b.z * c0) * inv_det,
                (a.x * c3 - a.y * c1 + a.z * c0) * inv_det,
                (-d.x * s3 + d.y * s1 - d.z * s0) * inv_det,
                (c.x * s3 - c.y * s1 + c.z * s0) * inv_det,
            ),
        )
    }

    /// The upper 3x4 block as three row vectors, the layout GPU instance
    /// transform buffers expect (row-major mat3x4).
    pub fn to_rows_3x4(&self) -> [[f32; 4]; 3] {
        [
            [self.cols[0].x, self.cols[1].x, self.cols[2].x, self.cols[3].x],
            [self.cols[0].y, self.cols[1].y, self.cols[2].y, self.cols[3].y],
            [self.cols[0].z, self.cols[1].z, self.cols[2].z, self.cols[3].z],
        ]
    }

    /// Convert to flat array (column-major)
    pub fn to_array(&self) -> [f32; 16] {
        [
            self.cols[0].x, self.cols[0].y, self.cols[0].z, self.cols[0].w,
            self.cols[1].x, self.cols[1].y, self.cols[1].z, self.cols[1].w,
            self.cols[2].x, self.cols[2].y, self.cols[2].z, self.cols[2].w,
            self.cols[3].x, self.cols[3].y, self.cols[3].z, self.cols[3].w,
        ]
    }
}

impl Default for Mat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for Mat4 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self::from_cols(
            self * rhs.cols[0],
            self * rhs.cols[1],
            self * rhs.cols[2],
            self * rhs.cols[3],
        )
    }
}

impl Mul<Vec4> for Mat4 {
    type Output = Vec4;

    #[inline]
    fn mul(self, rhs: Vec4) -> Vec4 {
        self.cols[0] * rhs.x + self.cols[1] * rhs.y + self.cols[2] * rhs.z + self.cols[3] * rhs.w
    }
}

/// 4x4 double-precision matrix (column-major) for world-space transforms
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DMat4 {
    pub cols: [[f64; 4]; 4],
}

impl DMat4 {
    pub const IDENTITY: Self = Self {
        cols: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    #[inline]
    pub fn from_translation(translation: Vec3d) -> Self {
        let mut m = Self::IDENTITY;
        m.cols[3] = [translation.x, translation.y, translation.z, 1.0];
        m
    }

    /// Get the translation component
    #[inline]
    pub fn translation(&self) -> Vec3d {
        Vec3d::new(self.cols[3][0], self.cols[3][1], self.cols[3][2])
    }

    /// Transform a point (w=1)
    pub fn transform_point(&self, p: Vec3d) -> Vec3d {
        Vec3d::new(
            self.cols[0][0] * p.x + self.cols[1][0] * p.y + self.cols[2][0] * p.z + self.cols[3][0],
            self.cols[0][1] * p.x + self.cols[1][1] * p.y + self.cols[2][1] * p.z + self.cols[3][1],
            self.cols[0][2] * p.x + self.cols[1][2] * p.y + self.cols[2][2] * p.z + self.cols[3][2],
        )
    }

    /// Downcast to single precision; meaningful after rebasing the
    /// translation near the local origin.
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols(
            Vec4::new(self.cols[0][0] as f32, self.cols[0][1] as f32, self.cols[0][2] as f32, self.cols[0][3] as f32),
            Vec4::new(self.cols[1][0] as f32, self.cols[1][1] as f32, self.cols[1][2] as f32, self.cols[1][3] as f32),
            Vec4::new(self.cols[2][0] as f32, self.cols[2][1] as f32, self.cols[2][2] as f32, self.cols[2][3] as f32),
            Vec4::new(self.cols[3][0] as f32, self.cols[3][1] as f32, self.cols[3][2] as f32, self.cols[3][3] as f32),
        )
    }
}

impl Default for DMat4 {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Mul for DMat4 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let mut out = Self { cols: [[0.0; 4]; 4] };
        for (c, rhs_col) in rhs.cols.iter().enumerate() {
            for r in 0..4 {
                out.cols[c][r] = self.cols[0][r] * rhs_col[0]
                    + self.cols[1][r] * rhs_col[1]
                    + self.cols[2][r] * rhs_col[2]
                    + self.cols[3][r] * rhs_col[3];
            }
        }
        out
    }
}
