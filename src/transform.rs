//! Perspective transformation for keystone correction
//!
//! Solves the 3x3 homography that carries the canonical rectangle
//! `(0,0), (W-1,0), (W-1,H-1), (0,H-1)` onto the four destination corners.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};

use crate::config::{CornerSet, Point, Resolution};
use crate::remap::RemapError;

/// Perspective transformation matrix (3x3 homography, `h33 = 1`)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectiveMatrix {
    matrix: Matrix3<f64>,
}

impl ProjectiveMatrix {
    /// Matrix mapping the canonical rectangle of `resolution` onto `corners`
    pub fn for_corners(corners: &CornerSet, resolution: Resolution) -> Result<Self, RemapError> {
        let canonical = CornerSet::canonical(resolution);
        Self::solve(canonical.points(), corners.points())
    }

    /// Compute the homography from 4 point correspondences
    ///
    /// Each correspondence `(x,y) -> (x',y')` contributes two rows:
    /// `x*h0 + y*h1 + h2 - x'*x*h6 - x'*y*h7 = x'`
    /// `x*h3 + y*h4 + h5 - y'*x*h6 - y'*y*h7 = y'`
    pub fn solve(src: [Point; 4], dst: [Point; 4]) -> Result<Self, RemapError> {
        if has_collinear_triple(&src) || has_collinear_triple(&dst) {
            return Err(RemapError::DegenerateCorners);
        }

        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();

        for (i, (s, d)) in src.iter().zip(dst.iter()).enumerate() {
            let r = i * 2;

            a[(r, 0)] = s.x;
            a[(r, 1)] = s.y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -d.x * s.x;
            a[(r, 7)] = -d.x * s.y;
            b[r] = d.x;

            a[(r + 1, 3)] = s.x;
            a[(r + 1, 4)] = s.y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -d.y * s.x;
            a[(r + 1, 7)] = -d.y * s.y;
            b[r + 1] = d.y;
        }

        let h = a.lu().solve(&b).ok_or(RemapError::DegenerateCorners)?;
        if h.iter().any(|v| !v.is_finite()) {
            return Err(RemapError::DegenerateCorners);
        }

        Ok(Self {
            matrix: Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0),
        })
    }

    /// Transform a point; a vanishing homogeneous coordinate maps to the origin
    #[inline]
    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        let v = self.matrix * Vector3::new(x, y, 1.0);
        if v.z.abs() <= f64::EPSILON {
            return (0.0, 0.0);
        }
        (v.x / v.z, v.y / v.z)
    }

    /// Transform and round half away from zero onto the pixel grid
    #[inline]
    pub fn map_pixel(&self, x: f64, y: f64) -> (i64, i64) {
        let (tx, ty) = self.transform_point(x, y);
        (tx.round() as i64, ty.round() as i64)
    }

    #[cfg(test)]
    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.matrix
    }
}

/// Any three of the four points on one line leave the system without a unique solution
fn has_collinear_triple(points: &[Point; 4]) -> bool {
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];

    TRIPLES.iter().any(|&[a, b, c]| {
        let (p, q, r) = (points[a], points[b], points[c]);
        let cross = (q.x - p.x) * (r.y - p.y) - (q.y - p.y) * (r.x - p.x);
        cross.abs() < 1e-9
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corners(points: [(f64, f64); 4]) -> CornerSet {
        CornerSet::from_points(points.map(|(x, y)| Point::new(x, y)))
    }

    #[test]
    fn test_identity_transform() {
        let resolution = Resolution::new(100, 100);
        let m = ProjectiveMatrix::for_corners(&CornerSet::canonical(resolution), resolution).unwrap();

        let (x, y) = m.transform_point(50.0, 50.0);
        assert!((x - 50.0).abs() < 1e-9);
        assert!((y - 50.0).abs() < 1e-9);
        assert!((m.matrix() - Matrix3::identity()).amax() < 1e-9);
    }

    #[test]
    fn test_corners_map_exactly() {
        let resolution = Resolution::new(1920, 1080);
        let target = corners([(242.0, 172.0), (1655.0, 71.0), (1714.0, 955.0), (255.0, 921.0)]);
        let m = ProjectiveMatrix::for_corners(&target, resolution).unwrap();

        for (src, dst) in CornerSet::canonical(resolution).points().iter().zip(target.points()) {
            let (x, y) = m.transform_point(src.x, src.y);
            assert!((x - dst.x).abs() < 1e-6, "x: {} vs {}", x, dst.x);
            assert!((y - dst.y).abs() < 1e-6, "y: {} vs {}", y, dst.y);
        }
    }

    #[test]
    fn test_uniform_shrink() {
        let resolution = Resolution::new(1920, 1080);
        let target = corners([(100.0, 100.0), (1819.0, 100.0), (1819.0, 979.0), (100.0, 979.0)]);
        let m = ProjectiveMatrix::for_corners(&target, resolution).unwrap();

        assert_eq!(m.map_pixel(0.0, 0.0), (100, 100));
        assert_eq!(m.map_pixel(1919.0, 1079.0), (1819, 979));
    }

    #[test]
    fn test_translation_leaves_frame() {
        // No bounds are applied here; the caller decides what is in range
        let src = CornerSet::canonical(Resolution::new(10, 10)).points();
        let dst = src.map(|p| Point::new(p.x + 3.0, p.y - 2.0));
        let m = ProjectiveMatrix::solve(src, dst).unwrap();

        assert_eq!(m.map_pixel(0.0, 0.0), (3, -2));
        assert_eq!(m.map_pixel(9.0, 9.0), (12, 7));
    }

    #[test]
    fn test_degenerate_corners() {
        let resolution = Resolution::new(100, 100);
        let collapsed = corners([(10.0, 10.0); 4]);
        assert!(matches!(
            ProjectiveMatrix::for_corners(&collapsed, resolution),
            Err(RemapError::DegenerateCorners)
        ));

        let collinear = corners([(0.0, 0.0), (50.0, 50.0), (99.0, 99.0), (0.0, 99.0)]);
        assert!(ProjectiveMatrix::for_corners(&collinear, resolution).is_err());
    }
}
