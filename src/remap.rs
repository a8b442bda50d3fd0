//! Remap table construction
//!
//! The table is a forward (scatter) mapping: entry `i` belongs to the source
//! pixel at raster position `i = y * W + x` and holds the offset of the
//! destination pixel that source pixel is written to. A transform that does
//! not cover the destination bijectively leaves some destination pixels
//! untouched and sends several source pixels to the same destination.

use rayon::prelude::*;
use thiserror::Error;

use crate::config::{CornerSet, Resolution};
use crate::transform::ProjectiveMatrix;

/// Errors raised while building a remap table or binding it to a canvas
#[derive(Debug, Error)]
pub enum RemapError {
    /// The corners do not admit a unique projective solution
    #[error("corner points are degenerate (three or more are collinear)")]
    DegenerateCorners,

    /// Entries whose rounded coordinates fall outside the destination
    #[error("{count} remap entries fall outside the destination frame")]
    OutOfBounds { count: usize },

    #[error("remap table has {table} entries but the destination holds {canvas} pixels")]
    SizeMismatch { table: usize, canvas: usize },

    /// Block transfer moves four words at a time
    #[error("block transfer needs a table size divisible by 4, got {len}")]
    BlockMisaligned { len: usize },

    /// The accelerated instruction set is missing on this machine
    #[error("method {0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error("failed to start the apply worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Flat table of destination offsets, one per canonical grid position
///
/// The length is fixed at `width * height` when the table is built and the
/// entries are never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapTable {
    resolution: Resolution,
    offsets: Box<[usize]>,
    out_of_bounds: usize,
}

impl RemapTable {
    /// Solve the transform for `corners` and build the table
    pub fn from_corners(corners: &CornerSet, resolution: Resolution) -> Result<Self, RemapError> {
        let matrix = ProjectiveMatrix::for_corners(corners, resolution)?;
        Ok(Self::build(&matrix, resolution))
    }

    /// Map every canonical grid coordinate through `matrix`
    ///
    /// Rows are computed in parallel; each entry depends only on its own
    /// coordinate so the result is identical to a sequential build.
    /// Coordinates landing outside the frame are counted, not rejected. Their
    /// offsets are stored as computed (negative offsets wrap) and the table
    /// will refuse to bind to a canvas.
    pub fn build(matrix: &ProjectiveMatrix, resolution: Resolution) -> Self {
        let width = resolution.width as usize;
        let w = resolution.width as i64;
        let h = resolution.height as i64;

        let mut offsets = vec![0usize; resolution.pixel_count()];

        let out_of_bounds = offsets
            .par_chunks_mut(width.max(1))
            .enumerate()
            .map(|(y, row)| {
                let mut outside = 0usize;
                for (x, offset) in row.iter_mut().enumerate() {
                    let (px, py) = matrix.map_pixel(x as f64, y as f64);
                    if px < 0 || py < 0 || px >= w || py >= h {
                        outside += 1;
                    }
                    *offset = (py * w + px) as usize;
                }
                outside
            })
            .sum();

        Self {
            resolution,
            offsets: offsets.into_boxed_slice(),
            out_of_bounds,
        }
    }

    /// Wrap hand-written offsets; entries past the end count as out of bounds
    #[cfg(test)]
    pub fn from_offsets(resolution: Resolution, offsets: Vec<usize>) -> Result<Self, RemapError> {
        let len = resolution.pixel_count();
        if offsets.len() != len {
            return Err(RemapError::SizeMismatch {
                table: offsets.len(),
                canvas: len,
            });
        }
        let out_of_bounds = offsets.iter().filter(|&&o| o >= len).count();
        Ok(Self {
            resolution,
            offsets: offsets.into_boxed_slice(),
            out_of_bounds,
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Number of entries whose destination lies outside `[0,W) x [0,H)`
    pub fn out_of_bounds(&self) -> usize {
        self.out_of_bounds
    }

    /// Whether each destination is hit by at most one source index
    pub fn is_injective(&self) -> bool {
        let mut seen = vec![false; self.len()];
        for &offset in self.offsets.iter() {
            match seen.get_mut(offset) {
                Some(hit) if !*hit => *hit = true,
                _ => return false,
            }
        }
        true
    }

    /// Fraction of destination pixels that receive at least one write
    pub fn coverage(&self) -> f64 {
        let mut seen = vec![false; self.len()];
        for &offset in self.offsets.iter() {
            if let Some(hit) = seen.get_mut(offset) {
                *hit = true;
            }
        }
        let covered = seen.iter().filter(|&&hit| hit).count();
        covered as f64 / self.len().max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Point;

    fn corners(points: [(f64, f64); 4]) -> CornerSet {
        CornerSet::from_points(points.map(|(x, y)| Point::new(x, y)))
    }

    #[test]
    fn test_identity_table() {
        let resolution = Resolution::new(64, 48);
        let table = RemapTable::from_corners(&CornerSet::canonical(resolution), resolution).unwrap();

        assert_eq!(table.len(), 64 * 48);
        assert_eq!(table.out_of_bounds(), 0);
        assert!(table.offsets().iter().enumerate().all(|(i, &o)| o == i));
        assert!(table.is_injective());
        assert_eq!(table.coverage(), 1.0);
    }

    #[test]
    fn test_identity_table_full_hd() {
        let resolution = Resolution::new(1920, 1080);
        let table = RemapTable::from_corners(&CornerSet::canonical(resolution), resolution).unwrap();

        assert_eq!(table.len(), 1920 * 1080);
        assert!(table.offsets().iter().enumerate().all(|(i, &o)| o == i));
    }

    #[test]
    fn test_uniform_shrink_origin() {
        let resolution = Resolution::new(1920, 1080);
        let target = corners([(100.0, 100.0), (1819.0, 100.0), (1819.0, 979.0), (100.0, 979.0)]);
        let table = RemapTable::from_corners(&target, resolution).unwrap();

        assert_eq!(table.offsets()[0], 100 * 1920 + 100);
        assert_eq!(table.offsets()[table.len() - 1], 979 * 1920 + 1819);
        assert_eq!(table.out_of_bounds(), 0);
        // Shrinking folds several source pixels onto one destination
        assert!(!table.is_injective());
        assert!(table.coverage() < 1.0);
    }

    #[test]
    fn test_corners_inside_frame_stay_in_bounds() {
        let resolution = Resolution::new(320, 240);
        let target = corners([(40.0, 29.0), (275.0, 10.0), (286.0, 199.0), (43.0, 230.0)]);
        let table = RemapTable::from_corners(&target, resolution).unwrap();

        assert_eq!(table.out_of_bounds(), 0);
        assert!(table.offsets().iter().all(|&o| o < table.len()));

        let matrix = ProjectiveMatrix::for_corners(&target, resolution).unwrap();
        for y in (0..240).step_by(7) {
            for x in (0..320).step_by(11) {
                let (px, py) = matrix.map_pixel(x as f64, y as f64);
                assert!((0..320).contains(&px) && (0..240).contains(&py));
            }
        }
    }

    #[test]
    fn test_corners_outside_frame_are_counted() {
        let resolution = Resolution::new(100, 100);
        let target = corners([(-10.0, 0.0), (99.0, 0.0), (99.0, 99.0), (0.0, 99.0)]);
        let table = RemapTable::from_corners(&target, resolution).unwrap();

        assert_eq!(table.len(), 100 * 100);
        assert!(table.out_of_bounds() > 0);
    }

    #[test]
    fn test_build_is_deterministic() {
        let resolution = Resolution::new(640, 360);
        let target = corners([(81.0, 57.0), (552.0, 24.0), (571.0, 318.0), (85.0, 307.0)]);

        let first = RemapTable::from_corners(&target, resolution).unwrap();
        let second = RemapTable::from_corners(&target, resolution).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_size_invariant() {
        for (w, h) in [(1, 1), (3, 5), (17, 9), (640, 480)] {
            let resolution = Resolution::new(w, h);
            if w < 2 || h < 2 {
                // A single row or column has collinear canonical corners
                assert!(RemapTable::from_corners(&CornerSet::canonical(resolution), resolution).is_err());
                continue;
            }
            let table = RemapTable::from_corners(&CornerSet::canonical(resolution), resolution).unwrap();
            assert_eq!(table.len(), (w * h) as usize);
        }
    }

    #[test]
    fn test_from_offsets() {
        let resolution = Resolution::new(2, 2);
        let table = RemapTable::from_offsets(resolution, vec![3, 2, 1, 0]).unwrap();
        assert_eq!(table.out_of_bounds(), 0);
        assert!(table.is_injective());

        let table = RemapTable::from_offsets(resolution, vec![0, 1, 2, 4]).unwrap();
        assert_eq!(table.out_of_bounds(), 1);

        assert!(matches!(
            RemapTable::from_offsets(resolution, vec![0, 1, 2]),
            Err(RemapError::SizeMismatch { table: 3, canvas: 4 })
        ));
    }
}
