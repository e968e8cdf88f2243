//! Shape, extent and downsample arithmetic.
//!
//! Everything here is a pure function of a dataset's shape and the caller's
//! request. Shapes and extents use toolkit order `(x, y, z)`, where `x` is
//! the fastest varying axis on disk and `z` the slowest (the slice axis).
//! Array indices into a [`Volume`](crate::volume::Volume) are `[z, y, x]`.

use std::ops::Range;

use thiserror::Error;

use crate::enums::{DownsampleStrategy, StorageOrder};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("Invalid shape {0:?}: every dimension must be positive")]
    InvalidShape([usize; 3]),

    #[error("Invalid extent {extent:?} for shape {shape:?}: {reason}")]
    InvalidExtent {
        extent: [i64; 6],
        shape: [usize; 3],
        reason: &'static str,
    },

    #[error("Invalid target size {0}: must be positive")]
    InvalidTargetSize(u64),

    #[error("Target shape {shape:?} holds {voxels} voxels, above the budget of {budget}")]
    BudgetTooSmall {
        shape: [usize; 3],
        voxels: u64,
        budget: u64,
    },
}

/// Dimensions of a volume in toolkit order. Every dimension is positive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Shape3 {
    x: usize,
    y: usize,
    z: usize,
}

impl Shape3 {
    pub fn new(x: usize, y: usize, z: usize) -> Result<Self, GeometryError> {
        if x == 0 || y == 0 || z == 0 {
            return Err(GeometryError::InvalidShape([x, y, z]));
        }
        Ok(Self { x, y, z })
    }

    /// Build from the shape of a stored array.
    ///
    /// C-order arrays list the slowest axis first, `(z, y, x)`; Fortran-order
    /// arrays list the fastest axis first, `(x, y, z)`.
    pub fn from_array_shape(shape: [usize; 3], order: StorageOrder) -> Result<Self, GeometryError> {
        match order {
            StorageOrder::C => Self::new(shape[2], shape[1], shape[0]),
            StorageOrder::Fortran => Self::new(shape[0], shape[1], shape[2]),
        }
    }

    pub fn to_array_shape(self, order: StorageOrder) -> [usize; 3] {
        match order {
            StorageOrder::C => [self.z, self.y, self.x],
            StorageOrder::Fortran => [self.x, self.y, self.z],
        }
    }

    pub fn x(self) -> usize {
        self.x
    }

    pub fn y(self) -> usize {
        self.y
    }

    pub fn z(self) -> usize {
        self.z
    }

    /// `(x, y, z)`
    pub fn as_array(self) -> [usize; 3] {
        [self.x, self.y, self.z]
    }

    /// ndarray dimensions `(z, y, x)`
    pub fn dim(self) -> (usize, usize, usize) {
        (self.z, self.y, self.x)
    }

    pub fn voxel_count(self) -> u64 {
        self.x as u64 * self.y as u64 * self.z as u64
    }

    /// Number of voxels in one z slice
    pub fn slice_len(self) -> usize {
        self.x * self.y
    }
}

/// Result of [`compute_magnification`].
///
/// When [`downsample`](Self::downsample) is false the source already fits
/// the budget and is read unchanged, in one chunk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DownsamplePlan {
    slice_per_chunk: usize,
    xy_magnification: f64,
    output_slices: usize,
    downsample: bool,
    target: Shape3,
    source: Shape3,
}

impl DownsamplePlan {
    pub fn slice_per_chunk(&self) -> usize {
        self.slice_per_chunk
    }

    pub fn xy_magnification(&self) -> f64 {
        self.xy_magnification
    }

    pub fn downsample(&self) -> bool {
        self.downsample
    }

    pub fn source_shape(&self) -> Shape3 {
        self.source
    }

    pub fn target_shape(&self) -> Shape3 {
        self.target
    }

    /// Ratio of output to input slices along z
    pub fn z_magnification(&self) -> f64 {
        self.output_slices as f64 / self.source.z as f64
    }

    /// Factors the source spacing is multiplied by, `(x, y, z)`.
    ///
    /// In-plane factors use the realised target size so that the physical
    /// size of the volume is preserved.
    pub fn spacing_factors(&self) -> [f64; 3] {
        [
            self.source.x as f64 / self.target.x as f64,
            self.source.y as f64 / self.target.y as f64,
            1.0 / self.z_magnification(),
        ]
    }

    /// Slice ranges read for each output slice. The last chunk may be short.
    pub fn chunk_ranges(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        let nz = self.source.z;
        let step = if self.downsample { self.slice_per_chunk } else { nz };
        (0..nz).step_by(step).map(move |start| start..(start + step).min(nz))
    }

    pub fn target_voxel_count(&self) -> u64 {
        self.target.voxel_count()
    }

    /// Fails with [`GeometryError::BudgetTooSmall`] when the clamped target
    /// still holds more voxels than `max_size`.
    pub fn check_budget(&self, max_size: u64) -> Result<(), GeometryError> {
        let voxels = self.target_voxel_count();
        if voxels > max_size {
            return Err(GeometryError::BudgetTooSmall {
                shape: self.target.as_array(),
                voxels,
                budget: max_size,
            });
        }
        Ok(())
    }
}

/// Compute how many slices to group per chunk and the in-plane
/// magnification so that the resampled volume fits `max_size` voxels.
///
/// `total_size` is the voxel count of the source. The z axis of `shape` is
/// the chunked axis.
pub fn compute_magnification(
    max_size: u64,
    total_size: u64,
    shape: Shape3,
    strategy: DownsampleStrategy,
) -> Result<DownsamplePlan, GeometryError> {
    if max_size == 0 {
        return Err(GeometryError::InvalidTargetSize(max_size));
    }
    if total_size == 0 {
        return Err(GeometryError::InvalidTargetSize(total_size));
    }
    let nz = shape.z;

    if total_size <= max_size {
        return Ok(DownsamplePlan {
            slice_per_chunk: nz,
            xy_magnification: 1.0,
            output_slices: nz,
            downsample: false,
            target: shape,
            source: shape,
        });
    }

    let ratio = max_size as f64 / total_size as f64;
    let slice_per_chunk = match strategy {
        DownsampleStrategy::Isotropic => {
            let axis_magnification = ratio.cbrt();
            let estimate = (1.0 / axis_magnification).round() as usize;
            // a 1x1 plane must still leave room for every output slice
            let fewest = usize::try_from(max_size).map_or(1, |max| nz.div_ceil(max));
            estimate.max(fewest).clamp(1, nz)
        }
        DownsampleStrategy::PreserveSlices => 1,
    };
    let output_slices = nz.div_ceil(slice_per_chunk);

    // whatever the slice grouping left over goes to x and y
    let per_slice = total_size as f64 / nz as f64;
    let xy_magnification = (max_size as f64 / (per_slice * output_slices as f64))
        .sqrt()
        .min(1.0);

    let target = fit_in_plane(shape, xy_magnification, output_slices, max_size);

    Ok(DownsamplePlan {
        slice_per_chunk,
        xy_magnification,
        output_slices,
        downsample: true,
        target,
        source: shape,
    })
}

fn fit_in_plane(shape: Shape3, magnification: f64, slices: usize, max_size: u64) -> Shape3 {
    let scaled = |n: usize| (((n as f64) * magnification + 1e-9).floor() as usize).clamp(1, n);
    let mut x = scaled(shape.x);
    let mut y = scaled(shape.y);
    // the floor above may land one voxel over when the product is exact
    while (x as u64) * (y as u64) * (slices as u64) > max_size && (x > 1 || y > 1) {
        if x >= y {
            x -= 1;
        } else {
            y -= 1;
        }
    }
    Shape3 { x, y, z: slices }
}

/// Extent covering the whole shape, `[0, nx-1, 0, ny-1, 0, nz-1]`.
pub fn whole_extent(shape: Shape3) -> [i64; 6] {
    [
        0,
        shape.x as i64 - 1,
        0,
        shape.y as i64 - 1,
        0,
        shape.z as i64 - 1,
    ]
}

/// Replace every `-1` entry of `requested` with the matching entry of `whole`.
pub fn resolve_extent(requested: [i64; 6], whole: [i64; 6]) -> [i64; 6] {
    let mut resolved = requested;
    for (value, fallback) in resolved.iter_mut().zip(whole) {
        if *value == -1 {
            *value = fallback;
        }
    }
    resolved
}

/// A sub-region in array convention: half-open ranges over `[z, y, x]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceRegion {
    pub z: Range<usize>,
    pub y: Range<usize>,
    pub x: Range<usize>,
}

impl SourceRegion {
    pub fn shape(&self) -> Shape3 {
        Shape3 {
            x: self.x.len(),
            y: self.y.len(),
            z: self.z.len(),
        }
    }

    /// Index of the first voxel, `(x, y, z)`
    pub fn offset(&self) -> [usize; 3] {
        [self.x.start, self.y.start, self.z.start]
    }

    /// Back to toolkit convention; inverse of [`map_extent`].
    pub fn to_extent(&self) -> [i64; 6] {
        [
            self.x.start as i64,
            self.x.end as i64 - 1,
            self.y.start as i64,
            self.y.end as i64 - 1,
            self.z.start as i64,
            self.z.end as i64 - 1,
        ]
    }
}

/// Translate an inclusive toolkit extent `[x0, x1, y0, y1, z0, z1]` into
/// array ranges, checking it against `shape`.
pub fn map_extent(requested: [i64; 6], shape: Shape3) -> Result<SourceRegion, GeometryError> {
    let invalid = |reason| GeometryError::InvalidExtent {
        extent: requested,
        shape: shape.as_array(),
        reason,
    };

    let dims = shape.as_array();
    let mut ranges = [0..0, 0..0, 0..0];
    for axis in 0..3 {
        let (min, max) = (requested[2 * axis], requested[2 * axis + 1]);
        if min > max {
            return Err(invalid("min is greater than max"));
        }
        if min < 0 || max > dims[axis] as i64 - 1 {
            return Err(invalid("outside of the dataset bounds"));
        }
        ranges[axis] = min as usize..max as usize + 1;
    }
    let [x, y, z] = ranges;
    Ok(SourceRegion { z, y, x })
}

/// Sample rate per axis so that reading every `rate`-th voxel keeps each
/// axis within `bounds`, `(x, y, z)`.
pub fn sample_rate_for_bounds(shape: Shape3, bounds: [usize; 3]) -> Result<[usize; 3], GeometryError> {
    if bounds.contains(&0) {
        return Err(GeometryError::InvalidShape(bounds));
    }
    let dims = shape.as_array();
    Ok(std::array::from_fn(|i| dims[i].div_ceil(bounds[i]).max(1)))
}

/// Element-wise maximum of a user sample rate and a computed one.
pub fn highest_sample_rate(user: [usize; 3], computed: [usize; 3]) -> [usize; 3] {
    std::array::from_fn(|i| user[i].max(computed[i]).max(1))
}

/// Number of samples left after keeping every `rate`-th of `n`.
pub fn decimated_len(n: usize, rate: usize) -> usize {
    n.div_ceil(rate.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(x: usize, y: usize, z: usize) -> Shape3 {
        Shape3::new(x, y, z).unwrap()
    }

    #[test]
    fn zero_dimension_is_invalid() {
        assert_eq!(Shape3::new(4, 0, 2), Err(GeometryError::InvalidShape([4, 0, 2])));
        assert!(Shape3::from_array_shape([0, 3, 3], StorageOrder::C).is_err());
    }

    #[test]
    fn array_shape_order() {
        let s = Shape3::from_array_shape([5, 10, 6], StorageOrder::C).unwrap();
        assert_eq!(s.as_array(), [6, 10, 5]);
        assert_eq!(s.to_array_shape(StorageOrder::C), [5, 10, 6]);
        assert_eq!(s.to_array_shape(StorageOrder::Fortran), [6, 10, 5]);
        assert_eq!(s.dim(), (5, 10, 6));
    }

    #[test]
    fn fitting_volume_is_not_downsampled() {
        let s = shape(10, 10, 10);
        for strategy in [DownsampleStrategy::Isotropic, DownsampleStrategy::PreserveSlices] {
            let plan = compute_magnification(1000, s.voxel_count(), s, strategy).unwrap();
            assert!(!plan.downsample());
            assert_eq!(plan.xy_magnification(), 1.0);
            assert_eq!(plan.slice_per_chunk(), 10);
            assert_eq!(plan.target_shape(), s);
            assert_eq!(plan.chunk_ranges().collect::<Vec<_>>(), vec![0..10]);
        }
    }

    #[test]
    fn cube_of_a_thousand_to_a_million() {
        let s = shape(1000, 1000, 1000);
        let plan =
            compute_magnification(1_000_000, s.voxel_count(), s, DownsampleStrategy::Isotropic).unwrap();
        assert!((plan.xy_magnification() - 0.1).abs() < 1e-9);
        assert_eq!(plan.slice_per_chunk(), 10);
        let m = plan.xy_magnification();
        assert!(plan.slice_per_chunk() as f64 * m * m * 1000.0 * 1000.0 <= 1_000_000.0);
        assert_eq!(plan.target_shape().as_array(), [100, 100, 100]);
        assert!(plan.check_budget(1_000_000).is_ok());
    }

    #[test]
    fn strategies_split_the_budget_differently() {
        let s = shape(20, 20, 20);
        let iso = compute_magnification(1000, 8000, s, DownsampleStrategy::Isotropic).unwrap();
        assert_eq!(iso.slice_per_chunk(), 2);
        assert_eq!(iso.target_shape().as_array(), [10, 10, 10]);
        assert!((iso.z_magnification() - 0.5).abs() < 1e-12);

        let acq = compute_magnification(1000, 8000, s, DownsampleStrategy::PreserveSlices).unwrap();
        assert_eq!(acq.slice_per_chunk(), 1);
        assert_eq!(acq.target_shape().as_array(), [7, 7, 20]);
        assert!((acq.xy_magnification() - (1.0f64 / 8.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn plan_invariants_hold_over_a_grid() {
        let dims = [1, 2, 5, 7, 64, 100, 333];
        let budgets = [1, 3, 10, 100, 1000, 12_345, 1 << 20];
        for &x in &dims {
            for &y in &dims {
                for &z in &dims {
                    let s = shape(x, y, z);
                    for &budget in &budgets {
                        for strategy in [DownsampleStrategy::Isotropic, DownsampleStrategy::PreserveSlices] {
                            let plan = compute_magnification(budget, s.voxel_count(), s, strategy).unwrap();
                            let m = plan.xy_magnification();
                            assert!(plan.slice_per_chunk() >= 1);
                            assert!(m > 0.0 && m <= 1.0);
                            let t = plan.target_shape();
                            assert!(t.x() >= 1 && t.x() <= x && t.y() >= 1 && t.y() <= y);
                            // only more slices than voxels in the budget may exceed it
                            assert!(
                                t.z() as u64 > budget || plan.check_budget(budget).is_ok(),
                                "{s:?} {budget} {strategy:?}"
                            );
                            if strategy == DownsampleStrategy::Isotropic {
                                assert!(plan.check_budget(budget).is_ok(), "{s:?} {budget}");
                            }
                            let covered: usize = plan.chunk_ranges().map(|r| r.len()).sum();
                            assert_eq!(covered, z);
                            if plan.downsample() {
                                assert_eq!(plan.chunk_ranges().count(), t.z());
                            } else {
                                assert_eq!(t, s);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn elongated_volume_groups_enough_slices_to_fit() {
        let s = shape(2, 2, 1000);
        let plan = compute_magnification(100, s.voxel_count(), s, DownsampleStrategy::Isotropic).unwrap();
        assert_eq!(plan.slice_per_chunk(), 10);
        assert_eq!(plan.target_shape().as_array(), [1, 1, 100]);
        assert!(plan.check_budget(100).is_ok());
        assert_eq!(plan.chunk_ranges().count(), 100);
    }

    #[test]
    fn budget_smaller_than_slice_axis_still_gives_a_chunk() {
        let s = shape(4, 4, 50);
        let plan = compute_magnification(10, s.voxel_count(), s, DownsampleStrategy::PreserveSlices).unwrap();
        assert_eq!(plan.slice_per_chunk(), 1);
        assert_eq!(plan.target_shape().as_array(), [1, 1, 50]);
        assert!(matches!(
            plan.check_budget(10),
            Err(GeometryError::BudgetTooSmall { voxels: 50, budget: 10, .. })
        ));
    }

    #[test]
    fn zero_budget_is_rejected() {
        let s = shape(2, 2, 2);
        assert_eq!(
            compute_magnification(0, 8, s, DownsampleStrategy::Isotropic),
            Err(GeometryError::InvalidTargetSize(0))
        );
    }

    #[test]
    fn map_extent_transposes_to_array_order() {
        let s = shape(6, 10, 5);
        let region = map_extent([1, 4, 0, 9, 2, 3], s).unwrap();
        assert_eq!(region.z, 2..4);
        assert_eq!(region.y, 0..10);
        assert_eq!(region.x, 1..5);
        assert_eq!(region.shape().as_array(), [4, 10, 2]);
        assert_eq!(region.offset(), [1, 0, 2]);
    }

    #[test]
    fn map_extent_round_trip() {
        let s = shape(6, 10, 5);
        for extent in [whole_extent(s), [0, 0, 0, 0, 0, 0], [5, 5, 9, 9, 4, 4], [2, 3, 1, 8, 0, 2]] {
            assert_eq!(map_extent(extent, s).unwrap().to_extent(), extent);
        }
    }

    #[test]
    fn map_extent_rejects_bad_extents() {
        let s = shape(6, 10, 5);
        let reversed = map_extent([3, 2, 0, 9, 0, 4], s);
        assert!(matches!(reversed, Err(GeometryError::InvalidExtent { reason: "min is greater than max", .. })));
        assert!(map_extent([0, 6, 0, 9, 0, 4], s).is_err());
        assert!(map_extent([-1, 5, 0, 9, 0, 4], s).is_err());
        assert!(map_extent([0, 5, 0, 9, 0, 5], s).is_err());
    }

    #[test]
    fn resolve_extent_fills_wildcards() {
        let s = shape(6, 10, 5);
        let resolved = resolve_extent([0, -1, 0, -1, 1, 3], whole_extent(s));
        assert_eq!(resolved, [0, 5, 0, 9, 1, 3]);
    }

    #[test]
    fn sample_rates() {
        let s = shape(1024, 600, 300);
        let rate = sample_rate_for_bounds(s, [512, 512, 512]).unwrap();
        assert_eq!(rate, [2, 2, 1]);
        assert_eq!(highest_sample_rate([1, 3, 2], rate), [2, 3, 2]);
        assert_eq!(decimated_len(1024, 2), 512);
        assert_eq!(decimated_len(600, 2), 300);
        assert_eq!(decimated_len(7, 3), 3);
        assert!(sample_rate_for_bounds(s, [0, 1, 1]).is_err());
    }
}
