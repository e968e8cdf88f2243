//! Budgeted downsampling.
//!
//! The source is read in chunks of consecutive z slices. Each chunk is
//! averaged into a single slice, which is then resized in-plane to the
//! target dimensions of the [`DownsamplePlan`].

use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::enums::DownsampleStrategy;
use crate::formats::SliceSource;
use crate::geometry::{DownsamplePlan, compute_magnification};
use crate::interpolator::Interpolator;
use crate::progress::{ChunkCounter, ProgressSink};
use crate::volume::Volume;
use crate::volume_loader::ReadError;

pub const DEFAULT_TARGET_SIZE: u64 = 512 * 512 * 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResampleOptions {
    /// Voxel budget of the output volume
    pub target_size: u64,
    pub strategy: DownsampleStrategy,
    /// Fail instead of warning when a single voxel per slice still
    /// exceeds the budget
    pub strict_budget: bool,
}

impl Default for ResampleOptions {
    fn default() -> Self {
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            strategy: DownsampleStrategy::default(),
            strict_budget: false,
        }
    }
}

impl ResampleOptions {
    pub fn with_target_size(mut self, target_size: u64) -> Self {
        self.target_size = target_size;
        self
    }

    pub fn with_strategy(mut self, strategy: DownsampleStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_strict_budget(mut self, strict_budget: bool) -> Self {
        self.strict_budget = strict_budget;
        self
    }

    pub fn plan(&self, source: &dyn SliceSource) -> Result<DownsamplePlan, ReadError> {
        let shape = source.shape();
        Ok(compute_magnification(
            self.target_size,
            shape.voxel_count(),
            shape,
            self.strategy,
        )?)
    }
}

/// Read `source` whole, in chunks so progress can be reported.
pub fn read_full(source: &dyn SliceSource, progress: &dyn ProgressSink) -> Result<Volume, ReadError> {
    let shape = source.shape();
    let step = shape.z().div_ceil(16).max(1);
    let ranges: Vec<_> = (0..shape.z())
        .step_by(step)
        .map(|start| start..(start + step).min(shape.z()))
        .collect();

    let counter = ChunkCounter::new(ranges.len(), progress);
    let chunks = ranges
        .into_iter()
        .map(|range| {
            let chunk = source.read_slices(range);
            counter.finish_one();
            chunk
        })
        .collect::<Result<Vec<_>, _>>()?;
    let views: Vec<_> = chunks.iter().map(|chunk| chunk.view()).collect();
    let data = ndarray::concatenate(Axis(0), &views)?;

    Ok(Volume::new(data, source.spacing())
        .with_origin(source.origin())
        .with_element_type(source.element_type()))
}

/// Downsample `source` so that it holds at most `options.target_size`
/// voxels. Sources that already fit are read unchanged.
pub fn resample(
    source: &dyn SliceSource,
    options: &ResampleOptions,
    progress: &dyn ProgressSink,
) -> Result<Volume, ReadError> {
    let plan = options.plan(source)?;
    if !plan.downsample() {
        debug!(shape = ?plan.source_shape(), "source fits the budget, reading in full");
        return read_full(source, progress);
    }

    if let Err(err) = plan.check_budget(options.target_size) {
        if options.strict_budget {
            return Err(err.into());
        }
        warn!("{err}; continuing with the smallest possible volume");
    }

    let target = plan.target_shape();
    debug!(
        source = ?plan.source_shape(),
        ?target,
        slice_per_chunk = plan.slice_per_chunk(),
        magnification = plan.xy_magnification(),
        "resampling"
    );

    let ranges: Vec<_> = plan.chunk_ranges().collect();
    let counter = ChunkCounter::new(ranges.len(), progress);
    let slices = ranges
        .into_par_iter()
        .map(|range| {
            let chunk = source.read_slices(range)?;
            let mean = Interpolator::mean_slice(&chunk.view());
            let resized = Interpolator::resize_bilinear(&mean.view(), target.y(), target.x());
            counter.finish_one();
            Ok(resized)
        })
        .collect::<Result<Vec<Array2<f32>>, ReadError>>()?;

    let mut data = Array3::zeros(target.dim());
    for (mut out, slice) in data.outer_iter_mut().zip(&slices) {
        out.assign(slice);
    }

    let factors = plan.spacing_factors();
    let spacing = source.spacing();
    let spacing = std::array::from_fn(|i| spacing[i] * factors[i]);

    Ok(Volume::new(data, spacing)
        .with_origin(source.origin())
        .with_element_type(source.element_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::ElementType;
    use crate::geometry::Shape3;
    use std::ops::Range;
    use std::sync::Mutex;

    /// In-memory source whose voxel at `[z, y, x]` holds `z`.
    struct SliceIndex {
        shape: Shape3,
    }

    impl SliceSource for SliceIndex {
        fn shape(&self) -> Shape3 {
            self.shape
        }

        fn element_type(&self) -> ElementType {
            ElementType::U16
        }

        fn spacing(&self) -> [f64; 3] {
            [0.5, 0.5, 1.0]
        }

        fn read_slices(&self, z: Range<usize>) -> Result<Array3<f32>, ReadError> {
            let start = z.start;
            Ok(Array3::from_shape_fn(
                (z.len(), self.shape.y(), self.shape.x()),
                |(k, _, _)| (start + k) as f32,
            ))
        }
    }

    #[test]
    fn isotropic_resample_averages_chunks() {
        let source = SliceIndex {
            shape: Shape3::new(20, 20, 20).unwrap(),
        };
        let options = ResampleOptions::default().with_target_size(1000);
        let volume = resample(&source, &options, &crate::progress::NoProgress).unwrap();

        assert_eq!(volume.shape(), [10, 10, 10]);
        assert!(volume.voxel_count() <= 1000);
        // chunk 0 holds slices 0 and 1
        assert!((volume.data()[[0, 3, 3]] - 0.5).abs() < 1e-4);
        assert!((volume.data()[[9, 0, 0]] - 18.5).abs() < 1e-4);
        assert_eq!(volume.spacing(), [1.0, 1.0, 2.0]);
        assert_eq!(volume.element_type(), ElementType::U16);
    }

    #[test]
    fn preserve_slices_keeps_every_slice() {
        let source = SliceIndex {
            shape: Shape3::new(20, 20, 20).unwrap(),
        };
        let options = ResampleOptions::default()
            .with_target_size(1000)
            .with_strategy(DownsampleStrategy::PreserveSlices);
        let volume = resample(&source, &options, &crate::progress::NoProgress).unwrap();
        assert_eq!(volume.shape(), [7, 7, 20]);
        assert!((volume.data()[[13, 2, 2]] - 13.0).abs() < 1e-4);
    }

    #[test]
    fn small_sources_are_read_unchanged() {
        let source = SliceIndex {
            shape: Shape3::new(4, 3, 2).unwrap(),
        };
        let seen = Mutex::new(Vec::new());
        let sink = |fraction: f32| seen.lock().unwrap().push(fraction);
        let volume = resample(&source, &ResampleOptions::default(), &sink).unwrap();
        assert_eq!(volume.shape(), [4, 3, 2]);
        assert_eq!(volume.spacing(), [0.5, 0.5, 1.0]);
        assert_eq!(seen.lock().unwrap().last(), Some(&1.0));
    }

    #[test]
    fn strict_budget_rejects_unreachable_targets() {
        let source = SliceIndex {
            shape: Shape3::new(4, 4, 50).unwrap(),
        };
        let options = ResampleOptions::default()
            .with_target_size(10)
            .with_strategy(DownsampleStrategy::PreserveSlices);
        let lenient = resample(&source, &options, &crate::progress::NoProgress).unwrap();
        assert_eq!(lenient.shape(), [1, 1, 50]);

        let strict = resample(&source, &options.with_strict_budget(true), &crate::progress::NoProgress);
        assert!(matches!(
            strict,
            Err(ReadError::Geometry(crate::geometry::GeometryError::BudgetTooSmall { .. }))
        ));
    }

    #[test]
    fn strict_isotropic_budget_holds_for_long_thin_volumes() {
        let source = SliceIndex {
            shape: Shape3::new(2, 2, 1000).unwrap(),
        };
        let options = ResampleOptions::default().with_target_size(100).with_strict_budget(true);
        let volume = resample(&source, &options, &crate::progress::NoProgress).unwrap();
        assert_eq!(volume.shape(), [1, 1, 100]);
        // slices 0..10 average to 4.5
        assert!((volume.data()[[0, 0, 0]] - 4.5).abs() < 1e-4);
        assert_eq!(volume.spacing(), [1.0, 1.0, 10.0]);
    }
}
