//! Reading part of a source: an axis aligned crop, or a decimated copy.

use ndarray::{Array3, Axis, s};
use rayon::prelude::*;
use tracing::debug;

use crate::formats::SliceSource;
use crate::geometry::{
    decimated_len, highest_sample_rate, map_extent, resolve_extent, sample_rate_for_bounds,
    whole_extent,
};
use crate::progress::{ChunkCounter, ProgressSink};
use crate::volume::Volume;
use crate::volume_loader::ReadError;

/// Read the inclusive extent `[x0, x1, y0, y1, z0, z1]` of `source`.
///
/// Entries of `-1` stand for the whole axis bound. Only slices `z0..=z1`
/// are read. The volume keeps the source spacing and origin and reports
/// `extent` back from [`Volume::extent`].
pub fn crop(
    source: &dyn SliceSource,
    extent: [i64; 6],
    progress: &dyn ProgressSink,
) -> Result<Volume, ReadError> {
    let shape = source.shape();
    let extent = resolve_extent(extent, whole_extent(shape));
    let region = map_extent(extent, shape)?;
    debug!(?extent, ?region, "cropping");

    let z = region.z.clone();
    let step = z.len().div_ceil(16).max(1);
    let ranges: Vec<_> = z
        .clone()
        .step_by(step)
        .map(|start| start..(start + step).min(z.end))
        .collect();

    let counter = ChunkCounter::new(ranges.len(), progress);
    let chunks = ranges
        .into_iter()
        .map(|range| {
            let chunk = source.read_slices(range)?;
            counter.finish_one();
            Ok(chunk
                .slice_move(s![.., region.y.clone(), region.x.clone()])
                .as_standard_layout()
                .into_owned())
        })
        .collect::<Result<Vec<_>, ReadError>>()?;
    let views: Vec<_> = chunks.iter().map(|chunk| chunk.view()).collect();
    let data = ndarray::concatenate(Axis(0), &views)?;

    Ok(Volume::new(data, source.spacing())
        .with_origin(source.origin())
        .with_offset(region.offset())
        .with_element_type(source.element_type()))
}

/// Keep every `rate`-th voxel per axis, with the rate chosen so that every
/// axis fits `bounds` and is never finer than `sample_rate`.
///
/// `bounds` and `sample_rate` are `(x, y, z)`.
pub fn decimate(
    source: &dyn SliceSource,
    bounds: [usize; 3],
    sample_rate: Option<[usize; 3]>,
    progress: &dyn ProgressSink,
) -> Result<Volume, ReadError> {
    let shape = source.shape();
    let computed = sample_rate_for_bounds(shape, bounds)?;
    let [rx, ry, rz] = highest_sample_rate(sample_rate.unwrap_or([1; 3]), computed);
    debug!(rate = ?[rx, ry, rz], ?bounds, "decimating");

    let out_z = decimated_len(shape.z(), rz);
    let counter = ChunkCounter::new(out_z, progress);
    let slices = (0..out_z)
        .into_par_iter()
        .map(|k| {
            let z = k * rz;
            let slab = source.read_slices(z..z + 1)?;
            counter.finish_one();
            Ok(slab.slice(s![0, ..;ry, ..;rx]).to_owned())
        })
        .collect::<Result<Vec<_>, ReadError>>()?;

    let mut data = Array3::zeros((
        out_z,
        decimated_len(shape.y(), ry),
        decimated_len(shape.x(), rx),
    ));
    for (mut out, slice) in data.outer_iter_mut().zip(&slices) {
        out.assign(slice);
    }

    let spacing = source.spacing();
    let rate = [rx, ry, rz];
    let spacing = std::array::from_fn(|i| spacing[i] * rate[i] as f64);
    Ok(Volume::new(data, spacing)
        .with_origin(source.origin())
        .with_element_type(source.element_type()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::ElementType;
    use crate::geometry::{GeometryError, Shape3};
    use crate::progress::NoProgress;
    use std::ops::Range;

    /// Voxel `[z, y, x]` holds `100 z + 10 y + x`.
    struct Ramp(Shape3);

    impl SliceSource for Ramp {
        fn shape(&self) -> Shape3 {
            self.0
        }

        fn element_type(&self) -> ElementType {
            ElementType::U16
        }

        fn read_slices(&self, z: Range<usize>) -> Result<Array3<f32>, ReadError> {
            let start = z.start;
            Ok(Array3::from_shape_fn((z.len(), self.0.y(), self.0.x()), |(k, j, i)| {
                ((start + k) * 100 + j * 10 + i) as f32
            }))
        }
    }

    #[test]
    fn z_crop_keeps_offset_in_extent() {
        let source = Ramp(Shape3::new(6, 10, 5).unwrap());
        let volume = crop(&source, [0, 5, 0, 9, 1, 3], &NoProgress).unwrap();
        assert_eq!(volume.shape(), [6, 10, 3]);
        assert_eq!(volume.extent(), [0, 5, 0, 9, 1, 3]);
        assert_eq!(volume.data()[[0, 0, 0]], 100.0);
        assert_eq!(volume.data()[[2, 9, 5]], 395.0);
    }

    #[test]
    fn crop_in_plane_with_wildcards() {
        let source = Ramp(Shape3::new(6, 10, 5).unwrap());
        let volume = crop(&source, [2, 3, 4, -1, -1, 0], &NoProgress).unwrap();
        assert_eq!(volume.extent(), [2, 3, 4, 9, 0, 0]);
        assert_eq!(volume.data()[[0, 0, 0]], 42.0);
    }

    #[test]
    fn crop_rejects_out_of_bounds() {
        let source = Ramp(Shape3::new(6, 10, 5).unwrap());
        let result = crop(&source, [0, 6, 0, 9, 0, 4], &NoProgress);
        assert!(matches!(
            result,
            Err(ReadError::Geometry(GeometryError::InvalidExtent { .. }))
        ));
    }

    #[test]
    fn decimate_to_bounds() {
        let source = Ramp(Shape3::new(6, 10, 5).unwrap());
        let volume = decimate(&source, [3, 10, 5], Some([1, 1, 2]), &NoProgress).unwrap();
        assert_eq!(volume.shape(), [3, 10, 3]);
        assert_eq!(volume.spacing(), [2.0, 1.0, 2.0]);
        assert_eq!(volume.data()[[1, 1, 2]], 214.0);
    }
}
