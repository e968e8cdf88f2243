use std::path::Path;

use image::ImageBuffer;
use image::Luma;
use ndarray::{Array3, ArrayView2, Axis, Zip, s};
use rayon::prelude::*;

use crate::enums::{ByteOrder, ElementType, Interpolation, Orientation};
use crate::formats::{RawLayout, meta_image, npy, raw};
use crate::geometry::GeometryError;
use crate::interpolator::Interpolator;
use crate::volume_loader::ReadError;

/// A volume held in memory, indexed `[z, y, x]`.
///
/// `spacing`, `origin` and `offset` are in toolkit order `(x, y, z)`.
#[derive(Clone, Debug, Default)]
pub struct Volume {
    data: Array3<f32>,
    spacing: [f64; 3],
    origin: [f64; 3],
    offset: [usize; 3],
    element_type: ElementType,
    interpolated_dim: (usize, usize, usize),
}

impl Volume {
    pub fn new(data: Array3<f32>, spacing: [f64; 3]) -> Self {
        let original_dim = data.dim();
        Self {
            data,
            spacing,
            origin: [0.0; 3],
            offset: [0; 3],
            element_type: ElementType::F32,
            interpolated_dim: Interpolator::get_isotropic_dimensions(spacing, original_dim),
        }
    }

    pub fn with_origin(mut self, origin: [f64; 3]) -> Self {
        self.origin = origin;
        self
    }

    /// Index of the first voxel within the source it was read from
    pub fn with_offset(mut self, offset: [usize; 3]) -> Self {
        self.offset = offset;
        self
    }

    /// Element type samples are written back as
    pub fn with_element_type(mut self, element_type: ElementType) -> Self {
        self.element_type = element_type;
        self
    }

    /// Get the dimensions of the volume (depth, height, width)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Dimensions in toolkit order `(x, y, z)`
    pub fn shape(&self) -> [usize; 3] {
        let (z, y, x) = self.dim();
        [x, y, z]
    }

    /// Inclusive index extent `[x0, x1, y0, y1, z0, z1]` within the source.
    pub fn extent(&self) -> [i64; 6] {
        let shape = self.shape();
        let mut extent = [0i64; 6];
        for axis in 0..3 {
            extent[2 * axis] = self.offset[axis] as i64;
            extent[2 * axis + 1] = (self.offset[axis] + shape[axis]) as i64 - 1;
        }
        extent
    }

    pub fn voxel_count(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn spacing(&self) -> [f64; 3] {
        self.spacing
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn offset(&self) -> [usize; 3] {
        self.offset
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    /// Smallest and largest finite sample, `None` for an empty or all-NaN
    /// volume.
    pub fn value_range(&self) -> Option<(f32, f32)> {
        self.data
            .as_slice_memory_order()
            .map(|samples| {
                samples
                    .par_iter()
                    .copied()
                    .filter(|v| v.is_finite())
                    .fold(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |(lo, hi), v| (lo.min(v), hi.max(v)),
                    )
                    .reduce(
                        || (f32::INFINITY, f32::NEG_INFINITY),
                        |a, b| (a.0.min(b.0), a.1.max(b.1)),
                    )
            })
            .filter(|(lo, hi)| lo <= hi)
    }

    pub fn get_slice_from_axis(
        &self,
        index: usize,
        orientation: &Orientation,
    ) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, orientation) {
            return None;
        }
        let slice = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(slice)
    }

    fn get_output_dimensions(&self, orientation: &Orientation) -> (usize, usize) {
        // (width, height)
        let (z, y, x) = self.interpolated_dim;
        match orientation {
            Orientation::Axial => (x, y),
            Orientation::Coronal => (x, z),
            Orientation::Sagittal => (y, z),
        }
    }

    /// 8-bit preview of one slice, windowed to the volume's value range.
    ///
    /// With [`Interpolation::Linear`] the slice is stretched so that pixels
    /// are square in physical units.
    pub fn get_image_from_axis(
        &self,
        index: usize,
        orientation: Orientation,
        interpolation: Interpolation,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.get_slice_from_axis(index, &orientation)?;
        let (lo, hi) = self.value_range().unwrap_or((0.0, 1.0));

        match interpolation {
            Interpolation::None => Self::slice_to_image(&slice, lo, hi),
            Interpolation::Linear => {
                let (width, height) = self.get_output_dimensions(&orientation);
                let resized = Interpolator::resize_bilinear(&slice, height, width);
                Self::slice_to_image(&resized.view(), lo, hi)
            }
        }
    }

    fn slice_to_image(
        slice: &ArrayView2<'_, f32>,
        lo: f32,
        hi: f32,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let scale = if hi > lo { 255.0 / (hi - lo) } else { 0.0 };
        let pixel_data: Vec<u8> = slice
            .iter()
            .map(|&v| ((v - lo) * scale).round().clamp(0.0, 255.0) as u8)
            .collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    fn is_valid_index(&self, index: usize, orientation: &Orientation) -> bool {
        let dim = self.data.dim();
        let max_index = match orientation {
            Orientation::Axial => dim.0,
            Orientation::Coronal => dim.1,
            Orientation::Sagittal => dim.2,
        };
        index < max_index
    }

    /// Flat field correction `(p - dark) / (flat - dark)`, applied to every
    /// slice. Non-finite results (zero denominators) become `default`.
    pub fn flat_field_correct(
        &mut self,
        dark: &ArrayView2<'_, f32>,
        flat: &ArrayView2<'_, f32>,
        default: f32,
    ) -> Result<(), ReadError> {
        let (_, height, width) = self.dim();
        for (h, w) in [dark.dim(), flat.dim()] {
            if (h, w) != (height, width) {
                return Err(GeometryError::InvalidShape([w, h, 1]).into());
            }
        }

        self.data
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .for_each(|mut slice| {
                Zip::from(&mut slice)
                    .and(dark)
                    .and(flat)
                    .for_each(|p, &d, &f| {
                        let corrected = (*p - d) / (f - d);
                        *p = if corrected.is_finite() { corrected } else { default };
                    });
            });
        self.element_type = ElementType::F32;
        Ok(())
    }

    /// Save as a C ordered `.npy` in the volume's element type.
    pub fn save_npy(&self, path: impl AsRef<Path>) -> Result<RawLayout, ReadError> {
        npy::write(path, self, self.element_type, false)
    }

    /// Save as headerless little endian samples.
    pub fn save_raw(&self, path: impl AsRef<Path>) -> Result<RawLayout, ReadError> {
        raw::write(path, self, self.element_type, ByteOrder::Little)
    }

    /// Save as a `.mhd` header and a `.raw` data file next to it.
    pub fn save_meta_image(&self, path: impl AsRef<Path>) -> Result<(), ReadError> {
        meta_image::write_meta_image(path, self, self.element_type)?;
        Ok(())
    }
}
