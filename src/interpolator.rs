use ndarray::{Array2, ArrayView2, ArrayView3, Axis};
use rayon::prelude::*;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Dimensions `(z, y, x)` a volume would need for isotropic voxels at
    /// its finest spacing. `spacing` is `(x, y, z)`.
    pub(crate) fn get_isotropic_dimensions(
        spacing: [f64; 3],
        original_dim: (usize, usize, usize),
    ) -> (usize, usize, usize) {
        let [x_spacing, y_spacing, z_spacing] = spacing;
        let min_spacing = x_spacing.min(y_spacing).min(z_spacing);
        if min_spacing.is_nan() || min_spacing <= 0.0 {
            return original_dim;
        }
        let inv_min_spacing = 1.0 / min_spacing;

        let scale = |n: usize, s: f64| ((n as f64 * s * inv_min_spacing).round() as usize).max(1);
        (
            scale(original_dim.0, z_spacing),
            scale(original_dim.1, y_spacing),
            scale(original_dim.2, x_spacing),
        )
    }

    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<f32>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;

        let v0 = slice[[y0, x0]].mul_add(1.0 - dx, slice[[y0, x1]] * dx);
        let v1 = slice[[y1, x0]].mul_add(1.0 - dx, slice[[y1, x1]] * dx);

        v0.mul_add(1.0 - dy, v1 * dy)
    }

    /// Resample `slice` to `height` x `width` with pixel centres aligned.
    pub(crate) fn resize_bilinear(slice: &ArrayView2<f32>, height: usize, width: usize) -> Array2<f32> {
        let (slice_height, slice_width) = slice.dim();
        if (slice_height, slice_width) == (height, width) {
            return slice.to_owned();
        }

        let scale_x = slice_width as f32 / width as f32;
        let scale_y = slice_height as f32 / height as f32;
        let max_x = (slice_width - 1) as f32;
        let max_y = (slice_height - 1) as f32;

        let pixels: Vec<f32> = (0..height)
            .into_par_iter()
            .flat_map_iter(|y| {
                let src_y = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, max_y);
                (0..width).map(move |x| {
                    let src_x = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, max_x);
                    Self::bilinear_interpolate(slice, src_y, src_x)
                })
            })
            .collect();

        Array2::from_shape_vec((height, width), pixels)
            .unwrap_or_else(|_| Array2::zeros((height, width)))
    }

    /// Average a run of slices `[z, y, x]` into one `[y, x]` slice.
    pub(crate) fn mean_slice(chunk: &ArrayView3<f32>) -> Array2<f32> {
        let (_, height, width) = chunk.dim();
        chunk
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array2::zeros((height, width)))
    }
}
