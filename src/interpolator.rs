use ndarray::Array3;

pub(crate) struct Interpolator;

impl Interpolator {
    /// Trilinear sample of `data` at a fractional index. Points outside the
    /// grid by more than half a voxel read as `outside`; points within that
    /// margin are clamped to the border.
    #[inline]
    pub(crate) fn trilinear_interpolate(data: &Array3<f32>, p: [f64; 3], outside: f32) -> f32 {
        let (d0, d1, d2) = data.dim();
        let dims = [d0, d1, d2];
        for axis in 0..3 {
            if !p[axis].is_finite() || p[axis] < -0.5 || p[axis] > dims[axis] as f64 - 0.5 {
                return outside;
            }
        }

        let x = p[0].clamp(0.0, (d0 - 1) as f64);
        let y = p[1].clamp(0.0, (d1 - 1) as f64);
        let z = p[2].clamp(0.0, (d2 - 1) as f64);

        let x0 = x.floor() as usize;
        let y0 = y.floor() as usize;
        let z0 = z.floor() as usize;
        let x1 = (x0 + 1).min(d0 - 1);
        let y1 = (y0 + 1).min(d1 - 1);
        let z1 = (z0 + 1).min(d2 - 1);

        let dx = (x - x0 as f64) as f32;
        let dy = (y - y0 as f64) as f32;
        let dz = (z - z0 as f64) as f32;

        let c00 = data[[x0, y0, z0]].mul_add(1.0 - dx, data[[x1, y0, z0]] * dx);
        let c01 = data[[x0, y0, z1]].mul_add(1.0 - dx, data[[x1, y0, z1]] * dx);
        let c10 = data[[x0, y1, z0]].mul_add(1.0 - dx, data[[x1, y1, z0]] * dx);
        let c11 = data[[x0, y1, z1]].mul_add(1.0 - dx, data[[x1, y1, z1]] * dx);

        let c0 = c00.mul_add(1.0 - dy, c10 * dy);
        let c1 = c01.mul_add(1.0 - dy, c11 * dy);

        c0.mul_add(1.0 - dz, c1 * dz)
    }

    /// Trilinear sample with the point clamped onto the grid, so borders
    /// extend outward.
    #[inline]
    pub(crate) fn trilinear_clamped(data: &Array3<f32>, p: [f64; 3]) -> f32 {
        let (d0, d1, d2) = data.dim();
        let clamp = |v: f64, d: usize| if v.is_finite() { v.clamp(0.0, (d - 1) as f64) } else { 0.0 };
        Self::trilinear_interpolate(data, [clamp(p[0], d0), clamp(p[1], d1), clamp(p[2], d2)], 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trilinear_hits_grid_points_and_midpoints() {
        let data = Array3::from_shape_fn((3, 3, 3), |(i, j, k)| (i + 2 * j + 4 * k) as f32);
        assert_eq!(Interpolator::trilinear_interpolate(&data, [1.0, 2.0, 0.0], 0.0), 5.0);
        let mid = Interpolator::trilinear_interpolate(&data, [0.5, 0.5, 0.5], 0.0);
        assert!((mid - 3.5).abs() < 1e-6);
    }

    #[test]
    fn trilinear_outside_grid_reads_fill_value() {
        let data = Array3::from_elem((2, 2, 2), 1.0f32);
        assert_eq!(Interpolator::trilinear_interpolate(&data, [-0.6, 0.0, 0.0], -1.0), -1.0);
        assert_eq!(Interpolator::trilinear_interpolate(&data, [1.4, 1.0, 1.0], -1.0), 1.0);
        assert_eq!(Interpolator::trilinear_interpolate(&data, [0.0, f64::NAN, 0.0], 0.0), 0.0);
    }
}
