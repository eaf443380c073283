use crate::volume::Volume;

use ndarray::{Array3, Axis, Zip};

/// Ratio between the full width at half maximum and the standard deviation
/// of a Gaussian, `2 * sqrt(2 * ln 2)`.
pub fn fwhm_to_sigma_ratio() -> f64 {
    2.0 * (2.0 * std::f64::consts::LN_2).sqrt()
}

/// Isotropic Gaussian smoothing with a kernel given in physical units.
#[derive(Debug, Clone, Copy)]
pub struct Smoother {
    fwhm: f64,
}

impl Default for Smoother {
    fn default() -> Self {
        Self { fwhm: 6.0 }
    }
}

impl Smoother {
    pub fn new(fwhm: f64) -> Self {
        Self { fwhm }
    }

    pub fn fwhm(&self) -> f64 {
        self.fwhm
    }

    /// Kernel standard deviation in physical units
    pub fn sigma(&self) -> f64 {
        self.fwhm / fwhm_to_sigma_ratio()
    }

    /// Smooth a copy of `volume`. The physical sigma is converted to voxels
    /// per axis from the affine's voxel size.
    pub fn smooth(&self, volume: &Volume) -> Volume {
        let sigma = self.sigma();
        let voxel_sigma = volume
            .voxel_size()
            .map(|size| if size > 0.0 { sigma / size } else { sigma });
        volume.with_data(gaussian_filter(&volume.data, voxel_sigma))
    }
}

/// Separable Gaussian filter with per-axis sigma in voxels. The kernel is
/// truncated at four standard deviations and borders are mirrored
/// (`d c b a | a b c d | d c b a`).
pub fn gaussian_filter(data: &Array3<f32>, sigma: [f64; 3]) -> Array3<f32> {
    let mut out = data.to_owned();
    for (axis, &s) in sigma.iter().enumerate() {
        if s > 0.0 && out.len_of(Axis(axis)) > 1 {
            let kernel = gaussian_kernel(s);
            out = convolve_axis(&out, axis, &kernel);
        }
    }
    out
}

fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (4.0 * sigma + 0.5) as isize;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

fn convolve_axis(input: &Array3<f32>, axis: usize, kernel: &[f64]) -> Array3<f32> {
    let mut output = Array3::<f32>::zeros(input.raw_dim());
    let radius = (kernel.len() / 2) as isize;

    Zip::from(output.lanes_mut(Axis(axis)))
        .and(input.lanes(Axis(axis)))
        .par_for_each(|mut out, line| {
            let line: Vec<f32> = line.iter().copied().collect();
            let n = line.len();
            for (i, o) in out.iter_mut().enumerate() {
                let acc: f64 = kernel
                    .iter()
                    .enumerate()
                    .map(|(t, &w)| w * line[reflect(i as isize + t as isize - radius, n)] as f64)
                    .sum();
                *o = acc as f32;
            }
        });

    output
}

#[inline]
fn reflect(index: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let i = index.rem_euclid(period);
    (if i >= n { period - 1 - i } else { i }) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix4;

    fn impulse(dim: usize) -> Array3<f32> {
        let mut data = Array3::zeros((dim, dim, dim));
        data[[dim / 2, dim / 2, dim / 2]] = 1000.0;
        data
    }

    #[test]
    fn sigma_from_fwhm() {
        let s = Smoother::new(6.0);
        assert!((s.sigma() - 6.0 / 2.3548).abs() < 1e-3);
    }

    #[test]
    fn reflect_mirrors_borders() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(-9, 2), 0);
    }

    #[test]
    fn reflect_matches_explicit_mirroring() {
        for n in 1..6usize {
            // ... d c b a | a b c d | d c b a ...
            let forward: Vec<usize> = (0..n).collect();
            let backward: Vec<usize> = (0..n).rev().collect();
            let period: Vec<usize> = forward.iter().chain(backward.iter()).copied().collect();
            let span = 3 * period.len() as isize;
            for index in -span..span {
                let expected = period[index.rem_euclid(period.len() as isize) as usize];
                assert_eq!(reflect(index, n), expected, "index {index}, n {n}");
            }
        }
    }

    #[test]
    fn zero_fwhm_leaves_data_unchanged() {
        let volume = Volume::new(impulse(9), Matrix4::identity());
        let out = Smoother::new(0.0).smooth(&volume);
        assert_eq!(out.data, volume.data);
    }

    #[test]
    fn smoothing_preserves_shape_and_is_deterministic() {
        let volume = Volume::new(impulse(17), Matrix4::identity());
        let smoother = Smoother::default();
        let a = smoother.smooth(&volume);
        let b = smoother.smooth(&volume);
        assert_eq!(a.dim(), volume.dim());
        assert_eq!(a.affine, volume.affine);
        assert_eq!(a.data, b.data);
        // input copy untouched
        assert_eq!(volume.data[[8, 8, 8]], 1000.0);
        assert!(a.data[[8, 8, 8]] < 1000.0);
    }

    #[test]
    fn smoothing_conserves_mass_and_constants() {
        let smoothed = gaussian_filter(&impulse(31), [2.0, 2.0, 2.0]);
        let total: f32 = smoothed.sum();
        assert!((total - 1000.0).abs() < 0.5, "mass {total}");

        let flat = Array3::from_elem((6, 5, 4), 3.0f32);
        let out = gaussian_filter(&flat, [1.5, 1.5, 1.5]);
        assert!(out.iter().all(|&v| (v - 3.0).abs() < 1e-5));
    }

    #[test]
    fn anisotropic_voxels_get_narrower_voxel_sigma() {
        let affine = Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(1.0, 1.0, 4.0));
        let volume = Volume::new(impulse(21), affine);
        let out = Smoother::new(4.0).smooth(&volume);
        // spread along the coarse axis is smaller in voxel units
        assert!(out.data[[10, 10, 11]] < out.data[[11, 10, 10]]);
    }
}
