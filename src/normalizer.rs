//! Normalization of a subject volume into template space.
//!
//! The moving volume is first aligned to the fixed grid in physical space
//! through both affines, shifted so the intensity centroids coincide. For
//! [`TransformFamily::SymmetricDiffeomorphic`] a dense displacement field is
//! then estimated with diffeomorphic demons using symmetric (averaged)
//! gradient forces, coarse to fine. Updates are regularised with a Gaussian,
//! exponentiated by scaling and squaring, and composed with the current
//! field, which keeps the transform smooth and invertible.

use crate::enums::TransformFamily;
use crate::error::{Error, Result};
use crate::interpolator::Interpolator;
use crate::smoother::gaussian_filter;
use crate::volume::Volume;

use log::debug;
use nalgebra::{Matrix4, Vector3, Vector4};
use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

/// Smallest extent either image may have along any axis
const MIN_EXTENT: usize = 4;

/// Demons schedule and regularisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationParams {
    /// Grid shrink factor per level, coarse to fine
    pub shrink_factors: Vec<usize>,
    /// Maximum iterations per level
    pub iterations: Vec<usize>,
    /// Gaussian sigma applied to each update, in level voxels
    pub update_sigma: f64,
    /// Gaussian sigma applied to the accumulated field, in level voxels
    pub field_sigma: f64,
    /// Bound on a single update step, in level voxels
    pub max_step: f64,
    /// Relative cost improvement below which a level stops early
    pub tolerance: f64,
}

impl Default for RegistrationParams {
    fn default() -> Self {
        Self {
            shrink_factors: vec![4, 2, 1],
            iterations: vec![40, 20, 10],
            update_sigma: 1.5,
            field_sigma: 1.0,
            max_step: 1.0,
            tolerance: 1e-4,
        }
    }
}

impl RegistrationParams {
    pub fn validate(&self) -> Result<()> {
        if self.shrink_factors.is_empty() {
            return Err(Error::InvalidConfig("registration needs at least one level".into()));
        }
        if self.shrink_factors.len() != self.iterations.len() {
            return Err(Error::InvalidConfig(format!(
                "{} shrink factors but {} iteration counts",
                self.shrink_factors.len(),
                self.iterations.len()
            )));
        }
        if self.shrink_factors.contains(&0) {
            return Err(Error::InvalidConfig("shrink factors must be positive".into()));
        }
        if self.max_step.is_nan() || self.max_step <= 0.0 {
            return Err(Error::InvalidConfig("max_step must be positive".into()));
        }
        if self.update_sigma < 0.0 || self.field_sigma < 0.0 || self.tolerance < 0.0 {
            return Err(Error::InvalidConfig(
                "sigmas and tolerance must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// A backend that resamples a moving volume into the grid of a fixed one.
pub trait Registration {
    /// The returned volume has the shape and the affine of `fixed`.
    fn register(&self, moving: &Volume, fixed: &Volume) -> Result<Volume>;
}

#[derive(Debug, Clone, Default)]
pub struct SpatialNormalizer {
    family: TransformFamily,
    params: RegistrationParams,
}

impl SpatialNormalizer {
    pub fn new(family: TransformFamily, params: RegistrationParams) -> Self {
        Self { family, params }
    }

    pub fn family(&self) -> TransformFamily {
        self.family
    }

    fn check_shape(volume: &Volume, role: &str) -> Result<()> {
        let (d0, d1, d2) = volume.dim();
        if d0 < MIN_EXTENT || d1 < MIN_EXTENT || d2 < MIN_EXTENT {
            return Err(Error::registration(format!(
                "{role} shape ({d0}, {d1}, {d2}) is too small for registration"
            )));
        }
        Ok(())
    }

    /// Matrix taking fixed voxel indices to moving voxel indices
    fn initial_alignment(moving: &Volume, fixed: &Volume) -> Result<Matrix4<f64>> {
        let world_to_moving = moving
            .world_to_voxel()
            .ok_or_else(|| Error::registration("moving affine is singular"))?;
        let moving_center = moving
            .center_of_mass()
            .ok_or_else(|| Error::registration("moving image is empty"))?;
        let fixed_center = fixed
            .center_of_mass()
            .ok_or_else(|| Error::registration("fixed image is empty"))?;

        let m = moving.voxel_to_world(moving_center);
        let f = fixed.voxel_to_world(fixed_center);
        let shift = Matrix4::new_translation(&Vector3::new(m[0] - f[0], m[1] - f[1], m[2] - f[2]));

        Ok(world_to_moving * shift * fixed.affine)
    }

    fn demons(&self, moving: &Volume, fixed: &Volume, initial: &Matrix4<f64>) -> Result<Field> {
        self.params
            .validate()
            .map_err(|e| Error::registration(e.to_string()))?;

        let fixed_norm = normalize_intensity(&fixed.data)
            .ok_or_else(|| Error::registration("fixed image is empty"))?;
        let moving_norm = normalize_intensity(&moving.data)
            .ok_or_else(|| Error::registration("moving image is empty"))?;

        let mut field: Option<Field> = None;
        for (level, (&factor, &iterations)) in self
            .params
            .shrink_factors
            .iter()
            .zip(&self.params.iterations)
            .enumerate()
        {
            let fixed_level = shrink(&fixed_norm, factor);
            let moving_level = if factor > 1 {
                gaussian_filter(&moving_norm, [0.5 * factor as f64; 3])
            } else {
                moving_norm.clone()
            };

            let mut current = match field.take() {
                Some(previous) => previous.resample(fixed_level.dim(), factor),
                None => Field::zeros(fixed_level.dim(), factor),
            };

            let mut previous_cost = f64::INFINITY;
            for iteration in 0..iterations {
                let warped = warp(&moving_level, &current, initial);
                let cost = mean_squared_error(&fixed_level, &warped);
                if !cost.is_finite() {
                    return Err(Error::registration(format!(
                        "cost diverged at level {level}, iteration {iteration}"
                    )));
                }
                if previous_cost.is_finite() {
                    let improvement = (previous_cost - cost) / previous_cost.max(f64::EPSILON);
                    if improvement < self.params.tolerance {
                        debug!("level {level} converged after {iteration} iterations, cost {cost:.6}");
                        break;
                    }
                }
                previous_cost = cost;

                let mut update = demons_update(&fixed_level, &warped, self.params.max_step, factor);
                update.smooth(self.params.update_sigma);
                let update = update.exp();
                current = current.compose(&update);
                current.smooth(self.params.field_sigma);
            }
            debug!("level {level} (shrink {factor}) finished, cost {previous_cost:.6}");
            field = Some(current);
        }

        field.ok_or_else(|| Error::registration("no registration level ran"))
    }
}

impl Registration for SpatialNormalizer {
    fn register(&self, moving: &Volume, fixed: &Volume) -> Result<Volume> {
        Self::check_shape(moving, "moving")?;
        Self::check_shape(fixed, "fixed")?;

        let initial = Self::initial_alignment(moving, fixed)?;
        let field = match self.family {
            TransformFamily::Translation => None,
            TransformFamily::SymmetricDiffeomorphic => Some(self.demons(moving, fixed, &initial)?),
        };

        let mut data = Array3::<f32>::zeros(fixed.data.raw_dim());
        Zip::indexed(&mut data).par_for_each(|(i, j, k), v| {
            let mut p = [i as f64, j as f64, k as f64];
            if let Some(field) = &field {
                let u = field.displacement_at_voxel(p);
                p = [p[0] + u[0], p[1] + u[1], p[2] + u[2]];
            }
            *v = Interpolator::trilinear_interpolate(&moving.data, map_point(&initial, p), 0.0);
        });

        if data.iter().any(|v| !v.is_finite()) {
            return Err(Error::registration("resampled image has non-finite values"));
        }
        Ok(Volume::new(data, fixed.affine))
    }
}

#[inline]
fn map_point(m: &Matrix4<f64>, p: [f64; 3]) -> [f64; 3] {
    let q = m * Vector4::new(p[0], p[1], p[2], 1.0);
    [q.x, q.y, q.z]
}

/// Scale positive intensities so the 99th percentile maps to 1.
fn normalize_intensity(data: &Array3<f32>) -> Option<Array3<f32>> {
    let mut samples: Vec<f32> = data
        .iter()
        .copied()
        .filter(|v| v.is_finite() && *v > 0.0)
        .collect();
    if samples.is_empty() {
        return None;
    }
    let index = ((0.99 * samples.len() as f64) as usize).min(samples.len() - 1);
    let (_, &mut reference, _) = samples.select_nth_unstable_by(index, |a, b| a.total_cmp(b));
    Some(data.mapv(|v| if v.is_finite() { (v / reference).clamp(0.0, 1.0) } else { 0.0 }))
}

/// Smooth then subsample every `factor`-th voxel
fn shrink(data: &Array3<f32>, factor: usize) -> Array3<f32> {
    if factor <= 1 {
        return data.clone();
    }
    let smoothed = gaussian_filter(data, [0.5 * factor as f64; 3]);
    let (d0, d1, d2) = data.dim();
    let dim = (d0.div_ceil(factor), d1.div_ceil(factor), d2.div_ceil(factor));
    Array3::from_shape_fn(dim, |(i, j, k)| smoothed[[i * factor, j * factor, k * factor]])
}

fn mean_squared_error(a: &Array3<f32>, b: &Array3<f32>) -> f64 {
    let sum: f64 = Zip::from(a)
        .and(b)
        .par_map_collect(|&x, &y| ((x - y) as f64).powi(2))
        .sum();
    sum / a.len().max(1) as f64
}

/// Moving intensities sampled at every level voxel through the current
/// field and the initial alignment.
fn warp(moving: &Array3<f32>, field: &Field, initial: &Matrix4<f64>) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros(field.dim());
    let f = field.factor as f64;
    Zip::indexed(&mut out).par_for_each(|(i, j, k), v| {
        let u = field.at_index((i, j, k));
        let p = [i as f64 * f + u[0], j as f64 * f + u[1], k as f64 * f + u[2]];
        *v = Interpolator::trilinear_interpolate(moving, map_point(initial, p), 0.0);
    });
    out
}

fn central_gradient(data: &Array3<f32>, (i, j, k): (usize, usize, usize)) -> [f32; 3] {
    let (d0, d1, d2) = data.dim();
    let diff = |lo: f32, hi: f32, span: usize| if span == 0 { 0.0 } else { (hi - lo) / span as f32 };
    let (i0, i1) = (i.saturating_sub(1), (i + 1).min(d0 - 1));
    let (j0, j1) = (j.saturating_sub(1), (j + 1).min(d1 - 1));
    let (k0, k1) = (k.saturating_sub(1), (k + 1).min(d2 - 1));
    [
        diff(data[[i0, j, k]], data[[i1, j, k]], i1 - i0),
        diff(data[[i, j0, k]], data[[i, j1, k]], j1 - j0),
        diff(data[[i, j, k0]], data[[i, j, k1]], k1 - k0),
    ]
}

/// Demons step with symmetric forces. Output displacements are in full
/// resolution voxels.
fn demons_update(fixed: &Array3<f32>, warped: &Array3<f32>, max_step: f64, factor: usize) -> Field {
    let mut field = Field::zeros(fixed.dim(), factor);
    let f = factor as f32;
    let alpha2 = (1.0 / (max_step as f32 * f)).powi(2);
    let [c0, c1, c2] = &mut field.components;

    Zip::indexed(c0).and(c1).and(c2).par_for_each(|idx, u0, u1, u2| {
        let diff = fixed[idx] - warped[idx];
        let gf = central_gradient(fixed, idx);
        let gm = central_gradient(warped, idx);
        // gradients per full resolution voxel
        let g = [
            0.5 * (gf[0] + gm[0]) / f,
            0.5 * (gf[1] + gm[1]) / f,
            0.5 * (gf[2] + gm[2]) / f,
        ];
        let denominator = g[0] * g[0] + g[1] * g[1] + g[2] * g[2] + alpha2 * diff * diff;
        if denominator > 1e-12 && diff != 0.0 {
            let scale = diff / denominator;
            *u0 = scale * g[0];
            *u1 = scale * g[1];
            *u2 = scale * g[2];
        }
    });
    field
}

/// Dense displacement field on a grid subsampled by `factor`. Values are
/// displacements in full resolution voxels.
#[derive(Debug, Clone)]
struct Field {
    components: [Array3<f32>; 3],
    factor: usize,
}

impl Field {
    fn zeros(dim: (usize, usize, usize), factor: usize) -> Self {
        Self {
            components: [Array3::zeros(dim), Array3::zeros(dim), Array3::zeros(dim)],
            factor,
        }
    }

    fn dim(&self) -> (usize, usize, usize) {
        self.components[0].dim()
    }

    #[inline]
    fn at_index(&self, idx: (usize, usize, usize)) -> [f64; 3] {
        [
            self.components[0][idx] as f64,
            self.components[1][idx] as f64,
            self.components[2][idx] as f64,
        ]
    }

    /// Displacement at a fractional grid position
    #[inline]
    fn at(&self, p: [f64; 3]) -> [f64; 3] {
        [
            Interpolator::trilinear_clamped(&self.components[0], p) as f64,
            Interpolator::trilinear_clamped(&self.components[1], p) as f64,
            Interpolator::trilinear_clamped(&self.components[2], p) as f64,
        ]
    }

    /// Displacement at a full resolution voxel position
    fn displacement_at_voxel(&self, p: [f64; 3]) -> [f64; 3] {
        let f = self.factor as f64;
        self.at([p[0] / f, p[1] / f, p[2] / f])
    }

    fn smooth(&mut self, sigma: f64) {
        if sigma <= 0.0 {
            return;
        }
        for c in self.components.iter_mut() {
            *c = gaussian_filter(c, [sigma; 3]);
        }
    }

    fn scaled(&self, s: f32) -> Self {
        Self {
            components: self.components.clone().map(|c| c * s),
            factor: self.factor,
        }
    }

    /// Largest displacement length in grid units
    fn max_norm(&self) -> f64 {
        let norms = Zip::from(&self.components[0])
            .and(&self.components[1])
            .and(&self.components[2])
            .par_map_collect(|&a, &b, &c| ((a * a + b * b + c * c) as f64).sqrt());
        norms.iter().copied().fold(0.0, f64::max) / self.factor as f64
    }

    /// `x -> x + self(x) + other(x + self(x))`, i.e. `other` applied after
    /// `self` in point order.
    fn compose(&self, other: &Field) -> Field {
        let mut out = Field::zeros(self.dim(), self.factor);
        let f = self.factor as f64;
        let [c0, c1, c2] = &mut out.components;
        Zip::indexed(c0).and(c1).and(c2).par_for_each(|idx, o0, o1, o2| {
            let u = other.at_index(idx);
            let q = [
                idx.0 as f64 + u[0] / f,
                idx.1 as f64 + u[1] / f,
                idx.2 as f64 + u[2] / f,
            ];
            let s = self.at(q);
            *o0 = (u[0] + s[0]) as f32;
            *o1 = (u[1] + s[1]) as f32;
            *o2 = (u[2] + s[2]) as f32;
        });
        out
    }

    /// Exponential of a stationary velocity field by scaling and squaring
    fn exp(&self) -> Field {
        let max_norm = self.max_norm();
        let squarings = if max_norm > 0.5 {
            (max_norm / 0.5).log2().ceil() as i32
        } else {
            0
        };
        let mut result = self.scaled(0.5f32.powi(squarings));
        for _ in 0..squarings {
            result = result.compose(&result);
        }
        result
    }

    /// The same displacement sampled on a grid with a different factor
    fn resample(&self, dim: (usize, usize, usize), factor: usize) -> Field {
        let mut out = Field::zeros(dim, factor);
        let ratio = factor as f64 / self.factor as f64;
        let [c0, c1, c2] = &mut out.components;
        Zip::indexed(c0).and(c1).and(c2).par_for_each(|(i, j, k), o0, o1, o2| {
            let u = self.at([i as f64 * ratio, j as f64 * ratio, k as f64 * ratio]);
            *o0 = u[0] as f32;
            *o1 = u[1] as f32;
            *o2 = u[2] as f32;
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(dim: (usize, usize, usize), center: [f64; 3], radius: f64) -> Array3<f32> {
        Array3::from_shape_fn(dim, |(i, j, k)| {
            let d2 = (i as f64 - center[0]).powi(2)
                + (j as f64 - center[1]).powi(2)
                + (k as f64 - center[2]).powi(2);
            (100.0 * (-d2 / (2.0 * radius * radius)).exp()) as f32
        })
    }

    fn quick_params() -> RegistrationParams {
        RegistrationParams {
            shrink_factors: vec![2, 1],
            iterations: vec![10, 5],
            ..RegistrationParams::default()
        }
    }

    #[test]
    fn output_takes_template_shape_and_affine() {
        let mut template_affine = Matrix4::identity();
        template_affine[(0, 3)] = -10.0;
        template_affine[(1, 1)] = 1.5;
        let fixed = Volume::new(blob((20, 18, 16), [10.0, 9.0, 8.0], 3.0), template_affine);
        let moving = Volume::new(blob((14, 16, 18), [6.0, 9.0, 10.0], 3.0), Matrix4::identity());

        for family in [TransformFamily::Translation, TransformFamily::SymmetricDiffeomorphic] {
            let out = SpatialNormalizer::new(family, quick_params())
                .register(&moving, &fixed)
                .unwrap();
            assert_eq!(out.dim(), fixed.dim());
            assert_eq!(out.affine, fixed.affine);
        }
    }

    #[test]
    fn translation_aligns_centroids() {
        let fixed = Volume::new(blob((24, 24, 24), [12.0, 12.0, 12.0], 3.0), Matrix4::identity());
        let moving = Volume::new(blob((24, 24, 24), [8.0, 14.0, 11.0], 3.0), Matrix4::identity());
        let out = SpatialNormalizer::new(TransformFamily::Translation, quick_params())
            .register(&moving, &fixed)
            .unwrap();
        let c = out.center_of_mass().unwrap();
        for axis in 0..3 {
            assert!((c[axis] - 12.0).abs() < 0.5, "axis {axis}: {c:?}");
        }
    }

    /// Uniform ball with a soft edge
    fn ball(dim: usize, radius: f64) -> Array3<f32> {
        let c = (dim as f64 - 1.0) / 2.0;
        Array3::from_shape_fn((dim, dim, dim), |(i, j, k)| {
            let r = ((i as f64 - c).powi(2) + (j as f64 - c).powi(2) + (k as f64 - c).powi(2)).sqrt();
            (100.0 / (1.0 + ((r - radius) / 0.7).exp())) as f32
        })
    }

    #[test]
    fn demons_reduces_mismatch_beyond_translation() {
        let fixed = Volume::new(ball(24, 7.0), Matrix4::identity());
        let moving = Volume::new(ball(24, 5.5), Matrix4::identity());

        let rigid = SpatialNormalizer::new(TransformFamily::Translation, quick_params())
            .register(&moving, &fixed)
            .unwrap();
        let deformable = SpatialNormalizer::new(TransformFamily::SymmetricDiffeomorphic, quick_params())
            .register(&moving, &fixed)
            .unwrap();

        let err_rigid = mean_squared_error(&fixed.data, &rigid.data);
        let err_deformable = mean_squared_error(&fixed.data, &deformable.data);
        assert!(err_deformable < err_rigid, "{err_deformable} !< {err_rigid}");
    }

    #[test]
    fn empty_or_tiny_inputs_fail() {
        let fixed = Volume::new(blob((8, 8, 8), [4.0, 4.0, 4.0], 2.0), Matrix4::identity());
        let empty = Volume::new(Array3::zeros((8, 8, 8)), Matrix4::identity());
        let tiny = Volume::new(Array3::from_elem((3, 8, 8), 1.0), Matrix4::identity());
        let normalizer = SpatialNormalizer::default();

        assert!(matches!(normalizer.register(&empty, &fixed), Err(Error::RegistrationFailure(_))));
        assert!(matches!(normalizer.register(&tiny, &fixed), Err(Error::RegistrationFailure(_))));
    }

    #[test]
    fn singular_affine_fails() {
        let fixed = Volume::new(blob((8, 8, 8), [4.0, 4.0, 4.0], 2.0), Matrix4::identity());
        let moving = Volume::new(blob((8, 8, 8), [4.0, 4.0, 4.0], 2.0), Matrix4::zeros());
        let result = SpatialNormalizer::default().register(&moving, &fixed);
        assert!(matches!(result, Err(Error::RegistrationFailure(_))));
    }

    #[test]
    fn zero_velocity_exponentiates_to_identity() {
        let field = Field::zeros((5, 5, 5), 1);
        let e = field.exp();
        assert!(e.components.iter().all(|c| c.iter().all(|&v| v == 0.0)));
    }

    #[test]
    fn exp_of_constant_field_is_the_constant() {
        let mut field = Field::zeros((6, 6, 6), 1);
        field.components[0].fill(2.0);
        let e = field.exp();
        assert!(e.components[0].iter().all(|&v| (v - 2.0).abs() < 1e-4));
        assert!(e.components[1].iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn schedule_validation() {
        let mut params = RegistrationParams::default();
        assert!(params.validate().is_ok());
        params.iterations.pop();
        assert!(params.validate().is_err());
        params = RegistrationParams {
            shrink_factors: vec![0],
            iterations: vec![1],
            ..RegistrationParams::default()
        };
        assert!(params.validate().is_err());
    }
}
