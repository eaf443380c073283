//! Skull stripping.
//!
//! [`BrainExtractor`] produces a tissue probability map from intensity
//! statistics and connectivity: robust normalisation, Otsu classification
//! softened by a sigmoid, the largest connected tissue component, hole
//! filling and morphological closing, then Gaussian feathering of the
//! resulting region. [`BrainMask`] binarises such a map and strips a volume.

use crate::enums::Modality;
use crate::error::{Error, Result};
use crate::smoother::gaussian_filter;
use crate::volume::Volume;

use ndarray::{Array3, Axis, Zip};
use std::collections::VecDeque;

/// Extraction parameters for one modality.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionProfile {
    /// Lower intensity quantile mapped to 0 before classification
    pub low_quantile: f64,
    /// Upper intensity quantile mapped to 1 before classification
    pub high_quantile: f64,
    /// Sigmoid width around the Otsu threshold, in normalised intensity
    pub softness: f32,
    /// Regularisation of the soft classification, in voxels
    pub smoothing_sigma: f64,
    /// Closing radius in voxels
    pub closing_radius: usize,
    /// Feathering of the final region, in voxels
    pub feather_sigma: f64,
}

impl ExtractionProfile {
    pub fn for_modality(modality: Modality) -> Self {
        match modality {
            Modality::Structural => Self {
                low_quantile: 0.02,
                high_quantile: 0.98,
                softness: 0.05,
                smoothing_sigma: 1.0,
                closing_radius: 2,
                feather_sigma: 1.0,
            },
            // EPI: coarse voxels and weak contrast, so less spatial
            // regularisation and a wider sigmoid
            Modality::Functional => Self {
                low_quantile: 0.05,
                high_quantile: 0.95,
                softness: 0.08,
                smoothing_sigma: 0.5,
                closing_radius: 1,
                feather_sigma: 0.5,
            },
        }
    }
}

/// A backend that estimates brain-tissue probability for every voxel.
pub trait BrainExtraction {
    /// Probability of brain tissue per voxel, same shape as `volume`, values
    /// in [0, 1].
    fn probability_map(&self, volume: &Volume) -> Result<Array3<f32>>;

    /// Threshold the probability map at [`BrainMask::THRESHOLD`] and strip
    /// `volume` with it.
    fn extract(&self, volume: &Volume) -> Result<(BrainMask, Volume)> {
        let probability = self.probability_map(volume)?;
        let mask = BrainMask::from_probability(&probability, BrainMask::THRESHOLD);
        if mask.count() == 0 {
            return Err(Error::extraction("empty brain mask"));
        }
        let stripped = mask.apply(volume)?;
        Ok((mask, stripped))
    }
}

#[derive(Debug, Clone)]
pub struct BrainExtractor {
    profile: ExtractionProfile,
}

impl BrainExtractor {
    pub fn new(modality: Modality) -> Self {
        Self::with_profile(ExtractionProfile::for_modality(modality))
    }

    pub fn with_profile(profile: ExtractionProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &ExtractionProfile {
        &self.profile
    }

    fn normalize(&self, data: &Array3<f32>) -> Result<Array3<f32>> {
        let mut samples: Vec<f32> = data
            .iter()
            .copied()
            .filter(|v| v.is_finite() && *v > 0.0)
            .collect();
        if samples.is_empty() {
            return Err(Error::extraction("no positive intensities"));
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let quantile = |q: f64| samples[((q * samples.len() as f64) as usize).min(samples.len() - 1)];
        let lo = quantile(self.profile.low_quantile);
        let hi = quantile(self.profile.high_quantile);
        if hi - lo <= f32::EPSILON * hi.abs().max(1.0) {
            return Err(Error::extraction("no intensity contrast"));
        }

        let range = hi - lo;
        Ok(data.mapv(|v| {
            if v.is_finite() {
                ((v - lo) / range).clamp(0.0, 1.0)
            } else {
                0.0
            }
        }))
    }
}

impl Default for BrainExtractor {
    fn default() -> Self {
        Self::new(Modality::default())
    }
}

impl BrainExtraction for BrainExtractor {
    fn probability_map(&self, volume: &Volume) -> Result<Array3<f32>> {
        let (d0, d1, d2) = volume.dim();
        if d0 < 3 || d1 < 3 || d2 < 3 {
            return Err(Error::extraction(format!(
                "volume shape ({d0}, {d1}, {d2}) is too small"
            )));
        }

        let normalized = self.normalize(&volume.data)?;
        let threshold = otsu_threshold(normalized.iter().copied(), 256);
        let softness = self.profile.softness;
        let soft = normalized.mapv(|v| 1.0 / (1.0 + (-(v - threshold) / softness).exp()));
        let soft = gaussian_filter(&soft, [self.profile.smoothing_sigma; 3]);

        let tissue = soft.mapv(|p| p >= 0.5);
        let mut region = largest_component(&tissue)
            .ok_or_else(|| Error::extraction("no connected tissue component"))?;
        region = fill_holes(&region);
        region = close(&region, self.profile.closing_radius);

        let region = region.mapv(|inside| if inside { 1.0f32 } else { 0.0 });
        let mut probability = gaussian_filter(&region, [self.profile.feather_sigma; 3]);
        probability.mapv_inplace(|p| p.clamp(0.0, 1.0));
        Ok(probability)
    }
}

/// Binary brain mask with the shape of its source volume.
#[derive(Debug, Clone, PartialEq)]
pub struct BrainMask {
    mask: Array3<bool>,
}

impl BrainMask {
    /// Voxels with probability at or above this value are brain
    pub const THRESHOLD: f32 = 0.5;

    pub fn from_probability(probability: &Array3<f32>, threshold: f32) -> Self {
        Self {
            mask: probability.mapv(|p| p >= threshold),
        }
    }

    pub fn from_array(mask: Array3<bool>) -> Self {
        Self { mask }
    }

    pub fn dim(&self) -> (usize, usize, usize) {
        self.mask.dim()
    }

    pub fn as_array(&self) -> &Array3<bool> {
        &self.mask
    }

    /// Number of brain voxels
    pub fn count(&self) -> usize {
        self.mask.iter().filter(|&&m| m).count()
    }

    /// Copy of `volume` with every voxel outside the mask set to zero. The
    /// affine is kept unchanged.
    pub fn apply(&self, volume: &Volume) -> Result<Volume> {
        if volume.dim() != self.dim() {
            return Err(Error::extraction(format!(
                "mask shape {:?} does not match volume shape {:?}",
                self.dim(),
                volume.dim()
            )));
        }
        let mut data = volume.data.clone();
        Zip::from(&mut data).and(&self.mask).par_for_each(|v, &inside| {
            if !inside {
                *v = 0.0;
            }
        });
        Ok(volume.with_data(data))
    }
}

/// Otsu's method over values in [0, 1]. Returns the upper edge of the last
/// background bin.
fn otsu_threshold(values: impl Iterator<Item = f32>, num_bins: usize) -> f32 {
    let mut histogram = vec![0usize; num_bins];
    for v in values {
        let bin = ((v.clamp(0.0, 1.0) * num_bins as f32) as usize).min(num_bins - 1);
        histogram[bin] += 1;
    }

    let total: f64 = histogram.iter().sum::<usize>() as f64;
    let sum_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum();

    let mut sum_background = 0.0;
    let mut weight_background = 0.0;
    let mut max_variance = 0.0;
    let mut optimal_bin = 0;

    for (t, &count) in histogram.iter().enumerate() {
        weight_background += count as f64;
        if weight_background == 0.0 {
            continue;
        }
        let weight_foreground = total - weight_background;
        if weight_foreground == 0.0 {
            break;
        }

        sum_background += t as f64 * count as f64;
        let mean_background = sum_background / weight_background;
        let mean_foreground = (sum_total - sum_background) / weight_foreground;

        let variance =
            weight_background * weight_foreground * (mean_background - mean_foreground).powi(2);
        if variance > max_variance {
            max_variance = variance;
            optimal_bin = t;
        }
    }

    (optimal_bin + 1) as f32 / num_bins as f32
}

fn neighbors(
    (i, j, k): (usize, usize, usize),
    (d0, d1, d2): (usize, usize, usize),
) -> impl Iterator<Item = (usize, usize, usize)> {
    let candidates = [
        (i.wrapping_sub(1), j, k),
        (i + 1, j, k),
        (i, j.wrapping_sub(1), k),
        (i, j + 1, k),
        (i, j, k.wrapping_sub(1)),
        (i, j, k + 1),
    ];
    candidates
        .into_iter()
        .filter(move |&(a, b, c)| a < d0 && b < d1 && c < d2)
}

/// Largest 6-connected component of `mask`
fn largest_component(mask: &Array3<bool>) -> Option<Array3<bool>> {
    let dim = mask.dim();
    let mut visited = Array3::from_elem(dim, false);
    let mut best: Vec<(usize, usize, usize)> = Vec::new();
    let mut queue = VecDeque::new();

    for (start, &inside) in mask.indexed_iter() {
        if !inside || visited[start] {
            continue;
        }
        let mut component = vec![start];
        visited[start] = true;
        queue.push_back(start);
        while let Some(p) = queue.pop_front() {
            for n in neighbors(p, dim) {
                if mask[n] && !visited[n] {
                    visited[n] = true;
                    component.push(n);
                    queue.push_back(n);
                }
            }
        }
        if component.len() > best.len() {
            best = component;
        }
    }

    if best.is_empty() {
        return None;
    }
    let mut out = Array3::from_elem(dim, false);
    for p in best {
        out[p] = true;
    }
    Some(out)
}

/// Fill every background region that does not reach the array border.
fn fill_holes(mask: &Array3<bool>) -> Array3<bool> {
    let (d0, d1, d2) = mask.dim();
    let mut outside = Array3::from_elem((d0, d1, d2), false);
    let mut queue = VecDeque::new();

    for (p, &inside) in mask.indexed_iter() {
        let on_border = p.0 == 0
            || p.1 == 0
            || p.2 == 0
            || p.0 == d0 - 1
            || p.1 == d1 - 1
            || p.2 == d2 - 1;
        if on_border && !inside {
            outside[p] = true;
            queue.push_back(p);
        }
    }
    while let Some(p) = queue.pop_front() {
        for n in neighbors(p, (d0, d1, d2)) {
            if !mask[n] && !outside[n] {
                outside[n] = true;
                queue.push_back(n);
            }
        }
    }

    outside.mapv(|o| !o)
}

/// Morphological closing with a cube of half-width `radius`
fn close(mask: &Array3<bool>, radius: usize) -> Array3<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let dilated = morph(mask, radius, true);
    morph(&dilated, radius, false)
}

/// Separable cube dilation (`grow`) or erosion. Out-of-bounds voxels are
/// ignored.
fn morph(mask: &Array3<bool>, radius: usize, grow: bool) -> Array3<bool> {
    let mut current = mask.clone();
    for axis in 0..3 {
        let mut next = Array3::from_elem(current.raw_dim(), false);
        Zip::from(next.lanes_mut(Axis(axis)))
            .and(current.lanes(Axis(axis)))
            .par_for_each(|mut out, line| {
                let n = line.len();
                for (i, o) in out.iter_mut().enumerate() {
                    let lo = i.saturating_sub(radius);
                    let hi = (i + radius).min(n - 1);
                    let mut window = (lo..=hi).map(|t| line[t]);
                    *o = if grow {
                        window.any(|v| v)
                    } else {
                        window.all(|v| v)
                    };
                }
            });
        current = next;
    }
    current
}
