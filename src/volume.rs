use crate::enums::Plane;

use nalgebra::{Matrix4, Vector4};
use ndarray::{Array3, ArrayView2, Axis, Zip};

/// A 3D intensity array paired with the affine that maps array indices to
/// physical coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub data: Array3<f32>,
    pub affine: Matrix4<f64>,
}

impl Volume {
    pub fn new(data: Array3<f32>, affine: Matrix4<f64>) -> Self {
        Self { data, affine }
    }

    /// Get the dimensions of the volume (i, j, k)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Get a mutable reference to the underlying data
    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn affine(&self) -> &Matrix4<f64> {
        &self.affine
    }

    /// New volume in the same space as `self` holding `data`.
    pub(crate) fn with_data(&self, data: Array3<f32>) -> Self {
        debug_assert_eq!(data.dim(), self.data.dim());
        Self {
            data,
            affine: self.affine,
        }
    }

    /// Physical size of a voxel along each array axis
    pub fn voxel_size(&self) -> [f64; 3] {
        let mut size = [0.0; 3];
        for (axis, s) in size.iter_mut().enumerate() {
            *s = self.affine.fixed_view::<3, 1>(0, axis).norm();
        }
        size
    }

    pub fn voxel_to_world(&self, index: [f64; 3]) -> [f64; 3] {
        let p = self.affine * Vector4::new(index[0], index[1], index[2], 1.0);
        [p.x, p.y, p.z]
    }

    /// Inverse of the affine, `None` when the affine is singular.
    pub fn world_to_voxel(&self) -> Option<Matrix4<f64>> {
        self.affine.try_inverse()
    }

    /// Intensity-weighted centroid in voxel coordinates. Only positive
    /// intensities contribute; `None` when there are none.
    pub fn center_of_mass(&self) -> Option<[f64; 3]> {
        let mut sum = [0.0f64; 3];
        let mut mass = 0.0f64;
        for ((i, j, k), &v) in self.data.indexed_iter() {
            if v.is_finite() && v > 0.0 {
                let w = v as f64;
                sum[0] += w * i as f64;
                sum[1] += w * j as f64;
                sum[2] += w * k as f64;
                mass += w;
            }
        }
        (mass > 0.0).then(|| [sum[0] / mass, sum[1] / mass, sum[2] / mass])
    }

    pub fn get_slice_from_axis(&self, index: usize, plane: Plane) -> Option<ArrayView2<'_, f32>> {
        if !self.is_valid_index(index, plane) {
            return None;
        }
        Some(self.data.index_axis(Axis(plane.axis()), index))
    }

    fn is_valid_index(&self, index: usize, plane: Plane) -> bool {
        index < self.data.len_of(Axis(plane.axis()))
    }

    /// For each array axis, the world axis it runs closest to and whether it
    /// runs in the negative direction.
    pub fn axis_orientation(&self) -> [(usize, bool); 3] {
        let mut weights = [[0.0f64; 3]; 3];
        for col in 0..3 {
            let norm = self.affine.fixed_view::<3, 1>(0, col).norm();
            for row in 0..3 {
                weights[row][col] = if norm > 0.0 {
                    self.affine[(row, col)].abs() / norm
                } else {
                    0.0
                };
            }
        }

        let mut orientation = [(0, false), (1, false), (2, false)];
        let mut used_rows = [false; 3];
        let mut used_cols = [false; 3];
        for _ in 0..3 {
            let mut best: Option<(usize, usize)> = None;
            let mut best_weight = -1.0;
            for row in (0..3).filter(|&r| !used_rows[r]) {
                for col in (0..3).filter(|&c| !used_cols[c]) {
                    if weights[row][col] > best_weight {
                        best_weight = weights[row][col];
                        best = Some((row, col));
                    }
                }
            }
            if let Some((row, col)) = best {
                used_rows[row] = true;
                used_cols[col] = true;
                orientation[col] = (row, self.affine[(row, col)] < 0.0);
            }
        }
        orientation
    }

    /// Reorder and flip the array so that axis `n` increases along world axis
    /// `n` (RAS+). Every voxel keeps its world position.
    pub fn to_canonical(&self) -> Volume {
        let orientation = self.axis_orientation();
        let old_dims = self.data.shape().to_vec();

        let mut perm = [0usize; 3];
        for (array_axis, &(world_axis, _)) in orientation.iter().enumerate() {
            perm[world_axis] = array_axis;
        }

        let mut data = self.data.view().permuted_axes(perm);

        // Maps new indices back onto old ones: old = transform * new
        let mut transform = Matrix4::<f64>::zeros();
        transform[(3, 3)] = 1.0;
        for (new_axis, &old_axis) in perm.iter().enumerate() {
            let flip = orientation[old_axis].1;
            if flip {
                data.invert_axis(Axis(new_axis));
                transform[(old_axis, new_axis)] = -1.0;
                transform[(old_axis, 3)] = (old_dims[old_axis] as f64 - 1.0).max(0.0);
            } else {
                transform[(old_axis, new_axis)] = 1.0;
            }
        }

        Volume {
            data: data.as_standard_layout().into_owned(),
            affine: self.affine * transform,
        }
    }

    /// Zero every non-finite voxel in place.
    pub fn sanitize(&mut self) {
        Zip::from(&mut self.data).par_for_each(|v| {
            if !v.is_finite() {
                *v = 0.0;
            }
        });
    }
}
