use crate::error::{Error, Result};
use crate::volume::Volume;

use nalgebra::Matrix4;
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions, XForm};
use ndarray::{Array3, ArrayD, Axis, Ix3};
use std::path::Path;

/// Recognized volumetric file extensions, longest first.
const VOLUME_EXTENSIONS: [&str; 2] = [".nii.gz", ".nii"];

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Reorient the array to canonical (RAS+) axis order after reading
    pub reorient: bool,
}

impl LoadOptions {
    pub fn canonical() -> Self {
        Self { reorient: true }
    }
}

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a volume from a `.nii` or `.nii.gz` file
    ///
    /// The affine is taken as stored unless `options.reorient` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnreadableVolume`] if the file is missing, cannot be
    /// parsed, or has fewer than three non-empty dimensions.
    pub fn load(path: impl AsRef<Path>, options: LoadOptions) -> Result<Volume> {
        let path = path.as_ref();
        let obj = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| Error::unreadable(path, e))?;
        let affine = Self::get_affine(obj.header());

        let array: ArrayD<f32> = obj
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|e| Error::unreadable(path, e))?;
        let data = Self::into_3d(array).map_err(|reason| Error::unreadable(path, reason))?;

        let mut volume = Volume::new(data, affine);
        volume.sanitize();
        if options.reorient {
            volume = volume.to_canonical();
        }
        Ok(volume)
    }

    /// Write a volume as float32 NIfTI-1, gzip compressed when the path ends
    /// with `.gz`. Existing files are overwritten.
    pub fn save(volume: &Volume, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let header = Self::build_header(volume);
        WriterOptions::new(path)
            .reference_header(&header)
            .write_nifti(&volume.data)
            .map_err(|e| Error::UnwritableVolume {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Whether `path` names a file with a recognized volumetric extension.
    /// Matching is case-sensitive: the reader only decompresses names ending
    /// in a lowercase `.gz`.
    pub fn is_volume_file(path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| VOLUME_EXTENSIONS.iter().any(|ext| name.ends_with(*ext)))
    }

    /// File name with the volumetric extension removed, e.g. `t1.nii.gz` -> `t1`
    pub fn base_name(path: impl AsRef<Path>) -> String {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        VOLUME_EXTENSIONS
            .iter()
            .find_map(|ext| name.strip_suffix(*ext))
            .map(str::to_string)
            .unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.clone())
            })
    }

    fn into_3d(mut array: ArrayD<f32>) -> std::result::Result<Array3<f32>, String> {
        if array.ndim() < 3 {
            return Err(format!("Expected at least 3D volume, got {}D", array.ndim()));
        }
        // keep the first volume of a series
        while array.ndim() > 3 {
            let last = array.ndim() - 1;
            if array.len_of(Axis(last)) == 0 {
                return Err("Empty volume series".to_string());
            }
            array = array.index_axis_move(Axis(last), 0);
        }
        let array = array
            .into_dimensionality::<Ix3>()
            .map_err(|e| e.to_string())?;
        if array.is_empty() {
            return Err(format!("Volume has an empty dimension: {:?}", array.dim()));
        }
        Ok(array.as_standard_layout().into_owned())
    }

    /// Index-to-world affine: sform when set, else qform, else pixdim scaling
    fn get_affine(header: &NiftiHeader) -> Matrix4<f64> {
        if header.sform_code > 0 {
            header.sform_affine::<f64>()
        } else if header.qform_code > 0 {
            // NiftiHeader::qform_affine panics on negative pixdim
            Self::qform_affine(header)
        } else {
            let p = &header.pixdim;
            Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(
                Self::nonzero(p[1]),
                Self::nonzero(p[2]),
                Self::nonzero(p[3]),
            ))
        }
    }

    fn qform_affine(header: &NiftiHeader) -> Matrix4<f64> {
        let b = header.quatern_b as f64;
        let c = header.quatern_c as f64;
        let d = header.quatern_d as f64;
        let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();

        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let dx = Self::nonzero(header.pixdim[1]);
        let dy = Self::nonzero(header.pixdim[2]);
        let dz = Self::nonzero(header.pixdim[3]) * qfac;

        Matrix4::new(
            (a * a + b * b - c * c - d * d) * dx,
            (2.0 * b * c - 2.0 * a * d) * dy,
            (2.0 * b * d + 2.0 * a * c) * dz,
            header.quatern_x as f64,
            (2.0 * b * c + 2.0 * a * d) * dx,
            (a * a + c * c - b * b - d * d) * dy,
            (2.0 * c * d - 2.0 * a * b) * dz,
            header.quatern_y as f64,
            (2.0 * b * d - 2.0 * a * c) * dx,
            (2.0 * c * d + 2.0 * a * b) * dy,
            (a * a + d * d - c * c - b * b) * dz,
            header.quatern_z as f64,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    fn nonzero(pixdim: f32) -> f64 {
        if pixdim > 0.0 { pixdim as f64 } else { 1.0 }
    }

    fn build_header(volume: &Volume) -> NiftiHeader {
        let size = volume.voxel_size();

        let mut header = NiftiHeader::default();
        header.pixdim = [
            1.0,
            size[0] as f32,
            size[1] as f32,
            size[2] as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ];
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;
        header.set_sform(&volume.affine, XForm::ScannerAnat);
        header.qform_code = XForm::Unknown as i16;
        header
    }
}
