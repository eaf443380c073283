#![allow(dead_code)]

use nalgebra::Matrix4;
use ndarray::Array3;
use neuroslice::{RegistrationParams, Volume, VolumeLoader};
use std::fs;
use std::path::{Path, PathBuf};

/// Bright ball inside a dimmer shell on a dark background, 1 mm voxels.
pub fn head_phantom(dim: (usize, usize, usize)) -> Volume {
    let c = [dim.0 as f64 / 2.0, dim.1 as f64 / 2.0, dim.2 as f64 / 2.0];
    let size = dim.0.min(dim.1).min(dim.2) as f64;
    let data = Array3::from_shape_fn(dim, |(i, j, k)| {
        let r = ((i as f64 - c[0]).powi(2) + (j as f64 - c[1]).powi(2) + (k as f64 - c[2]).powi(2)).sqrt();
        if r < size * 0.3 {
            100.0 + (i % 3) as f32
        } else if r < size * 0.4 {
            20.0
        } else {
            1.0
        }
    });
    Volume::new(data, Matrix4::identity())
}

/// Smooth gradient volume, cheap to build at full template size.
pub fn gradient_volume(dim: (usize, usize, usize)) -> Volume {
    let data = Array3::from_shape_fn(dim, |(i, j, k)| (i + j + k) as f32);
    Volume::new(data, Matrix4::identity())
}

/// Write `volume` to `<root>/<subject>/<file_name>`.
pub fn write_volume(root: &Path, subject: &str, file_name: &str, volume: &Volume) -> PathBuf {
    let dir = root.join(subject);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file_name);
    VolumeLoader::save(volume, &path).unwrap();
    path
}

/// A file with a volumetric extension that is not a readable volume.
pub fn write_corrupt(root: &Path, subject: &str, file_name: &str) -> PathBuf {
    let dir = root.join(subject);
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(file_name);
    fs::write(&path, b"this is not a nifti file").unwrap();
    path
}

/// Short demons schedule for small phantoms.
pub fn quick_registration() -> RegistrationParams {
    RegistrationParams {
        shrink_factors: vec![2, 1],
        iterations: vec![5, 3],
        ..RegistrationParams::default()
    }
}

/// Every file below `root`, relative to it, sorted.
pub fn relative_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}
