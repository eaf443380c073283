//! # neuroslice
//!
//! Batch preprocessing of structural and functional MRI volumes into a
//! common template space, and extraction of 2D slice images from the
//! normalized results.
//!
//! Volumes are read from NIfTI files (`.nii` / `.nii.gz`) and held as an
//! [`ndarray::Array3`] together with their voxel-to-world affine. Each
//! subject volume passes through four stages:
//!  - Brain extraction (skull stripping)
//!  - Spatial normalization to a reference template
//!  - Gaussian smoothing (FWHM in physical units)
//!  - Saving to `<output>/<subject>/preprocessed.nii.gz`
//!
//! The slice extractor then walks the preprocessed tree and writes a window
//! of up to 15 slices around the centre of each volume, in the three medical
//! planes:
//!  - Axial
//!  - Coronal
//!  - Sagittal
//!
//! Both batches are sequential and isolate failures per file: a volume that
//! cannot be read, stripped, registered or rasterized is logged and counted,
//! and the run moves on.
//!
//! Numeric kernels (smoothing, resampling, slice conversion) are
//! parallelised with rayon where the environment supports it.
//!
//! # Examples
//!
//! ## Preprocessing a directory of subjects
//!
//! ```no_run
//! # use neuroslice::{Config, PreprocessingPipeline};
//! let config = Config::from_file("neuroslice.json").expect("should have read config");
//! let pipeline = PreprocessingPipeline::from_config(config.preprocessing)
//!     .expect("should have loaded the template");
//! let summary = pipeline.run().expect("input root should exist");
//! summary.log_report("Preprocessing");
//! ```
//!
//! ## Writing the centre slices of a single volume
//!
//! ```no_run
//! # use neuroslice::{Plane, LoadOptions, VolumeLoader, raster};
//! let volume = VolumeLoader::load("S01/preprocessed.nii.gz", LoadOptions::default())
//!     .expect("should have loaded volume");
//! let index = volume.dim().2 / 2;
//! let slice = volume
//!     .get_slice_from_axis(index, Plane::Axial)
//!     .expect("index should be inside the volume");
//! let image = raster::render_slice(slice, &format!("S01\naxial slice {index}"));
//! raster::save_png(&image, "result.png").expect("should have saved image");
//! ```

pub mod brain_extractor;
pub mod config;
pub mod enums;
pub mod error;
mod interpolator;
pub mod normalizer;
pub mod pipeline;
pub mod raster;
pub mod slice_extractor;
pub mod smoother;
pub mod summary;
pub mod volume;
pub mod volume_loader;

pub use brain_extractor::{BrainExtraction, BrainExtractor, BrainMask};
pub use config::{Config, PreprocessingConfig, SliceConfig};
pub use enums::{Modality, Plane, ScanType, TransformFamily};
pub use error::{Error, Result};
pub use normalizer::{Registration, RegistrationParams, SpatialNormalizer};
pub use pipeline::{PreprocessingPipeline, SubjectRecord};
pub use slice_extractor::{SliceExtractor, SliceWindow};
pub use smoother::Smoother;
pub use summary::{BatchSummary, FailureRecord, Stage};
pub use volume::Volume;
pub use volume_loader::{LoadOptions, VolumeLoader};
