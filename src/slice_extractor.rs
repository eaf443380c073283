use crate::config::SliceConfig;
use crate::enums::Plane;
use crate::error::{Error, Result};
use crate::raster;
use crate::summary::{BatchSummary, FailureRecord};
use crate::volume_loader::{LoadOptions, VolumeLoader};

use log::{debug, info, warn};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Slices on either side of the window centre
pub const HALF_WIDTH: usize = 7;

/// Contiguous run of slice indices along one axis, clamped to `[0, extent)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceWindow {
    pub start: usize,
    pub end: usize,
}

impl SliceWindow {
    /// `[max(0, c - 7), min(extent, c + 8))`. Empty when `center` lies past
    /// the end of the axis by more than the half width.
    pub fn centered(extent: usize, center: usize) -> Self {
        let start = center.saturating_sub(HALF_WIDTH);
        let end = extent.min(center.saturating_add(HALF_WIDTH + 1));
        if start >= end {
            return Self { start: end, end };
        }
        Self { start, end }
    }

    pub fn width(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0
    }

    pub fn indices(&self) -> Range<usize> {
        self.start..self.end
    }
}

/// `<output_root>/<plane>/<subject>/<base>_<plane>_slice<index>.png`
pub fn slice_path(output_root: &Path, plane: Plane, subject: &str, base: &str, index: usize) -> PathBuf {
    output_root
        .join(plane.name())
        .join(subject)
        .join(format!("{base}_{plane}_slice{index}.png"))
}

/// A discovered volume and the subject it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceSource {
    pub subject: String,
    pub path: PathBuf,
}

/// Turns every volume under a root into windows of titled PNG slices in the
/// axial, coronal and sagittal planes.
pub struct SliceExtractor {
    config: SliceConfig,
}

impl SliceExtractor {
    pub fn new(config: SliceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SliceConfig {
        &self.config
    }

    /// Every volume below the input root, in file name order. The subject is
    /// the name of the directory holding the file.
    pub fn discover(&self) -> Result<Vec<SliceSource>> {
        let root = &self.config.input_root;
        if !root.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("input root {} is not a directory", root.display()),
            )));
        }

        let mut sources = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry: {e}");
                    continue;
                }
            };
            let path = entry.path();
            if !entry.file_type().is_file() || !VolumeLoader::is_volume_file(path) {
                continue;
            }
            let subject = path
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            sources.push(SliceSource {
                subject,
                path: path.to_path_buf(),
            });
        }
        Ok(sources)
    }

    /// Render the slice windows of one volume in every plane. Returns the
    /// written paths in the order they were produced.
    pub fn extract_volume(&self, path: &Path, subject: &str) -> Result<Vec<PathBuf>> {
        let volume = VolumeLoader::load(path, LoadOptions::default())?;
        let base = VolumeLoader::base_name(path);
        let (d0, d1, d2) = volume.dim();
        let extents = [d0, d1, d2];

        let mut written = Vec::new();
        for plane in Plane::ALL {
            let extent = extents[plane.axis()];
            let center = self.config.slice_index.unwrap_or(extent / 2);
            let window = SliceWindow::centered(extent, center);
            if window.is_empty() {
                warn!("{subject}: {plane} index {center} is outside extent {extent}, no slices");
                continue;
            }
            debug!("{subject}: {plane} slices {:?}", window.indices());

            let dir = self.config.output_root.join(plane.name()).join(subject);
            fs::create_dir_all(&dir).map_err(|e| Error::RasterizationFailure {
                path: dir.clone(),
                reason: e.to_string(),
            })?;

            for index in window.indices() {
                let Some(slice) = volume.get_slice_from_axis(index, plane) else {
                    continue;
                };
                let image = raster::render_slice(slice, &format!("{subject}\n{plane} slice {index}"));
                let output = slice_path(&self.config.output_root, plane, subject, &base, index);
                raster::save_png(&image, &output)?;
                written.push(output);
            }
        }
        Ok(written)
    }

    /// Slice every discovered volume, one after the other.
    ///
    /// # Errors
    ///
    /// Only if the input root is missing. Failing volumes are recorded in
    /// the summary.
    pub fn run(&self) -> Result<BatchSummary> {
        let sources = self.discover()?;
        info!(
            "Slicing {} volumes from {}",
            sources.len(),
            self.config.input_root.display()
        );

        let mut summary = BatchSummary::default();
        for source in &sources {
            info!("Processing {} ({})", source.path.display(), source.subject);
            match self.extract_volume(&source.path, &source.subject) {
                Ok(written) => {
                    info!("Saved {} slices for {}", written.len(), source.subject);
                    summary.record_success();
                }
                Err(e) => summary.record_failure(FailureRecord {
                    subject: source.subject.clone(),
                    file: source.path.clone(),
                    stage: None,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(summary)
    }
}
