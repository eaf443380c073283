use crate::brain_extractor::{BrainExtraction, BrainExtractor};
use crate::config::PreprocessingConfig;
use crate::enums::ScanType;
use crate::error::{Error, Result};
use crate::normalizer::{Registration, SpatialNormalizer};
use crate::smoother::Smoother;
use crate::summary::{BatchSummary, FailureRecord, Stage};
use crate::volume::Volume;
use crate::volume_loader::{LoadOptions, VolumeLoader};

use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// File name of the single result written per subject
pub const OUTPUT_FILE_NAME: &str = "preprocessed.nii.gz";

/// A subject directory and the volumes found directly inside it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRecord {
    pub id: String,
    pub files: Vec<PathBuf>,
}

impl SubjectRecord {
    /// Enumerate `<root>/<subject_id>/<file>.nii[.gz]`, sorted by subject id
    /// and file name. Subjects without volumes are left out.
    ///
    /// A subject whose directory cannot be listed comes back as a
    /// [`FailureRecord`]; only an unreadable `root` is an error.
    pub fn discover(root: impl AsRef<Path>) -> Result<(Vec<SubjectRecord>, Vec<FailureRecord>)> {
        let mut subjects = Vec::new();
        let mut failures = Vec::new();
        for entry in fs::read_dir(root.as_ref())? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry in {}: {e}", root.as_ref().display());
                    continue;
                }
            };
            let path = entry.path();
            let id = entry.file_name().to_string_lossy().into_owned();

            // Broken subject links are reported, links to files are not subjects
            let is_subject = match fs::metadata(&path) {
                Ok(meta) => meta.is_dir(),
                Err(_) => entry.file_type().is_ok_and(|t| t.is_symlink()),
            };
            if !is_subject {
                continue;
            }

            match Self::volume_files(&path) {
                Ok(files) if files.is_empty() => debug!("Skipping {id}: no volumes"),
                Ok(files) => subjects.push(SubjectRecord { id, files }),
                Err(e) => {
                    warn!("Cannot list subject {id}: {e}");
                    failures.push(FailureRecord {
                        subject: id,
                        file: path,
                        stage: None,
                        reason: Error::Io(e).to_string(),
                    });
                }
            }
        }
        subjects.sort_by(|a, b| a.id.cmp(&b.id));
        failures.sort_by(|a, b| a.subject.cmp(&b.subject));
        Ok((subjects, failures))
    }

    fn volume_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && VolumeLoader::is_volume_file(p))
            .collect();
        files.sort();
        Ok(files)
    }
}

struct StageFailure {
    stage: Option<Stage>,
    error: Error,
}

trait AtStage<T> {
    fn at(self, stage: Option<Stage>) -> std::result::Result<T, StageFailure>;
}

impl<T> AtStage<T> for Result<T> {
    fn at(self, stage: Option<Stage>) -> std::result::Result<T, StageFailure> {
        self.map_err(|error| StageFailure { stage, error })
    }
}

/// Load, skull strip, normalize to the template, smooth and save every
/// subject volume under an input root.
///
/// The template is injected once and only read. A failure in any stage is
/// recorded for that file and the batch moves on.
pub struct PreprocessingPipeline<E = BrainExtractor, R = SpatialNormalizer> {
    config: PreprocessingConfig,
    template: Arc<Volume>,
    extractor: E,
    normalizer: R,
    smoother: Smoother,
}

impl PreprocessingPipeline {
    /// Pipeline with the built-in extraction and registration backends
    pub fn new(config: PreprocessingConfig, template: Arc<Volume>) -> Self {
        let extractor = BrainExtractor::new(config.modality);
        let normalizer = SpatialNormalizer::new(config.transform, config.registration.clone());
        Self::with_backends(config, template, extractor, normalizer)
    }

    /// Validate `config` and load its template once.
    pub fn from_config(config: PreprocessingConfig) -> Result<Self> {
        config.validate()?;
        let template = VolumeLoader::load(&config.template_path, LoadOptions::default())?;
        info!(
            "Loaded template {} with shape {:?}",
            config.template_path.display(),
            template.dim()
        );
        Ok(Self::new(config, Arc::new(template)))
    }
}

impl<E: BrainExtraction, R: Registration> PreprocessingPipeline<E, R> {
    pub fn with_backends(
        config: PreprocessingConfig,
        template: Arc<Volume>,
        extractor: E,
        normalizer: R,
    ) -> Self {
        let smoother = Smoother::new(config.fwhm);
        Self {
            config,
            template,
            extractor,
            normalizer,
            smoother,
        }
    }

    pub fn template(&self) -> &Volume {
        &self.template
    }

    pub fn config(&self) -> &PreprocessingConfig {
        &self.config
    }

    pub fn output_path(&self, subject_id: &str) -> PathBuf {
        self.config.output_root.join(subject_id).join(OUTPUT_FILE_NAME)
    }

    /// Process every subject under the input root, one after the other.
    ///
    /// # Errors
    ///
    /// Only if the input root cannot be enumerated. Per-file failures are
    /// reported in the returned summary.
    pub fn run(&self) -> Result<BatchSummary> {
        let (subjects, unlisted) = SubjectRecord::discover(&self.config.input_root)?;
        info!(
            "Preprocessing {} subjects from {}",
            subjects.len(),
            self.config.input_root.display()
        );

        let mut summary = BatchSummary::default();
        for failure in unlisted {
            summary.record_failure(failure);
        }
        for subject in &subjects {
            self.process_subject(subject, &mut summary);
        }
        Ok(summary)
    }

    pub fn process_subject(&self, subject: &SubjectRecord, summary: &mut BatchSummary) {
        for file in &subject.files {
            let name = file.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            info!(
                "Processing subject {}, file: {name} ({})",
                subject.id,
                ScanType::from_file_name(&name).label()
            );

            match self.process_file(&subject.id, file) {
                Ok(output) => {
                    info!("Preprocessing complete for subject {}: {}", subject.id, output.display());
                    summary.record_success();
                }
                Err(StageFailure { stage, error }) => summary.record_failure(FailureRecord {
                    subject: subject.id.clone(),
                    file: file.clone(),
                    stage,
                    reason: error.to_string(),
                }),
            }
        }
    }

    fn process_file(&self, subject_id: &str, file: &Path) -> std::result::Result<PathBuf, StageFailure> {
        let volume = VolumeLoader::load(file, LoadOptions::canonical()).at(None)?;
        debug!("{subject_id}: {} {:?}", Stage::Loaded, volume.dim());

        let (mask, stripped) = self.extractor.extract(&volume).at(Some(Stage::Loaded))?;
        debug!("{subject_id}: {} ({} brain voxels)", Stage::Extracted, mask.count());

        let normalized = self
            .normalizer
            .register(&stripped, &self.template)
            .and_then(|v| self.check_template_space(v))
            .at(Some(Stage::Extracted))?;
        debug!("{subject_id}: {}", Stage::Normalized);

        let smoothed = self.smoother.smooth(&normalized);
        debug!("{subject_id}: {} (sigma {:.3})", Stage::Smoothed, self.smoother.sigma());

        let output = self.output_path(subject_id);
        self.save(&smoothed, &output).at(Some(Stage::Smoothed))?;
        debug!("{subject_id}: {}", Stage::Saved);
        Ok(output)
    }

    fn check_template_space(&self, volume: Volume) -> Result<Volume> {
        if volume.dim() != self.template.dim() {
            return Err(Error::RegistrationFailure(format!(
                "normalized shape {:?} differs from template shape {:?}",
                volume.dim(),
                self.template.dim()
            )));
        }
        // Result always carries the template's affine
        Ok(Volume::new(volume.data, self.template.affine))
    }

    fn save(&self, volume: &Volume, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::UnwritableVolume {
                path: output.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        VolumeLoader::save(volume, output)
    }
}
