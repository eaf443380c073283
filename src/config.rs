use crate::enums::{Modality, TransformFamily};
use crate::error::{Error, Result};
use crate::normalizer::RegistrationParams;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Run configuration, usually read from a JSON file. Missing fields take
/// their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub preprocessing: PreprocessingConfig,
    pub slicing: SliceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    /// `<input_root>/<subject_id>/<file>.nii[.gz]`
    pub input_root: PathBuf,
    /// Receives `<subject_id>/preprocessed.nii.gz`
    pub output_root: PathBuf,
    /// Reference template every subject is normalized to
    pub template_path: PathBuf,
    pub modality: Modality,
    /// Smoothing kernel full width at half maximum, physical units
    pub fwhm: f64,
    pub transform: TransformFamily,
    pub registration: RegistrationParams,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("input"),
            output_root: PathBuf::from("preprocessed"),
            template_path: PathBuf::from("template.nii.gz"),
            modality: Modality::default(),
            fwhm: 6.0,
            transform: TransformFamily::default(),
            registration: RegistrationParams::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliceConfig {
    /// Searched recursively for volumes
    pub input_root: PathBuf,
    /// Receives `<plane>/<subject_id>/<base>_<plane>_slice<index>.png`
    pub output_root: PathBuf,
    /// Window centre for every plane and subject; the per-axis midpoint
    /// when unset
    pub slice_index: Option<usize>,
}

impl Default for SliceConfig {
    fn default() -> Self {
        Self {
            input_root: PathBuf::from("preprocessed"),
            output_root: PathBuf::from("slices"),
            slice_index: None,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.preprocessing.validate()
    }
}

impl PreprocessingConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.fwhm.is_finite() || self.fwhm < 0.0 {
            return Err(Error::InvalidConfig(format!(
                "fwhm must be a non-negative number, got {}",
                self.fwhm
            )));
        }
        self.registration.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.preprocessing.fwhm, 6.0);
        assert_eq!(config.preprocessing.modality, Modality::Structural);
        assert_eq!(config.preprocessing.transform, TransformFamily::SymmetricDiffeomorphic);
        assert_eq!(config.slicing.slice_index, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "slicing": { "slice_index": 91 }, "preprocessing": { "modality": "functional" } }"#,
        )
        .unwrap();
        assert_eq!(config.slicing.slice_index, Some(91));
        assert_eq!(config.slicing.output_root, PathBuf::from("slices"));
        assert_eq!(config.preprocessing.modality, Modality::Functional);
        assert_eq!(config.preprocessing.registration, RegistrationParams::default());
    }

    #[test]
    fn from_file_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "preprocessing": { "fwhm": -1.0 } }"#).unwrap();
        assert!(matches!(Config::from_file(&path), Err(Error::InvalidConfig(_))));

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(Config::from_file(&path), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn fwhm_bounds() {
        let with_fwhm = |fwhm| PreprocessingConfig { fwhm, ..PreprocessingConfig::default() };
        assert!(with_fwhm(0.0).validate().is_ok());
        assert!(with_fwhm(6.0).validate().is_ok());
        assert!(matches!(with_fwhm(-0.5).validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(with_fwhm(f64::NAN).validate(), Err(Error::InvalidConfig(_))));
        assert!(matches!(with_fwhm(f64::INFINITY).validate(), Err(Error::InvalidConfig(_))));
    }
}
