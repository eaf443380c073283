mod common;

use common::{head_phantom, quick_registration, relative_files, write_corrupt, write_volume};
use ndarray::Array3;
use neuroslice::{
    BrainExtraction, Error, LoadOptions, PreprocessingConfig, PreprocessingPipeline, Result,
    SliceConfig, SliceExtractor, SpatialNormalizer, Stage, TransformFamily, Volume, VolumeLoader,
};
use std::path::Path;
use std::sync::Arc;

fn config(root: &Path) -> PreprocessingConfig {
    PreprocessingConfig {
        input_root: root.join("input"),
        output_root: root.join("preprocessed"),
        template_path: root.join("template.nii.gz"),
        fwhm: 3.0,
        registration: quick_registration(),
        ..PreprocessingConfig::default()
    }
}

struct UnavailableModel;

impl BrainExtraction for UnavailableModel {
    fn probability_map(&self, _volume: &Volume) -> Result<Array3<f32>> {
        Err(Error::ExtractionFailure("model weights unavailable".into()))
    }
}

#[test]
fn subjects_land_in_template_space_and_failures_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let template = head_phantom((20, 22, 18));
    VolumeLoader::save(&template, &config.template_path).unwrap();

    write_volume(&config.input_root, "S01", "t1_mprage.nii.gz", &head_phantom((24, 24, 24)));
    write_corrupt(&config.input_root, "S02", "t1.nii.gz");
    write_volume(&config.input_root, "S03", "T2.nii", &head_phantom((22, 20, 22)));

    let output_root = config.output_root.clone();
    let pipeline = PreprocessingPipeline::from_config(config).unwrap();
    let summary = pipeline.run().unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded(), 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].subject, "S02");
    assert_eq!(summary.failures[0].stage, None);

    for subject in ["S01", "S03"] {
        let path = output_root.join(subject).join("preprocessed.nii.gz");
        let volume = VolumeLoader::load(&path, LoadOptions::default()).unwrap();
        assert_eq!(volume.dim(), template.dim());
        assert_eq!(volume.affine, template.affine);
        assert!(volume.data.iter().all(|v| v.is_finite()));
        assert!(volume.data.iter().any(|&v| v > 0.0));
    }
    assert!(!output_root.join("S02").exists());
}

#[test]
fn preprocessed_tree_feeds_the_slicer() {
    let dir = tempfile::tempdir().unwrap();
    let config = PreprocessingConfig {
        transform: TransformFamily::Translation,
        ..config(dir.path())
    };
    VolumeLoader::save(&head_phantom((20, 22, 18)), &config.template_path).unwrap();
    write_volume(&config.input_root, "S01", "t1.nii.gz", &head_phantom((24, 24, 24)));

    let output_root = config.output_root.clone();
    let summary = PreprocessingPipeline::from_config(config).unwrap().run().unwrap();
    assert!(summary.is_clean());

    let slices = dir.path().join("slices");
    let summary = SliceExtractor::new(SliceConfig {
        input_root: output_root,
        output_root: slices.clone(),
        slice_index: None,
    })
    .run()
    .unwrap();
    assert!(summary.is_clean());

    let files = relative_files(&slices);
    assert_eq!(files.len(), 45);
    assert!(slices.join("axial/S01/preprocessed_axial_slice2.png").exists());
    assert!(slices.join("coronal/S01/preprocessed_coronal_slice18.png").exists());
    assert!(slices.join("sagittal/S01/preprocessed_sagittal_slice17.png").exists());
}

#[test]
fn extraction_failures_are_recorded_with_their_stage() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    write_volume(&config.input_root, "S01", "t1.nii.gz", &head_phantom((12, 12, 12)));
    write_volume(&config.input_root, "S02", "t1.nii.gz", &head_phantom((12, 12, 12)));

    let template = Arc::new(head_phantom((12, 12, 12)));
    let normalizer = SpatialNormalizer::new(TransformFamily::Translation, quick_registration());
    let pipeline = PreprocessingPipeline::with_backends(config, template, UnavailableModel, normalizer);

    let summary = pipeline.run().unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.failed(), 2);
    assert!(summary.failures.iter().all(|f| f.stage == Some(Stage::Loaded)));
    assert!(summary.failures[0].reason.contains("model weights unavailable"));
}

#[cfg(unix)]
#[test]
fn unlistable_subject_does_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = PreprocessingConfig {
        transform: TransformFamily::Translation,
        ..config(dir.path())
    };
    VolumeLoader::save(&head_phantom((20, 20, 20)), &config.template_path).unwrap();
    write_volume(&config.input_root, "S01", "t1.nii.gz", &head_phantom((20, 20, 20)));
    std::os::unix::fs::symlink(dir.path().join("missing"), config.input_root.join("S02")).unwrap();
    write_volume(&config.input_root, "S03", "t1.nii.gz", &head_phantom((20, 20, 20)));

    let output_root = config.output_root.clone();
    let summary = PreprocessingPipeline::from_config(config).unwrap().run().unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded(), 2);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].subject, "S02");
    assert!(output_root.join("S01/preprocessed.nii.gz").exists());
    assert!(output_root.join("S03/preprocessed.nii.gz").exists());
}

#[test]
fn unreadable_template_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    assert!(matches!(
        PreprocessingPipeline::from_config(config),
        Err(Error::UnreadableVolume { .. })
    ));
}
