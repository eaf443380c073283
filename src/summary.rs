use std::fmt;
use std::path::PathBuf;

use log::{info, warn};

/// Processing stages a preprocessing unit passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Loaded,
    Extracted,
    Normalized,
    Smoothed,
    Saved,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Loaded => "loaded",
            Stage::Extracted => "extracted",
            Stage::Normalized => "normalized",
            Stage::Smoothed => "smoothed",
            Stage::Saved => "saved",
        };
        f.write_str(name)
    }
}

/// One unit of work that did not complete.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub subject: String,
    pub file: PathBuf,
    /// Last stage reached before the failure, `None` if nothing succeeded
    pub stage: Option<Stage>,
    pub reason: String,
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.subject, self.file.display(), self.reason)?;
        if let Some(stage) = self.stage {
            write!(f, " [after {stage}]")?;
        }
        Ok(())
    }
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub total: usize,
    pub failures: Vec<FailureRecord>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.total - self.failures.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn record_success(&mut self) {
        self.total += 1;
    }

    pub(crate) fn record_failure(&mut self, failure: FailureRecord) {
        warn!("Failed: {failure}");
        self.total += 1;
        self.failures.push(failure);
    }

    /// Log the counts and every failed identifier with its reason.
    pub fn log_report(&self, label: &str) {
        info!("{label}: processed {} / {}", self.succeeded(), self.total);
        if !self.failures.is_empty() {
            warn!("{label}: {} failed", self.failures.len());
            for failure in &self.failures {
                warn!("  - {}: {}", failure.subject, failure.reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_follow_records() {
        let mut summary = BatchSummary::default();
        summary.record_success();
        summary.record_failure(FailureRecord {
            subject: "S02".into(),
            file: PathBuf::from("S02/t1.nii.gz"),
            stage: Some(Stage::Extracted),
            reason: "Registration failed: moving image is empty".into(),
        });
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.failed(), 1);
        assert!(!summary.is_clean());
    }

    #[test]
    fn failure_display_names_subject_and_stage() {
        let failure = FailureRecord {
            subject: "S07".into(),
            file: PathBuf::from("bad.nii"),
            stage: Some(Stage::Loaded),
            reason: "boom".into(),
        };
        let text = failure.to_string();
        assert!(text.starts_with("S07"));
        assert!(text.contains("after loaded"));
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Loaded < Stage::Extracted);
        assert!(Stage::Smoothed < Stage::Saved);
    }
}
