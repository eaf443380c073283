use serde::{Deserialize, Serialize};

/// Anatomical plane a 2D slice is taken in.
///
/// Volumes are assumed to be in canonical (RAS+) orientation, so the plane
/// maps directly onto an array axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Plane {
    Axial,
    Coronal,
    Sagittal,
}

impl Plane {
    /// Planes in the order slices are produced for each volume.
    pub const ALL: [Plane; 3] = [Plane::Axial, Plane::Coronal, Plane::Sagittal];

    /// Array axis orthogonal to the plane
    pub fn axis(self) -> usize {
        match self {
            Plane::Axial => 2,
            Plane::Coronal => 1,
            Plane::Sagittal => 0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Plane::Axial => "axial",
            Plane::Coronal => "coronal",
            Plane::Sagittal => "sagittal",
        }
    }
}

impl std::fmt::Display for Plane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Acquisition modality, selects the brain extraction profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    /// T1/T2 weighted anatomical images
    #[default]
    Structural,
    /// BOLD / EPI images
    Functional,
}

/// Spatial transform family used to normalize a subject into template space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformFamily {
    /// Physical-space alignment plus a centre-of-mass shift
    Translation,
    /// Translation followed by symmetric diffeomorphic demons
    #[default]
    SymmetricDiffeomorphic,
}

/// Best-effort scan type derived from a file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    T1w,
    T2w,
    Other,
}

impl ScanType {
    pub fn from_file_name(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.contains("t1") {
            ScanType::T1w
        } else if lower.contains("t2") {
            ScanType::T2w
        } else {
            ScanType::Other
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ScanType::T1w => "T1w",
            ScanType::T2w => "T2w",
            ScanType::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn planes_map_to_distinct_axes() {
        let axes: Vec<_> = Plane::ALL.iter().map(|p| p.axis()).collect();
        assert_eq!(axes, vec![2, 1, 0]);
    }

    #[test]
    fn scan_type_is_case_insensitive() {
        assert_eq!(ScanType::from_file_name("S01_T1_MPRAGE.nii.gz"), ScanType::T1w);
        assert_eq!(ScanType::from_file_name("flair_t2.nii"), ScanType::T2w);
        assert_eq!(ScanType::from_file_name("bold.nii"), ScanType::Other);
    }

    #[test]
    fn modality_deserializes_snake_case() {
        let m: Modality = serde_json::from_str("\"functional\"").unwrap();
        assert_eq!(m, Modality::Functional);
        let t: TransformFamily = serde_json::from_str("\"symmetric_diffeomorphic\"").unwrap();
        assert_eq!(t, TransformFamily::SymmetricDiffeomorphic);
    }
}
