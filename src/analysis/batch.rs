//! Batch dispatch with per-recording fault containment.
//!
//! `analyze_one` is the fault boundary: whatever a routine does, the worst
//! a malformed recording can produce is a `Failed` outcome in the batch
//! report. Nothing unwinds across recording boundaries.

use std::fs;
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::analysis::error::AnalysisError;
use crate::analysis::micrograph;
use crate::analysis::plot::RenderOptions;
use crate::analysis::protocols::{AnalysisContext, Routine};
use crate::analysis::recording::{Recording, RECORDING_EXTENSION};

/// Folder-level subdirectory that collects converted micrographs.
pub const REVIEW_SUBDIR: &str = "patchplot";

/// Per-recording result of a batch run.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Vec<PathBuf>),
    Skipped,
    Failed(String),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Skipped => "skipped",
            Outcome::Failed(_) => "error",
        }
    }
}

/// Analyze one recording file. The resolved routine runs exactly once,
/// inside the fault boundary; a sibling reviewed-marker skips the file
/// entirely.
pub fn analyze_one(path: &Path, options: &RenderOptions) -> Outcome {
    if Recording::reviewed_marker(path).exists() {
        info!("{}: reviewed marker present, skipping", path.display());
        return Outcome::Skipped;
    }
    match run_routine(path, options) {
        Ok(artifacts) => {
            info!("{}: success ({} artifacts)", path.display(), artifacts.len());
            Outcome::Success(artifacts)
        }
        Err(e) => {
            error!("{}: analysis failed: {e}", path.display());
            Outcome::Failed(e.to_string())
        }
    }
}

fn run_routine(path: &Path, options: &RenderOptions) -> Result<Vec<PathBuf>, AnalysisError> {
    let recording = Recording::open(path)?;
    let routine = Routine::resolve(&recording.protocol);
    info!(
        "{}: protocol [{}] -> {:?}",
        recording.id, recording.protocol, routine
    );
    let mut ctx = AnalysisContext::new(options);
    routine.run(&recording, &mut ctx)
}

/// Analyze every `.ephys` recording in the folder in lexicographic order,
/// then convert sibling `.tif` micrographs and collect every converted
/// image under `<folder>/patchplot/`, preserving filenames.
pub fn analyze_folder(
    folder: &Path,
    options: &RenderOptions,
) -> Result<Vec<(PathBuf, Outcome)>, AnalysisError> {
    let mut recordings: Vec<PathBuf> = fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext == RECORDING_EXTENSION)
                .unwrap_or(false)
        })
        .collect();
    recordings.sort();

    let mut outcomes = Vec::with_capacity(recordings.len());
    for path in recordings {
        let outcome = analyze_one(&path, options);
        info!("{}: {}", path.display(), outcome.label());
        outcomes.push((path, outcome));
    }

    micrograph::convert_all(folder)?;
    relocate_converted(folder)?;
    Ok(outcomes)
}

/// Move every `*.tif.jpg` in the folder into the review subdirectory.
fn relocate_converted(folder: &Path) -> Result<(), AnalysisError> {
    let review_dir = folder.join(REVIEW_SUBDIR);
    fs::create_dir_all(&review_dir)?;
    for entry in fs::read_dir(folder)? {
        let path = entry?.path();
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if !name.ends_with(".tif.jpg") {
            continue;
        }
        let target = review_dir.join(&name);
        if let Err(e) = fs::rename(&path, &target) {
            warn!(
                "could not move {} to {}: {e}",
                path.display(),
                target.display()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::recording::RecordingFile;

    fn write_recording(path: &Path, protocol: &str) {
        let file = RecordingFile {
            id: None,
            sample_rate_hz: 1000.0,
            units: "pA".to_string(),
            units_derivative: None,
            protocol: protocol.to_string(),
            sweeps: vec![vec![-10.0; 200]; 2],
            sweep_start_times_s: None,
            sweep_interval_s: None,
            comments: Vec::new(),
            stimulus_window: None,
        };
        let writer = std::io::BufWriter::new(std::fs::File::create(path).unwrap());
        serde_json::to_writer(writer, &file).unwrap();
    }

    fn quiet() -> RenderOptions {
        RenderOptions {
            save: false,
            show: false,
        }
    }

    #[test]
    fn one_bad_recording_does_not_abort_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        write_recording(&dir.path().join("a.ephys"), "0201");
        std::fs::write(dir.path().join("b.ephys"), b"{ not json").unwrap();
        write_recording(&dir.path().join("c.ephys"), "not-a-protocol");
        let outcomes = analyze_folder(dir.path(), &quiet()).unwrap();
        let labels: Vec<&str> = outcomes.iter().map(|(_, o)| o.label()).collect();
        assert_eq!(labels, vec!["success", "error", "success"]);
    }

    #[test]
    fn reviewed_marker_skips_before_any_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.ephys");
        write_recording(&path, "0201");
        std::fs::write(dir.path().join("done.reviewed"), b"").unwrap();
        let outcome = analyze_one(&path, &RenderOptions::default());
        assert_eq!(outcome, Outcome::Skipped);
        assert!(!dir.path().join("done_plots").exists());
    }

    #[test]
    fn success_with_save_writes_named_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cell1.ephys");
        write_recording(&path, "0201");
        let outcome = analyze_one(&path, &RenderOptions::default());
        let Outcome::Success(artifacts) = outcome else {
            panic!("expected success, got {outcome:?}");
        };
        assert_eq!(
            artifacts,
            vec![dir.path().join("cell1_plots").join("plot_membrane_test.jpg")]
        );
        assert!(artifacts[0].exists());
    }

    #[test]
    fn folder_pass_relocates_converted_micrographs() {
        let dir = tempfile::tempdir().unwrap();
        let tif = dir.path().join("slice.tif");
        image::RgbImage::new(8, 8)
            .save_with_format(&tif, image::ImageFormat::Tiff)
            .unwrap();
        let outcomes = analyze_folder(dir.path(), &quiet()).unwrap();
        assert!(outcomes.is_empty());
        let relocated = dir.path().join(REVIEW_SUBDIR).join("slice.tif.jpg");
        assert!(relocated.exists());
        assert!(!dir.path().join("slice.tif.jpg").exists());
        // the raw micrograph itself stays behind
        assert!(tif.exists());
    }
}
