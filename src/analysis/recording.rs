//! Recording model and the `.ephys` JSON decoder.
//!
//! A [`Recording`] is immutable after load. There is no "current sweep"
//! cursor: every sample access goes through an explicit sweep index, and
//! [`Recording::sweeps`] hands out borrowed [`Sweep`] views in order, so
//! nested traversals cannot interfere with each other.

use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::{Path, PathBuf};

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::analysis::error::AnalysisError;
use crate::analysis::stats;

/// File extension a recording must carry.
pub const RECORDING_EXTENSION: &str = "ephys";
/// Extension of the sibling marker that flags "already reviewed - skip".
pub const REVIEWED_EXTENSION: &str = "reviewed";

/// On-disk schema of an `.ephys` recording file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingFile {
    /// Defaults to the file stem when absent.
    pub id: Option<String>,
    pub sample_rate_hz: f64,
    /// Physical units of the primary signal, e.g. "mV" or "pA".
    pub units: String,
    /// Units of the time-derivative signal; defaults to `<units>/ms`.
    pub units_derivative: Option<String>,
    pub protocol: String,
    /// channels are sweeps x samples, all sweeps equal length
    pub sweeps: Vec<Vec<f64>>,
    /// Start time of each sweep relative to the recording start. When
    /// absent, sweeps are assumed back-to-back at `sweep_interval_s`
    /// (itself defaulting to the sweep duration).
    pub sweep_start_times_s: Option<Vec<f64>>,
    pub sweep_interval_s: Option<f64>,
    #[serde(default)]
    pub comments: Vec<CommentMarker>,
    /// Stimulus epoch `[t1, t2)` in seconds, used by the stimulus-stack
    /// routine when present.
    pub stimulus_window: Option<(f64, f64)>,
}

/// A tagged experimenter comment dropped during acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentMarker {
    pub time_s: f64,
    pub tag: String,
}

/// A loaded recording: per-load metadata plus sweep-indexed sample buffers.
#[derive(Debug, Clone)]
pub struct Recording {
    pub id: String,
    pub path: PathBuf,
    pub sample_rate_hz: f64,
    pub units_y: String,
    pub units_dy: String,
    pub protocol: String,
    pub comments: Vec<CommentMarker>,
    pub stimulus_window: Option<(f64, f64)>,
    sweeps: Vec<Vec<f64>>,
    sweep_starts: Vec<f64>,
}

impl Recording {
    /// Decode a recording from an `.ephys` file.
    pub fn open(path: &Path) -> Result<Self, AnalysisError> {
        let decode_err = |reason: String| AnalysisError::Decode {
            path: path.display().to_string(),
            reason,
        };
        let file = File::open(path)?;
        let parsed: RecordingFile = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| decode_err(e.to_string()))?;
        let recording = Self::from_file(parsed, path).map_err(|e| match e {
            AnalysisError::Decode { reason, .. } => decode_err(reason),
            other => other,
        })?;
        debug!(
            "{}: {} sweeps @ {} Hz, protocol [{}]",
            recording.id,
            recording.sweep_count(),
            recording.sample_rate_hz,
            recording.protocol
        );
        Ok(recording)
    }

    fn from_file(file: RecordingFile, path: &Path) -> Result<Self, AnalysisError> {
        let invalid = |reason: &str| AnalysisError::Decode {
            path: path.display().to_string(),
            reason: reason.to_string(),
        };
        if file.sample_rate_hz <= 0.0 || !file.sample_rate_hz.is_finite() {
            return Err(AnalysisError::InvalidSampleRate);
        }
        if file.sweeps.is_empty() {
            return Err(invalid("recording has no sweeps"));
        }
        let sweep_len = file.sweeps[0].len();
        if sweep_len == 0 {
            return Err(invalid("sweeps are empty"));
        }
        if file.sweeps.iter().any(|s| s.len() != sweep_len) {
            return Err(invalid("sweeps are not all the same length"));
        }
        let sweep_duration = sweep_len as f64 / file.sample_rate_hz;
        let sweep_starts = match &file.sweep_start_times_s {
            Some(starts) => {
                if starts.len() != file.sweeps.len() {
                    return Err(invalid("sweep_start_times_s length mismatch"));
                }
                starts.clone()
            }
            None => {
                let interval = file.sweep_interval_s.unwrap_or(sweep_duration);
                (0..file.sweeps.len()).map(|i| i as f64 * interval).collect()
            }
        };
        if sweep_starts.windows(2).any(|pair| pair[1] < pair[0]) {
            return Err(invalid("sweep start times are not monotonic"));
        }
        let id = file.id.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "recording".to_string())
        });
        let units_dy = file
            .units_derivative
            .clone()
            .unwrap_or_else(|| format!("{}/ms", file.units));
        Ok(Self {
            id,
            path: path.to_path_buf(),
            sample_rate_hz: file.sample_rate_hz,
            units_y: file.units,
            units_dy,
            protocol: file.protocol,
            comments: file.comments,
            stimulus_window: file.stimulus_window,
            sweeps: file.sweeps,
            sweep_starts,
        })
    }

    pub fn sweep_count(&self) -> usize {
        self.sweeps.len()
    }

    /// Samples per sweep.
    pub fn sweep_samples(&self) -> usize {
        self.sweeps[0].len()
    }

    /// Sweep duration in seconds.
    pub fn sweep_len_s(&self) -> f64 {
        self.sweep_samples() as f64 / self.sample_rate_hz
    }

    /// Borrowed view of one sweep; explicit index, no hidden cursor.
    pub fn sweep(&self, index: usize) -> Result<Sweep<'_>, AnalysisError> {
        let samples = self.sweeps.get(index).ok_or(AnalysisError::SweepIndex {
            index,
            count: self.sweeps.len(),
        })?;
        Ok(Sweep {
            index,
            rate_hz: self.sample_rate_hz,
            start_s: self.sweep_starts[index],
            ys: samples,
        })
    }

    /// Ordered, restartable traversal of all sweeps.
    pub fn sweeps(&self) -> impl Iterator<Item = Sweep<'_>> {
        self.sweeps.iter().enumerate().map(|(index, ys)| Sweep {
            index,
            rate_hz: self.sample_rate_hz,
            start_s: self.sweep_starts[index],
            ys,
        })
    }

    pub fn sweep_start(&self, index: usize) -> f64 {
        self.sweep_starts.get(index).copied().unwrap_or(f64::NAN)
    }

    /// Sweep indices during which a comment was dropped.
    pub fn comment_sweeps(&self) -> Vec<usize> {
        self.comments
            .iter()
            .map(|comment| {
                match self
                    .sweep_starts
                    .iter()
                    .rposition(|start| *start <= comment.time_s)
                {
                    Some(i) => i,
                    None => 0,
                }
            })
            .collect()
    }

    /// Point-wise mean of the sweeps in `range` (clamped to bounds).
    pub fn average_sweep(&self, range: Range<usize>) -> Vec<f64> {
        let start = range.start.min(self.sweeps.len());
        let end = range.end.min(self.sweeps.len());
        let n = end.saturating_sub(start);
        if n == 0 {
            return vec![f64::NAN; self.sweep_samples()];
        }
        let mut acc = vec![0.0; self.sweep_samples()];
        for sweep in &self.sweeps[start..end] {
            for (a, v) in acc.iter_mut().zip(sweep) {
                *a += v;
            }
        }
        for a in &mut acc {
            *a /= n as f64;
        }
        acc
    }

    /// Output directory for this recording's figures:
    /// `<recordingDir>/<recordingID>_plots/`.
    pub fn output_dir(&self) -> PathBuf {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!("{}_plots", self.id))
    }

    /// Path of the sibling "already reviewed" marker.
    pub fn reviewed_marker(path: &Path) -> PathBuf {
        path.with_extension(REVIEWED_EXTENSION)
    }
}

/// Borrowed view of one sweep's samples and timing.
#[derive(Debug, Clone, Copy)]
pub struct Sweep<'a> {
    pub index: usize,
    pub rate_hz: f64,
    pub start_s: f64,
    pub ys: &'a [f64],
}

impl Sweep<'_> {
    /// Time axis within the sweep, starting at zero.
    pub fn times(&self) -> Vec<f64> {
        (0..self.ys.len())
            .map(|i| i as f64 / self.rate_hz)
            .collect()
    }

    /// Chronological time axis, offset by the sweep start.
    pub fn times_absolute(&self) -> Vec<f64> {
        (0..self.ys.len())
            .map(|i| self.start_s + i as f64 / self.rate_hz)
            .collect()
    }

    /// Numerically differentiated companion series (units per ms).
    pub fn derivative(&self) -> Vec<f64> {
        stats::derivative_per_ms(self.ys, self.rate_hz)
    }

    pub fn len_s(&self) -> f64 {
        self.ys.len() as f64 / self.rate_hz
    }

    /// Windowed average over `[t1, t2)` of this sweep.
    pub fn window_mean(&self, t1: f64, t2: Option<f64>) -> f64 {
        stats::window_mean(self.ys, self.rate_hz, t1, t2)
    }

    /// Windowed population standard deviation over `[t1, t2)`.
    pub fn window_std(&self, t1: f64, t2: Option<f64>) -> f64 {
        stats::window_std(self.ys, self.rate_hz, t1, t2)
    }
}

/// Write the deterministic demo recording used by the zero-argument smoke
/// test: a voltage-clamp time course whose holding current steps down after
/// a tagged "drug" comment.
pub fn write_demo_recording(dir: &Path) -> Result<PathBuf, AnalysisError> {
    let rate = 1000.0;
    let sweep_len = 2500;
    let sweep_count = 24;
    let interval = 5.0;
    let drug_at_s = 60.0;
    let mut rng = StdRng::seed_from_u64(0x45504859);

    let mut sweeps = Vec::with_capacity(sweep_count);
    for sweep in 0..sweep_count {
        let start = sweep as f64 * interval;
        let holding = if start >= drug_at_s { -80.0 } else { -35.0 };
        let samples = (0..sweep_len)
            .map(|i| {
                let t = i as f64 / rate;
                let test_pulse = if (0.1..0.15).contains(&t) { -140.0 } else { 0.0 };
                holding + test_pulse + (rng.gen::<f64>() - 0.5) * 8.0
            })
            .collect();
        sweeps.push(samples);
    }

    let file = RecordingFile {
        id: Some("demo".to_string()),
        sample_rate_hz: rate,
        units: "pA".to_string(),
        units_derivative: None,
        protocol: "0402".to_string(),
        sweeps,
        sweep_start_times_s: None,
        sweep_interval_s: Some(interval),
        comments: vec![CommentMarker {
            time_s: drug_at_s,
            tag: "drug".to_string(),
        }],
        stimulus_window: None,
    };
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("demo.{RECORDING_EXTENSION}"));
    let writer = std::io::BufWriter::new(File::create(&path)?);
    serde_json::to_writer(writer, &file).map_err(|e| AnalysisError::Decode {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(path)
}

/// In-memory recording for unit tests.
#[cfg(test)]
pub(crate) fn synthetic(protocol: &str, sweeps: Vec<Vec<f64>>, rate: f64) -> Recording {
    let file = RecordingFile {
        id: Some("test".to_string()),
        sample_rate_hz: rate,
        units: "mV".to_string(),
        units_derivative: None,
        protocol: protocol.to_string(),
        sweeps,
        sweep_start_times_s: None,
        sweep_interval_s: None,
        comments: Vec::new(),
        stimulus_window: None,
    };
    Recording::from_file(file, Path::new("test.ephys")).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_recording_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_demo_recording(dir.path()).unwrap();
        let rec = Recording::open(&path).unwrap();
        assert_eq!(rec.id, "demo");
        assert_eq!(rec.protocol, "0402");
        assert_eq!(rec.sweep_count(), 24);
        assert_eq!(rec.units_dy, "pA/ms");
        assert_eq!(rec.comment_sweeps(), vec![12]);
    }

    #[test]
    fn sweep_index_is_bounds_checked() {
        let rec = synthetic("0201", vec![vec![0.0; 10]; 3], 1000.0);
        assert!(rec.sweep(2).is_ok());
        assert!(matches!(
            rec.sweep(3),
            Err(AnalysisError::SweepIndex { index: 3, count: 3 })
        ));
    }

    #[test]
    fn sweeps_iterator_is_ordered_and_restartable() {
        let rec = synthetic("0201", vec![vec![1.0; 4], vec![2.0; 4]], 1000.0);
        let first: Vec<usize> = rec.sweeps().map(|s| s.index).collect();
        let second: Vec<usize> = rec.sweeps().map(|s| s.index).collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(first, second);
    }

    #[test]
    fn unequal_sweeps_are_rejected() {
        let file = RecordingFile {
            id: None,
            sample_rate_hz: 1000.0,
            units: "mV".to_string(),
            units_derivative: None,
            protocol: "0201".to_string(),
            sweeps: vec![vec![0.0; 10], vec![0.0; 9]],
            sweep_start_times_s: None,
            sweep_interval_s: None,
            comments: Vec::new(),
            stimulus_window: None,
        };
        assert!(Recording::from_file(file, Path::new("bad.ephys")).is_err());
    }

    #[test]
    fn derivative_view_matches_sweep_length() {
        let rec = synthetic("0111", vec![(0..100).map(|i| i as f64).collect()], 1000.0);
        let sweep = rec.sweep(0).unwrap();
        assert_eq!(sweep.derivative().len(), 100);
        assert_eq!(sweep.times().len(), 100);
        assert_eq!(sweep.times_absolute()[0], 0.0);
    }

    #[test]
    fn average_sweep_clamps_range() {
        let rec = synthetic("0314", vec![vec![1.0; 4], vec![3.0; 4]], 1000.0);
        assert_eq!(rec.average_sweep(0..2), vec![2.0; 4]);
        assert_eq!(rec.average_sweep(1..99), vec![3.0; 4]);
        assert!(rec.average_sweep(5..9).iter().all(|v| v.is_nan()));
    }
}
