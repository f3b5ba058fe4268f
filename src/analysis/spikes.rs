//! Action-potential event detection.
//!
//! Events are found per sweep as upward threshold crossings of the voltage
//! derivative inside a configured detection window, the standard criterion
//! for current-clamp spike timing.

use std::collections::BTreeMap;

use log::debug;

use crate::analysis::recording::Recording;
use crate::analysis::stats;

/// Derivative threshold (units/ms) that marks an action-potential upstroke.
pub const DEFAULT_UPSTROKE_THRESHOLD: f64 = 10.0;
/// Minimum spacing between detected events (seconds).
pub const DEFAULT_REFRACTORY_S: f64 = 0.003;

/// Spike detector configured with a `[t1, t2)` detection window.
#[derive(Debug, Clone)]
pub struct SpikeDetector {
    pub t1: f64,
    pub t2: Option<f64>,
    pub upstroke_threshold: f64,
    pub refractory_s: f64,
}

impl Default for SpikeDetector {
    fn default() -> Self {
        Self {
            t1: 0.0,
            t2: None,
            upstroke_threshold: DEFAULT_UPSTROKE_THRESHOLD,
            refractory_s: DEFAULT_REFRACTORY_S,
        }
    }
}

impl SpikeDetector {
    /// Detector over the window `[t1, t2)`; `None` means "to sweep end".
    pub fn with_window(t1: f64, t2: Option<f64>) -> Self {
        Self {
            t1,
            t2,
            ..Self::default()
        }
    }

    /// Detect events in every sweep of the recording.
    pub fn detect(&self, recording: &Recording) -> SpikeTrains {
        let mut by_sweep = Vec::with_capacity(recording.sweep_count());
        let mut sweep_starts = Vec::with_capacity(recording.sweep_count());
        for sweep in recording.sweeps() {
            let window = stats::window_indices(sweep.ys.len(), sweep.rate_hz, self.t1, self.t2);
            let derivative = sweep.derivative();
            let mut times = Vec::new();
            let mut last_event = f64::NEG_INFINITY;
            for i in window {
                if i == 0 {
                    continue;
                }
                let crossed = derivative[i] >= self.upstroke_threshold
                    && derivative[i - 1] < self.upstroke_threshold;
                if !crossed {
                    continue;
                }
                let t = i as f64 / sweep.rate_hz;
                if t - last_event >= self.refractory_s {
                    times.push(t);
                    last_event = t;
                }
            }
            sweep_starts.push(sweep.start_s);
            by_sweep.push(times);
        }
        let trains = SpikeTrains {
            by_sweep,
            sweep_starts,
            window: (self.t1, self.t2),
        };
        debug!(
            "detected {} events across {} sweeps in [{}, {:?})",
            trains.total(),
            trains.by_sweep.len(),
            self.t1,
            self.t2
        );
        trains
    }

    /// Detect and compute the feature map of the first event in the whole
    /// recording. `None` when no event was found.
    pub fn first_event_features(
        &self,
        recording: &Recording,
    ) -> Option<BTreeMap<String, f64>> {
        let trains = self.detect(recording);
        let (sweep_index, t) = trains.first_event()?;
        let sweep = recording.sweep(sweep_index).ok()?;
        let rate = sweep.rate_hz;
        let derivative = sweep.derivative();
        let idx = ((t * rate).round() as usize).min(sweep.ys.len() - 1);

        // peak within 5 ms of the upstroke
        let peak_window = stats::window_indices(sweep.ys.len(), rate, t, Some(t + 0.005));
        let (peak_idx, v_peak) = peak_window
            .map(|i| (i, sweep.ys[i]))
            .fold((idx, f64::NEG_INFINITY), |best, cand| {
                if cand.1 > best.1 {
                    cand
                } else {
                    best
                }
            });
        let v_threshold = sweep.ys[idx];
        let peak_t = peak_idx as f64 / rate;

        // width at half height between threshold and peak
        let half = (v_threshold + v_peak) / 2.0;
        let rise = (idx..=peak_idx).find(|i| sweep.ys[*i] >= half);
        let fall_limit = stats::window_indices(sweep.ys.len(), rate, peak_t, Some(peak_t + 0.01));
        let fall = fall_limit.filter(|i| *i > peak_idx).find(|i| sweep.ys[*i] <= half);
        let halfwidth_ms = match (rise, fall) {
            (Some(r), Some(f)) if f > r => (f - r) as f64 / rate * 1000.0,
            _ => f64::NAN,
        };

        let around = stats::window_indices(sweep.ys.len(), rate, t - 0.005, Some(t + 0.005));
        let dvdt_max = stats::nan_max(&derivative[around.clone()]);
        let dvdt_min = stats::nan_min(&derivative[around]);
        let ahp_window = stats::window_indices(sweep.ys.len(), rate, peak_t, Some(peak_t + 0.05));
        let ahp = stats::nan_min(&sweep.ys[ahp_window]) - v_threshold;

        let mut features = BTreeMap::new();
        features.insert("T".to_string(), sweep.start_s + t);
        features.insert("Vthreshold".to_string(), v_threshold);
        features.insert("Vpeak".to_string(), v_peak);
        features.insert("height".to_string(), v_peak - v_threshold);
        features.insert("halfwidth_ms".to_string(), halfwidth_ms);
        features.insert("dVdt_max".to_string(), dvdt_max);
        features.insert("dVdt_min".to_string(), dvdt_min);
        features.insert("AHP".to_string(), ahp);
        Some(features)
    }
}

/// Per-sweep event times (within-sweep seconds) and derived summaries.
#[derive(Debug, Clone)]
pub struct SpikeTrains {
    pub by_sweep: Vec<Vec<f64>>,
    sweep_starts: Vec<f64>,
    window: (f64, Option<f64>),
}

impl SpikeTrains {
    pub fn total(&self) -> usize {
        self.by_sweep.iter().map(Vec::len).sum()
    }

    /// Event count per sweep.
    pub fn counts(&self) -> Vec<usize> {
        self.by_sweep.iter().map(Vec::len).collect()
    }

    /// First event time per sweep (within-sweep seconds); NaN when none.
    pub fn first_times(&self) -> Vec<f64> {
        self.by_sweep
            .iter()
            .map(|times| times.first().copied().unwrap_or(f64::NAN))
            .collect()
    }

    /// Instantaneous frequency series per sweep.
    pub fn freqs(&self) -> Vec<Vec<f64>> {
        self.by_sweep
            .iter()
            .map(|times| stats::instantaneous_freqs(times))
            .collect()
    }

    /// Median instantaneous frequency per sweep; NaN when fewer than two
    /// events.
    pub fn median_freqs(&self) -> Vec<f64> {
        self.freqs().iter().map(|f| stats::median(f)).collect()
    }

    /// First inter-event frequency per sweep; NaN when fewer than two events.
    pub fn first_freqs(&self) -> Vec<f64> {
        self.freqs()
            .iter()
            .map(|f| f.first().copied().unwrap_or(f64::NAN))
            .collect()
    }

    /// Mean event rate per sweep over the observed detection window.
    pub fn mean_rates(&self, sweep_len_s: f64) -> Vec<f64> {
        let end = self.window.1.unwrap_or(sweep_len_s);
        let duration = (end - self.window.0).max(f64::EPSILON);
        self.by_sweep
            .iter()
            .map(|times| times.len() as f64 / duration)
            .collect()
    }

    /// First event of the whole recording as `(sweep index, within-sweep
    /// time)`.
    pub fn first_event(&self) -> Option<(usize, f64)> {
        self.by_sweep
            .iter()
            .enumerate()
            .find_map(|(i, times)| times.first().map(|t| (i, *t)))
    }

    /// First event of the whole recording in chronological time.
    pub fn first_event_absolute(&self) -> Option<f64> {
        self.first_event()
            .map(|(sweep_index, t)| self.sweep_starts[sweep_index] + t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::recording;

    /// One sweep at 10 kHz with triangular spikes planted at the given times.
    fn spiking_sweep(rate: f64, len_s: f64, spike_times: &[f64]) -> Vec<f64> {
        let n = (rate * len_s) as usize;
        let mut ys = vec![-70.0; n];
        for &t in spike_times {
            let at = (t * rate) as usize;
            // 1 ms rise to +30 mV, 2 ms fall back
            let rise = (0.001 * rate) as usize;
            let fall = (0.002 * rate) as usize;
            for i in 0..rise {
                if at + i < n {
                    ys[at + i] = -70.0 + 100.0 * i as f64 / rise as f64;
                }
            }
            for i in 0..fall {
                if at + rise + i < n {
                    ys[at + rise + i] = 30.0 - 100.0 * i as f64 / fall as f64;
                }
            }
        }
        ys
    }

    #[test]
    fn detects_planted_events_inside_window_only() {
        let rate = 10_000.0;
        let sweep = spiking_sweep(rate, 1.0, &[0.05, 0.3, 0.5, 0.9]);
        let rec = recording::synthetic("0113", vec![sweep], rate);
        let trains = SpikeDetector::with_window(0.1, Some(0.7)).detect(&rec);
        assert_eq!(trains.counts(), vec![2]);
        for t in &trains.by_sweep[0] {
            assert!((0.1..0.7).contains(t));
        }
    }

    #[test]
    fn whole_recording_window_finds_everything() {
        let rate = 10_000.0;
        let sweep = spiking_sweep(rate, 1.0, &[0.05, 0.3, 0.9]);
        let rec = recording::synthetic("0111", vec![sweep], rate);
        let trains = SpikeDetector::default().detect(&rec);
        assert_eq!(trains.total(), 3);
        let (sweep_index, first) = trains.first_event().unwrap();
        assert_eq!(sweep_index, 0);
        assert!((first - 0.05).abs() < 0.002);
    }

    #[test]
    fn frequency_summaries() {
        let rate = 10_000.0;
        // 100 ms apart -> 10 Hz instantaneous
        let sweep = spiking_sweep(rate, 1.0, &[0.2, 0.3, 0.4]);
        let rec = recording::synthetic("0113", vec![sweep, vec![-70.0; 10_000]], rate);
        let trains = SpikeDetector::default().detect(&rec);
        let medians = trains.median_freqs();
        let firsts = trains.first_freqs();
        assert!((medians[0] - 10.0).abs() < 0.5);
        assert!((firsts[0] - 10.0).abs() < 0.5);
        assert!(medians[1].is_nan());
        assert_eq!(trains.counts()[1], 0);
        assert!(trains.first_times()[1].is_nan());
        // count / observed duration (whole 1 s sweep here)
        let rates = trains.mean_rates(1.0);
        assert!((rates[0] - 3.0).abs() < 1e-9);
        assert_eq!(rates[1], 0.0);
    }

    #[test]
    fn first_event_absolute_offsets_by_sweep_start() {
        let rate = 10_000.0;
        let quiet = vec![-70.0; 10_000];
        let spiking = spiking_sweep(rate, 1.0, &[0.4]);
        // second sweep starts at t = 1 s
        let rec = recording::synthetic("0111", vec![quiet, spiking], rate);
        let trains = SpikeDetector::default().detect(&rec);
        let t_abs = trains.first_event_absolute().unwrap();
        assert!((t_abs - 1.4).abs() < 0.002);
    }

    #[test]
    fn first_event_features_are_plausible() {
        let rate = 10_000.0;
        let sweep = spiking_sweep(rate, 1.0, &[0.25]);
        let rec = recording::synthetic("0111", vec![sweep], rate);
        let features = SpikeDetector::default()
            .first_event_features(&rec)
            .unwrap();
        assert!(features.contains_key("Vpeak"));
        assert!(features["Vpeak"] > 0.0);
        assert!(features["height"] > 50.0);
        assert!(features["dVdt_max"] > DEFAULT_UPSTROKE_THRESHOLD);
        assert!(features["T"] > 0.2 && features["T"] < 0.3);
    }

    #[test]
    fn quiet_recording_has_no_features() {
        let rec = recording::synthetic("0111", vec![vec![-70.0; 1000]], 10_000.0);
        assert!(SpikeDetector::default().first_event_features(&rec).is_none());
    }
}
