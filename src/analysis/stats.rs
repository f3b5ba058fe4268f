//! Windowed numeric summaries over sweep sample arrays.
//!
//! Every function here is total: an empty or out-of-bounds window yields a
//! NaN sentinel (or an empty series) rather than an error, so a malformed
//! window can never fail a batch run.

use std::ops::Range;

/// Resolve a `[t1, t2)` time window (seconds) to a clamped sample-index
/// range. `t2 = None` means "to the end of the sweep".
pub fn window_indices(len: usize, rate_hz: f64, t1: f64, t2: Option<f64>) -> Range<usize> {
    let to_index = |t: f64| ((t * rate_hz).round() as i64).clamp(0, len as i64) as usize;
    let i1 = to_index(t1);
    let i2 = match t2 {
        Some(t) => to_index(t),
        None => len,
    };
    i1..i2.max(i1)
}

/// Arithmetic mean, NaN for an empty slice.
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population standard deviation, NaN for an empty slice.
pub fn population_std(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    let mean = mean(data);
    let variance = data
        .iter()
        .map(|v| {
            let delta = v - mean;
            delta * delta
        })
        .sum::<f64>()
        / data.len() as f64;
    variance.sqrt()
}

/// Mean of the samples whose index falls in `[round(t1*rate), round(t2*rate))`.
pub fn window_mean(samples: &[f64], rate_hz: f64, t1: f64, t2: Option<f64>) -> f64 {
    mean(&samples[window_indices(samples.len(), rate_hz, t1, t2)])
}

/// Population standard deviation over the same index range as [`window_mean`].
pub fn window_std(samples: &[f64], rate_hz: f64, t1: f64, t2: Option<f64>) -> f64 {
    population_std(&samples[window_indices(samples.len(), rate_hz, t1, t2)])
}

/// Mark an index sub-range invalid (NaN). The range is clamped to bounds.
pub fn mask(samples: &mut [f64], range: Range<usize>) {
    let start = range.start.min(samples.len());
    let end = range.end.min(samples.len());
    for sample in &mut samples[start..end] {
        *sample = f64::NAN;
    }
}

/// Minimum ignoring NaN entries; NaN when nothing is left.
pub fn nan_min(data: &[f64]) -> f64 {
    data.iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NAN, f64::min)
}

/// Maximum ignoring NaN entries; NaN when nothing is left.
pub fn nan_max(data: &[f64]) -> f64 {
    data.iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f64::NAN, f64::max)
}

/// Median of the finite entries, NaN when there are none.
pub fn median(data: &[f64]) -> f64 {
    percentile(data, 50.0)
}

/// Percentile (linear interpolation) of the finite entries, NaN when empty.
pub fn percentile(data: &[f64], pct: f64) -> f64 {
    let mut finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return f64::NAN;
    }
    finite.sort_by(|a, b| a.total_cmp(b));
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (finite.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        finite[lo]
    } else {
        let frac = rank - lo as f64;
        finite[lo] * (1.0 - frac) + finite[hi] * frac
    }
}

/// Instantaneous frequencies (Hz) between consecutive event times.
/// `n` event times yield `n - 1` frequencies.
pub fn instantaneous_freqs(times: &[f64]) -> Vec<f64> {
    times
        .windows(2)
        .map(|pair| {
            let dt = pair[1] - pair[0];
            if dt > 0.0 {
                1.0 / dt
            } else {
                f64::NAN
            }
        })
        .collect()
}

/// Numerical derivative in units per millisecond (central differences,
/// one-sided at the ends). Returns a series the same length as the input.
pub fn derivative_per_ms(samples: &[f64], rate_hz: f64) -> Vec<f64> {
    let n = samples.len();
    if n < 2 {
        return vec![0.0; n];
    }
    let dt_ms = 1000.0 / rate_hz;
    let mut out = Vec::with_capacity(n);
    out.push((samples[1] - samples[0]) / dt_ms);
    for i in 1..n - 1 {
        out.push((samples[i + 1] - samples[i - 1]) / (2.0 * dt_ms));
    }
    out.push((samples[n - 1] - samples[n - 2]) / dt_ms);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_window_mean_is_exact() {
        let samples = vec![3.25; 1000];
        assert_eq!(window_mean(&samples, 1000.0, 0.1, Some(0.5)), 3.25);
        assert_eq!(window_std(&samples, 1000.0, 0.1, Some(0.5)), 0.0);
    }

    #[test]
    fn empty_window_yields_nan() {
        let samples = vec![1.0; 100];
        assert!(window_mean(&samples, 1000.0, 0.5, Some(0.5)).is_nan());
        assert!(window_mean(&samples, 1000.0, 5.0, Some(6.0)).is_nan());
        assert!(window_std(&samples, 1000.0, 9.0, None).is_nan());
    }

    #[test]
    fn window_end_defaults_to_sweep_end() {
        let samples: Vec<f64> = (0..10).map(|i| i as f64).collect();
        // last 5 samples: 5..=9
        assert_eq!(window_mean(&samples, 1.0, 5.0, None), 7.0);
    }

    #[test]
    fn masked_range_is_excluded_from_extrema() {
        let original: Vec<f64> = vec![0.0, -1.0, -9.0, -2.0, 5.0, 9.0, -3.0, 1.0];
        for mask_start in 0..original.len() {
            let mut samples = original.clone();
            mask(&mut samples, mask_start..mask_start + 2);
            let survivors: Vec<f64> = original
                .iter()
                .enumerate()
                .filter(|(i, _)| *i < mask_start || *i >= mask_start + 2)
                .map(|(_, v)| *v)
                .collect();
            assert_eq!(nan_min(&samples), survivors.iter().cloned().fold(f64::NAN, f64::min));
            assert_eq!(nan_max(&samples), survivors.iter().cloned().fold(f64::NAN, f64::max));
        }
    }

    #[test]
    fn nan_extrema_of_all_masked_is_nan() {
        let mut samples = vec![1.0, 2.0];
        mask(&mut samples, 0..2);
        assert!(nan_min(&samples).is_nan());
        assert!(nan_max(&samples).is_nan());
    }

    #[test]
    fn percentile_interpolates() {
        let data = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&data, 0.0), 0.0);
        assert_eq!(percentile(&data, 50.0), 2.0);
        assert_eq!(percentile(&data, 100.0), 4.0);
        assert!((percentile(&data, 90.0) - 3.6).abs() < 1e-12);
        assert!(percentile(&[], 50.0).is_nan());
    }

    #[test]
    fn instantaneous_freqs_from_times() {
        let freqs = instantaneous_freqs(&[0.1, 0.2, 0.4]);
        assert_eq!(freqs.len(), 2);
        assert!((freqs[0] - 10.0).abs() < 1e-9);
        assert!((freqs[1] - 5.0).abs() < 1e-9);
        assert!(instantaneous_freqs(&[0.5]).is_empty());
    }

    #[test]
    fn derivative_of_constant_sweep_is_zero() {
        let d = derivative_per_ms(&[7.0; 64], 1000.0);
        assert_eq!(d.len(), 64);
        assert!(d.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn derivative_of_ramp_is_slope() {
        // 1 unit per sample at 1 kHz = 1 unit/ms
        let samples: Vec<f64> = (0..32).map(|i| i as f64).collect();
        let d = derivative_per_ms(&samples, 1000.0);
        assert!(d.iter().all(|v| (*v - 1.0).abs() < 1e-12));
    }
}
