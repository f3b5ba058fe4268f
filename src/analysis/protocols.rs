//! Protocol dispatch and the per-protocol analysis recipes.
//!
//! Each routine is a fixed, hand-tuned recipe for one acquisition paradigm:
//! it walks the sweeps, computes per-sweep summaries, and renders one or
//! more annotated figures. Routing is a closed table; identifiers without a
//! registered routine fall back to [`Routine::Unknown`], so resolution is
//! total and dispatch can never fail.

use std::collections::HashMap;
use std::path::PathBuf;

use log::{info, warn};
use ndarray::{s, Array2, ArrayView1, Axis};
use once_cell::sync::Lazy;
use plotters::prelude::{BLACK, BLUE, GREEN, MAGENTA, RED, RGBColor, YELLOW};

use crate::analysis::error::AnalysisError;
use crate::analysis::plot::{
    add_chronological, add_comment_markers, add_single_sweep, add_sweep_overlay, frame_and_save,
    rainbow_color, Band, DataType, Figure, Legend, MarkerLine, Note, RenderOptions, Span,
    SweepStyle, Trace, TraceKind, SQUARE,
};
use crate::analysis::recording::Recording;
use crate::analysis::spikes::SpikeDetector;
use crate::analysis::stats;

const LIGHT_BLUE: RGBColor = RGBColor(170, 170, 255);
const GRAY: RGBColor = RGBColor(128, 128, 128);
const UNKNOWN_BACKGROUND: RGBColor = RGBColor(170, 170, 170);

// paired-pulse stimulus timing (seconds within the sweep)
const PP_FIRST_PULSE_S: f64 = 2.31255;
const PP_ISI_S: f64 = 0.040;
const PP_PULSE_WIDTH_S: f64 = 0.003;

/// Transient presentation state for one handler invocation.
pub struct AnalysisContext<'a> {
    pub options: &'a RenderOptions,
    pub style: SweepStyle,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(options: &'a RenderOptions) -> Self {
        Self {
            options,
            style: SweepStyle::default(),
        }
    }
}

/// Closed set of analysis recipes; handler parameters are baked into the
/// variant so intentionally aliased identifiers share one entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Routine {
    Unknown,
    MembraneTau,
    ApShape,
    Gain { step_pa: f64, start_pa: f64 },
    MembraneTest,
    MembraneTestIv,
    FastIv,
    CapacitanceRamp,
    SineSweep,
    RepeatedRamps,
    RepeatedSteps,
    CosineRamp,
    AverageRange { t1: f64, t2: Option<f64> },
    StimulusStack,
    PairedPulseVaried,
    PairedPulseTrain,
}

/// Protocol identifier -> routine. Lookup misses resolve to
/// [`Routine::Unknown`]; they are not errors.
pub static ROUTES: &[(&str, Routine)] = &[
    ("0101", Routine::MembraneTau),
    ("0111", Routine::ApShape),
    ("0112", Routine::Gain { step_pa: 10.0, start_pa: -50.0 }),
    ("0113", Routine::Gain { step_pa: 25.0, start_pa: -100.0 }),
    ("0114", Routine::Gain { step_pa: 100.0, start_pa: -100.0 }),
    ("0201", Routine::MembraneTest),
    ("0202", Routine::MembraneTestIv),
    ("0203", Routine::FastIv),
    ("0204", Routine::CapacitanceRamp),
    ("0222", Routine::SineSweep),
    ("0302", Routine::RepeatedRamps),
    ("0303", Routine::RepeatedRamps),
    ("0304", Routine::RepeatedSteps),
    ("0314", Routine::CosineRamp),
    ("0401", Routine::AverageRange { t1: 0.5, t2: Some(2.0) }),
    ("0402", Routine::AverageRange { t1: 0.5, t2: Some(2.0) }),
    ("0404", Routine::AverageRange { t1: 1.0, t2: Some(1.1) }),
    ("0405", Routine::AverageRange { t1: 1.0, t2: None }),
    ("0406", Routine::AverageRange { t1: 1.0, t2: None }),
    ("0501", Routine::StimulusStack),
    ("0502", Routine::StimulusStack),
    ("0911", Routine::PairedPulseVaried),
    ("0912", Routine::PairedPulseTrain),
];

static REGISTRY: Lazy<HashMap<&'static str, Routine>> =
    Lazy::new(|| ROUTES.iter().copied().collect());

impl Routine {
    /// Total resolution: trim + ASCII-lowercase the identifier, exact table
    /// match, else the fallback routine.
    pub fn resolve(protocol: &str) -> Routine {
        let key = protocol.trim().to_ascii_lowercase();
        REGISTRY
            .get(key.as_str())
            .copied()
            .unwrap_or(Routine::Unknown)
    }

    /// Run the recipe over one recording, returning the persisted artifacts.
    pub fn run(
        &self,
        recording: &Recording,
        ctx: &mut AnalysisContext,
    ) -> Result<Vec<PathBuf>, AnalysisError> {
        match *self {
            Routine::Unknown => unknown(recording, ctx),
            Routine::MembraneTau => membrane_tau(recording, ctx),
            Routine::ApShape => ap_shape(recording, ctx),
            Routine::Gain { step_pa, start_pa } => gain(recording, ctx, step_pa, start_pa),
            Routine::MembraneTest => overlay_figure(recording, ctx, SQUARE / 2, "membrane test"),
            Routine::MembraneTestIv => membrane_test_iv(recording, ctx),
            Routine::FastIv => fast_iv(recording, ctx),
            Routine::CapacitanceRamp => overlay_figure(recording, ctx, SQUARE / 2, "Cm ramp"),
            Routine::SineSweep => overlay_figure(recording, ctx, SQUARE / 2, "VC sine sweep"),
            Routine::RepeatedRamps => repeated_ramps(recording, ctx),
            Routine::RepeatedSteps => repeated_steps(recording, ctx),
            Routine::CosineRamp => cosine_ramp(recording, ctx),
            Routine::AverageRange { t1, t2 } => average_range(recording, ctx, t1, t2),
            Routine::StimulusStack => stimulus_stack(recording, ctx),
            Routine::PairedPulseVaried => paired_pulse_varied(recording, ctx),
            Routine::PairedPulseTrain => paired_pulse_train(recording, ctx),
        }
    }
}

/// Fallback: all sweeps chronologically, reduced line weight, gray panel
/// background to flag the unrecognized protocol to a reviewer.
fn unknown(rec: &Recording, ctx: &mut AnalysisContext) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as an unknown protocol", rec.id);
    ctx.style.rainbow = false;
    ctx.style.width = 1;
    ctx.style.alpha = 0.6;
    let mut fig = Figure::single(SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.background = Some(UNKNOWN_BACKGROUND);
    add_chronological(panel, rec, &ctx.style, false);
    add_comment_markers(panel, rec, false, false);
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "UNKNOWN",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Baseline-subtracted sweep overlay plus the average trace, with the
/// measurement window shaded.
fn membrane_tau(rec: &Recording, ctx: &mut AnalysisContext) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as an IC tau measurement", rec.id);
    let (m1, m2) = (0.05, 0.1);
    let mut fig = Figure::single(SQUARE / 2, SQUARE / 2);
    let panel = fig.panel_mut(0);
    panel.y_label = Some("relative potential (mV)".to_string());
    panel.x_label = Some("time (sec)".to_string());
    for sweep in rec.sweeps() {
        let baseline = sweep.window_mean(m1, Some(m2));
        let ys: Vec<f64> = sweep.ys.iter().map(|y| y - baseline).collect();
        panel
            .traces
            .push(Trace::line(sweep.times(), ys, LIGHT_BLUE).alpha(0.2));
    }
    let mut average = rec.average_sweep(0..rec.sweep_count());
    let offset = stats::window_mean(&average, rec.sample_rate_hz, m1, Some(m2));
    for v in &mut average {
        *v -= offset;
    }
    let times = rec.sweep(0)?.times();
    panel
        .traces
        .push(Trace::line(times, average, BLUE).width(2).alpha(0.5));
    panel.spans.push(Span::vertical(m1, m2, RED));
    panel.lines.push(MarkerLine::horizontal(0.0, RED));
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "IC tau",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Full-trace and zoomed views of the signal and its derivative around the
/// first detected action potential, annotated with its feature set.
fn ap_shape(rec: &Recording, ctx: &mut AnalysisContext) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing action potential shape", rec.id);
    let detector = SpikeDetector::default();
    let trains = detector.detect(rec);

    let mut fig = Figure::grid(2, 2, SQUARE, SQUARE);
    for sweep in rec.sweeps() {
        let xs = sweep.times_absolute();
        let derivative = sweep.derivative();
        fig.panel_mut(0)
            .traces
            .push(Trace::line(xs.clone(), sweep.ys.to_vec(), BLUE).alpha(0.8));
        fig.panel_mut(1)
            .traces
            .push(Trace::line(xs.clone(), sweep.ys.to_vec(), BLUE).alpha(0.8).width(2));
        fig.panel_mut(2)
            .traces
            .push(Trace::line(xs.clone(), derivative.clone(), RED).alpha(0.8));
        fig.panel_mut(3)
            .traces
            .push(Trace::line(xs, derivative, RED).alpha(0.8).width(2));
    }
    fig.panel_mut(0).y_label = Some(rec.units_y.clone());
    fig.panel_mut(2).y_label = Some(rec.units_dy.clone());
    for i in [2, 3] {
        fig.panel_mut(i)
            .lines
            .push(MarkerLine::horizontal(-100.0, RED));
    }
    for i in [1, 3] {
        fig.panel_mut(i).hide_y_axis = true;
    }
    if let Some(t_abs) = trains.first_event_absolute() {
        fig.panel_mut(1).set_xlim(Some(t_abs - 0.25), Some(t_abs + 0.25));
        fig.panel_mut(3).set_xlim(Some(t_abs - 0.01), Some(t_abs + 0.01));
    }
    if let Some(features) = detector.first_event_features(rec) {
        // keys sort lexicographically; current-amplitude keys stay out
        let text = features
            .iter()
            .filter(|(key, _)| !key.ends_with("_pA"))
            .map(|(key, value)| format!("{key} = {value:.3}"))
            .collect::<Vec<_>>()
            .join("\n");
        fig.panel_mut(0).notes.push(Note {
            x_frac: 0.02,
            y_frac: 0.04,
            text,
        });
    }
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "AP shape",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Gain-function recipe: spike frequency against injected current, with
/// stacked sweep views and two zoomed voltage-response figures.
fn gain(
    rec: &Recording,
    ctx: &mut AnalysisContext,
    step_pa: f64,
    start_pa: f64,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!(
        "{}: analyzing as a gain function ({} pA steps from {} pA)",
        rec.id, step_pa, start_pa
    );
    let currents: Vec<f64> = (0..rec.sweep_count())
        .map(|i| start_pa + i as f64 * step_pa)
        .collect();
    let (detect_t1, detect_t2) = (0.1, 0.7);
    let trains = SpikeDetector::with_window(detect_t1, Some(detect_t2)).detect(rec);
    let mut artifacts = Vec::new();

    let mut fig = Figure::grid(2, 2, SQUARE, SQUARE);
    ctx.style.width = 1;
    add_sweep_overlay(fig.panel_mut(0), rec, &ctx.style, 0.0, 0.0);
    add_sweep_overlay(fig.panel_mut(1), rec, &ctx.style, 0.0, 150.0);
    fig.panel_mut(1).hide_y_axis = true;
    for i in [0, 1] {
        for t in [detect_t1, detect_t2] {
            fig.panel_mut(i).lines.push(MarkerLine::vertical(t, RED));
        }
    }

    let freqs = trains.freqs();
    let count = rec.sweep_count();
    let freq_panel = fig.panel_mut(2);
    freq_panel.y_label = Some("frequency (Hz)".to_string());
    freq_panel.x_label = Some("seconds".to_string());
    for (i, (times, sweep_freqs)) in trains.by_sweep.iter().zip(&freqs).enumerate() {
        if sweep_freqs.is_empty() {
            continue;
        }
        let xs = times[..times.len() - 1].to_vec();
        freq_panel.traces.push(
            Trace::line(xs, sweep_freqs.clone(), rainbow_color(i as f64 / count as f64))
                .alpha(0.5)
                .width(2),
        );
    }

    let gain_panel = fig.panel_mut(3);
    gain_panel.x_label = Some("applied current (pA)".to_string());
    gain_panel.margins = (0.02, 0.1);
    gain_panel.traces.push(
        Trace::line(currents.clone(), trains.median_freqs(), BLUE)
            .kind(TraceKind::LineDots(4))
            .label("median"),
    );
    gain_panel.traces.push(
        Trace::line(currents.clone(), trains.first_freqs(), GREEN)
            .kind(TraceKind::LineDots(4))
            .label("first"),
    );
    gain_panel.traces.push(
        Trace::line(currents, trains.mean_rates(rec.sweep_len_s()), BLACK)
            .alpha(0.5)
            .kind(TraceKind::LineDots(4))
            .label("mean"),
    );
    gain_panel.lines.push(MarkerLine::horizontal(40.0, RED));
    gain_panel.legend = Some(Legend::UpperLeft);

    let tag = format!("AP Gain {start_pa:.0}_{step_pa:.0}");
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        &tag,
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));

    // second figure: every sweep up to the first suprathreshold one, then
    // the same scene persisted under two zoom tags
    let mut fig = Figure::single(SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.y_label = Some("Membrane Potential (mV)".to_string());
    panel.x_label = Some("Time (seconds)".to_string());
    for sweep in rec.sweeps() {
        panel
            .traces
            .push(Trace::line(sweep.times(), sweep.ys.to_vec(), BLUE).alpha(0.5));
        if stats::nan_max(sweep.ys) > 0.0 {
            break;
        }
    }
    panel.set_xlim(Some(0.0), Some(1.0));
    panel.title = Some(format!("{step_pa:.0} pA Steps from Rest"));
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "voltage response fromRest",
        DataType::Plot,
        ctx.options,
        None,
        true,
    ));
    let panel = fig.panel_mut(0);
    panel.set_xlim(Some(1.5), Some(2.5));
    panel.title = Some(format!("{step_pa:.0} pA Steps from {start_pa:.0} pA"));
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "voltage response hyperpol",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Plain sweep overlay at the given square size.
fn overlay_figure(
    rec: &Recording,
    ctx: &mut AnalysisContext,
    size: u32,
    tag: &str,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as {}", rec.id, tag);
    let mut fig = Figure::single(size, size);
    add_sweep_overlay(fig.panel_mut(0), rec, &ctx.style, 0.0, 0.0);
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        tag,
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Sweep overlay with y-bounds taken from a late, stable window of the
/// first and last sweeps, so capacitive transients do not set the scale.
fn membrane_test_iv(
    rec: &Recording,
    ctx: &mut AnalysisContext,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as MTIV", rec.id);
    let mut fig = Figure::single(SQUARE, SQUARE);
    ctx.style.alpha = 0.6;
    add_sweep_overlay(fig.panel_mut(0), rec, &ctx.style, 0.0, 0.0);
    let lo = rec.sweep(0)?.window_mean(0.9, Some(1.0)) - 100.0;
    let hi = rec
        .sweep(rec.sweep_count() - 1)?
        .window_mean(0.9, Some(1.0))
        + 100.0;
    let panel = fig.panel_mut(0);
    if lo.is_finite() {
        panel.y_limits.0 = Some(lo);
    }
    if hi.is_finite() {
        panel.y_limits.1 = Some(hi);
    }
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "MTIV",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Two panels: sweeps with the measurement window shaded, and the windowed
/// average against the command potential.
fn fast_iv(rec: &Recording, ctx: &mut AnalysisContext) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as a fast IV", rec.id);
    let (m1, m2) = (0.7, 1.0);
    let mut fig = Figure::grid(1, 2, SQUARE, SQUARE / 2);
    add_sweep_overlay(fig.panel_mut(0), rec, &ctx.style, 0.0, 0.0);
    fig.panel_mut(0).spans.push(Span::vertical(m1, m2, RED));

    let command_mv: Vec<f64> = (0..rec.sweep_count())
        .map(|i| i as f64 * 5.0 - 110.0)
        .collect();
    let averages: Vec<f64> = rec
        .sweeps()
        .map(|sweep| sweep.window_mean(m1, Some(m2)))
        .collect();
    let panel = fig.panel_mut(1);
    panel.x_label = Some("membrane potential (mV)".to_string());
    panel.y_label = Some(rec.units_y.clone());
    panel.margins = (0.1, 0.1);
    panel
        .traces
        .push(Trace::line(command_mv, averages, BLUE).kind(TraceKind::LineDots(5)));
    panel.lines.push(MarkerLine::vertical(-70.0, RED));
    panel.lines.push(MarkerLine::horizontal(0.0, RED));
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "fast IV",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Stacked dot-line panels of per-sweep series against experiment minutes,
/// with labeled comment markers.
fn time_course_panels(rec: &Recording, series: &[(&str, Vec<f64>)]) -> Figure {
    let minutes: Vec<f64> = (0..rec.sweep_count())
        .map(|i| rec.sweep_start(i) / 60.0)
        .collect();
    let mut fig = Figure::grid(series.len(), 1, SQUARE, SQUARE);
    for (i, (label, values)) in series.iter().enumerate() {
        let panel = fig.panel_mut(i);
        panel.y_label = Some(label.to_string());
        panel.traces.push(
            Trace::line(minutes.clone(), values.clone(), BLUE).kind(TraceKind::LineDots(5)),
        );
        add_comment_markers(panel, rec, true, true);
        if !rec.comments.is_empty() {
            panel.legend = Some(Legend::UpperRight);
        }
    }
    if let Some(panel) = fig.panels.last_mut() {
        panel.x_label = Some("Experiment Duration (minutes)".to_string());
    }
    fig
}

/// Repeated current-clamp ramps: time course, stacked sweeps with the
/// comment sweeps highlighted, and event counts / first-event latency.
fn repeated_ramps(
    rec: &Recording,
    ctx: &mut AnalysisContext,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as repeated IC ramps", rec.id);
    let mut artifacts = average_range(rec, ctx, 0.2, Some(1.2))?;

    let comment_sweeps = rec.comment_sweeps();
    let mut fig = Figure::single(SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.margins = (0.0, 0.01);
    for sweep in rec.sweeps() {
        let color = if comment_sweeps.contains(&sweep.index) {
            RED
        } else {
            BLUE
        };
        let ys: Vec<f64> = sweep
            .ys
            .iter()
            .map(|y| y + 100.0 * sweep.index as f64)
            .collect();
        panel.traces.push(Trace::line(sweep.times(), ys, color).alpha(0.5));
    }
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "IC ramps",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));

    let trains = SpikeDetector::with_window(2.3, Some(8.3)).detect(rec);
    let counts: Vec<f64> = trains.counts().iter().map(|c| *c as f64).collect();
    let first_times: Vec<f64> = trains
        .by_sweep
        .iter()
        .map(|times| times.first().copied().unwrap_or(0.0))
        .collect();
    let fig = time_course_panels(
        rec,
        &[("AP Count", counts), ("First AP Time (s)", first_times)],
    );
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "IC ramp freq",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Repeated current-clamp steps: rest potential plus step-window and
/// whole-sweep event counts over the experiment.
fn repeated_steps(
    rec: &Recording,
    ctx: &mut AnalysisContext,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as repeated current-clamp steps", rec.id);
    let rest: Vec<f64> = rec
        .sweeps()
        .map(|sweep| sweep.window_mean(0.0, Some(3.0)))
        .collect();
    let step_counts: Vec<f64> = SpikeDetector::with_window(3.15, Some(4.15))
        .detect(rec)
        .counts()
        .iter()
        .map(|c| *c as f64)
        .collect();
    let sweep_counts: Vec<f64> = SpikeDetector::with_window(0.0, Some(10.0))
        .detect(rec)
        .counts()
        .iter()
        .map(|c| *c as f64)
        .collect();
    let fig = time_course_panels(
        rec,
        &[
            ("Rest Potential (mV)", rest),
            ("APs in Step (#)", step_counts),
            ("APs in Sweep (#)", sweep_counts),
        ],
    );
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "cos ramp",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Cosine + ramp protocol: baseline-vs-drug averaged sweeps around the
/// first comment (persisted under full and zoomed tags), then the usual
/// rest/event time course.
fn cosine_ramp(rec: &Recording, ctx: &mut AnalysisContext) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as a cosine + ramp protocol", rec.id);
    let mut artifacts = Vec::new();
    let (sine_t1, sine_t2) = (2.25, 4.5);
    let (ramp_t1, ramp_t2) = (9.0, 12.5);

    if let Some(&first_comment_sweep) = rec.comment_sweeps().first() {
        let sweeps_to_average = 10usize;
        let b1 = first_comment_sweep.saturating_sub(sweeps_to_average);
        let b2 = first_comment_sweep;
        let d1 = first_comment_sweep + 1;
        let d2 = (d1 + sweeps_to_average).min(rec.sweep_count().saturating_sub(1));

        let mut fig = Figure::single(2 * SQUARE, SQUARE / 2);
        let panel = fig.panel_mut(0);
        panel.margins = (0.0, 0.05);
        let times = rec.sweep(0)?.times();
        panel.traces.push(
            Trace::line(times.clone(), rec.average_sweep(b1..b2), BLUE)
                .alpha(0.8)
                .label(format!("baseline ({b1}-{b2})")),
        );
        panel.traces.push(
            Trace::line(times, rec.average_sweep(d1..d2 + 1), RED)
                .alpha(0.8)
                .label(format!("drug ({d1}-{d2})")),
        );
        panel.legend = Some(Legend::UpperRight);
        artifacts.extend(frame_and_save(
            &fig,
            rec,
            "cos ramp avg",
            DataType::Plot,
            ctx.options,
            None,
            true,
        ));
        fig.panel_mut(0).set_xlim(Some(sine_t1), Some(sine_t2));
        artifacts.extend(frame_and_save(
            &fig,
            rec,
            "cos ramp avgSine",
            DataType::Plot,
            ctx.options,
            None,
            true,
        ));
        fig.panel_mut(0).set_xlim(Some(ramp_t1), Some(ramp_t2));
        artifacts.extend(frame_and_save(
            &fig,
            rec,
            "cos ramp avgRamp",
            DataType::Plot,
            ctx.options,
            None,
            false,
        ));
    }

    let rest: Vec<f64> = rec
        .sweeps()
        .map(|sweep| sweep.window_mean(0.0, Some(sine_t1)))
        .collect();
    let cos_counts: Vec<f64> = SpikeDetector::with_window(sine_t1, Some(sine_t2))
        .detect(rec)
        .counts()
        .iter()
        .map(|c| *c as f64)
        .collect();
    let ramp_counts: Vec<f64> = SpikeDetector::with_window(ramp_t1, Some(ramp_t2))
        .detect(rec)
        .counts()
        .iter()
        .map(|c| *c as f64)
        .collect();
    let fig = time_course_panels(
        rec,
        &[
            ("Rest Potential (mV)", rest),
            ("APs in Cos (#)", cos_counts),
            ("APs in Ramp (#)", ramp_counts),
        ],
    );
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "cos ramp",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Generic time-course recipe: per-sweep windowed average and standard
/// deviation against experiment minutes, three panels.
fn average_range(
    rec: &Recording,
    ctx: &mut AnalysisContext,
    t1: f64,
    t2: Option<f64>,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as a time-course experiment", rec.id);
    let minutes: Vec<f64> = (0..rec.sweep_count())
        .map(|i| rec.sweep_start(i) / 60.0)
        .collect();
    let averages: Vec<f64> = rec.sweeps().map(|s| s.window_mean(t1, t2)).collect();
    let stddevs: Vec<f64> = rec.sweeps().map(|s| s.window_std(t1, t2)).collect();
    let tags = rec
        .comments
        .iter()
        .map(|c| c.tag.clone())
        .collect::<Vec<_>>()
        .join(", ");

    let mut fig = Figure::grid(1, 3, 2 * SQUARE, SQUARE / 2);
    let panel = fig.panel_mut(0);
    add_single_sweep(panel, rec, 0, &ctx.style);
    panel.title = Some("First Sweep (shaded measurement range)".to_string());
    panel
        .spans
        .push(Span::vertical(t1, t2.unwrap_or(rec.sweep_len_s()), RED));

    let panel = fig.panel_mut(1);
    panel.title = Some(if tags.is_empty() {
        "Range Average".to_string()
    } else {
        format!("Range Average  TAGS: {tags}")
    });
    panel.y_label = Some(rec.units_y.clone());
    panel.x_label = Some("minutes".to_string());
    panel.traces.push(
        Trace::line(minutes.clone(), averages, BLUE)
            .kind(TraceKind::Dots(4))
            .alpha(0.75),
    );
    add_comment_markers(panel, rec, true, false);

    let panel = fig.panel_mut(2);
    panel.title = Some(if tags.is_empty() {
        "Range Standard Deviation".to_string()
    } else {
        format!("Range Standard Deviation  TAGS: {tags}")
    });
    panel.y_label = Some(rec.units_y.clone());
    panel.x_label = Some("minutes".to_string());
    panel.traces.push(
        Trace::line(minutes, stddevs.clone(), GREEN)
            .kind(TraceKind::Dots(6))
            .alpha(0.5),
    );
    add_comment_markers(panel, rec, true, false);
    // clip to 1.25 x p99 so outliers do not crush the vertical scale
    let clip = stats::percentile(&stddevs, 99.0) * 1.25;
    panel.y_limits.0 = Some(0.0);
    if clip.is_finite() && clip > 0.0 {
        panel.y_limits.1 = Some(clip);
    }

    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "sweep vs average",
        DataType::Experiment,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Stimulus-epoch average and stacked-sweep figure. Falls back to the
/// unknown recipe when the recording carries no stimulus window.
fn stimulus_stack(
    rec: &Recording,
    ctx: &mut AnalysisContext,
) -> Result<Vec<PathBuf>, AnalysisError> {
    let Some((t1, t2)) = rec.stimulus_window else {
        warn!(
            "{}: no stimulus window in metadata; rendering as unknown",
            rec.id
        );
        return unknown(rec, ctx);
    };
    info!("{}: analyzing as a stimulus-epoch experiment", rec.id);
    let padding = if rec.units_y == "mV" { 0.25 } else { 0.1 };
    let pad = t1.min(padding);
    let window = stats::window_indices(rec.sweep_samples(), rec.sample_rate_hz, t1 - pad, Some(t2 + pad));
    let times: Vec<f64> = rec.sweep(0)?.times()[window.clone()].to_vec();
    let chunks: Vec<Vec<f64>> = rec
        .sweeps()
        .map(|sweep| sweep.ys[window.clone()].to_vec())
        .collect();

    let mut fig = Figure::grid(2, 1, SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.title = Some(format!(
        "{} stimulus average of {} sweeps",
        rec.id,
        rec.sweep_count()
    ));
    panel.y_label = Some(rec.units_y.clone());
    for chunk in &chunks {
        panel
            .traces
            .push(Trace::line(times.clone(), chunk.clone(), GRAY).alpha(0.2).width(2));
    }
    let mut average = vec![0.0; times.len()];
    for chunk in &chunks {
        for (a, v) in average.iter_mut().zip(chunk) {
            *a += v;
        }
    }
    for a in &mut average {
        *a /= chunks.len().max(1) as f64;
    }
    panel
        .traces
        .push(Trace::line(times.clone(), average, BLUE).alpha(0.5).width(2));
    panel.spans.push(Span::vertical(t1, t2, YELLOW).alpha(0.2));

    let panel = fig.panel_mut(1);
    panel.x_label = Some("time (sec)".to_string());
    panel.y_label = Some("stacked sweeps".to_string());
    let count = rec.sweep_count();
    for sweep in rec.sweeps() {
        let offset = 100.0 * (count - sweep.index) as f64;
        if rec.units_y == "pA" {
            let ys: Vec<f64> = chunks[sweep.index].iter().map(|y| y + offset).collect();
            panel
                .traces
                .push(Trace::line(times.clone(), ys, BLUE).alpha(0.5).width(2));
        } else {
            let ys: Vec<f64> = sweep.ys.iter().map(|y| y + offset).collect();
            panel
                .traces
                .push(Trace::line(sweep.times(), ys, BLUE).alpha(0.5).width(2));
        }
    }
    panel.spans.push(Span::vertical(t1, t2, YELLOW).alpha(0.2));
    if rec.units_y == "mV" {
        panel
            .lines
            .push(MarkerLine::vertical(t1, RED).alpha(0.2).width(3));
    }
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "stim stack",
        DataType::Experiment,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Paired pulses at increasing inter-stimulus intervals: one overlay in the
/// millisecond domain with both pulse artifacts masked out.
fn paired_pulse_varied(
    rec: &Recording,
    ctx: &mut AnalysisContext,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!(
        "{}: analyzing as paired pulse stimulation with increasing ISIs",
        rec.id
    );
    let rate = rec.sample_rate_hz;
    let (m1, m2) = (2.2, 2.4);
    let window = stats::window_indices(rec.sweep_samples(), rate, m1, Some(m2));
    let p1_index = (2.23440 * rate).round() as usize;
    let pulse_width = ((1.5 / 1000.0) * rate).round() as usize;

    let mut fig = Figure::single(SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.title = Some("Paired Pulse Stimulation (varied ISIs)".to_string());
    panel.y_label = Some("clamp current (pA) [artifacts removed]".to_string());
    panel.x_label = Some(format!("time (ms) [offset by {m1:.2} s]"));
    panel.lines.push(MarkerLine::horizontal(0.0, BLACK));
    let count = rec.sweep_count();
    for sweep in rec.sweeps() {
        if window.is_empty() {
            break;
        }
        let baseline = sweep.window_mean(1.0, Some(2.0));
        let xs: Vec<f64> = (0..window.len()).map(|i| i as f64 / rate * 1000.0).collect();
        let mut ys: Vec<f64> = sweep.ys[window.clone()].iter().map(|y| y - baseline).collect();
        let isi_ms = 10 + sweep.index * 10;
        let p1 = p1_index.saturating_sub(window.start);
        stats::mask(&mut ys, p1..p1 + pulse_width);
        let p2 = p1 + ((isi_ms as f64 / 1000.0) * rate).round() as usize;
        stats::mask(&mut ys, p2..p2 + pulse_width);
        panel.traces.push(
            Trace::line(xs, ys, rainbow_color(sweep.index as f64 / count as f64))
                .alpha(0.8)
                .label(format!("{isi_ms} ms")),
        );
    }
    panel.legend = Some(Legend::UpperRight);
    let mut artifacts = Vec::new();
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "pp_varied",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

/// Per-sweep paired-pulse measurement on a baseline-corrected, artifact-
/// masked copy of the sweep.
#[derive(Debug, Clone, Copy)]
struct PulseMeasure {
    baseline: f64,
    transient: f64,
    peak1: f64,
    peak2: f64,
    ratio: f64,
}

fn measure_paired_pulse(ys: &[f64], rate: f64) -> (PulseMeasure, Vec<f64>) {
    let p1 = (PP_FIRST_PULSE_S * rate).round() as usize;
    let p2 = p1 + (PP_ISI_S * rate).round() as usize;
    let p3 = p2 + (p2 - p1);
    let pulse_width = (PP_PULSE_WIDTH_S * rate).round() as usize;
    let len = ys.len();

    let baseline = stats::window_mean(ys, rate, 1.0, Some(2.0));
    // peak transient right after the test pulse is an access-resistance proxy
    let transient =
        stats::nan_max(&ys[stats::window_indices(len, rate, 0.51, Some(0.52))]) - baseline;

    let mut corrected: Vec<f64> = ys.iter().map(|y| y - baseline).collect();
    stats::mask(&mut corrected, p1..p1 + pulse_width);
    stats::mask(&mut corrected, p2..p2 + pulse_width);
    let pre = p1.saturating_sub((0.05 * rate).round() as usize);
    stats::mask(&mut corrected, 0..pre);
    let post = p1 + (0.15 * rate).round() as usize;
    stats::mask(&mut corrected, post..len);

    let peak1 = stats::nan_min(&corrected[p1.min(len)..p2.min(len)]);
    let peak2 = stats::nan_min(&corrected[p2.min(len)..p3.min(len)]);
    (
        PulseMeasure {
            baseline,
            transient,
            peak1,
            peak2,
            ratio: peak2 / peak1,
        },
        corrected,
    )
}

/// Fixed 40 ms paired-pulse experiment: averaged evoked responses, peak
/// amplitude / ratio time course, holding current and normalized access
/// resistance.
fn paired_pulse_train(
    rec: &Recording,
    ctx: &mut AnalysisContext,
) -> Result<Vec<PathBuf>, AnalysisError> {
    info!("{}: analyzing as a 40 ms paired-pulse experiment", rec.id);
    let rate = rec.sample_rate_hz;
    let p1 = (PP_FIRST_PULSE_S * rate).round() as usize;
    let p2 = p1 + (PP_ISI_S * rate).round() as usize;
    let p3 = p2 + (p2 - p1);
    let roi_pad = (0.02 * rate).round() as usize;
    let roi_start = p1.saturating_sub(roi_pad);
    let roi_end = (p3 + roi_pad).min(rec.sweep_samples());
    let roi_len = roi_end.saturating_sub(roi_start);

    let count = rec.sweep_count();
    let mut minutes = Vec::with_capacity(count);
    let mut baselines = Vec::with_capacity(count);
    let mut transients = Vec::with_capacity(count);
    let mut peak1s = Vec::with_capacity(count);
    let mut peak2s = Vec::with_capacity(count);
    let mut ratios = Vec::with_capacity(count);
    let mut roi = Array2::<f64>::from_elem((count, roi_len), f64::NAN);
    for sweep in rec.sweeps() {
        let (measure, corrected) = measure_paired_pulse(sweep.ys, rate);
        minutes.push(sweep.start_s / 60.0);
        baselines.push(measure.baseline);
        transients.push(measure.transient);
        peak1s.push(measure.peak1);
        peak2s.push(measure.peak2);
        ratios.push(measure.ratio * 100.0);
        if roi_len > 0 && corrected.len() >= roi_end {
            roi.row_mut(sweep.index)
                .assign(&ArrayView1::from(&corrected[roi_start..roi_end]));
        }
    }
    let mut artifacts = Vec::new();

    // averaged evoked response over fixed five-minute sweep ranges
    let mut fig = Figure::single(SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.lines.push(MarkerLine::horizontal(0.0, BLACK));
    let xs: Vec<f64> = (0..roi_len).map(|i| i as f64 / rate).collect();
    let span_sweeps = 15; // 3 sweeps/minute, 5 minutes
    for (k, end) in [30usize, 60, 90].into_iter().enumerate() {
        let s2 = end.min(count);
        let s1 = s2.saturating_sub(span_sweeps);
        if s1 >= s2 || roi_len == 0 {
            continue;
        }
        let segment = roi.slice(s![s1..s2, ..]);
        let Some(average) = segment.mean_axis(Axis(0)) else {
            continue;
        };
        let sd = segment.std_axis(Axis(0), 0.0);
        let color = [BLUE, GREEN, MAGENTA][k % 3];
        let lo: Vec<f64> = average.iter().zip(sd.iter()).map(|(a, s)| a - s).collect();
        let hi: Vec<f64> = average.iter().zip(sd.iter()).map(|(a, s)| a + s).collect();
        panel.bands.push(Band {
            xs: xs.clone(),
            lo,
            hi,
            color,
            alpha: 0.1,
        });
        panel.traces.push(
            Trace::line(xs.clone(), average.to_vec(), color).label(format!("sweeps {s1}-{s2}")),
        );
    }
    panel.legend = Some(Legend::UpperRight);
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "pp_avg",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));

    // peak amplitudes and paired-pulse ratio over the experiment
    let mut fig = Figure::grid(2, 1, SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.title = Some("Paired Pulse Stimulation".to_string());
    panel.y_label = Some("Peak Amplitude (pA)".to_string());
    panel.traces.push(
        Trace::line(minutes.clone(), peak1s, GREEN)
            .kind(TraceKind::Dots(6))
            .alpha(0.6)
            .label("pulse1"),
    );
    panel.traces.push(
        Trace::line(minutes.clone(), peak2s, MAGENTA)
            .kind(TraceKind::Dots(6))
            .alpha(0.6)
            .label("pulse2"),
    );
    panel.y_limits.1 = Some(0.0);
    panel.legend = Some(Legend::UpperRight);
    add_comment_markers(panel, rec, true, true);

    let panel = fig.panel_mut(1);
    panel.y_label = Some("Paired Pulse Ratio (%)".to_string());
    panel.x_label = Some("Experiment Duration (minutes)".to_string());
    panel.lines.push(MarkerLine::horizontal(100.0, BLACK));
    panel.traces.push(
        Trace::line(minutes.clone(), ratios, RED)
            .kind(TraceKind::Dots(6))
            .alpha(0.6),
    );
    panel.y_limits.0 = Some(0.0);
    add_comment_markers(panel, rec, true, false);
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "pp_experiment",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));

    // holding current and normalized peak transient over the experiment
    let mut fig = Figure::grid(2, 1, SQUARE, SQUARE);
    let panel = fig.panel_mut(0);
    panel.title = Some("Holding Current (pulse baseline)".to_string());
    panel.y_label = Some("Clamp Current (pA)".to_string());
    let lo = stats::nan_min(&baselines);
    let hi = stats::nan_max(&baselines);
    if lo.is_finite() && hi.is_finite() {
        panel.set_ylim(Some(lo - 100.0), Some(hi + 100.0));
    }
    panel.traces.push(
        Trace::line(minutes.clone(), baselines, BLUE)
            .kind(TraceKind::Dots(6))
            .alpha(0.6),
    );
    add_comment_markers(panel, rec, true, true);

    let panel = fig.panel_mut(1);
    panel.title = Some("Access Resistance".to_string());
    panel.y_label = Some("Peak Transient Current (% of first)".to_string());
    panel.x_label = Some("Experiment Duration (minutes)".to_string());
    let first_transient = transients.first().copied().unwrap_or(f64::NAN);
    let access: Vec<f64> = transients
        .iter()
        .map(|t| t / first_transient * 100.0)
        .collect();
    panel.traces.push(
        Trace::line(minutes, access, RED)
            .kind(TraceKind::Dots(6))
            .alpha(0.6),
    );
    panel
        .spans
        .push(Span::horizontal(75.0, 125.0, BLACK).label("+/- 25%"));
    panel.margins = (0.0, 0.5);
    panel.y_limits.0 = Some(0.0);
    panel.legend = Some(Legend::UpperRight);
    add_comment_markers(panel, rec, true, false);
    artifacts.extend(frame_and_save(
        &fig,
        rec,
        "pp_baselines",
        DataType::Plot,
        ctx.options,
        None,
        false,
    ));
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::recording;

    #[test]
    fn unregistered_identifiers_resolve_to_fallback() {
        for id in ["", "9999", "gibberish", "0101x", "  ", "proto_0101"] {
            assert_eq!(Routine::resolve(id), Routine::Unknown);
        }
    }

    #[test]
    fn registered_identifiers_resolve_exactly() {
        assert_eq!(Routine::resolve("0101"), Routine::MembraneTau);
        assert_eq!(Routine::resolve("0912"), Routine::PairedPulseTrain);
        assert_eq!(
            Routine::resolve("0113"),
            Routine::Gain {
                step_pa: 25.0,
                start_pa: -100.0
            }
        );
        // normalization: surrounding whitespace is ignored
        assert_eq!(Routine::resolve(" 0203 "), Routine::FastIv);
    }

    #[test]
    fn intentional_aliases_share_a_routine() {
        for (a, b) in [("0302", "0303"), ("0401", "0402"), ("0405", "0406"), ("0501", "0502")] {
            assert_eq!(Routine::resolve(a), Routine::resolve(b));
        }
    }

    #[test]
    fn every_route_key_is_unique() {
        let mut keys: Vec<&str> = ROUTES.iter().map(|(k, _)| *k).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), ROUTES.len());
    }

    #[test]
    fn paired_pulse_ratio_of_planted_peaks() {
        let rate = 1000.0;
        let mut ys = vec![0.0; 2600];
        // access-resistance transient inside [0.51, 0.52)
        ys[515] = 100.0;
        let p1 = (PP_FIRST_PULSE_S * rate).round() as usize;
        let p2 = p1 + (PP_ISI_S * rate).round() as usize;
        ys[p1 + 10] = -50.0;
        ys[p2 + 10] = -25.0;
        let (measure, corrected) = measure_paired_pulse(&ys, rate);
        assert_eq!(measure.peak1, -50.0);
        assert_eq!(measure.peak2, -25.0);
        assert!((measure.ratio - 0.5).abs() < 1e-12);
        assert_eq!(measure.baseline, 0.0);
        assert_eq!(measure.transient, 100.0);
        // both pulse artifact windows are invalidated
        for i in p1..p1 + 3 {
            assert!(corrected[i].is_nan());
        }
        for i in p2..p2 + 3 {
            assert!(corrected[i].is_nan());
        }
    }

    #[test]
    fn short_sweep_paired_pulse_yields_nan_not_panic() {
        let (measure, _) = measure_paired_pulse(&[0.0; 100], 1000.0);
        assert!(measure.peak1.is_nan());
        assert!(measure.ratio.is_nan());
    }

    #[test]
    fn every_routine_runs_on_a_small_recording() {
        let rate = 1000.0;
        let sweeps: Vec<Vec<f64>> = (0..4)
            .map(|s| (0..2600).map(|i| (i as f64 * 0.01).sin() * 20.0 - 60.0 + s as f64).collect())
            .collect();
        let rec = recording::synthetic("xxxx", sweeps, rate);
        let options = RenderOptions {
            save: false,
            show: false,
        };
        let mut unique: Vec<Routine> = ROUTES.iter().map(|(_, r)| *r).collect();
        unique.push(Routine::Unknown);
        unique.dedup();
        for routine in unique {
            let mut ctx = AnalysisContext::new(&options);
            let result = routine.run(&rec, &mut ctx);
            assert!(result.is_ok(), "{routine:?} failed: {result:?}");
        }
    }
}
