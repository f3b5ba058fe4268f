//! Figure construction and persistence.
//!
//! A [`Figure`] is an owned, retained scene: a grid of [`Panel`]s holding
//! traces, shaded spans, marker lines, filled bands and inline notes. The
//! scene is rasterized afresh on every [`frame_and_save`] call, so a handler
//! can persist a figure, change a panel's axis limits, and persist it again
//! under a new tag before the scene finally drops.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use log::{debug, error, info, warn};
use plotters::chart::SeriesLabelPosition;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::series::DashedLineSeries;
use plotters::style::text_anchor::{HPos, Pos, VPos};

use crate::analysis::error::AnalysisError;
use crate::analysis::recording::Recording;

/// Reference edge length (pixels) for square diagnostic figures.
pub const SQUARE: u32 = 1100;

// pixel rows reserved for the provenance annotations
const ANNOTATION_TOP_PX: i32 = 26;
const ANNOTATION_BOTTOM_PX: i32 = 22;

/// Save/show switches, set once per run and threaded through every render
/// call; never mutated mid-batch.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub save: bool,
    pub show: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            save: true,
            show: false,
        }
    }
}

/// Artifact category encoded in the output filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    /// Per-recording raw views.
    Plot,
    /// Time-course / experiment summaries.
    Experiment,
}

impl DataType {
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Plot => "plot",
            DataType::Experiment => "experiment",
        }
    }
}

/// `<dataTypeTag>_<tag lowercased, spaces -> underscores>.jpg`
pub fn artifact_filename(tag: &str, data_type: DataType) -> String {
    format!(
        "{}_{}.jpg",
        data_type.as_str(),
        tag.to_lowercase().replace(' ', "_")
    )
}

/// Sweep trace styling: solid color or position-in-recording rainbow.
#[derive(Debug, Clone, Copy)]
pub struct SweepStyle {
    pub color: RGBColor,
    pub alpha: f64,
    pub width: u32,
    pub rainbow: bool,
}

impl Default for SweepStyle {
    fn default() -> Self {
        Self {
            color: BLUE,
            alpha: 0.8,
            width: 1,
            rainbow: true,
        }
    }
}

impl SweepStyle {
    pub fn solid(color: RGBColor) -> Self {
        Self {
            color,
            rainbow: false,
            ..Self::default()
        }
    }

    pub fn sweep_color(&self, index: usize, count: usize) -> RGBColor {
        if self.rainbow && count > 1 {
            rainbow_color(index as f64 / count as f64)
        } else {
            self.color
        }
    }
}

/// Map a `[0, 1]` fraction onto a perceptible hue sweep.
pub fn rainbow_color(fraction: f64) -> RGBColor {
    let RGBAColor(r, g, b, _) =
        HSLColor(0.83 * fraction.clamp(0.0, 1.0), 0.65, 0.42).to_rgba();
    RGBColor(r, g, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Line,
    /// Filled dots of the given pixel radius.
    Dots(u32),
    /// Line through the points plus dots.
    LineDots(u32),
}

/// One numeric series within a panel. NaN samples split the drawn line.
#[derive(Debug, Clone)]
pub struct Trace {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    pub color: RGBColor,
    pub alpha: f64,
    pub width: u32,
    pub kind: TraceKind,
    pub label: Option<String>,
}

impl Trace {
    pub fn line(xs: Vec<f64>, ys: Vec<f64>, color: RGBColor) -> Self {
        Self {
            xs,
            ys,
            color,
            alpha: 1.0,
            width: 1,
            kind: TraceKind::Line,
            label: None,
        }
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    pub fn kind(mut self, kind: TraceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Vertical or horizontal reference line across the whole panel.
#[derive(Debug, Clone)]
pub struct MarkerLine {
    pub vertical: bool,
    pub at: f64,
    pub color: RGBColor,
    pub alpha: f64,
    pub width: u32,
    pub dashed: bool,
    pub label: Option<String>,
}

impl MarkerLine {
    pub fn vertical(at: f64, color: RGBColor) -> Self {
        Self {
            vertical: true,
            at,
            color,
            alpha: 0.5,
            width: 2,
            dashed: true,
            label: None,
        }
    }

    pub fn horizontal(at: f64, color: RGBColor) -> Self {
        Self {
            vertical: false,
            ..Self::vertical(at, color)
        }
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn width(mut self, width: u32) -> Self {
        self.width = width;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Shaded region spanning the panel in one direction.
#[derive(Debug, Clone)]
pub struct Span {
    pub vertical: bool,
    pub from: f64,
    pub to: f64,
    pub color: RGBColor,
    pub alpha: f64,
    pub label: Option<String>,
}

impl Span {
    pub fn vertical(from: f64, to: f64, color: RGBColor) -> Self {
        Self {
            vertical: true,
            from,
            to,
            color,
            alpha: 0.1,
            label: None,
        }
    }

    pub fn horizontal(from: f64, to: f64, color: RGBColor) -> Self {
        Self {
            vertical: false,
            ..Self::vertical(from, to, color)
        }
    }

    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Filled `lo..hi` band along `xs` (e.g. a +/- 1 SD envelope).
#[derive(Debug, Clone)]
pub struct Band {
    pub xs: Vec<f64>,
    pub lo: Vec<f64>,
    pub hi: Vec<f64>,
    pub color: RGBColor,
    pub alpha: f64,
}

/// Monospaced text block anchored at a fraction of the panel area
/// (`0,0` = top left).
#[derive(Debug, Clone)]
pub struct Note {
    pub x_frac: f64,
    pub y_frac: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Legend {
    UpperLeft,
    UpperRight,
}

/// One axes rectangle of a figure.
#[derive(Debug, Clone, Default)]
pub struct Panel {
    pub title: Option<String>,
    pub x_label: Option<String>,
    pub y_label: Option<String>,
    pub traces: Vec<Trace>,
    pub bands: Vec<Band>,
    pub lines: Vec<MarkerLine>,
    pub spans: Vec<Span>,
    pub notes: Vec<Note>,
    pub x_limits: (Option<f64>, Option<f64>),
    pub y_limits: (Option<f64>, Option<f64>),
    /// Fractional padding applied to the auto-computed data ranges.
    pub margins: (f64, f64),
    pub hide_y_axis: bool,
    pub background: Option<RGBColor>,
    pub legend: Option<Legend>,
}

impl Panel {
    pub fn new() -> Self {
        Self {
            margins: (0.0, 0.1),
            ..Self::default()
        }
    }

    pub fn set_xlim(&mut self, lo: Option<f64>, hi: Option<f64>) {
        self.x_limits = (lo, hi);
    }

    pub fn set_ylim(&mut self, lo: Option<f64>, hi: Option<f64>) {
        self.y_limits = (lo, hi);
    }

    fn x_range(&self) -> (f64, f64) {
        let data = self
            .traces
            .iter()
            .flat_map(|t| t.xs.iter())
            .chain(self.bands.iter().flat_map(|b| b.xs.iter()))
            .copied();
        let auto = padded_range(data, self.margins.0);
        resolve_range(auto, self.x_limits)
    }

    fn y_range(&self) -> (f64, f64) {
        let data = self
            .traces
            .iter()
            .flat_map(|t| t.ys.iter())
            .chain(self.bands.iter().flat_map(|b| b.lo.iter()))
            .chain(self.bands.iter().flat_map(|b| b.hi.iter()))
            .copied();
        let auto = padded_range(data, self.margins.1);
        resolve_range(auto, self.y_limits)
    }

    fn render<DB: DrawingBackend>(
        &self,
        area: &DrawingArea<DB, Shift>,
    ) -> Result<(), AnalysisError>
    where
        DB::ErrorType: 'static,
    {
        if let Some(bg) = self.background {
            area.fill(&bg)?;
        }
        let (x_min, x_max) = self.x_range();
        let (y_min, y_max) = self.y_range();

        let mut builder = ChartBuilder::on(area);
        builder
            .margin(8)
            .set_label_area_size(
                LabelAreaPosition::Left,
                if self.hide_y_axis { 10 } else { 55 },
            )
            .set_label_area_size(LabelAreaPosition::Bottom, 34);
        if let Some(title) = &self.title {
            builder.caption(
                title.as_str(),
                ("sans-serif", 15).into_font().color(&BLACK.mix(0.8)),
            );
        }
        let mut chart = builder.build_cartesian_2d(x_min..x_max, y_min..y_max)?;

        {
            let mut mesh = chart.configure_mesh();
            mesh.light_line_style(&BLACK.mix(0.08))
                .bold_line_style(&BLACK.mix(0.15))
                .label_style(("sans-serif", 12));
            if let Some(label) = &self.x_label {
                mesh.x_desc(label.as_str());
            }
            if let Some(label) = &self.y_label {
                mesh.y_desc(label.as_str());
            }
            if self.hide_y_axis {
                mesh.y_labels(0);
            }
            mesh.draw()?;
        }

        for span in &self.spans {
            let corners = if span.vertical {
                [(span.from, y_min), (span.to, y_max)]
            } else {
                [(x_min, span.from), (x_max, span.to)]
            };
            let style = span.color.mix(span.alpha).filled();
            let anno =
                chart.draw_series(std::iter::once(Rectangle::new(corners, style)))?;
            if let Some(label) = &span.label {
                let color = span.color.mix(span.alpha.max(0.3));
                anno.label(label.as_str()).legend(move |(x, y)| {
                    Rectangle::new([(x, y - 4), (x + 16, y + 4)], color.filled())
                });
            }
        }

        for band in &self.bands {
            let lower: Vec<(f64, f64)> = band
                .xs
                .iter()
                .zip(&band.lo)
                .filter(|(x, y)| x.is_finite() && y.is_finite())
                .map(|(x, y)| (*x, *y))
                .collect();
            let mut polygon = lower;
            let upper: Vec<(f64, f64)> = band
                .xs
                .iter()
                .zip(&band.hi)
                .filter(|(x, y)| x.is_finite() && y.is_finite())
                .map(|(x, y)| (*x, *y))
                .rev()
                .collect();
            polygon.extend(upper);
            if polygon.len() >= 3 {
                chart.draw_series(std::iter::once(Polygon::new(
                    polygon,
                    band.color.mix(band.alpha).filled(),
                )))?;
            }
        }

        for trace in &self.traces {
            let mut labeled = false;
            let color = trace.color;
            let alpha = trace.alpha;
            if matches!(trace.kind, TraceKind::Line | TraceKind::LineDots(_)) {
                for segment in finite_segments(&trace.xs, &trace.ys) {
                    if segment.len() < 2 {
                        continue;
                    }
                    let style = trace.color.mix(trace.alpha).stroke_width(trace.width);
                    let anno = chart.draw_series(LineSeries::new(segment, style))?;
                    if !labeled {
                        if let Some(label) = &trace.label {
                            labeled = true;
                            anno.label(label.as_str()).legend(move |(x, y)| {
                                PathElement::new(
                                    vec![(x, y), (x + 16, y)],
                                    color.mix(alpha).stroke_width(2),
                                )
                            });
                        }
                    }
                }
            }
            if let TraceKind::Dots(radius) | TraceKind::LineDots(radius) = trace.kind {
                let dots = trace
                    .xs
                    .iter()
                    .zip(&trace.ys)
                    .filter(|(x, y)| x.is_finite() && y.is_finite())
                    .map(|(x, y)| {
                        Circle::new((*x, *y), radius, trace.color.mix(trace.alpha).filled())
                    });
                let anno = chart.draw_series(dots)?;
                if !labeled {
                    if let Some(label) = &trace.label {
                        anno.label(label.as_str()).legend(move |(x, y)| {
                            Circle::new((x + 8, y), 4, color.mix(alpha).filled())
                        });
                    }
                }
            }
        }

        for line in &self.lines {
            let points = if line.vertical {
                vec![(line.at, y_min), (line.at, y_max)]
            } else {
                vec![(x_min, line.at), (x_max, line.at)]
            };
            let style = line.color.mix(line.alpha).stroke_width(line.width);
            let anno = if line.dashed {
                chart.draw_series(DashedLineSeries::new(points, 6, 4, style))?
            } else {
                chart.draw_series(LineSeries::new(points, style))?
            };
            if let Some(label) = &line.label {
                let color = line.color.mix(line.alpha);
                let width = line.width;
                anno.label(label.as_str()).legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 16, y)], color.stroke_width(width))
                });
            }
        }

        for note in &self.notes {
            let (w, h) = area.dim_in_pixel();
            let x = (note.x_frac * w as f64) as i32;
            let mut y = (note.y_frac * h as f64) as i32;
            let style = ("monospace", 11).into_font().color(&BLACK.mix(0.8));
            for line in note.text.lines() {
                area.draw(&Text::new(line.to_string(), (x, y), style.clone()))?;
                y += 13;
            }
        }

        if let Some(position) = self.legend {
            chart
                .configure_series_labels()
                .position(match position {
                    Legend::UpperLeft => SeriesLabelPosition::UpperLeft,
                    Legend::UpperRight => SeriesLabelPosition::UpperRight,
                })
                .border_style(&BLACK.mix(0.3))
                .background_style(&WHITE.mix(0.85))
                .label_font(("sans-serif", 12))
                .draw()?;
        }
        Ok(())
    }
}

/// Owned multi-panel figure scene (row-major panel order).
#[derive(Debug, Clone)]
pub struct Figure {
    width: u32,
    height: u32,
    rows: usize,
    cols: usize,
    pub panels: Vec<Panel>,
}

impl Figure {
    pub fn grid(rows: usize, cols: usize, width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            rows,
            cols,
            panels: (0..rows * cols).map(|_| Panel::new()).collect(),
        }
    }

    pub fn single(width: u32, height: u32) -> Self {
        Self::grid(1, 1, width, height)
    }

    pub fn panel_mut(&mut self, index: usize) -> &mut Panel {
        &mut self.panels[index]
    }

    /// Rasterize the scene to a `width * height * 3` RGB buffer, with the
    /// provenance annotations in the reserved top/bottom margins.
    pub fn render_rgb(&self, header: &str, footer: &str) -> Result<Vec<u8>, AnalysisError> {
        let mut buffer = vec![0u8; (self.width * self.height * 3) as usize];
        {
            let root = BitMapBackend::with_buffer(&mut buffer, (self.width, self.height))
                .into_drawing_area();
            root.fill(&WHITE)?;
            let corner = ("monospace", 12).into_font().color(&BLACK.mix(0.5));
            root.draw(&Text::new(
                header.to_string(),
                (8, 4),
                corner.clone().pos(Pos::new(HPos::Left, VPos::Top)),
            ))?;
            root.draw(&Text::new(
                footer.to_string(),
                (8, self.height as i32 - 4),
                corner.pos(Pos::new(HPos::Left, VPos::Bottom)),
            ))?;
            let panel_zone = root.margin(ANNOTATION_TOP_PX, ANNOTATION_BOTTOM_PX, 4, 4);
            let areas = panel_zone.split_evenly((self.rows, self.cols));
            for (panel, area) in self.panels.iter().zip(areas.iter()) {
                panel.render(area)?;
            }
            root.present()?;
        }
        Ok(buffer)
    }

    pub fn encode_jpeg(&self, header: &str, footer: &str) -> Result<Vec<u8>, AnalysisError> {
        let buffer = self.render_rgb(header, footer)?;
        let img = ImageBuffer::<Rgb<u8>, _>::from_raw(self.width, self.height, buffer)
            .ok_or_else(|| AnalysisError::Plot("failed to allocate image buffer".into()))?;
        let mut output = Vec::new();
        DynamicImage::ImageRgb8(img).write_to(&mut Cursor::new(&mut output), ImageFormat::Jpeg)?;
        Ok(output)
    }
}

/// Frame the figure with provenance annotations and commit it.
///
/// `keep_open` signals that the caller will keep mutating and re-persisting
/// the same scene, so interactive display is skipped for this call. Save
/// failures are logged and absorbed; the enclosing handler and batch
/// continue. Returns the written path when a file was persisted.
pub fn frame_and_save(
    figure: &Figure,
    recording: &Recording,
    tag: &str,
    data_type: DataType,
    options: &RenderOptions,
    explicit_path: Option<&Path>,
    keep_open: bool,
) -> Option<PathBuf> {
    let footer = format!("{} [{}]", recording.id, recording.protocol);
    let filename = artifact_filename(tag, data_type);
    if !options.save && !options.show {
        debug!("save and show disabled; dropping [{filename}]");
        return None;
    }
    let jpeg = match figure.encode_jpeg(tag, &footer) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("rendering [{filename}] failed: {e}");
            return None;
        }
    };

    let mut saved = None;
    if options.save {
        let target = match explicit_path {
            Some(path) => path.to_path_buf(),
            None => recording.output_dir().join(&filename),
        };
        info!("saving [{filename}]");
        match persist(&target, &jpeg) {
            Ok(()) => saved = Some(target),
            Err(e) => error!(
                "saving [{filename}] failed ({e}); is the output location writable?"
            ),
        }
    }
    if options.show {
        if keep_open {
            debug!("not showing [{filename}]; figure is still open for annotation");
        } else {
            let path = match &saved {
                Some(path) => path.clone(),
                None => {
                    let fallback = std::env::temp_dir().join(&filename);
                    if let Err(e) = persist(&fallback, &jpeg) {
                        warn!("could not stage [{filename}] for display: {e}");
                        return saved;
                    }
                    fallback
                }
            };
            info!("showing [{filename}]");
            if let Err(e) = open::that(&path) {
                warn!("could not open [{}]: {e}", path.display());
            }
        }
    }
    saved
}

fn persist(target: &Path, bytes: &[u8]) -> Result<(), AnalysisError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(target, bytes)?;
    Ok(())
}

/// Every sweep overlaid on a shared within-sweep time axis, optionally
/// offset per sweep in either direction.
pub fn add_sweep_overlay(
    panel: &mut Panel,
    recording: &Recording,
    style: &SweepStyle,
    offset_x: f64,
    offset_y: f64,
) {
    let count = recording.sweep_count();
    for sweep in recording.sweeps() {
        let shift = sweep.index as f64;
        let xs: Vec<f64> = sweep.times().iter().map(|t| t + shift * offset_x).collect();
        let ys: Vec<f64> = sweep.ys.iter().map(|y| y + shift * offset_y).collect();
        panel.traces.push(
            Trace::line(xs, ys, style.sweep_color(sweep.index, count))
                .alpha(style.alpha)
                .width(style.width),
        );
    }
    if offset_x != 0.0 {
        panel.margins.0 = 0.05;
    }
    decorate(panel, recording);
}

/// Every sweep plotted against chronological (absolute) time.
pub fn add_chronological(
    panel: &mut Panel,
    recording: &Recording,
    style: &SweepStyle,
    use_derivative: bool,
) {
    let count = recording.sweep_count();
    for sweep in recording.sweeps() {
        let ys = if use_derivative {
            sweep.derivative()
        } else {
            sweep.ys.to_vec()
        };
        panel.traces.push(
            Trace::line(sweep.times_absolute(), ys, style.sweep_color(sweep.index, count))
                .alpha(style.alpha)
                .width(style.width),
        );
    }
    decorate(panel, recording);
}

/// One sweep on its within-sweep time axis.
pub fn add_single_sweep(
    panel: &mut Panel,
    recording: &Recording,
    index: usize,
    style: &SweepStyle,
) {
    if let Ok(sweep) = recording.sweep(index) {
        panel.traces.push(
            Trace::line(sweep.times(), sweep.ys.to_vec(), style.color)
                .alpha(style.alpha)
                .width(style.width),
        );
    }
    decorate(panel, recording);
}

/// Dotted comment markers, optionally labeled with the comment tags.
pub fn add_comment_markers(
    panel: &mut Panel,
    recording: &Recording,
    minutes: bool,
    labeled: bool,
) {
    for comment in &recording.comments {
        let at = if minutes {
            comment.time_s / 60.0
        } else {
            comment.time_s
        };
        let mut line = MarkerLine::vertical(at, RED).alpha(0.5).width(2);
        if labeled {
            line = line.label(comment.tag.as_str());
        }
        panel.lines.push(line);
    }
}

fn decorate(panel: &mut Panel, recording: &Recording) {
    if panel.x_label.is_none() {
        panel.x_label = Some("seconds".to_string());
    }
    if panel.y_label.is_none() {
        panel.y_label = Some(recording.units_y.clone());
    }
}

/// Split a series at NaN samples into finite polyline segments.
fn finite_segments(xs: &[f64], ys: &[f64]) -> Vec<Vec<(f64, f64)>> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    for (x, y) in xs.iter().zip(ys) {
        if x.is_finite() && y.is_finite() {
            current.push((*x, *y));
        } else if !current.is_empty() {
            segments.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

fn padded_range(data: impl Iterator<Item = f64>, margin: f64) -> (f64, f64) {
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for v in data.filter(|v| v.is_finite()) {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if lo > hi {
        return (0.0, 1.0);
    }
    let pad = (hi - lo) * margin;
    (lo - pad, hi + pad)
}

fn resolve_range(auto: (f64, f64), limits: (Option<f64>, Option<f64>)) -> (f64, f64) {
    let lo = limits.0.unwrap_or(auto.0);
    let hi = limits.1.unwrap_or(auto.1);
    if hi > lo {
        (lo, hi)
    } else {
        (lo, lo + 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::recording;

    #[test]
    fn filename_is_deterministic() {
        assert_eq!(artifact_filename("Fast IV", DataType::Plot), "plot_fast_iv.jpg");
        assert_eq!(
            artifact_filename("sweep vs average", DataType::Experiment),
            "experiment_sweep_vs_average.jpg"
        );
    }

    #[test]
    fn figure_renders_and_encodes() {
        let mut fig = Figure::grid(1, 2, 400, 220);
        let panel = fig.panel_mut(0);
        panel.traces.push(Trace::line(
            vec![0.0, 1.0, f64::NAN, 2.0, 3.0],
            vec![0.0, 1.0, f64::NAN, -1.0, 2.0],
            BLUE,
        ));
        panel.spans.push(Span::vertical(0.5, 1.5, RED));
        panel.lines.push(MarkerLine::horizontal(0.0, BLACK));
        let jpeg = fig.encode_jpeg("header", "footer").unwrap();
        assert!(!jpeg.is_empty());
    }

    #[test]
    fn empty_panels_render_without_data() {
        let fig = Figure::grid(2, 2, 300, 300);
        assert!(fig.encode_jpeg("t", "b").is_ok());
    }

    #[test]
    fn finite_segments_split_on_nan() {
        let xs = vec![0.0, 1.0, 2.0, 3.0, 4.0];
        let ys = vec![1.0, f64::NAN, 2.0, 3.0, f64::NAN];
        let segments = finite_segments(&xs, &ys);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], vec![(0.0, 1.0)]);
        assert_eq!(segments[1], vec![(2.0, 2.0), (3.0, 3.0)]);
    }

    #[test]
    fn limits_override_auto_range() {
        let mut panel = Panel::new();
        panel.traces.push(Trace::line(
            vec![0.0, 10.0],
            vec![-5.0, 5.0],
            BLUE,
        ));
        panel.set_xlim(Some(2.0), Some(4.0));
        assert_eq!(panel.x_range(), (2.0, 4.0));
        // y stays auto-scaled to the full data (zoom keeps amplitude context)
        let (y_lo, y_hi) = panel.y_range();
        assert!(y_lo < -5.0 && y_hi > 5.0);
    }

    #[test]
    fn save_disabled_returns_no_path() {
        let rec = recording::synthetic("0201", vec![vec![0.0; 10]], 1000.0);
        let fig = Figure::single(200, 150);
        let options = RenderOptions {
            save: false,
            show: false,
        };
        let saved = frame_and_save(&fig, &rec, "membrane test", DataType::Plot, &options, None, false);
        assert!(saved.is_none());
    }

    #[test]
    fn save_failure_is_absorbed() {
        let dir = tempfile::tempdir().unwrap();
        // a file where a directory is needed makes the target non-creatable
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"x").unwrap();
        let rec = recording::synthetic("0201", vec![vec![0.0; 10]], 1000.0);
        let fig = Figure::single(200, 150);
        let options = RenderOptions::default();
        let target = blocker.join("deeper").join("figure.jpg");
        let saved = frame_and_save(
            &fig,
            &rec,
            "membrane test",
            DataType::Plot,
            &options,
            Some(&target),
            false,
        );
        assert!(saved.is_none());
    }

    #[test]
    fn rainbow_endpoints_differ() {
        assert_ne!(rainbow_color(0.0), rainbow_color(0.9));
        let style = SweepStyle::default();
        assert_ne!(style.sweep_color(0, 10), style.sweep_color(9, 10));
        let solid = SweepStyle::solid(RED);
        assert_eq!(solid.sweep_color(0, 10), solid.sweep_color(9, 10));
    }
}
