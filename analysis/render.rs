//! SVG rendering of aggregated series and their fitted curves.

use crate::types::FittedCurve;
use plotters::coord::ranged1d::{AsRangedCoord, ValueFormatter};
use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::Range;
use std::path::Path;
use thiserror::Error;

/// Colour cycle for categories; a category keeps its colour across scatter and line.
const PALETTE: [RGBColor; 6] = [
    RGBColor(31, 119, 180),
    RGBColor(214, 39, 40),
    RGBColor(44, 160, 44),
    RGBColor(255, 127, 14),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
];

/// Orders of magnitude the y values must span before `LogScale::Auto` switches to a log axis.
const AUTO_LOG_RATIO: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogScale {
    #[default]
    Auto,
    Always,
    Never,
}

/// Raw aggregate points for one category.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterSeries {
    pub label: String,
    pub points: Vec<(f64, f64)>,
}

/// Everything needed to draw one figure.
#[derive(Debug, Clone)]
pub struct PlotSpec {
    pub title: String,
    pub x_label: String,
    pub y_label: String,
    pub width: u32,
    pub height: u32,
    pub log_scale: LogScale,
    pub scatter: Vec<ScatterSeries>,
    pub curves: Vec<FittedCurve>,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("The figure '{0}' has no data points to draw.")]
    NoData(String),
    #[error("The figure '{0}' requests a logarithmic y axis but contains values <= 0.")]
    NonPositiveLogAxis(String),
    #[error("Failed to draw the figure: {0}")]
    Drawing(String),
    #[error("Failed to write the figure: {0}")]
    Io(#[from] std::io::Error),
}

impl PlotSpec {
    fn all_points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.scatter
            .iter()
            .flat_map(|s| s.points.iter().copied())
            .chain(self.curves.iter().flat_map(|c| c.points.iter().copied()))
    }

    fn color_of(&self, label: &str) -> RGBColor {
        let index = self
            .scatter
            .iter()
            .map(|s| s.label.as_str())
            .chain(self.curves.iter().map(|c| c.label.as_str()))
            .position(|l| l == label)
            .unwrap_or(0);
        PALETTE[index % PALETTE.len()]
    }

    /// Decides whether the y axis is logarithmic.
    pub fn uses_log_axis(&self) -> Result<bool, RenderError> {
        let (min, max) = self
            .all_points()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, y)| {
                (lo.min(y), hi.max(y))
            });
        match self.log_scale {
            LogScale::Never => Ok(false),
            LogScale::Always if min <= 0.0 => Err(RenderError::NonPositiveLogAxis(self.title.clone())),
            LogScale::Always => Ok(true),
            LogScale::Auto => Ok(min > 0.0 && max / min >= AUTO_LOG_RATIO),
        }
    }
}

fn padded(range: Range<f64>, log: bool) -> Range<f64> {
    if log {
        return (range.start / 1.5)..(range.end * 1.5);
    }
    let span = range.end - range.start;
    let pad = if span > 0.0 { span * 0.05 } else { 1.0 };
    (range.start - pad)..(range.end + pad)
}

/// Renders the figure and returns the SVG document.
pub fn render_svg(spec: &PlotSpec) -> Result<String, RenderError> {
    let mut points = spec.all_points().peekable();
    if points.peek().is_none() {
        return Err(RenderError::NoData(spec.title.clone()));
    }
    let (x_min, x_max, y_min, y_max) = points.fold(
        (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY),
        |(x0, x1, y0, y1), (x, y)| (x0.min(x), x1.max(x), y0.min(y), y1.max(y)),
    );

    let log_axis = spec.uses_log_axis()?;
    let x_range = padded(x_min..x_max, false);
    let y_range = padded(y_min..y_max, log_axis);

    let mut svg_data = String::new();
    {
        let root = SVGBackend::with_string(&mut svg_data, (spec.width, spec.height))
            .into_drawing_area();
        root.fill(&WHITE)
            .map_err(|e| RenderError::Drawing(e.to_string()))?;
        if log_axis {
            draw_chart(&root, spec, x_range, y_range.log_scale())?;
        } else {
            draw_chart(&root, spec, x_range, y_range)?;
        }
        root.present()
            .map_err(|e| RenderError::Drawing(e.to_string()))?;
    }
    Ok(svg_data)
}

/// Renders the figure and writes it to `path`.
pub fn write_svg(spec: &PlotSpec, path: &Path) -> Result<(), RenderError> {
    let svg = render_svg(spec)?;
    fs::write(path, svg)?;
    log::info!("Wrote figure '{}' to {}", spec.title, path.display());
    Ok(())
}

fn draw_chart<Y>(
    root: &DrawingArea<SVGBackend<'_>, plotters::coord::Shift>,
    spec: &PlotSpec,
    x_range: Range<f64>,
    y_range: Y,
) -> Result<(), RenderError>
where
    Y: AsRangedCoord<Value = f64>,
    Y::CoordDescType: ValueFormatter<f64>,
{
    let drawing = |e: DrawingAreaErrorKind<std::io::Error>| RenderError::Drawing(e.to_string());

    let mut chart = ChartBuilder::on(root)
        .caption(&spec.title, ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_range, y_range)
        .map_err(drawing)?;

    chart
        .configure_mesh()
        .x_desc(spec.x_label.as_str())
        .y_desc(spec.y_label.as_str())
        .draw()
        .map_err(drawing)?;

    for series in &spec.scatter {
        let color = spec.color_of(&series.label);
        chart
            .draw_series(
                series
                    .points
                    .iter()
                    .map(move |&point| Circle::new(point, 3, color.filled())),
            )
            .map_err(drawing)?
            .label(series.label.as_str())
            .legend(move |(x, y)| Circle::new((x, y), 4, color.filled()));
    }

    for curve in &spec.curves {
        let color = spec.color_of(&curve.label);
        chart
            .draw_series(LineSeries::new(
                curve.points.iter().copied(),
                color.stroke_width(2),
            ))
            .map_err(drawing)?;
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(drawing)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(log_scale: LogScale, ys: &[f64]) -> PlotSpec {
        PlotSpec {
            title: "Mean total cost by risk percentile".to_string(),
            x_label: "Percentile of algorithm risk score".to_string(),
            y_label: "Mean total medical expenditure".to_string(),
            width: 640,
            height: 480,
            log_scale,
            scatter: vec![ScatterSeries {
                label: "black".to_string(),
                points: ys
                    .iter()
                    .enumerate()
                    .map(|(i, &y)| (i as f64 * 10.0, y))
                    .collect(),
            }],
            curves: vec![FittedCurve {
                label: "black".to_string(),
                points: ys
                    .iter()
                    .enumerate()
                    .map(|(i, &y)| (i as f64 * 10.0, y * 1.1))
                    .collect(),
            }],
        }
    }

    #[test]
    fn auto_log_axis_requires_two_orders_of_magnitude() {
        assert!(spec(LogScale::Auto, &[10.0, 500.0, 20_000.0]).uses_log_axis().unwrap());
        assert!(!spec(LogScale::Auto, &[1.0, 2.0, 5.0]).uses_log_axis().unwrap());
        assert!(!spec(LogScale::Auto, &[0.0, 500.0]).uses_log_axis().unwrap());
        assert!(!spec(LogScale::Never, &[10.0, 20_000.0]).uses_log_axis().unwrap());
    }

    #[test]
    fn forced_log_axis_rejects_non_positive_values() {
        let err = spec(LogScale::Always, &[0.0, 3.0]).uses_log_axis().unwrap_err();
        assert!(matches!(err, RenderError::NonPositiveLogAxis(_)));
    }

    #[test]
    fn svg_contains_title_and_legend() {
        let svg = render_svg(&spec(LogScale::Auto, &[1000.0, 3000.0, 90_000.0])).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.contains("Mean total cost by risk percentile"));
        assert!(svg.contains("black"));
        assert!(svg.contains("<circle"));
        assert!(svg.contains("<polyline"));
    }

    #[test]
    fn linear_axis_renders_too() {
        let svg = render_svg(&spec(LogScale::Never, &[1.0, 2.0, 2.5])).unwrap();
        assert!(svg.contains("<circle"));
    }

    #[test]
    fn empty_figure_is_an_error() {
        let mut empty = spec(LogScale::Auto, &[]);
        empty.curves.clear();
        assert!(matches!(render_svg(&empty), Err(RenderError::NoData(_))));
    }

    #[test]
    fn write_svg_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cost.svg");
        write_svg(&spec(LogScale::Auto, &[1.0, 4.0]), &path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("</svg>"));
    }
}
