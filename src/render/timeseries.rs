use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::axes::{draw_frame, DateAxis, PlotArea, ValueAxis};
use super::canvas::{save_svg, Canvas, Color, LineStyle, TextAnchor, TextStyle};
use super::{CHANGE_MARKER_CLASS, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::data_types::TimeSeries;
use crate::error::RenderFormat;
use crate::{ReclassError, Result};

const MARGINS: (f64, f64, f64, f64) = (40.0, 24.0, 40.0, 72.0);

/// Monthly line chart annotated with a legislation change date
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesChart {
    pub title: String,
    pub change_date: NaiveDate,
    /// Upper bound of the y axis; values above it are clipped
    pub y_max: Option<f64>,
    pub y_label: Option<String>,
    pub width: f64,
    pub height: f64,
}

impl TimeSeriesChart {
    pub fn new(title: impl Into<String>, change_date: NaiveDate) -> Self {
        Self {
            title: title.into(),
            change_date,
            y_max: None,
            y_label: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }

    pub fn with_y_max(mut self, y_max: Option<f64>) -> Self {
        self.y_max = y_max;
        self
    }

    pub fn with_y_label(mut self, label: impl Into<String>) -> Self {
        self.y_label = Some(label.into());
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Render the series to an SVG document
    pub fn render(&self, series: &TimeSeries) -> Result<String> {
        if let Some(y_max) = self.y_max {
            if !(y_max > 0.0 && y_max.is_finite()) {
                return Err(ReclassError::Render {
                    message: format!("y_max must be positive, got {}", y_max),
                    format: RenderFormat::TimeSeries,
                });
            }
        }

        let mut canvas = Canvas::new(self.width, self.height);
        let area = PlotArea::inset(self.width, self.height, MARGINS);

        let (first, last) = match (series.first_month(), series.last_month()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(placeholder(&mut canvas, &area, &self.title)),
        };

        let x = DateAxis::new(first.min(self.change_date), last.max(self.change_date));
        let top = self
            .y_max
            .unwrap_or_else(|| series.max_value().unwrap_or(0.0) * 1.05);
        let y = ValueAxis::from_zero(top, 5);

        draw_frame(&mut canvas, &area, &x, &y, &self.title, self.y_label.as_deref());

        let points: Vec<(f64, f64)> = series
            .points
            .iter()
            .map(|(d, v)| (x.to_pixel(*d, &area), y.to_pixel(*v, &area)))
            .collect();
        canvas.push_clip(area.left, area.top, area.width, area.height);
        canvas.polyline(&points, &LineStyle::solid(Color::hex("#1f77b4"), 1.5), Some("series"));
        canvas.pop_clip();

        let cx = x.to_pixel(self.change_date, &area);
        canvas.line_with_class(
            cx,
            area.top,
            cx,
            area.bottom(),
            &LineStyle::dashed(Color::BLACK, 2.0),
            CHANGE_MARKER_CLASS,
        );

        Ok(canvas.finish_svg())
    }

    /// Render and write to `path`
    pub fn save(&self, series: &TimeSeries, path: &Path) -> Result<()> {
        let svg = self.render(series)?;
        save_svg(&svg, path)
    }
}

fn placeholder(canvas: &mut Canvas, area: &PlotArea, title: &str) -> String {
    let title_style = TextStyle { bold: true, ..TextStyle::sized(14.0, TextAnchor::Middle) };
    canvas.text(area.left + area.width / 2.0, area.top - 14.0, title, &title_style);
    canvas.text(
        area.left + area.width / 2.0,
        area.top + area.height / 2.0,
        "No data",
        &TextStyle::sized(12.0, TextAnchor::Middle),
    );
    canvas.finish_svg()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn series() -> TimeSeries {
        TimeSeries::new(vec![
            (date(2018, 1), 20_000_000.0),
            (date(2019, 4), 25_000_000.0),
            (date(2020, 6), 40_000_000.0),
        ])
    }

    fn marker_x(svg: &str) -> f64 {
        let line = svg
            .lines()
            .find(|l| l.contains(CHANGE_MARKER_CLASS))
            .expect("change marker present");
        let start = line.find("x1=\"").unwrap() + 4;
        let end = start + line[start..].find('"').unwrap();
        line[start..end].parse().unwrap()
    }

    #[test]
    fn test_change_marker_is_dashed_at_change_date() {
        let chart = TimeSeriesChart::new("Gabapentinoids", date(2019, 4));
        let svg = chart.render(&series()).unwrap();

        let marker = svg.lines().find(|l| l.contains(CHANGE_MARKER_CLASS)).unwrap();
        assert!(marker.contains("stroke-dasharray"));
        assert!(marker.contains("stroke=\"#000000\""));
        assert!(marker.contains("stroke-width=\"2.00\""));

        let area = PlotArea::inset(chart.width, chart.height, MARGINS);
        let axis = DateAxis::new(date(2018, 1), date(2020, 6));
        let expected = axis.to_pixel(date(2019, 4), &area);
        assert!((marker_x(&svg) - expected).abs() < 0.01);
    }

    #[test]
    fn test_y_max_clips_series() {
        let chart = TimeSeriesChart::new("Gabapentinoids", date(2019, 4)).with_y_max(Some(30_000_000.0));
        let svg = chart.render(&series()).unwrap();
        let polyline = svg.lines().find(|l| l.contains("<polyline")).unwrap();
        assert!(polyline.contains("clip-path=\"url(#clip0)\""));
        assert!(svg.contains(">30M</text>"));
    }

    #[test]
    fn test_axis_extends_to_change_date() {
        let late_change = date(2022, 1);
        let chart = TimeSeriesChart::new("Tramadol", late_change);
        let svg = chart.render(&series()).unwrap();
        let area = PlotArea::inset(chart.width, chart.height, MARGINS);
        assert!((marker_x(&svg) - area.right()).abs() < 0.01);
    }

    #[test]
    fn test_empty_series_renders_placeholder() {
        let chart = TimeSeriesChart::new("Empty", date(2014, 6));
        let svg = chart.render(&TimeSeries::default()).unwrap();
        assert!(svg.contains("No data"));
        assert!(!svg.contains(CHANGE_MARKER_CLASS));
    }

    #[test]
    fn test_invalid_y_max_rejected() {
        let chart = TimeSeriesChart::new("Bad", date(2014, 6)).with_y_max(Some(0.0));
        assert!(matches!(chart.render(&series()), Err(ReclassError::Render { .. })));
    }
}
