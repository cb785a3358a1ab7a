use chrono::{Datelike, NaiveDate};

use super::canvas::{Canvas, Color, LineStyle, TextAnchor, TextStyle};

/// Pixel rectangle the data is drawn into
#[derive(Debug, Clone, Copy)]
pub struct PlotArea {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl PlotArea {
    /// Plot area inside a canvas after subtracting margins (top, right, bottom, left)
    pub fn inset(width: f64, height: f64, margins: (f64, f64, f64, f64)) -> Self {
        let (top, right, bottom, left) = margins;
        Self {
            left,
            top,
            width: (width - left - right).max(1.0),
            height: (height - top - bottom).max(1.0),
        }
    }

    pub fn right(&self) -> f64 {
        self.left + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.top + self.height
    }
}

/// Linear value axis with "nice" ticks
#[derive(Debug, Clone)]
pub struct ValueAxis {
    pub min: f64,
    pub max: f64,
    pub ticks: Vec<f64>,
}

impl ValueAxis {
    /// Axis over `[0, max]` with ticks at nice steps not exceeding `max`
    pub fn from_zero(max: f64, target_ticks: usize) -> Self {
        let max = if max > 0.0 && max.is_finite() { max } else { 1.0 };
        let step = nice_step(max / (target_ticks.max(2) - 1) as f64);
        let mut ticks = Vec::new();
        let mut v = 0.0;
        while v <= max + step * 0.01 {
            ticks.push(v);
            v += step;
        }
        Self { min: 0.0, max, ticks }
    }

    pub fn to_pixel(&self, value: f64, area: &PlotArea) -> f64 {
        let frac = (value - self.min) / (self.max - self.min);
        area.bottom() - frac * area.height
    }
}

/// Date axis mapping days linearly onto the plot width
#[derive(Debug, Clone)]
pub struct DateAxis {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateAxis {
    /// Axis spanning `start..=end`, padded when the span is a single day
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        if start == end {
            let pad = chrono::Duration::days(31);
            return Self { start: start - pad, end: end + pad };
        }
        Self { start, end }
    }

    pub fn to_pixel(&self, date: NaiveDate, area: &PlotArea) -> f64 {
        let span = (self.end - self.start).num_days() as f64;
        let offset = (date - self.start).num_days() as f64;
        area.left + offset / span * area.width
    }

    /// January 1st of every year inside the axis
    pub fn year_ticks(&self) -> Vec<NaiveDate> {
        (self.start.year()..=self.end.year())
            .filter_map(|y| NaiveDate::from_ymd_opt(y, 1, 1))
            .filter(|d| *d >= self.start && *d <= self.end)
            .collect()
    }
}

pub(crate) fn nice_step(rough: f64) -> f64 {
    if rough <= 0.0 || !rough.is_finite() {
        return 1.0;
    }
    let exp = rough.log10().floor();
    let frac = rough / 10.0_f64.powf(exp);
    let nice_frac = if frac <= 1.5 {
        1.0
    } else if frac <= 3.5 {
        2.0
    } else if frac <= 7.5 {
        5.0
    } else {
        10.0
    };
    nice_frac * 10.0_f64.powf(exp)
}

/// Compact label with k / M / bn suffixes
pub fn format_si(value: f64) -> String {
    let abs = value.abs();
    let (scaled, suffix) = if abs >= 1e9 {
        (value / 1e9, "bn")
    } else if abs >= 1e6 {
        (value / 1e6, "M")
    } else if abs >= 1e3 {
        (value / 1e3, "k")
    } else {
        (value, "")
    };

    let mut text = if (scaled - scaled.round()).abs() < 1e-9 {
        format!("{}", scaled.round() as i64)
    } else if scaled.abs() >= 10.0 {
        format!("{:.1}", scaled)
    } else {
        format!("{:.2}", scaled)
    };
    if text.contains('.') {
        text = text.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{text}{suffix}")
}

/// Axis lines, gridlines, tick labels and titles shared by the line charts
pub(crate) fn draw_frame(
    canvas: &mut Canvas,
    area: &PlotArea,
    x: &DateAxis,
    y: &ValueAxis,
    title: &str,
    y_label: Option<&str>,
) {
    let axis = LineStyle::solid(Color::BLACK, 1.0);
    let grid = LineStyle::solid(Color::rgb(230, 230, 230), 0.5);
    let tick_label = TextStyle::sized(10.0, TextAnchor::End);

    for v in &y.ticks {
        let py = y.to_pixel(*v, area);
        canvas.line(area.left, py, area.right(), py, &grid);
        canvas.line(area.left - 4.0, py, area.left, py, &axis);
        canvas.text(area.left - 6.0, py + 3.5, &format_si(*v), &tick_label);
    }

    let year_label = TextStyle::sized(10.0, TextAnchor::Middle);
    for d in x.year_ticks() {
        let px = x.to_pixel(d, area);
        canvas.line(px, area.bottom(), px, area.bottom() + 4.0, &axis);
        canvas.text(px, area.bottom() + 16.0, &d.year().to_string(), &year_label);
    }

    canvas.line(area.left, area.bottom(), area.right(), area.bottom(), &axis);
    canvas.line(area.left, area.top, area.left, area.bottom(), &axis);

    let title_style = TextStyle { bold: true, ..TextStyle::sized(14.0, TextAnchor::Middle) };
    canvas.text(area.left + area.width / 2.0, area.top - 14.0, title, &title_style);

    if let Some(label) = y_label {
        let style = TextStyle::sized(11.0, TextAnchor::Middle);
        let lx = area.left - 52.0;
        let ly = area.top + area.height / 2.0;
        canvas.text_rotated(lx, ly, label, &style, -90.0);
    }
}
