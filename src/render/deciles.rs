use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::axes::{draw_frame, DateAxis, PlotArea, ValueAxis};
use super::canvas::{save_svg, Canvas, Color, LineStyle, TextAnchor, TextStyle};
use super::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::data_types::TimeSeries;
use crate::error::RenderFormat;
use crate::{ReclassError, Result};

const MARGINS: (f64, f64, f64, f64) = (40.0, 150.0, 40.0, 72.0);

/// Per-month percentile bands with an optional highlighted region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecileChart {
    pub title: String,
    pub show_outer_percentiles: bool,
    pub y_label: Option<String>,
    pub width: f64,
    pub height: f64,
}

impl DecileChart {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            show_outer_percentiles: false,
            y_label: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }

    pub fn with_outer_percentiles(mut self, show: bool) -> Self {
        self.show_outer_percentiles = show;
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

    /// Render percentile series keyed by rank, plus an optional `(label, series)` highlight
    pub fn render(
        &self,
        percentiles: &BTreeMap<u32, TimeSeries>,
        highlight: Option<(&str, &TimeSeries)>,
    ) -> Result<String> {
        let visible: Vec<(u32, &TimeSeries)> = percentiles
            .iter()
            .filter(|(rank, s)| !s.is_empty() && (self.show_outer_percentiles || is_decile(**rank)))
            .map(|(rank, s)| (*rank, s))
            .collect();

        if visible.is_empty() {
            return Err(ReclassError::Render {
                message: "No percentile series to draw".to_string(),
                format: RenderFormat::Deciles,
            });
        }

        let all_points = visible
            .iter()
            .flat_map(|(_, s)| s.points.iter())
            .chain(highlight.iter().flat_map(|(_, s)| s.points.iter()));
        let mut first = None;
        let mut last = None;
        let mut max = 0.0_f64;
        for (d, v) in all_points {
            first = Some(first.map_or(*d, |f: chrono::NaiveDate| f.min(*d)));
            last = Some(last.map_or(*d, |l: chrono::NaiveDate| l.max(*d)));
            max = max.max(*v);
        }
        let (Some(first), Some(last)) = (first, last) else {
            return Err(ReclassError::Render {
                message: "Percentile series have no points".to_string(),
                format: RenderFormat::Deciles,
            });
        };

        let mut canvas = Canvas::new(self.width, self.height);
        let area = PlotArea::inset(self.width, self.height, MARGINS);
        let x = DateAxis::new(first, last);
        let y = ValueAxis::from_zero(max * 1.05, 5);
        draw_frame(&mut canvas, &area, &x, &y, &self.title, self.y_label.as_deref());

        let project = |s: &TimeSeries| -> Vec<(f64, f64)> {
            s.points
                .iter()
                .map(|(d, v)| (x.to_pixel(*d, &area), y.to_pixel(*v, &area)))
                .collect()
        };

        let blue = Color::hex("#1f77b4");
        canvas.push_clip(area.left, area.top, area.width, area.height);
        for (rank, series) in &visible {
            let style = percentile_style(*rank, blue);
            canvas.polyline(&project(series), &style, Some(&format!("p{rank}")));
        }
        if let Some((_, series)) = highlight {
            canvas.polyline(
                &project(series),
                &LineStyle::dashed(Color::hex("#d62728"), 2.0),
                Some("highlight"),
            );
        }
        canvas.pop_clip();

        let mut legend = vec![
            ("Decile".to_string(), LineStyle::solid(blue, 1.0)),
            ("Median".to_string(), LineStyle::dashed(blue, 2.0)),
        ];
        if self.show_outer_percentiles {
            legend.push(("1st-9th, 91st-99th".to_string(), LineStyle::dotted(blue, 0.8)));
        }
        if let Some((label, _)) = highlight {
            legend.push((label.to_string(), LineStyle::dashed(Color::hex("#d62728"), 2.0)));
        }
        draw_legend(&mut canvas, &area, &legend);

        Ok(canvas.finish_svg())
    }

    /// Render and write to `path`
    pub fn save(
        &self,
        percentiles: &BTreeMap<u32, TimeSeries>,
        highlight: Option<(&str, &TimeSeries)>,
        path: &Path,
    ) -> Result<()> {
        let svg = self.render(percentiles, highlight)?;
        save_svg(&svg, path)
    }
}

fn is_decile(rank: u32) -> bool {
    rank % 10 == 0 && (10..=90).contains(&rank)
}

fn percentile_style(rank: u32, color: Color) -> LineStyle {
    if rank == 50 {
        LineStyle::dashed(color, 2.0)
    } else if is_decile(rank) {
        LineStyle::solid(color, 1.0)
    } else {
        LineStyle::dotted(color, 0.8)
    }
}

fn draw_legend(canvas: &mut Canvas, area: &PlotArea, entries: &[(String, LineStyle)]) {
    let lx = area.right() + 14.0;
    let label = TextStyle::sized(10.0, TextAnchor::Start);
    for (i, (text, style)) in entries.iter().enumerate() {
        let ly = area.top + 10.0 + i as f64 * 16.0;
        canvas.line(lx, ly, lx + 20.0, ly, style);
        canvas.text(lx + 26.0, ly + 3.5, text, &label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{outer_percentiles, DECILES};
    use chrono::NaiveDate;

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn bands(ranks: &[u32]) -> BTreeMap<u32, TimeSeries> {
        ranks
            .iter()
            .map(|r| {
                let v = *r as f64 / 100.0;
                (*r, TimeSeries::new(vec![(date(2020, 1), v), (date(2020, 2), v)]))
            })
            .collect()
    }

    #[test]
    fn test_median_is_dashed_and_heavier() {
        let svg = DecileChart::new("Zopiclone breach").render(&bands(&DECILES), None).unwrap();
        let median = svg.lines().find(|l| l.contains("class=\"p50\"")).unwrap();
        assert!(median.contains("stroke-dasharray=\"6 3\""));
        assert!(median.contains("stroke-width=\"2.00\""));
        let p10 = svg.lines().find(|l| l.contains("class=\"p10\"")).unwrap();
        assert!(!p10.contains("stroke-dasharray"));
    }

    #[test]
    fn test_outer_percentiles_toggle() {
        let mut ranks: Vec<u32> = DECILES.to_vec();
        ranks.extend(outer_percentiles());
        let all = bands(&ranks);

        let hidden = DecileChart::new("t").render(&all, None).unwrap();
        assert!(!hidden.contains("class=\"p1\""));

        let shown = DecileChart::new("t").with_outer_percentiles(true).render(&all, None).unwrap();
        let p99 = shown.lines().find(|l| l.contains("class=\"p99\"")).unwrap();
        assert!(p99.contains("stroke-dasharray=\"2 2\""));
    }

    #[test]
    fn test_highlight_drawn_in_red() {
        let region = TimeSeries::new(vec![(date(2020, 1), 0.4), (date(2020, 2), 0.2)]);
        let svg = DecileChart::new("t").render(&bands(&DECILES), Some(("15N", &region))).unwrap();
        let line = svg.lines().find(|l| l.contains("class=\"highlight\"")).unwrap();
        assert!(line.contains("#d62728"));
        assert!(svg.contains(">15N</text>"));
    }

    #[test]
    fn test_no_series_is_error() {
        let err = DecileChart::new("t").render(&BTreeMap::new(), None).unwrap_err();
        assert!(matches!(err, ReclassError::Render { format: RenderFormat::Deciles, .. }));
    }
}
