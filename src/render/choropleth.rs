use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, warn};

use super::axes::{format_si, PlotArea};
use super::canvas::{save_svg, Canvas, Color, Style, TextAnchor, TextStyle};
use super::{DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::data_types::ResultSet;
use crate::error::RenderFormat;
use crate::{ErrorContext, ReclassError, Result};

/// Polygon as a list of rings; the first ring is the outer boundary
pub type Polygon = Vec<Vec<(f64, f64)>>;

/// One administrative area
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub code: String,
    pub london: bool,
    pub polygons: Vec<Polygon>,
}

/// Region outlines loaded from a GeoJSON FeatureCollection
#[derive(Debug, Clone, Default)]
pub struct RegionBoundaries {
    pub regions: Vec<Region>,
}

impl RegionBoundaries {
    /// Load boundaries; `code_property` names the feature property holding the region code
    pub fn from_path<P: AsRef<Path>>(path: P, code_property: &str) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ReclassError::Io {
            message: format!("Cannot read boundaries '{}': {}", path.display(), e),
            source: e,
            context: ErrorContext {
                file_path: Some(path.to_path_buf()),
                ..Default::default()
            },
        })?;
        Self::from_geojson_str(&text, code_property)
    }

    pub fn from_geojson_str(text: &str, code_property: &str) -> Result<Self> {
        let root: Json = serde_json::from_str(text).map_err(|e| invalid_geojson(e.to_string()))?;
        if root.get("type").and_then(Json::as_str) != Some("FeatureCollection") {
            return Err(invalid_geojson("top-level object is not a FeatureCollection".into()));
        }
        let features = root
            .get("features")
            .and_then(Json::as_array)
            .ok_or_else(|| invalid_geojson("missing 'features' array".into()))?;

        let mut regions = Vec::with_capacity(features.len());
        for (idx, feature) in features.iter().enumerate() {
            let properties = feature.get("properties");
            let code = match properties.and_then(|p| p.get(code_property)) {
                Some(Json::String(s)) => s.clone(),
                Some(Json::Number(n)) => n.to_string(),
                _ => {
                    warn!(feature = idx, property = code_property, "feature without region code skipped");
                    continue;
                }
            };
            let london = match properties.and_then(|p| p.get("london")) {
                Some(Json::Bool(b)) => *b,
                Some(Json::String(s)) => s.eq_ignore_ascii_case("true"),
                _ => false,
            };
            let polygons = match feature.get("geometry") {
                Some(Json::Null) | None => {
                    debug!(code = %code, "feature without geometry skipped");
                    continue;
                }
                Some(geometry) => parse_geometry(geometry)
                    .map_err(|msg| invalid_geojson(format!("feature '{}': {}", code, msg)))?,
            };
            regions.push(Region { code, london, polygons });
        }

        debug!(regions = regions.len(), "loaded region boundaries");
        Ok(Self { regions })
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn codes(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.code.as_str()).collect()
    }
}

fn invalid_geojson(message: String) -> ReclassError {
    ReclassError::DataValidation {
        message: format!("Invalid GeoJSON: {}", message),
        field: Some("geometry".to_string()),
        value: None,
        context: Default::default(),
    }
}

fn parse_geometry(geometry: &Json) -> std::result::Result<Vec<Polygon>, String> {
    let kind = geometry.get("type").and_then(Json::as_str).unwrap_or_default();
    let coords = geometry
        .get("coordinates")
        .ok_or_else(|| "geometry has no coordinates".to_string())?;
    match kind {
        "Polygon" => Ok(vec![parse_polygon(coords)?]),
        "MultiPolygon" => coords
            .as_array()
            .ok_or_else(|| "MultiPolygon coordinates are not an array".to_string())?
            .iter()
            .map(parse_polygon)
            .collect(),
        other => Err(format!("unsupported geometry type '{}'", other)),
    }
}

fn parse_polygon(coords: &Json) -> std::result::Result<Polygon, String> {
    coords
        .as_array()
        .ok_or_else(|| "polygon is not an array of rings".to_string())?
        .iter()
        .map(|ring| -> std::result::Result<Vec<(f64, f64)>, String> {
            ring.as_array()
                .ok_or_else(|| "ring is not an array".to_string())?
                .iter()
                .map(|pos| match pos.as_array().map(Vec::as_slice) {
                    Some([x, y, ..]) => match (x.as_f64(), y.as_f64()) {
                        (Some(x), Some(y)) => Ok((x, y)),
                        _ => Err("position is not numeric".to_string()),
                    },
                    _ => Err("position needs two coordinates".to_string()),
                })
                .collect()
        })
        .collect()
}

/// Extract `region -> value` from a single-month result set
///
/// Null values are left out so those regions render as missing. A region
/// appearing twice means the input was not restricted to one month.
pub fn region_values(rs: &ResultSet, region_column: &str, value_column: &str) -> Result<BTreeMap<String, f64>> {
    let region_idx = rs.column_index(region_column)?;
    let value_idx = rs.column_index(value_column)?;

    let mut values = BTreeMap::new();
    for (row_idx, row) in rs.rows().iter().enumerate() {
        let code = row[region_idx].to_string();
        if code.is_empty() {
            return Err(ReclassError::unexpected_null(region_column, row_idx));
        }
        let Some(value) = crate::data_types::numeric_cell(&row[value_idx], value_column, row_idx)? else {
            continue;
        };
        if values.insert(code.clone(), value).is_some() {
            return Err(ReclassError::DataValidation {
                message: format!(
                    "Region '{}' appears more than once; restrict the data to a single month",
                    code
                ),
                field: Some(region_column.to_string()),
                value: Some(code),
                context: Default::default(),
            });
        }
    }
    Ok(values)
}

#[derive(Debug, Clone, Copy)]
struct Bounds {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

impl Bounds {
    fn of<'a, I: IntoIterator<Item = &'a Region>>(regions: I) -> Option<Self> {
        let mut bounds: Option<Bounds> = None;
        for (x, y) in regions
            .into_iter()
            .flat_map(|r| r.polygons.iter())
            .flat_map(|p| p.iter())
            .flat_map(|ring| ring.iter())
        {
            let b = bounds.get_or_insert(Bounds { min_x: *x, min_y: *y, max_x: *x, max_y: *y });
            b.min_x = b.min_x.min(*x);
            b.min_y = b.min_y.min(*y);
            b.max_x = b.max_x.max(*x);
            b.max_y = b.max_y.max(*y);
        }
        bounds
    }
}

/// Equirectangular projection fitted to a panel, preserving aspect ratio
struct Projection {
    origin_x: f64,
    origin_y: f64,
    x_scale: f64,
    scale: f64,
    offset_x: f64,
    offset_y: f64,
}

impl Projection {
    fn fit(bounds: Bounds, panel: &PlotArea) -> Self {
        let mid_lat = (bounds.min_y + bounds.max_y) / 2.0;
        let x_scale = mid_lat.to_radians().cos().abs().max(0.1);
        let w = ((bounds.max_x - bounds.min_x) * x_scale).max(1e-9);
        let h = (bounds.max_y - bounds.min_y).max(1e-9);
        let scale = (panel.width / w).min(panel.height / h);
        Self {
            origin_x: bounds.min_x,
            origin_y: bounds.max_y,
            x_scale,
            scale,
            offset_x: panel.left + (panel.width - w * scale) / 2.0,
            offset_y: panel.top + (panel.height - h * scale) / 2.0,
        }
    }

    fn project(&self, (x, y): (f64, f64)) -> (f64, f64) {
        (
            self.offset_x + (x - self.origin_x) * self.x_scale * self.scale,
            self.offset_y + (self.origin_y - y) * self.scale,
        )
    }
}

/// Sequential colour scale from near-white to dark blue
fn shade(t: f64) -> Color {
    Color::lerp(Color::hex("#f7fbff"), Color::hex("#08306b"), t)
}

/// Region map shaded by value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoroplethMap {
    pub title: String,
    /// Draw London regions in their own inset panel
    pub separate_london: bool,
    /// Codes treated as London in addition to features flagged `london`
    #[serde(default)]
    pub london_codes: Vec<String>,
    pub legend_label: Option<String>,
    pub width: f64,
    pub height: f64,
}

impl ChoroplethMap {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            separate_london: false,
            london_codes: Vec::new(),
            legend_label: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT + 200.0,
        }
    }

    pub fn with_separate_london(mut self, separate: bool) -> Self {
        self.separate_london = separate;
        self
    }

    pub fn with_london_codes(mut self, codes: Vec<String>) -> Self {
        self.london_codes = codes;
        self
    }

    pub fn with_legend_label(mut self, label: impl Into<String>) -> Self {
        self.legend_label = Some(label.into());
        self
    }

    pub fn with_size(mut self, width: f64, height: f64) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    fn is_london(&self, region: &Region) -> bool {
        region.london || self.london_codes.iter().any(|c| *c == region.code)
    }

    /// Render the map; regions absent from `values` are drawn grey
    pub fn render(&self, boundaries: &RegionBoundaries, values: &BTreeMap<String, f64>) -> Result<String> {
        if boundaries.is_empty() {
            return Err(ReclassError::Render {
                message: "No region boundaries to draw".to_string(),
                format: RenderFormat::Choropleth,
            });
        }

        let range = values
            .values()
            .filter(|v| v.is_finite())
            .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                Some((lo, hi)) => Some((lo.min(*v), hi.max(*v))),
                None => Some((*v, *v)),
            });
        let unmatched = values
            .keys()
            .filter(|k| !boundaries.regions.iter().any(|r| &r.code == *k))
            .count();
        if unmatched > 0 {
            warn!(unmatched, "values with no matching region boundary");
        }

        let mut canvas = Canvas::new(self.width, self.height);
        let title_style = TextStyle { bold: true, ..TextStyle::sized(14.0, TextAnchor::Middle) };
        canvas.text(self.width / 2.0, 24.0, &self.title, &title_style);

        let (main, london): (Vec<&Region>, Vec<&Region>) = if self.separate_london {
            boundaries.regions.iter().partition(|r| !self.is_london(r))
        } else {
            (boundaries.regions.iter().collect(), Vec::new())
        };
        if self.separate_london && london.is_empty() {
            warn!("no London regions found for the inset panel");
        }

        let legend_height = 60.0;
        let body = PlotArea::inset(self.width, self.height, (40.0, 20.0, legend_height, 20.0));
        let main_panel = if london.is_empty() {
            body
        } else {
            PlotArea { width: body.width * 0.68, ..body }
        };

        self.draw_panel(&mut canvas, &main, &main_panel, values, range);

        if !london.is_empty() {
            let inset = PlotArea {
                left: main_panel.right() + 20.0,
                top: body.top + 20.0,
                width: body.width - main_panel.width - 20.0,
                height: body.height * 0.5,
            };
            canvas.rect(
                inset.left - 4.0,
                inset.top - 4.0,
                inset.width + 8.0,
                inset.height + 8.0,
                &Style::stroked(Color::rgb(120, 120, 120), 0.8),
            );
            canvas.text(inset.left, inset.top - 8.0, "London", &TextStyle::sized(11.0, TextAnchor::Start));
            self.draw_panel(&mut canvas, &london, &inset, values, range);
        }

        self.draw_colour_bar(&mut canvas, range, body.bottom() + 16.0);
        Ok(canvas.finish_svg())
    }

    /// Render and write to `path`
    pub fn save(&self, boundaries: &RegionBoundaries, values: &BTreeMap<String, f64>, path: &Path) -> Result<()> {
        let svg = self.render(boundaries, values)?;
        save_svg(&svg, path)
    }

    fn draw_panel(
        &self,
        canvas: &mut Canvas,
        regions: &[&Region],
        panel: &PlotArea,
        values: &BTreeMap<String, f64>,
        range: Option<(f64, f64)>,
    ) {
        let Some(bounds) = Bounds::of(regions.iter().copied()) else {
            return;
        };
        let projection = Projection::fit(bounds, panel);

        for region in regions {
            let fill = match (values.get(&region.code), range) {
                (Some(v), Some((lo, hi))) if v.is_finite() => {
                    let t = if hi > lo { (v - lo) / (hi - lo) } else { 0.5 };
                    shade(t)
                }
                _ => Color::GREY,
            };
            let style = Style {
                fill: Some(fill),
                stroke: Some(Color::WHITE),
                stroke_width: 0.4,
            };
            let rings: Vec<Vec<(f64, f64)>> = region
                .polygons
                .iter()
                .flat_map(|p| p.iter())
                .map(|ring| ring.iter().map(|pt| projection.project(*pt)).collect())
                .collect();
            canvas.rings(rings, &style, Some(&format!("region-{}", region.code)));
        }
    }

    fn draw_colour_bar(&self, canvas: &mut Canvas, range: Option<(f64, f64)>, top: f64) {
        let steps = 20;
        let bar_width = (self.width * 0.5).min(400.0);
        let left = (self.width - bar_width) / 2.0;
        let step_width = bar_width / steps as f64;
        let label = TextStyle::sized(10.0, TextAnchor::Middle);

        let Some((lo, hi)) = range else {
            canvas.text(self.width / 2.0, top + 12.0, "No data", &label);
            return;
        };

        for i in 0..steps {
            let t = (i as f64 + 0.5) / steps as f64;
            canvas.rect(left + i as f64 * step_width, top, step_width + 0.5, 12.0, &Style::filled(shade(t)));
        }
        canvas.rect(left, top, bar_width, 12.0, &Style::stroked(Color::rgb(120, 120, 120), 0.5));
        canvas.text(left, top + 26.0, &format_si(lo), &label);
        canvas.text(left + bar_width, top + 26.0, &format_si(hi), &label);
        if let Some(caption) = &self.legend_label {
            canvas.text(left + bar_width / 2.0, top + 26.0, caption, &label);
        }
    }
}
