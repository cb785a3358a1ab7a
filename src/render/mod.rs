/*!
 * SVG rendering for prescribing charts and maps
 *
 * Three artifacts are produced: an annotated monthly time series with a
 * dashed marker at the legislation change, a decile chart of a per-region
 * metric, and a choropleth of one month's values by region.
 */

pub mod axes;
pub mod canvas;
pub mod choropleth;
pub mod deciles;
pub mod timeseries;

pub use canvas::{save_svg, Canvas, Color, LineStyle, Style, TextAnchor, TextStyle};
pub use choropleth::{region_values, ChoroplethMap, Region, RegionBoundaries};
pub use deciles::DecileChart;
pub use timeseries::TimeSeriesChart;

/// Default chart width in pixels
pub const DEFAULT_WIDTH: f64 = 900.0;
/// Default chart height in pixels
pub const DEFAULT_HEIGHT: f64 = 500.0;

/// Class attribute on the legislation change marker
pub const CHANGE_MARKER_CLASS: &str = "change-marker";
