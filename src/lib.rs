/*!
 * # cdreclass: Controlled Drug Reclassification Analysis
 *
 * Query, cache, aggregate and chart monthly prescribing volumes around the
 * dates medicines were moved into stricter controlled-drug schedules.
 *
 * ## Features
 *
 * - **Cached queries**: results are stored as CSV and reused until the file is deleted
 * - **Monthly aggregation**: sum any measure by month, optionally filtered to one drug or region
 * - **Annotated charts**: SVG line charts with a dashed marker at the legislation change
 * - **Deciles and maps**: per-region percentile bands and choropleths of a single month
 * - **Built-in scenarios**: gabapentinoids, tramadol, z-drugs and lisdexamfetamine
 *
 * ## Quick Start
 *
 * ```no_run
 * use cdreclass::prelude::*;
 *
 * # fn main() -> Result<()> {
 * // Without the `remote` feature only existing cache files can be read
 * let runner = CachedQueryRunner::new(CacheOnlyBackend).with_cache_dir("./cache");
 *
 * let registry = ScenarioRegistry::builtin();
 * let scenario = registry.get("gabapentinoids").expect("built-in scenario");
 * let report = run_scenario(&runner, scenario, "charts".as_ref(), &RunOptions::default())?;
 * report.print_summary();
 * # Ok(())
 * # }
 * ```
 *
 * ## Aggregating a Cached Result
 *
 * ```no_run
 * # use cdreclass::prelude::*;
 * # fn main() -> Result<()> {
 * let mut rs = ResultSetReader::new().read_path("data/df_z_drugs.csv")?;
 * rs.coerce_month("month")?;
 *
 * let zopiclone = EqFilter::new("chemical", "Zopiclone");
 * let series = monthly_totals(&rs, "month", "total_items", Some(&zopiclone))?;
 *
 * let change = chrono::NaiveDate::from_ymd_opt(2014, 6, 1).unwrap();
 * TimeSeriesChart::new("Zopiclone items", change)
 *     .with_y_max(Some(600_000.0))
 *     .save(&series, "zopiclone.svg".as_ref())?;
 * # Ok(())
 * # }
 * ```
 *
 * ## Configuration
 *
 * ```no_run
 * # use cdreclass::prelude::*;
 * # fn main() -> Result<()> {
 * let config = ConfigBuilder::new()
 *     .cache_dir("./cache")
 *     .project_id("my-billing-project")
 *     .corrupt_cache_policy(CorruptCachePolicy::Refetch)
 *     .build();
 * cdreclass::config::set_global_config(config);
 * # Ok(())
 * # }
 * ```
 *
 * Settings can also come from `~/.config/cdreclass/config.toml` or
 * `CDRECLASS_*` environment variables; see [`config::AnalysisConfig`].
 */

// Re-export error types from root
pub use error::{ErrorContext, ReclassError, RenderFormat, Result};

// Public modules
pub mod analytics;
pub mod cache;
pub mod config;
pub mod data_types;
pub mod error;
pub mod query;
pub mod reader;
pub mod render;
pub mod scenario;
pub mod schema;

/// Prelude module for convenient imports
///
/// Import everything you need with:
/// ```
/// use cdreclass::prelude::*;
/// ```
pub mod prelude {
    pub use crate::analytics::{
        breach_ratio, change_summary, monthly_totals, monthly_totals_by, percentiles_by_month, ChangeSummary,
    };
    pub use crate::cache::{CacheOutcome, CachedQueryRunner, CorruptCachePolicy};
    pub use crate::config::{AnalysisConfig, ConfigBuilder};
    pub use crate::data_types::*;
    pub use crate::error::{ReclassError, Result};
    pub use crate::query::{BigQueryClient, CacheOnlyBackend, QueryBackend, RemoteConfig};
    pub use crate::reader::{write_csv, write_csv_path, ResultSetReader};
    pub use crate::render::{ChoroplethMap, DecileChart, RegionBoundaries, TimeSeriesChart};
    pub use crate::scenario::{run_scenario, MapSpec, RunOptions, Scenario, ScenarioRegistry, ScenarioReport};
    pub use crate::schema::ResultSchema;
}

/// Prescribing domain constants
pub mod constants {
    /// Quantity per item above which a zopiclone prescription exceeds one month
    pub const BREACH_THRESHOLD_DAYS: u32 = 31;

    /// BNF chemical code prefixes used by the built-in scenarios
    pub const TRAMADOL_BNF_PREFIX: &str = "040702040";
    pub const ZALEPLON_BNF_PREFIX: &str = "0401010W0";
    pub const ZOPICLONE_BNF_PREFIX: &str = "0401010Z0";
    pub const LISDEXAMFETAMINE_BNF_PREFIX: &str = "0404000U0";

    /// Region highlighted on the zopiclone decile chart (NHS Devon)
    pub const DEVON_CCG: &str = "15N";
}

/// Common recipes for working with CSV extracts directly
pub mod cookbook {
    use std::path::Path;

    use tracing::info;

    use crate::prelude::*;

    /// Read a CSV extract and total one measure by month
    ///
    /// # Example
    /// ```no_run
    /// # use cdreclass::prelude::*;
    /// # use cdreclass::cookbook::monthly_totals_from_csv;
    /// # fn main() -> Result<()> {
    /// let filter = EqFilter::new("chemical", "Zaleplon");
    /// let series = monthly_totals_from_csv("data/df_z_drugs.csv".as_ref(), "month", "total_items", Some(&filter))?;
    /// series.print_table("total_items");
    /// # Ok(())
    /// # }
    /// ```
    pub fn monthly_totals_from_csv(
        path: &Path,
        time_column: &str,
        measure_column: &str,
        filter: Option<&EqFilter>,
    ) -> Result<TimeSeries> {
        let mut rs = ResultSetReader::new().read_path(path)?;
        rs.coerce_month(time_column)?;
        monthly_totals(&rs, time_column, measure_column, filter)
    }

    /// Draw a choropleth of one month of a CSV extract
    ///
    /// Returns the number of regions that had a value.
    pub fn map_from_csv(
        path: &Path,
        time_column: &str,
        boundaries: &RegionBoundaries,
        spec: &MapSpec,
        output_dir: &Path,
    ) -> Result<usize> {
        let mut rs = ResultSetReader::new().read_path(path)?;
        rs.coerce_month(time_column)?;
        let (written, regions) = spec.draw(&rs, time_column, boundaries, output_dir)?;
        info!(month = %spec.month, regions, path = %written.display(), "map drawn");
        Ok(regions)
    }
}
