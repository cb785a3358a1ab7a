/*!
 * Reclassification scenarios and the pipeline that runs them
 *
 * A scenario bundles one query, the cache file its result lives in, the
 * legislation change date, and the charts and maps drawn from the result.
 * Running a scenario is strictly sequential: cached read, month coercion,
 * renames, then each chart in declaration order. The first failure aborts
 * the scenario.
 */

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analytics::{change_summary, monthly_totals, outer_percentiles, percentiles_by_month, ChangeSummary, DECILES};
use crate::cache::{CacheOutcome, CachedQueryRunner};
use crate::data_types::{EqFilter, ResultSet};
use crate::query::QueryBackend;
use crate::render::{region_values, ChoroplethMap, DecileChart, RegionBoundaries, TimeSeriesChart};
use crate::schema::ResultSchema;
use crate::{ReclassError, Result};

/// Gabapentinoids controlled from April 2019
pub const GABAPENTINOID_CHANGE: &str = "2019-04-01";
/// Tramadol, zopiclone, zaleplon and lisdexamfetamine controlled from June 2014
pub const JUNE_2014_CHANGE: &str = "2014-06-01";

fn default_time_column() -> String {
    "month".to_string()
}

fn default_region_column() -> String {
    "pct".to_string()
}

/// One annotated time-series chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub title: String,
    pub measure: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_max: Option<f64>,
    /// File name under the output directory
    pub output: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<EqFilter>,
}

/// Ratio column computed after loading, null where the denominator is zero
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRatio {
    pub numerator: String,
    pub denominator: String,
    pub output: String,
}

/// Decile chart of a per-region metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecileSpec {
    pub title: String,
    pub column: String,
    #[serde(default = "default_region_column")]
    pub region_column: String,
    /// Region drawn over the deciles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<String>,
    #[serde(default)]
    pub show_outer_percentiles: bool,
    pub output: PathBuf,
}

/// Choropleth of one month's values by region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapSpec {
    pub title: String,
    pub month: NaiveDate,
    pub column: String,
    #[serde(default = "default_region_column")]
    pub region_column: String,
    #[serde(default)]
    pub separate_london: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub london_codes: Vec<String>,
    pub output: PathBuf,
}

impl MapSpec {
    /// Shade the rows of `rs` falling in `self.month` and save under `output_dir`
    ///
    /// Returns the file written and the number of regions with a value.
    pub fn draw(
        &self,
        rs: &ResultSet,
        time_column: &str,
        boundaries: &RegionBoundaries,
        output_dir: &Path,
    ) -> Result<(PathBuf, usize)> {
        let month = rs.filter_month(time_column, self.month)?;
        let values = region_values(&month, &self.region_column, &self.column)?;
        let path = output_dir.join(&self.output);
        ChoroplethMap::new(&self.title)
            .with_separate_london(self.separate_london)
            .with_london_codes(self.london_codes.clone())
            .with_legend_label(&self.column)
            .save(boundaries, &values, &path)?;
        Ok((path, values.len()))
    }
}

/// A reclassification event and the analysis drawn for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub title: String,
    pub sql: String,
    /// Cache path, relative to the cache directory unless absolute
    pub cache_file: PathBuf,
    pub change_date: NaiveDate,
    #[serde(default = "default_time_column")]
    pub time_column: String,
    /// Column renames applied after loading, as (from, to)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rename: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived: Vec<DerivedRatio>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charts: Vec<ChartSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deciles: Option<DecileSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map: Option<MapSpec>,
}

impl Scenario {
    /// Columns the loaded result set must provide once renames are applied
    pub fn schema(&self) -> ResultSchema {
        let derived: HashSet<&str> = self.derived.iter().map(|d| d.output.as_str()).collect();
        let mut schema = ResultSchema::new().month(&self.time_column);
        for ratio in &self.derived {
            schema = schema.measure(&ratio.numerator).measure(&ratio.denominator);
        }
        for chart in &self.charts {
            if !derived.contains(chart.measure.as_str()) {
                schema = schema.measure(&chart.measure);
            }
            if let Some(filter) = &chart.filter {
                schema = schema.key(&filter.column);
            }
        }
        if let Some(deciles) = &self.deciles {
            schema = schema.key(&deciles.region_column);
            if !derived.contains(deciles.column.as_str()) {
                schema = schema.measure(&deciles.column);
            }
        }
        if let Some(map) = &self.map {
            schema = schema.key(&map.region_column);
            if !derived.contains(map.column.as_str()) {
                schema = schema.measure(&map.column);
            }
        }
        schema
    }

    /// Load the result set and apply month coercion, renames and derived ratios
    pub fn load<B: QueryBackend>(&self, runner: &CachedQueryRunner<B>) -> Result<(ResultSet, CacheOutcome)> {
        let (mut rs, outcome) = runner.cached_read_with_outcome(&self.sql, &self.cache_file)?;
        rs.coerce_month(&self.time_column)?;
        for (from, to) in &self.rename {
            rs.rename(from, to)?;
        }
        self.schema().validate(&rs)?;
        for ratio in &self.derived {
            rs.derive_ratio(&ratio.numerator, &ratio.denominator, &ratio.output)?;
        }
        Ok((rs, outcome))
    }
}

/// Settings shared by every scenario in a run
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub chart_width: f64,
    pub chart_height: f64,
    /// Months either side of the change compared in summaries
    pub window_months: u32,
    /// Boundaries for maps; scenarios with a map skip it when absent
    pub boundaries: Option<&'a RegionBoundaries>,
}

impl Default for RunOptions<'_> {
    fn default() -> Self {
        Self {
            chart_width: crate::render::DEFAULT_WIDTH,
            chart_height: crate::render::DEFAULT_HEIGHT,
            window_months: 6,
            boundaries: None,
        }
    }
}

/// What a scenario run produced
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub id: String,
    pub title: String,
    pub cache_outcome: CacheOutcome,
    pub rows: usize,
    pub files: Vec<PathBuf>,
    pub summaries: Vec<(String, ChangeSummary)>,
    /// Artifacts not drawn, with the reason
    pub skipped: Vec<String>,
}

impl ScenarioReport {
    /// Print formatted summary
    pub fn print_summary(&self) {
        println!("\n=== {} ({}) ===", self.title, self.id);
        println!("Cache: {}, {} rows", self.cache_outcome, self.rows);
        for (label, summary) in &self.summaries {
            summary.print_summary(label);
        }
        if !self.files.is_empty() {
            println!("Written:");
            for file in &self.files {
                println!("  {}", file.display());
            }
        }
        for reason in &self.skipped {
            println!("Skipped: {}", reason);
        }
    }
}

/// Run one scenario end to end, writing artifacts under `output_dir`
pub fn run_scenario<B: QueryBackend>(
    runner: &CachedQueryRunner<B>,
    scenario: &Scenario,
    output_dir: &Path,
    options: &RunOptions<'_>,
) -> Result<ScenarioReport> {
    run_inner(runner, scenario, output_dir, options).map_err(|e| e.in_scenario(&scenario.id))
}

fn run_inner<B: QueryBackend>(
    runner: &CachedQueryRunner<B>,
    scenario: &Scenario,
    output_dir: &Path,
    options: &RunOptions<'_>,
) -> Result<ScenarioReport> {
    let start_time = Instant::now();
    info!(scenario = %scenario.id, "running scenario");

    let (rs, cache_outcome) = scenario.load(runner)?;
    fs::create_dir_all(output_dir)?;

    let mut report = ScenarioReport {
        id: scenario.id.clone(),
        title: scenario.title.clone(),
        cache_outcome,
        rows: rs.len(),
        files: Vec::new(),
        summaries: Vec::new(),
        skipped: Vec::new(),
    };

    for chart in &scenario.charts {
        let series = monthly_totals(&rs, &scenario.time_column, &chart.measure, chart.filter.as_ref())?;
        debug!(chart = %chart.title, months = series.len(), "aggregated");
        report.summaries.push((
            chart.title.clone(),
            change_summary(&series, scenario.change_date, options.window_months),
        ));

        let path = output_dir.join(&chart.output);
        TimeSeriesChart::new(&chart.title, scenario.change_date)
            .with_y_max(chart.y_max)
            .with_y_label(&chart.measure)
            .with_size(options.chart_width, options.chart_height)
            .save(&series, &path)?;
        report.files.push(path);
    }

    if let Some(spec) = &scenario.deciles {
        let mut ranks = DECILES.to_vec();
        if spec.show_outer_percentiles {
            ranks.extend(outer_percentiles());
        }
        let percentiles = percentiles_by_month(&rs, &scenario.time_column, &spec.column, &ranks)?;

        let highlight = match &spec.highlight {
            Some(region) => {
                let subset = rs.filter_eq(&EqFilter::new(&spec.region_column, region))?;
                if subset.is_empty() {
                    warn!(region = %region, "highlighted region has no rows");
                }
                let series = monthly_totals(&subset, &scenario.time_column, &spec.column, None)?;
                Some((region.as_str(), series))
            }
            None => None,
        };

        let path = output_dir.join(&spec.output);
        DecileChart::new(&spec.title)
            .with_outer_percentiles(spec.show_outer_percentiles)
            .with_y_label(&spec.column)
            .with_size(options.chart_width, options.chart_height)
            .save(&percentiles, highlight.as_ref().map(|(r, s)| (*r, s)), &path)?;
        report.files.push(path);
    }

    if let Some(spec) = &scenario.map {
        match options.boundaries {
            Some(boundaries) => {
                let (path, regions) = spec.draw(&rs, &scenario.time_column, boundaries, output_dir)?;
                debug!(scenario = %scenario.id, regions, "map drawn");
                report.files.push(path);
            }
            None => {
                warn!(scenario = %scenario.id, "no boundaries configured; map skipped");
                report.skipped.push(format!("{} (no boundaries file configured)", spec.title));
            }
        }
    }

    info!(
        scenario = %scenario.id,
        files = report.files.len(),
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "scenario complete"
    );
    Ok(report)
}

/// Ordered collection of scenarios
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioRegistry {
    #[serde(rename = "scenario", default)]
    pub scenarios: Vec<Scenario>,
}

impl ScenarioRegistry {
    /// Registry with duplicate ids rejected
    pub fn new(scenarios: Vec<Scenario>) -> Result<Self> {
        let mut seen = HashSet::new();
        for s in &scenarios {
            if !seen.insert(s.id.as_str()) {
                return Err(ReclassError::Configuration {
                    message: format!("Duplicate scenario id '{}'", s.id),
                    suggestion: Some("Scenario ids must be unique".to_string()),
                });
            }
        }
        Ok(Self { scenarios })
    }

    pub fn get(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|s| s.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.scenarios.iter().map(|s| s.id.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.iter()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Scenarios matching `ids` in the order given; all of them when empty
    pub fn select(&self, ids: &[String]) -> Result<Vec<&Scenario>> {
        if ids.is_empty() {
            return Ok(self.scenarios.iter().collect());
        }
        ids.iter()
            .map(|id| {
                self.get(id).ok_or_else(|| ReclassError::Configuration {
                    message: format!("Unknown scenario '{}'", id),
                    suggestion: Some(format!("Known scenarios: {}", self.ids().join(", "))),
                })
            })
            .collect()
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let parsed: ScenarioRegistry = toml::from_str(text)?;
        Self::new(parsed.scenarios)
    }

    /// Load a registry from a TOML file of `[[scenario]]` tables
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ReclassError::Configuration {
            message: format!("Failed to serialize scenarios: {}", e),
            suggestion: None,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// The six reclassification analyses
    pub fn builtin() -> Self {
        Self {
            scenarios: vec![
                gabapentinoids(),
                tramadol(),
                tramadol_mg(),
                z_drugs(),
                zopiclone_breach(),
                lisdexamfetamine(),
            ],
        }
    }
}

fn change(date: &str) -> NaiveDate {
    NaiveDate::parse_from_str(date, crate::data_types::MONTH_FORMAT).unwrap_or_default()
}

fn chart(title: &str, measure: &str, y_max: Option<f64>, output: &str) -> ChartSpec {
    ChartSpec {
        title: title.to_string(),
        measure: measure.to_string(),
        filter: None,
        y_max,
        output: PathBuf::from(output),
    }
}

fn gabapentinoids() -> Scenario {
    Scenario {
        id: "gabapentinoids".into(),
        title: "Gabapentinoids".into(),
        sql: r#"
SELECT
  month,
  pct_id,
  sum(numerator) as total_gaba,
FROM
  `ebmdatalab.measures.ccg_data_gabapentinoidsddd` AS p
GROUP BY
month,
pct_id
"#
        .into(),
        cache_file: "data/df_gaba.csv".into(),
        change_date: change(GABAPENTINOID_CHANGE),
        time_column: default_time_column(),
        rename: vec![("pct_id".into(), "pct".into())],
        derived: Vec::new(),
        charts: vec![chart("Total Gabapentinoids DDD", "total_gaba", Some(30_000_000.0), "gabapentinoids_ddd.svg")],
        deciles: None,
        map: None,
    }
}

const TRAMADOL_SQL: &str = r#"
SELECT
  month,
  bnf_name,
  bnf_code,
  SUM(items) AS total_items,
  SUM(actual_cost) AS total_cost
FROM
  ebmdatalab.hscic.normalised_prescribing AS rx
WHERE
 bnf_code LIKE '040702040%'
GROUP BY
  month,
  bnf_name,
  bnf_code
ORDER BY
  month
"#;

fn tramadol() -> Scenario {
    Scenario {
        id: "tramadol".into(),
        title: "Tramadol".into(),
        sql: TRAMADOL_SQL.into(),
        cache_file: "data/df_tramadol.csv".into(),
        change_date: change(JUNE_2014_CHANGE),
        time_column: default_time_column(),
        rename: Vec::new(),
        derived: Vec::new(),
        charts: vec![
            chart("Total number of items for Tramadol", "total_items", Some(800_000.0), "tramadol_items.svg"),
            chart("Total cost (£) for Tramadol", "total_cost", None, "tramadol_cost.svg"),
        ],
        deciles: None,
        map: None,
    }
}

fn tramadol_mg() -> Scenario {
    Scenario {
        id: "tramadol_mg".into(),
        title: "Tramadol 50mg (total mg)".into(),
        sql: r#"
SELECT
  month,
  bnf_name,
  bnf_code,
SUM(CASE
      WHEN SUBSTR(bnf_code,14,2)='AA' THEN quantity * 50 #Tramadol 50mg capsules
      WHEN SUBSTR(bnf_code,14,2)='AT' THEN quantity * 50 #Tramadol 50mg orodispersible tablets sugar free
      WHEN SUBSTR(bnf_code,14,2)='AG' THEN quantity * 50 #Tramadol 50mg modified-release capsules
      WHEN SUBSTR(bnf_code,14,2)='AY' THEN quantity * 50 #Tramadol 50mg modified-release tablets
      WHEN SUBSTR(bnf_code,14,2)='AF' THEN quantity * 50 #Tramadol 50mg soluble tablets sugar free
      ELSE 0 END) AS tramadol_mg
FROM
  ebmdatalab.hscic.normalised_prescribing
WHERE
 bnf_code LIKE '040702040%'
GROUP BY
  month,
  bnf_name,
  bnf_code
ORDER BY
  month
"#
        .into(),
        cache_file: "data/df_tramadol_raw.csv".into(),
        change_date: change(JUNE_2014_CHANGE),
        time_column: default_time_column(),
        rename: Vec::new(),
        derived: Vec::new(),
        charts: vec![chart(
            "Total number of mg for Tramadol 50mg caps",
            "tramadol_mg",
            Some(3_500_000_000.0),
            "tramadol_mg.svg",
        )],
        deciles: None,
        map: None,
    }
}

fn z_drugs() -> Scenario {
    let by_chemical = |title: &str, chemical: &str, y_max: Option<f64>, output: &str| ChartSpec {
        filter: Some(EqFilter::new("chemical", chemical)),
        ..chart(title, "total_items", y_max, output)
    };
    Scenario {
        id: "z_drugs".into(),
        title: "Zopiclone & Zaleplon".into(),
        sql: r#"
WITH
bnf_tab AS (
SELECT
DISTINCT chemical,
chemical_code
FROM
ebmdatalab.hscic.bnf )
SELECT
  month,
  chemical,
  SUM(items) AS total_items,
  SUM(actual_cost) AS total_cost
FROM
  ebmdatalab.hscic.normalised_prescribing AS rx
LEFT JOIN
bnf_tab
ON
chemical_code =SUBSTR(rx.bnf_code,1,9)
WHERE
 bnf_code LIKE '0401010W0%' OR #zaleplon
 bnf_code LIKE '0401010Z0%'    #zopiclone
GROUP BY
  month,
  chemical
ORDER BY
  month
"#
        .into(),
        cache_file: "data/df_z_drugs.csv".into(),
        change_date: change(JUNE_2014_CHANGE),
        time_column: default_time_column(),
        rename: Vec::new(),
        derived: Vec::new(),
        charts: vec![
            by_chemical("Total number of items for zaleplon", "Zaleplon", None, "zaleplon_items.svg"),
            by_chemical("Total number of items for zopiclone", "Zopiclone", Some(600_000.0), "zopiclone_items.svg"),
        ],
        deciles: None,
        map: None,
    }
}

fn zopiclone_breach() -> Scenario {
    Scenario {
        id: "zopiclone_breach".into(),
        title: "Zopiclone quantities over one month".into(),
        sql: r#"
SELECT
  CAST(month AS DATE) AS month,
  pct,
  SUM(CASE
      WHEN quantity_per_item>31 THEN items
      ELSE 0
  END) AS items_breach,
  SUM(CASE
      WHEN quantity_per_item>31 THEN total_quantity
      ELSE 0
  END) AS qty_breach,
  SUM(total_quantity) AS all_QI,
  IEEE_DIVIDE(SUM(CASE
      WHEN quantity_per_item>31 THEN total_quantity
      ELSE 0
  END),
      SUM(total_quantity)) AS percent_qty_breach
FROM
 ebmdatalab.hscic.raw_prescribing_normalised AS presc
JOIN
  hscic.ccgs AS ccgs
ON
presc.pct=ccgs.code
WHERE
bnf_code LIKE "0401010Z0%"   ##zopiclone
AND
bnf_name LIKE '%_tab%'  ##this restricts to tablets
AND
ccgs.org_type='CCG'
GROUP BY
  month,
  pct
ORDER BY
  percent_qty_breach DESC
"#
        .into(),
        cache_file: "zop_breach.csv".into(),
        change_date: change(JUNE_2014_CHANGE),
        time_column: default_time_column(),
        rename: Vec::new(),
        derived: Vec::new(),
        charts: vec![chart(
            "Total number of items for zopiclone that had greater than 31 days qty",
            "items_breach",
            None,
            "zopiclone_breach_items.svg",
        )],
        deciles: Some(DecileSpec {
            title: "Proportion of one month quantity breaches of zopiclone (Devon - CCG)".into(),
            column: "percent_qty_breach".into(),
            region_column: default_region_column(),
            highlight: Some("15N".into()),
            show_outer_percentiles: true,
            output: "zopiclone_breach_deciles.svg".into(),
        }),
        map: Some(MapSpec {
            title: "Proportion of one month quantity breaches of zopiclone".into(),
            month: change("2020-05-01"),
            column: "percent_qty_breach".into(),
            region_column: default_region_column(),
            separate_london: true,
            london_codes: Vec::new(),
            output: "zopiclone_breach_map.svg".into(),
        }),
    }
}

fn lisdexamfetamine() -> Scenario {
    Scenario {
        id: "lisdexamfetamine".into(),
        title: "Lisdexamfetamine".into(),
        sql: TRAMADOL_SQL.replace("040702040%", "0404000U0%"),
        cache_file: "data/df_lisdex.csv".into(),
        change_date: change(JUNE_2014_CHANGE),
        time_column: default_time_column(),
        rename: Vec::new(),
        derived: Vec::new(),
        charts: vec![chart(
            "Total number of items for lisdexamfetamine",
            "total_items",
            None,
            "lisdexamfetamine_items.svg",
        )],
        deciles: None,
        map: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::Value;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct FixedBackend {
        rs: ResultSet,
        calls: Cell<usize>,
    }

    impl QueryBackend for FixedBackend {
        fn run(&self, _sql: &str) -> Result<ResultSet> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.rs.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    fn z_drug_rows() -> ResultSet {
        let rows = [
            ("2014-05-01", "Zopiclone", "500000", "1000.5"),
            ("2014-05-01", "Zaleplon", "300", "20.0"),
            ("2014-06-01", "Zopiclone", "480000", "990.25"),
            ("2014-06-01", "Zaleplon", "250", "18.0"),
        ];
        ResultSet::from_inferred(
            vec!["month".into(), "chemical".into(), "total_items".into(), "total_cost".into()],
            rows.iter()
                .map(|(m, c, i, t)| vec![Value::infer(m), Value::infer(c), Value::infer(i), Value::infer(t)])
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_builtin_registry() {
        let registry = ScenarioRegistry::builtin();
        assert_eq!(
            registry.ids(),
            vec!["gabapentinoids", "tramadol", "tramadol_mg", "z_drugs", "zopiclone_breach", "lisdexamfetamine"]
        );
        let gaba = registry.get("gabapentinoids").unwrap();
        assert_eq!(gaba.change_date, NaiveDate::from_ymd_opt(2019, 4, 1).unwrap());
        assert_eq!(gaba.charts[0].y_max, Some(30_000_000.0));
        let lisdex = registry.get("lisdexamfetamine").unwrap();
        assert!(lisdex.sql.contains("0404000U0%"));
        assert!(!lisdex.sql.contains("040702040%"));
    }

    #[test]
    fn test_registry_toml_round_trip() {
        let registry = ScenarioRegistry::builtin();
        let text = registry.to_toml_string().unwrap();
        assert!(text.contains("[[scenario]]"));
        assert_eq!(ScenarioRegistry::from_toml_str(&text).unwrap(), registry);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
[[scenario]]
id = "a"
title = "A"
sql = "SELECT 1"
cache_file = "a.csv"
change_date = "2014-06-01"

[[scenario]]
id = "a"
title = "A again"
sql = "SELECT 2"
cache_file = "b.csv"
change_date = "2014-06-01"
"#;
        assert!(ScenarioRegistry::from_toml_str(text).is_err());
    }

    #[test]
    fn test_select_unknown_scenario() {
        let registry = ScenarioRegistry::builtin();
        assert_eq!(registry.select(&[]).unwrap().len(), 6);
        assert!(registry.select(&["nope".to_string()]).is_err());
        let picked = registry.select(&["tramadol".into(), "z_drugs".into()]).unwrap();
        assert_eq!(picked[1].id, "z_drugs");
    }

    #[test]
    fn test_schema_covers_charts_and_filters() {
        let schema = z_drugs().schema();
        assert_eq!(schema.column_names(), vec!["month", "total_items", "chemical"]);
    }

    #[test]
    fn test_run_z_drugs_writes_filtered_charts() {
        let dir = TempDir::new().unwrap();
        let backend = FixedBackend { rs: z_drug_rows(), calls: Cell::new(0) };
        let runner = CachedQueryRunner::new(backend).with_cache_dir(dir.path().join("cache"));
        let out = dir.path().join("charts");

        let report = run_scenario(&runner, &z_drugs(), &out, &RunOptions::default()).unwrap();
        assert_eq!(report.cache_outcome, CacheOutcome::Miss);
        assert_eq!(report.files.len(), 2);
        assert!(out.join("zopiclone_items.svg").exists());
        assert!(dir.path().join("cache/data/df_z_drugs.csv").exists());

        let (_, zopiclone) = &report.summaries[1];
        let pct = zopiclone.percent_change.unwrap();
        assert!((pct - (-4.0)).abs() < 1e-9);

        let again = run_scenario(&runner, &z_drugs(), &out, &RunOptions::default()).unwrap();
        assert_eq!(again.cache_outcome, CacheOutcome::Hit);
        assert_eq!(runner.backend().calls.get(), 1);
    }

    #[test]
    fn test_missing_measure_fails_scenario() {
        let dir = TempDir::new().unwrap();
        let backend = FixedBackend { rs: z_drug_rows(), calls: Cell::new(0) };
        let runner = CachedQueryRunner::new(backend).with_cache_dir(dir.path());
        let mut scenario = z_drugs();
        scenario.charts[0].measure = "total_quantity".into();

        let err = run_scenario(&runner, &scenario, dir.path(), &RunOptions::default()).unwrap_err();
        assert!(matches!(err, ReclassError::MissingColumn { .. }));
    }

    #[test]
    fn test_map_skipped_without_boundaries() {
        let dir = TempDir::new().unwrap();
        let rs = ResultSet::from_inferred(
            vec!["month".into(), "pct".into(), "qty_breach".into(), "all_qi".into()],
            vec![
                vec![Value::infer("2020-05-01"), Value::infer("15N"), Value::Int(5), Value::Int(10)],
                vec![Value::infer("2020-05-01"), Value::infer("99A"), Value::Int(0), Value::Int(0)],
            ],
        )
        .unwrap();
        let backend = FixedBackend { rs, calls: Cell::new(0) };
        let runner = CachedQueryRunner::new(backend).with_cache_dir(dir.path());

        let scenario = Scenario {
            id: "breach".into(),
            title: "Breach".into(),
            sql: "SELECT 1".into(),
            cache_file: "breach.csv".into(),
            change_date: change(JUNE_2014_CHANGE),
            time_column: default_time_column(),
            rename: Vec::new(),
            derived: vec![DerivedRatio {
                numerator: "qty_breach".into(),
                denominator: "all_qi".into(),
                output: "ratio".into(),
            }],
            charts: Vec::new(),
            deciles: Some(DecileSpec {
                title: "Deciles".into(),
                column: "ratio".into(),
                region_column: "pct".into(),
                highlight: Some("15N".into()),
                show_outer_percentiles: false,
                output: "deciles.svg".into(),
            }),
            map: Some(MapSpec {
                title: "Map".into(),
                month: change("2020-05-01"),
                column: "ratio".into(),
                region_column: "pct".into(),
                separate_london: false,
                london_codes: Vec::new(),
                output: "map.svg".into(),
            }),
        };

        let report = run_scenario(&runner, &scenario, &dir.path().join("out"), &RunOptions::default()).unwrap();
        assert_eq!(report.files, vec![dir.path().join("out/deciles.svg")]);
        assert_eq!(report.skipped.len(), 1);
    }
}
