/*!
 * End-to-end scenario runs against an in-memory backend
 *
 * Each run writes its cache file and SVG artifacts into a temporary
 * directory; the tests then inspect the files the way a reader would.
 */

use std::cell::Cell;
use std::fs;

use cdreclass::prelude::*;
use cdreclass::query::{PageAccumulator, QueryResponse};
use cdreclass::render::CHANGE_MARKER_CLASS;
use tempfile::TempDir;

/// Serves a fixed zopiclone breach extract: three regions over four months
struct BreachBackend {
    calls: Cell<usize>,
}

impl QueryBackend for BreachBackend {
    fn run(&self, _sql: &str) -> Result<ResultSet> {
        self.calls.set(self.calls.get() + 1);
        let mut rows = Vec::new();
        let months = ["2014-04-01", "2014-05-01", "2014-06-01", "2020-05-01"];
        for (i, month) in months.iter().enumerate() {
            for (region, scale) in [("15N", 1.0), ("99A", 2.0), ("07L", 3.0)] {
                let items_breach = (10 * (i + 1)) as i64;
                let qty_breach = 28.0 * scale;
                let all_qi = 280.0;
                rows.push(vec![
                    Value::infer(month),
                    Value::infer(region),
                    Value::Int(items_breach),
                    Value::Float(qty_breach),
                    Value::Float(all_qi),
                    Value::Float(qty_breach / all_qi),
                ]);
            }
        }
        ResultSet::from_inferred(
            vec![
                "month".into(),
                "pct".into(),
                "items_breach".into(),
                "qty_breach".into(),
                "all_QI".into(),
                "percent_qty_breach".into(),
            ],
            rows,
        )
    }

    fn name(&self) -> &str {
        "breach"
    }
}

const BOUNDARIES: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {"type": "Feature", "properties": {"code": "15N"},
     "geometry": {"type": "Polygon", "coordinates": [[[-4,50],[-3,50],[-3,51],[-4,51],[-4,50]]]}},
    {"type": "Feature", "properties": {"code": "99A"},
     "geometry": {"type": "Polygon", "coordinates": [[[-2,52],[-1,52],[-1,53],[-2,53],[-2,52]]]}},
    {"type": "Feature", "properties": {"code": "07L", "london": true},
     "geometry": {"type": "Polygon", "coordinates": [[[-0.2,51.4],[0.1,51.4],[0.1,51.6],[-0.2,51.6],[-0.2,51.4]]]}}
  ]
}"#;

fn breach_scenario() -> Scenario {
    ScenarioRegistry::builtin()
        .get("zopiclone_breach")
        .cloned()
        .expect("built-in scenario")
}

#[test]
fn zopiclone_breach_writes_chart_deciles_and_map() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(BreachBackend { calls: Cell::new(0) }).with_cache_dir(dir.path());
    let boundaries = RegionBoundaries::from_geojson_str(BOUNDARIES, "code").unwrap();
    let options = RunOptions {
        boundaries: Some(&boundaries),
        ..Default::default()
    };
    let out = dir.path().join("charts");

    let report = run_scenario(&runner, &breach_scenario(), &out, &options).unwrap();
    assert_eq!(report.rows, 12);
    assert_eq!(report.files.len(), 3);
    assert!(report.skipped.is_empty());
    assert!(dir.path().join("zop_breach.csv").exists());

    let chart = fs::read_to_string(out.join("zopiclone_breach_items.svg")).unwrap();
    let marker = chart
        .lines()
        .find(|l| l.contains(CHANGE_MARKER_CLASS))
        .expect("change marker");
    assert!(marker.contains("stroke-dasharray"));

    let deciles = fs::read_to_string(out.join("zopiclone_breach_deciles.svg")).unwrap();
    assert!(deciles.contains("class=\"highlight\""));
    assert!(deciles.contains("class=\"p99\""));

    let map = fs::read_to_string(out.join("zopiclone_breach_map.svg")).unwrap();
    assert!(map.contains("class=\"region-07L\""));
    assert!(map.contains(">London</text>"));
}

#[test]
fn breach_items_summary_compares_either_side_of_change() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(BreachBackend { calls: Cell::new(0) }).with_cache_dir(dir.path());
    let report = run_scenario(&runner, &breach_scenario(), dir.path(), &RunOptions::default()).unwrap();

    // Before: April 30 and May 60 items -> mean 45; from June: 90 items
    let (_, summary) = &report.summaries[0];
    assert_eq!(summary.mean_before, Some(45.0));
    assert_eq!(summary.mean_after, Some(90.0));
    assert_eq!(summary.percent_change, Some(100.0));
    assert_eq!(report.skipped.len(), 1);
}

#[test]
fn rerun_reads_cache_and_reproduces_artifacts() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(BreachBackend { calls: Cell::new(0) }).with_cache_dir(dir.path());
    let out = dir.path().join("charts");

    run_scenario(&runner, &breach_scenario(), &out, &RunOptions::default()).unwrap();
    let first = fs::read_to_string(out.join("zopiclone_breach_items.svg")).unwrap();

    let report = run_scenario(&runner, &breach_scenario(), &out, &RunOptions::default()).unwrap();
    let second = fs::read_to_string(out.join("zopiclone_breach_items.svg")).unwrap();

    assert_eq!(report.cache_outcome, CacheOutcome::Hit);
    assert_eq!(runner.backend().calls.get(), 1);
    assert_eq!(first, second);
}

#[test]
fn scenarios_loaded_from_toml_run_like_builtins() {
    let dir = TempDir::new().unwrap();
    let registry_path = dir.path().join("scenarios.toml");
    let registry = ScenarioRegistry::new(vec![breach_scenario()]).unwrap();
    registry.save(&registry_path).unwrap();

    let loaded = ScenarioRegistry::from_file(&registry_path).unwrap();
    let scenario = loaded.get("zopiclone_breach").unwrap();
    let runner = CachedQueryRunner::new(BreachBackend { calls: Cell::new(0) }).with_cache_dir(dir.path());
    let report = run_scenario(&runner, scenario, &dir.path().join("out"), &RunOptions::default()).unwrap();
    assert_eq!(report.files.len(), 2);
}

/// Serves one BigQuery `jobs.query` page, as the remote client would see it
struct PageBackend {
    page: &'static str,
}

impl QueryBackend for PageBackend {
    fn run(&self, _sql: &str) -> Result<ResultSet> {
        let page: QueryResponse = serde_json::from_str(self.page)?;
        let mut acc = PageAccumulator::new();
        acc.push_page(&page)?;
        acc.finish()
    }

    fn name(&self) -> &str {
        "page"
    }
}

// 99A prescribed no zopiclone tablets in June, so IEEE_DIVIDE returned NaN
const NAN_PAGE: &str = r#"{
  "schema": {"fields": [
    {"name": "month", "type": "DATE"},
    {"name": "pct", "type": "STRING"},
    {"name": "items_breach", "type": "INTEGER"},
    {"name": "qty_breach", "type": "INTEGER"},
    {"name": "all_QI", "type": "INTEGER"},
    {"name": "percent_qty_breach", "type": "FLOAT"}
  ]},
  "rows": [
    {"f": [{"v": "2014-05-01"}, {"v": "15N"}, {"v": "4"}, {"v": "112"}, {"v": "560"}, {"v": "0.2"}]},
    {"f": [{"v": "2014-05-01"}, {"v": "99A"}, {"v": "2"}, {"v": "56"}, {"v": "560"}, {"v": "0.1"}]},
    {"f": [{"v": "2014-06-01"}, {"v": "15N"}, {"v": "3"}, {"v": "84"}, {"v": "560"}, {"v": "0.15"}]},
    {"f": [{"v": "2014-06-01"}, {"v": "99A"}, {"v": "0"}, {"v": "0"}, {"v": "0"}, {"v": "NaN"}]}
  ],
  "jobComplete": true
}"#;

#[test]
fn zero_denominator_ratio_is_null_and_scenario_completes() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(PageBackend { page: NAN_PAGE }).with_cache_dir(dir.path());
    let out = dir.path().join("charts");

    let report = run_scenario(&runner, &breach_scenario(), &out, &RunOptions::default()).unwrap();
    assert_eq!(report.rows, 4);
    assert_eq!(report.files.len(), 2);
    assert!(out.join("zopiclone_breach_deciles.svg").exists());

    let cached = ResultSetReader::new().read_path(dir.path().join("zop_breach.csv")).unwrap();
    assert_eq!(
        cached.column("percent_qty_breach").unwrap().column_type,
        ColumnType::Float
    );
    assert_eq!(cached.rows()[3][5], Value::Null);
}

#[test]
fn nan_cells_in_an_existing_cache_read_as_null() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("zop_breach.csv"),
        "month,pct,items_breach,qty_breach,all_QI,percent_qty_breach\n\
         2014-05-01,15N,4,112,560,0.2\n\
         2014-06-01,15N,3,84,560,0.15\n\
         2014-06-01,99A,0,0,0,NaN\n",
    )
    .unwrap();

    let runner = CachedQueryRunner::new(CacheOnlyBackend).with_cache_dir(dir.path());
    let report = run_scenario(&runner, &breach_scenario(), &dir.path().join("charts"), &RunOptions::default()).unwrap();
    assert_eq!(report.cache_outcome, CacheOutcome::Hit);
    assert_eq!(report.files.len(), 2);
}
