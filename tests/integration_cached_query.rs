/*!
 * Integration tests for the cached query runner
 *
 * An in-memory backend counts how often it is asked to run a query, so these
 * tests pin down when the cache is trusted and when the backend is called.
 */

use std::cell::Cell;
use std::fs;

use cdreclass::prelude::*;
use tempfile::TempDir;

struct CountingBackend {
    rows: Vec<(&'static str, &'static str, i64)>,
    calls: Cell<usize>,
}

impl CountingBackend {
    fn new() -> Self {
        Self {
            rows: vec![
                ("2014-05-01", "15N", 100),
                ("2014-05-01", "99A", 50),
                ("2014-06-01", "15N", 200),
            ],
            calls: Cell::new(0),
        }
    }
}

impl QueryBackend for CountingBackend {
    fn run(&self, _sql: &str) -> Result<ResultSet> {
        self.calls.set(self.calls.get() + 1);
        ResultSet::from_inferred(
            vec!["month".into(), "pct".into(), "total_items".into()],
            self.rows
                .iter()
                .map(|(m, p, n)| vec![Value::infer(m), Value::infer(p), Value::Int(*n)])
                .collect(),
        )
    }

    fn name(&self) -> &str {
        "counting"
    }
}

const SQL: &str = "SELECT month, pct, SUM(items) AS total_items FROM rx GROUP BY month, pct";

#[test]
fn second_read_is_byte_identical_and_skips_backend() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(CountingBackend::new()).with_cache_dir(dir.path());

    let first = runner.cached_read(SQL, "cache/a.csv").unwrap();
    let bytes_after_first = fs::read(dir.path().join("cache/a.csv")).unwrap();

    let second = runner.cached_read(SQL, "cache/a.csv").unwrap();
    let bytes_after_second = fs::read(dir.path().join("cache/a.csv")).unwrap();

    assert_eq!(first, second);
    assert_eq!(bytes_after_first, bytes_after_second);
    assert_eq!(runner.backend().calls.get(), 1);
}

#[test]
fn existing_cache_is_served_without_backend() {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("data")).unwrap();
    fs::write(
        dir.path().join("data/df_gaba.csv"),
        "month,pct_id,total_gaba\n2019-03-01,15N,1000.5\n2019-04-01,15N,900\n",
    )
    .unwrap();

    let runner = CachedQueryRunner::new(CacheOnlyBackend).with_cache_dir(dir.path());
    let (rs, outcome) = runner
        .cached_read_with_outcome("SELECT anything", "data/df_gaba.csv")
        .unwrap();
    assert_eq!(outcome, CacheOutcome::Hit);
    assert_eq!(rs.len(), 2);
    assert_eq!(rs.column_sum("total_gaba").unwrap(), 1900.5);
}

#[test]
fn missing_cache_with_offline_backend_is_query_error() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(CacheOnlyBackend).with_cache_dir(dir.path());
    let err = runner.cached_read(SQL, "missing.csv").unwrap_err();
    assert!(matches!(err, ReclassError::Query { .. }));
    assert!(!dir.path().join("missing.csv").exists());
}

#[test]
fn refetch_policy_rewrites_corrupt_cache() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.csv");
    fs::write(&path, "month,pct,total_items\n2014-05-01,15N\n").unwrap();

    let failing = CachedQueryRunner::new(CountingBackend::new()).with_cache_dir(dir.path());
    assert!(matches!(
        failing.cached_read(SQL, "a.csv").unwrap_err(),
        ReclassError::Cache { .. }
    ));

    let repairing = CachedQueryRunner::new(CountingBackend::new())
        .with_cache_dir(dir.path())
        .with_corrupt_policy(CorruptCachePolicy::Refetch);
    let rs = repairing.cached_read(SQL, "a.csv").unwrap();
    assert_eq!(rs.len(), 3);
    assert_eq!(repairing.backend().calls.get(), 1);

    let reread = ResultSetReader::new().read_path(&path).unwrap();
    assert_eq!(reread, rs);
}

#[test]
fn cached_result_aggregates_like_the_original() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(CountingBackend::new()).with_cache_dir(dir.path());

    let mut rs = runner.cached_read(SQL, "a.csv").unwrap();
    rs.coerce_month("month").unwrap();
    let series = monthly_totals(&rs, "month", "total_items", None).unwrap();

    let may = chrono::NaiveDate::from_ymd_opt(2014, 5, 1).unwrap();
    let june = chrono::NaiveDate::from_ymd_opt(2014, 6, 1).unwrap();
    assert_eq!(series.points, vec![(may, 150.0), (june, 200.0)]);
    assert_eq!(series.total(), rs.column_sum("total_items").unwrap());
}

/// Returns chemical codes as the engine types them: STRING, leading zeros intact
struct ChemicalBackend;

impl QueryBackend for ChemicalBackend {
    fn run(&self, _sql: &str) -> Result<ResultSet> {
        ResultSet::new(
            vec![
                Column::new("month", ColumnType::Date),
                Column::new("chemical_code", ColumnType::Text),
                Column::new("total_items", ColumnType::Integer),
            ],
            vec![
                vec![Value::infer("2014-05-01"), Value::Text("040702040".into()), Value::Int(120)],
                vec![Value::infer("2014-05-01"), Value::Text("0401010Z0".into()), Value::Int(80)],
                vec![Value::infer("2014-06-01"), Value::Text("040702040".into()), Value::Int(90)],
            ],
        )
    }

    fn name(&self) -> &str {
        "chemical"
    }
}

#[test]
fn leading_zero_codes_survive_the_cache() {
    let dir = TempDir::new().unwrap();
    let runner = CachedQueryRunner::new(ChemicalBackend).with_cache_dir(dir.path());
    let tramadol = EqFilter::new("chemical_code", "040702040");

    let direct = ChemicalBackend.run(SQL).unwrap();
    let cached = runner.cached_read(SQL, "data/df_tramadol.csv").unwrap();
    assert_eq!(cached, direct);
    assert_eq!(cached.filter_eq(&tramadol).unwrap().len(), 2);

    let mut rs = runner.cached_read(SQL, "data/df_tramadol.csv").unwrap();
    rs.coerce_month("month").unwrap();
    let series = monthly_totals(&rs, "month", "total_items", Some(&tramadol)).unwrap();
    assert_eq!(series.total(), 210.0);
}
