/*!
 * Cached query runner
 *
 * `cached_read` returns the result set stored at a cache path if one exists,
 * otherwise runs the query, stores the result there and returns it. Staleness
 * is never checked: a cache file is authoritative until someone deletes it.
 */

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::data_types::ResultSet;
use crate::query::QueryBackend;
use crate::reader::{write_csv_path, ResultSetReader};
use crate::{ReclassError, Result};

/// What to do when a cache file exists but cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CorruptCachePolicy {
    /// Surface the error and leave the file alone
    #[default]
    Fail,
    /// Re-run the query and overwrite the file
    Refetch,
}

/// How a cached read was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from an existing cache file
    Hit,
    /// No cache file; queried and stored
    Miss,
    /// Cache ignored on request; queried and stored
    Refreshed,
    /// Cache file was unreadable; queried and overwritten
    Repaired,
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheOutcome::Hit => write!(f, "hit"),
            CacheOutcome::Miss => write!(f, "miss"),
            CacheOutcome::Refreshed => write!(f, "refreshed"),
            CacheOutcome::Repaired => write!(f, "repaired"),
        }
    }
}

/// Runs queries through a backend, caching results as CSV files
pub struct CachedQueryRunner<B: QueryBackend> {
    backend: B,
    cache_dir: Option<PathBuf>,
    corrupt_policy: CorruptCachePolicy,
    use_cache: bool,
    reader: ResultSetReader,
}

impl<B: QueryBackend> CachedQueryRunner<B> {
    /// Create a runner; relative cache paths resolve against the working directory
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            cache_dir: None,
            corrupt_policy: CorruptCachePolicy::default(),
            use_cache: true,
            reader: ResultSetReader::new(),
        }
    }

    /// Resolve relative cache paths against `dir`
    pub fn with_cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cache_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set the policy for unreadable cache files
    pub fn with_corrupt_policy(mut self, policy: CorruptCachePolicy) -> Self {
        self.corrupt_policy = policy;
        self
    }

    /// When false, existing cache files are ignored and overwritten
    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Where a cache path resolves to
    pub fn resolve(&self, path: &Path) -> PathBuf {
        match &self.cache_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Return the cached result set at `path`, querying the backend only if needed
    pub fn cached_read<P: AsRef<Path>>(&self, sql: &str, path: P) -> Result<ResultSet> {
        self.cached_read_with_outcome(sql, path).map(|(rs, _)| rs)
    }

    /// As `cached_read`, also reporting how the read was satisfied
    pub fn cached_read_with_outcome<P: AsRef<Path>>(
        &self,
        sql: &str,
        path: P,
    ) -> Result<(ResultSet, CacheOutcome)> {
        let path = self.resolve(path.as_ref());

        if !self.use_cache {
            let rs = self.fetch_and_store(sql, &path)?;
            info!(path = %path.display(), outcome = %CacheOutcome::Refreshed, rows = rs.len(), "cached read");
            return Ok((rs, CacheOutcome::Refreshed));
        }

        if path.exists() {
            match self.reader.read_path(&path) {
                Ok(rs) => {
                    info!(path = %path.display(), outcome = %CacheOutcome::Hit, rows = rs.len(), "cached read");
                    return Ok((rs, CacheOutcome::Hit));
                }
                Err(e) => match self.corrupt_policy {
                    CorruptCachePolicy::Fail => {
                        return Err(ReclassError::corrupt_cache(path, e.to_string()));
                    }
                    CorruptCachePolicy::Refetch => {
                        warn!(path = %path.display(), error = %e, "unreadable cache entry; re-querying");
                        let rs = self.fetch_and_store(sql, &path)?;
                        return Ok((rs, CacheOutcome::Repaired));
                    }
                },
            }
        }

        let rs = self.fetch_and_store(sql, &path)?;
        info!(path = %path.display(), outcome = %CacheOutcome::Miss, rows = rs.len(), "cached read");
        Ok((rs, CacheOutcome::Miss))
    }

    /// Query, persist to `path`, and return the result as read back from disk
    ///
    /// Reading back means a miss and a later hit yield the same value.
    fn fetch_and_store(&self, sql: &str, path: &Path) -> Result<ResultSet> {
        debug!(backend = self.backend.name(), sql_len = sql.len(), "running query");
        let rs = self.backend.run(sql)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        // Write beside the target then rename, so an interrupted write never
        // leaves a partial cache entry.
        let tmp = temp_sibling(path);
        write_csv_path(&rs, &tmp)?;
        fs::rename(&tmp, path)?;

        self.reader
            .read_path(path)
            .map_err(|e| ReclassError::corrupt_cache(path.to_path_buf(), e.to_string()))
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "cache".into());
    name.push(".partial");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_types::Value;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct CountingBackend {
        calls: Cell<usize>,
    }

    impl QueryBackend for CountingBackend {
        fn run(&self, _sql: &str) -> Result<ResultSet> {
            self.calls.set(self.calls.get() + 1);
            ResultSet::from_inferred(
                vec!["month".into(), "total_items".into()],
                vec![
                    vec![Value::infer("2014-05-01"), Value::Int(100)],
                    vec![Value::infer("2014-06-01"), Value::Float(200.0)],
                ],
            )
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn runner(dir: &TempDir) -> CachedQueryRunner<CountingBackend> {
        CachedQueryRunner::new(CountingBackend { calls: Cell::new(0) }).with_cache_dir(dir.path())
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);

        let (first, outcome) = runner.cached_read_with_outcome("SELECT 1", "a.csv").unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        let (second, outcome) = runner.cached_read_with_outcome("SELECT 1", "a.csv").unwrap();
        assert_eq!(outcome, CacheOutcome::Hit);

        assert_eq!(first, second);
        assert_eq!(runner.backend().calls.get(), 1);
        assert!(!dir.path().join("a.csv.partial").exists());
    }

    #[test]
    fn test_refresh_ignores_cache() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        runner.cached_read("SELECT 1", "a.csv").unwrap();

        let runner = runner.with_use_cache(false);
        let (_, outcome) = runner.cached_read_with_outcome("SELECT 1", "a.csv").unwrap();
        assert_eq!(outcome, CacheOutcome::Refreshed);
        assert_eq!(runner.backend().calls.get(), 2);
    }

    #[test]
    fn test_corrupt_cache_fails_by_default() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.csv"), "month,total\n2014-05-01\n").unwrap();
        let runner = runner(&dir);

        let err = runner.cached_read("SELECT 1", "bad.csv").unwrap_err();
        assert!(matches!(err, ReclassError::Cache { .. }));
        assert_eq!(runner.backend().calls.get(), 0);
    }

    #[test]
    fn test_corrupt_cache_refetch_repairs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.csv"), "month,total\n2014-05-01\n").unwrap();
        let runner = runner(&dir).with_corrupt_policy(CorruptCachePolicy::Refetch);

        let (rs, outcome) = runner.cached_read_with_outcome("SELECT 1", "bad.csv").unwrap();
        assert_eq!(outcome, CacheOutcome::Repaired);
        assert_eq!(rs.len(), 2);
        let (_, outcome) = runner.cached_read_with_outcome("SELECT 1", "bad.csv").unwrap();
        assert_eq!(outcome, CacheOutcome::Hit);
    }

    #[test]
    fn test_nested_cache_dirs_created() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir);
        runner.cached_read("SELECT 1", "data/sub/df.csv").unwrap();
        assert!(dir.path().join("data/sub/df.csv").exists());
    }

    #[test]
    fn test_absolute_path_ignores_cache_dir() {
        let dir = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let runner = runner(&dir);
        let target = other.path().join("abs.csv");
        assert_eq!(runner.resolve(&target), target);
    }
}
