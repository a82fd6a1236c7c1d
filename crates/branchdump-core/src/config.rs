use crate::error::{RestoreError, Result};
use crate::mode::TableSteps;
use std::path::PathBuf;
use std::time::Duration;

/// Inclusive, lexicographic bound on the tables a run touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl TableRange {
    pub fn new(start: Option<String>, end: Option<String>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, table: &str) -> bool {
        if let Some(start) = &self.start {
            if table < start.as_str() {
                return false;
            }
        }
        if let Some(end) = &self.end {
            if table > end.as_str() {
                return false;
            }
        }
        true
    }

    pub fn validate(&self) -> Result<()> {
        if let (Some(start), Some(end)) = (&self.start, &self.end) {
            if end < start {
                return Err(RestoreError::Validation(format!(
                    "provided ending table {} must come alphabetically after your provided starting table {} for the restore to continue",
                    end, start
                )));
            }
        }
        Ok(())
    }
}

/// Everything a restore run needs to know about the dump and how to replay it.
///
/// Built once from user input and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    pub source_dir: PathBuf,
    pub overwrite_tables: bool,
    pub schema_only: bool,
    pub data_only: bool,
    pub show_details: bool,
    pub tables: TableRange,
    pub allow_different_destination: bool,
    pub max_query_size: usize,
    pub workers: usize,
    /// Name of the database on the destination branch.
    pub database: String,
    pub poll_interval_ms: u64,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::new(),
            overwrite_tables: false,
            schema_only: false,
            data_only: false,
            show_details: false,
            tables: TableRange::default(),
            allow_different_destination: false,
            max_query_size: crate::DEFAULT_MAX_QUERY_SIZE,
            workers: 1,
            database: String::new(),
            poll_interval_ms: crate::DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl RestoreConfig {
    /// Checks the inputs that can be checked without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.source_dir.as_os_str().is_empty() {
            return Err(RestoreError::Validation(
                "--dir flag is missing, it's needed to restore the database".into(),
            ));
        }
        if self.database.is_empty() {
            return Err(RestoreError::Validation("destination database name is missing".into()));
        }
        if self.workers == 0 {
            return Err(RestoreError::Validation("worker count must be at least 1".into()));
        }
        if self.max_query_size == 0 {
            return Err(RestoreError::Validation("max query size must be greater than 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(RestoreError::Validation("poll interval must be greater than 0".into()));
        }
        for (flag, table) in [("starting", &self.tables.start), ("ending", &self.tables.end)] {
            if table.as_deref() == Some("") {
                return Err(RestoreError::Validation(format!("{} table must not be empty", flag)));
            }
        }
        self.tables.validate()
    }

    pub fn steps(&self) -> TableSteps {
        TableSteps::resolve(self.schema_only, self.data_only, self.overwrite_tables)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RestoreConfig {
        RestoreConfig {
            source_dir: PathBuf::from("/tmp/dump"),
            database: "shop".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_range_is_inclusive() {
        let range = TableRange::new(Some("logs".into()), Some("users".into()));
        assert!(!range.contains("accounts"));
        assert!(range.contains("logs"));
        assert!(range.contains("orders"));
        assert!(range.contains("users"));
        assert!(!range.contains("videos"));
    }

    #[test]
    fn test_open_range_contains_everything() {
        assert!(TableRange::default().contains("anything"));
        assert!(TableRange::new(Some("b".into()), None).contains("zzz"));
        assert!(TableRange::new(None, Some("b".into())).contains("a"));
    }

    #[test]
    fn test_reversed_range_fails_validation() {
        let mut cfg = config();
        cfg.tables = TableRange::new(Some("users".into()), Some("logs".into()));
        match cfg.validate() {
            Err(RestoreError::Validation(msg)) => assert!(msg.contains("alphabetically")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_same_start_and_end_is_valid() {
        let mut cfg = config();
        cfg.tables = TableRange::new(Some("users".into()), Some("users".into()));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_missing_dir_and_zero_workers() {
        let mut cfg = config();
        cfg.source_dir = PathBuf::new();
        assert!(matches!(cfg.validate(), Err(RestoreError::Validation(_))));

        let mut cfg = config();
        cfg.workers = 0;
        assert!(matches!(cfg.validate(), Err(RestoreError::Validation(_))));
    }
}
