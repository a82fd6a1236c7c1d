pub mod config;
pub mod credential;
pub mod error;
pub mod mode;

pub use config::{RestoreConfig, TableRange};
pub use credential::{BranchRef, Credential, Secret};
pub use error::{RestoreError, Result, TableFailure};
pub use mode::TableSteps;

/// Default upper bound for a single statement sent to the branch (16 MiB).
pub const DEFAULT_MAX_QUERY_SIZE: usize = 16 * 1024 * 1024;

/// Default interval between progress reports.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10_000;

/// Port appended to credential hostnames that do not carry one.
pub const DEFAULT_MYSQL_PORT: u16 = 3306;
