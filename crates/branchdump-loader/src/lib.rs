//! Replays a mydumper-style dump directory against a MySQL endpoint with a
//! pool of workers, one table per worker at a time.

pub mod dump;
pub mod executor;
pub mod loader;
pub mod progress;
pub mod statements;

pub use dump::{DumpLayout, TableFiles, ViewFile};
pub use executor::{Connector, ExecError, MySqlConnector, StatementExecutor};
pub use loader::{Loader, RestorePlan, RestoreSummary};
pub use progress::{Progress, ProgressSnapshot};
