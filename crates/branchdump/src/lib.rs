//! Restores a dump into a database branch: issues a short-lived credential,
//! runs a local authenticating relay to the branch and replays the dump
//! through it.

pub mod cli;
pub mod logging;
pub mod orchestrator;
pub mod settings;

pub use orchestrator::{Orchestrator, RestoreOutcome, RestorePhase, RestoreRequest};
pub use settings::Settings;
