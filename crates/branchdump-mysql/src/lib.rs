//! MySQL wire protocol pieces for branch restores: packet codec, a small
//! client used to replay dump statements, and the authenticating relay.

pub mod client;
pub mod error;
pub mod protocol;
pub mod relay;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{Connection, LoginOptions, QueryResult};
pub use error::WireError;
pub use protocol::AuthMethod;
pub use relay::{Relay, RelayConfig, RelayError, RelayListener};
