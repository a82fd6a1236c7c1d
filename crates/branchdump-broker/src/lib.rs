//! Short-lived branch credentials: issuance, renewal and revocation against
//! the management API.

pub mod api;
pub mod broker;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{ApiConfig, ApiError, BranchStatus, CreatePasswordRequest, HttpManagementApi, IssuedPassword, ManagementApi};
pub use broker::{BrokerOptions, CredentialBroker};

/// Role requested for restore credentials.
pub const ADMIN_ROLE: &str = "admin";
