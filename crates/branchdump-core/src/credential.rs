use chrono::{DateTime, Utc};
use std::fmt;

/// Identifies a branch of a database inside an organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub organization: String,
    pub database: String,
    pub branch: String,
}

impl BranchRef {
    pub fn new(
        organization: impl Into<String>,
        database: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            organization: organization.into(),
            database: database.into(),
            branch: branch.into(),
        }
    }
}

impl fmt::Display for BranchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization, self.database, self.branch)
    }
}

/// A password that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Short-lived administrator credential for one branch.
///
/// Issued once per restore run. Relay and loader only ever borrow it.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Identifier used by the management API to renew or revoke the credential.
    pub id: String,
    /// Branch the credential grants access to.
    pub branch: BranchRef,
    pub username: String,
    pub secret: Secret,
    /// Host (optionally `host:port`) of the branch endpoint.
    pub remote_host: String,
    /// Expiry at issuance. Renewals extend the lease tracked by the broker.
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    /// Address to dial upstream, appending the MySQL port when the host has none.
    pub fn remote_addr(&self) -> String {
        if self.remote_host.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
            self.remote_host.clone()
        } else {
            format!("{}:{}", self.remote_host, crate::DEFAULT_MYSQL_PORT)
        }
    }
}
