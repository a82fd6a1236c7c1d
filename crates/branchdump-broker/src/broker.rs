use crate::api::{CreatePasswordRequest, ManagementApi};
use branchdump_core::{BranchRef, Credential, RestoreError, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive renewal failures tolerated before the credential is given up.
const MAX_RENEW_FAILURES: u32 = 2;

/// Shortest pause between two renewal calls when the cadence is derived from the lease.
const MIN_RENEW_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Prefix of the generated password name.
    pub name_prefix: String,
    /// Bound on the revoke call, applied independently of any cancellation.
    pub revoke_timeout: Duration,
    /// Fixed renewal period. Defaults to a quarter of the remaining lease.
    pub renew_interval: Option<Duration>,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            name_prefix: "branchdump-restore".to_string(),
            revoke_timeout: Duration::from_secs(5),
            renew_interval: None,
        }
    }
}

/// Owns the lifecycle of the one credential a restore run uses.
pub struct CredentialBroker {
    api: Arc<dyn ManagementApi>,
    options: BrokerOptions,
    revoked: AtomicBool,
}

impl CredentialBroker {
    pub fn new(api: Arc<dyn ManagementApi>, options: BrokerOptions) -> Self {
        Self {
            api,
            options,
            revoked: AtomicBool::new(false),
        }
    }

    /// Fails with `NotFound` for a missing branch and `NotReady` for one still provisioning.
    pub async fn check_branch(&self, branch: &BranchRef) -> Result<()> {
        let status = self.api.get_branch(branch).await.map_err(|e| {
            if e.is_not_found() {
                RestoreError::NotFound(format!(
                    "branch {} does not exist in database {} (organization: {})",
                    branch.branch, branch.database, branch.organization
                ))
            } else {
                e.into()
            }
        })?;
        if !status.ready {
            return Err(RestoreError::NotReady(branch.to_string()));
        }
        Ok(())
    }

    pub async fn issue(&self, branch: &BranchRef, role: &str, ttl: Duration) -> Result<Credential> {
        self.check_branch(branch).await?;

        let request = CreatePasswordRequest {
            role: role.to_string(),
            name: password_name(&self.options.name_prefix),
            ttl: ttl.as_secs(),
        };
        let issued = self.api.create_password(branch, &request).await?;
        let expires_at = issued.expires_at.unwrap_or_else(|| Utc::now() + lease_delta(ttl));
        info!(
            %branch,
            name = %request.name,
            username = %issued.username,
            %expires_at,
            "issued branch credential"
        );
        Ok(Credential {
            id: issued.id,
            branch: branch.clone(),
            username: issued.username,
            secret: issued.secret,
            remote_host: issued.hostname,
            expires_at,
        })
    }

    /// Keeps `credential` alive until `cancel` fires.
    ///
    /// A single failed renewal is only logged. Two consecutive failures, or
    /// reaching the expiry without a successful renewal, end the loop with
    /// `CredentialExpired`.
    pub async fn renew(&self, credential: &Credential, cancel: CancellationToken) -> Result<()> {
        let mut lease = remaining(credential.expires_at);
        let mut deadline = Instant::now() + lease;
        let mut failures = 0u32;
        let mut attempts = 0u32;

        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let wait = renew_wait(self.options.renew_interval, lease, left, attempts);
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(id = %credential.id, "renewal stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            attempts += 1;
            match self.api.renew_password(&credential.branch, &credential.id).await {
                Ok(expires_at) => {
                    failures = 0;
                    lease = expires_at.map(remaining).unwrap_or(lease);
                    deadline = Instant::now() + lease;
                    debug!(id = %credential.id, ?expires_at, "renewed branch credential");
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_RENEW_FAILURES {
                        return Err(RestoreError::CredentialExpired(format!(
                            "renewal failed {} times in a row: {}",
                            failures, e
                        )));
                    }
                    if Instant::now() >= deadline {
                        return Err(RestoreError::CredentialExpired(format!(
                            "credential expired before it could be renewed: {}",
                            e
                        )));
                    }
                    warn!(id = %credential.id, "failed to renew branch credential, retrying: {}", e);
                }
            }
        }
    }

    /// Deletes the credential. Only the first call does anything; errors are
    /// logged. Returns whether the API confirmed the deletion.
    pub async fn revoke(&self, credential: &Credential) -> bool {
        if self.revoked.swap(true, Ordering::SeqCst) {
            debug!(id = %credential.id, "credential already revoked");
            return false;
        }
        let delete = self.api.delete_password(&credential.branch, &credential.id);
        match tokio::time::timeout(self.options.revoke_timeout, delete).await {
            Ok(Ok(())) => {
                info!(id = %credential.id, "revoked branch credential");
                true
            }
            Ok(Err(e)) => {
                warn!(id = %credential.id, "failed to delete credentials: {}", e);
                false
            }
            Err(_) => {
                warn!(
                    id = %credential.id,
                    "failed to delete credentials: timed out after {:?}", self.options.revoke_timeout
                );
                false
            }
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }
}

fn password_name(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, Utc::now().format("%Y-%m-%d-%H%M%S"), &suffix[..6])
}

/// Pause before the next renewal: the configured interval, or a quarter of
/// the current lease, never past half of what is left. An expired lease is
/// renewed at once, but only the first time.
fn renew_wait(interval: Option<Duration>, lease: Duration, left: Duration, attempts: u32) -> Duration {
    let cadence = interval.unwrap_or_else(|| (lease / 4).max(MIN_RENEW_WAIT));
    let wait = cadence.min(left / 2);
    if attempts == 0 {
        wait
    } else {
        wait.max(cadence.min(MIN_RENEW_WAIT))
    }
}

fn lease_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

fn remaining(expires_at: chrono::DateTime<Utc>) -> Duration {
    (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_name_is_unique_and_prefixed() {
        let a = password_name("branchdump-restore");
        let b = password_name("branchdump-restore");
        assert!(a.starts_with("branchdump-restore-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_remaining_is_zero_for_past_expiry() {
        assert_eq!(remaining(Utc::now() - chrono::Duration::seconds(10)), Duration::ZERO);
        assert!(remaining(Utc::now() + chrono::Duration::seconds(60)) > Duration::from_secs(50));
    }
}
