//! In-memory [`ManagementApi`] that records every call.

use crate::api::{ApiError, BranchStatus, CreatePasswordRequest, IssuedPassword, ManagementApi};
use async_trait::async_trait;
use branchdump_core::{BranchRef, Secret};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Default)]
struct Calls {
    branch_lookups: usize,
    issued: Vec<CreatePasswordRequest>,
    renewals: usize,
    revocations: Vec<String>,
}

pub struct FakeManagementApi {
    hostname: String,
    username: String,
    password: String,
    branch_status: Option<u16>,
    ready: bool,
    lease: Duration,
    create_delay: Option<Duration>,
    delete_fails: bool,
    delete_delay: Option<Duration>,
    /// Scripted renewal outcomes, `false` meaning failure. Renewals succeed once it runs out.
    renew_script: Mutex<VecDeque<bool>>,
    calls: Mutex<Calls>,
}

impl FakeManagementApi {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            password: password.into(),
            branch_status: None,
            ready: true,
            lease: Duration::from_secs(300),
            create_delay: None,
            delete_fails: false,
            delete_delay: None,
            renew_script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Calls::default()),
        }
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    /// Branch lookups fail with the given HTTP status.
    pub fn branch_error(mut self, status: u16) -> Self {
        self.branch_status = Some(status);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn renewals_script(self, outcomes: impl IntoIterator<Item = bool>) -> Self {
        self.renew_script.lock().extend(outcomes);
        self
    }

    /// Password creation takes `delay` before the password exists.
    pub fn slow_create(mut self, delay: Duration) -> Self {
        self.create_delay = Some(delay);
        self
    }

    pub fn failing_delete(mut self) -> Self {
        self.delete_fails = true;
        self
    }

    pub fn slow_delete(mut self, delay: Duration) -> Self {
        self.delete_delay = Some(delay);
        self
    }

    pub fn branch_lookups(&self) -> usize {
        self.calls.lock().branch_lookups
    }

    pub fn issued(&self) -> Vec<CreatePasswordRequest> {
        self.calls.lock().issued.clone()
    }

    pub fn renewals(&self) -> usize {
        self.calls.lock().renewals
    }

    pub fn revocations(&self) -> Vec<String> {
        self.calls.lock().revocations.clone()
    }

    /// Total calls that reached the API.
    pub fn total_calls(&self) -> usize {
        let calls = self.calls.lock();
        calls.branch_lookups + calls.issued.len() + calls.renewals + calls.revocations.len()
    }

    fn expiry(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::minutes(5))
    }
}

#[async_trait]
impl ManagementApi for FakeManagementApi {
    async fn get_branch(&self, branch: &BranchRef) -> Result<BranchStatus, ApiError> {
        self.calls.lock().branch_lookups += 1;
        if let Some(status) = self.branch_status {
            return Err(ApiError::Status {
                status,
                message: format!("branch {} lookup failed", branch),
            });
        }
        Ok(BranchStatus {
            name: branch.branch.clone(),
            ready: self.ready,
        })
    }

    async fn create_password(
        &self,
        _branch: &BranchRef,
        request: &CreatePasswordRequest,
    ) -> Result<IssuedPassword, ApiError> {
        if let Some(delay) = self.create_delay {
            tokio::time::sleep(delay).await;
        }
        let mut calls = self.calls.lock();
        calls.issued.push(request.clone());
        Ok(IssuedPassword {
            id: format!("pw-{}", calls.issued.len()),
            username: self.username.clone(),
            secret: Secret::new(self.password.clone()),
            hostname: self.hostname.clone(),
            expires_at: Some(self.expiry()),
        })
    }

    async fn renew_password(&self, _branch: &BranchRef, id: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
        self.calls.lock().renewals += 1;
        match self.renew_script.lock().pop_front() {
            Some(false) => Err(ApiError::Status {
                status: 503,
                message: format!("renewing {} failed", id),
            }),
            _ => Ok(Some(self.expiry())),
        }
    }

    async fn delete_password(&self, _branch: &BranchRef, id: &str) -> Result<(), ApiError> {
        self.calls.lock().revocations.push(id.to_string());
        if let Some(delay) = self.delete_delay {
            tokio::time::sleep(delay).await;
        }
        if self.delete_fails {
            return Err(ApiError::Network("connection reset".into()));
        }
        Ok(())
    }
}
