use async_trait::async_trait;
use branchdump_core::{BranchRef, RestoreError, Secret};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_API_URL: &str = "https://api.planetscale.com/v1";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("API Error {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Network Error: {0}")]
    Network(String),
    #[error("Decode Error: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

impl From<ApiError> for RestoreError {
    fn from(err: ApiError) -> Self {
        match &err {
            ApiError::Status { status: 404, .. } => RestoreError::NotFound(err.to_string()),
            ApiError::Status { status: 401 | 403, .. } => RestoreError::Authorization(err.to_string()),
            ApiError::Status { status, .. } if *status == 429 || *status >= 500 => {
                RestoreError::Transient(err.to_string())
            }
            ApiError::Status { .. } => RestoreError::Validation(err.to_string()),
            ApiError::Network(_) | ApiError::Decode(_) => RestoreError::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchStatus {
    pub name: String,
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePasswordRequest {
    pub role: String,
    pub name: String,
    /// Lifetime in seconds.
    pub ttl: u64,
}

/// A freshly created branch password. The plain text is only returned once.
#[derive(Clone)]
pub struct IssuedPassword {
    pub id: String,
    pub username: String,
    pub secret: Secret,
    pub hostname: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for IssuedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedPassword")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("hostname", &self.hostname)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Calls the restore flow issues against the management API.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn get_branch(&self, branch: &BranchRef) -> Result<BranchStatus, ApiError>;

    async fn create_password(
        &self,
        branch: &BranchRef,
        request: &CreatePasswordRequest,
    ) -> Result<IssuedPassword, ApiError>;

    /// Extends the password's lease and returns the new expiry when the API reports one.
    async fn renew_password(&self, branch: &BranchRef, id: &str) -> Result<Option<DateTime<Utc>>, ApiError>;

    async fn delete_password(&self, branch: &BranchRef, id: &str) -> Result<(), ApiError>;
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub token_id: String,
    pub token: Secret,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(token_id: impl Into<String>, token: Secret) -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            token_id: token_id.into(),
            token,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Deserialize)]
struct PasswordBody {
    id: String,
    username: String,
    plain_text: String,
    access_host_url: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RenewBody {
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// [`ManagementApi`] over HTTPS with service-token authentication.
pub struct HttpManagementApi {
    client: Client,
    config: ApiConfig,
}

impl HttpManagementApi {
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("branchdump/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn branch_url(&self, branch: &BranchRef) -> String {
        format!(
            "{}/organizations/{}/databases/{}/branches/{}",
            self.config.base_url.trim_end_matches('/'),
            branch.organization,
            branch.database,
            branch.branch
        )
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(
            reqwest::header::AUTHORIZATION,
            format!("{}:{}", self.config.token_id, self.config.token.expose()),
        )
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.message)
            .ok()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| status_text(status));
        Err(ApiError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

fn status_text(status: StatusCode) -> String {
    status.canonical_reason().unwrap_or("unexpected response").to_string()
}

#[async_trait]
impl ManagementApi for HttpManagementApi {
    async fn get_branch(&self, branch: &BranchRef) -> Result<BranchStatus, ApiError> {
        let url = self.branch_url(branch);
        debug!(%url, "fetching branch");
        self.send(self.client.get(&url))
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    async fn create_password(
        &self,
        branch: &BranchRef,
        request: &CreatePasswordRequest,
    ) -> Result<IssuedPassword, ApiError> {
        let url = format!("{}/passwords", self.branch_url(branch));
        debug!(%url, name = %request.name, role = %request.role, "creating password");
        let body: PasswordBody = self
            .send(self.client.post(&url).json(request))
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(IssuedPassword {
            id: body.id,
            username: body.username,
            secret: Secret::new(body.plain_text),
            hostname: body.access_host_url,
            expires_at: body.expires_at,
        })
    }

    async fn renew_password(&self, branch: &BranchRef, id: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
        let url = format!("{}/passwords/{}/renew", self.branch_url(branch), id);
        let body: RenewBody = self
            .send(self.client.post(&url))
            .await?
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(body.expires_at)
    }

    async fn delete_password(&self, branch: &BranchRef, id: &str) -> Result<(), ApiError> {
        let url = format!("{}/passwords/{}", self.branch_url(branch), id);
        self.send(self.client.delete(&url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping() {
        let status = |status| ApiError::Status {
            status,
            message: "x".into(),
        };
        assert!(matches!(RestoreError::from(status(404)), RestoreError::NotFound(_)));
        assert!(matches!(RestoreError::from(status(403)), RestoreError::Authorization(_)));
        assert!(matches!(RestoreError::from(status(503)), RestoreError::Transient(_)));
        assert!(matches!(RestoreError::from(status(422)), RestoreError::Validation(_)));
        assert!(matches!(
            RestoreError::from(ApiError::Network("reset".into())),
            RestoreError::Transient(_)
        ));
        assert!(status(404).is_not_found());
    }

    #[test]
    fn test_branch_url() {
        let mut config = ApiConfig::new("id", Secret::new("token"));
        config.base_url = "http://localhost:9000/v1/".into();
        let api = HttpManagementApi::new(config).unwrap();
        assert_eq!(
            api.branch_url(&BranchRef::new("acme", "shop", "main")),
            "http://localhost:9000/v1/organizations/acme/databases/shop/branches/main"
        );
    }

    #[test]
    fn test_password_body_decodes() {
        let body: PasswordBody = serde_json::from_str(
            r#"{"id":"pw1","username":"u","plain_text":"p","access_host_url":"aws.connect.example.com","expires_at":null}"#,
        )
        .unwrap();
        assert_eq!(body.access_host_url, "aws.connect.example.com");
        assert!(body.expires_at.is_none());
    }
}
