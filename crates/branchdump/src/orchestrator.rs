//! Drives one restore run: validate, issue a credential, start the relay and
//! the renewal loop, replay the dump, then clean up whatever was started.

use branchdump_broker::CredentialBroker;
use branchdump_core::{BranchRef, Credential, RestoreConfig, RestoreError, Result};
use branchdump_loader::{Loader, MySqlConnector, RestorePlan, RestoreSummary};
use branchdump_mysql::{AuthMethod, LoginOptions, Relay, RelayConfig, RelayListener};
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Validating,
    CredentialIssuing,
    RelayStarting,
    Restoring,
    CleaningUp,
    Succeeded,
    Failed,
    Cancelled,
}

impl RestorePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RestorePhase::Succeeded | RestorePhase::Failed | RestorePhase::Cancelled)
    }
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestorePhase::Validating => "validating",
            RestorePhase::CredentialIssuing => "issuing credential",
            RestorePhase::RelayStarting => "starting relay",
            RestorePhase::Restoring => "restoring",
            RestorePhase::CleaningUp => "cleaning up",
            RestorePhase::Succeeded => "succeeded",
            RestorePhase::Failed => "failed",
            RestorePhase::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Everything one run needs, fixed before it starts.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub branch: BranchRef,
    pub config: RestoreConfig,
    /// Relay bind address; port 0 picks an ephemeral port.
    pub local_addr: String,
    /// Overrides the branch endpoint from the credential.
    pub remote_addr: Option<String>,
    pub role: String,
    pub credential_ttl: Duration,
    /// Bound on reaching the branch endpoint, and on each loader login through the relay.
    pub connect_timeout: Duration,
    /// Plugin local clients must use against the relay.
    pub auth_method: AuthMethod,
}

impl RestoreRequest {
    pub fn new(branch: BranchRef, config: RestoreConfig) -> Self {
        Self {
            branch,
            config,
            local_addr: "127.0.0.1:0".to_string(),
            remote_addr: None,
            role: branchdump_broker::ADMIN_ROLE.to_string(),
            credential_ttl: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(10),
            auth_method: AuthMethod::NativePassword,
        }
    }
}

#[derive(Debug)]
pub struct RestoreOutcome {
    /// One of the terminal phases.
    pub phase: RestorePhase,
    pub result: Result<RestoreSummary>,
    /// Address the relay listened on, when it got that far.
    pub relay_addr: Option<SocketAddr>,
    /// Whether the API confirmed revocation; `None` when no credential was issued.
    pub credential_revoked: Option<bool>,
}

impl RestoreOutcome {
    /// Process exit code: 0 on success, 130 on cancellation, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.phase {
            RestorePhase::Succeeded => 0,
            RestorePhase::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Background tasks that live as long as the credential is in use.
struct Services {
    token: CancellationToken,
    relay: JoinHandle<Result<()>>,
    renewal: JoinHandle<Result<()>>,
}

pub struct Orchestrator {
    broker: Arc<CredentialBroker>,
    request: RestoreRequest,
    history: Mutex<Vec<RestorePhase>>,
}

impl Orchestrator {
    pub fn new(broker: Arc<CredentialBroker>, request: RestoreRequest) -> Self {
        Self {
            broker,
            request,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Phases entered so far, in order.
    pub fn history(&self) -> Vec<RestorePhase> {
        self.history.lock().clone()
    }

    fn enter(&self, phase: RestorePhase) {
        self.history.lock().push(phase);
        debug!(branch = %self.request.branch, %phase, "restore phase");
    }

    /// Runs the restore to a terminal phase.
    ///
    /// Cancelling `cancel` lets loader workers finish their current statement.
    /// An issuance already sent to the API is awaited, and a credential that
    /// arrives after cancellation is revoked without starting any service.
    /// Cleanup always runs once a credential exists, and its errors never
    /// replace the run's own outcome.
    pub async fn run(&self, cancel: CancellationToken) -> RestoreOutcome {
        self.enter(RestorePhase::Validating);
        let plan = match self.validate(&cancel).await {
            Ok(plan) => plan,
            Err(e) => return self.finish(Err(e), None, None),
        };

        self.enter(RestorePhase::CredentialIssuing);
        let issued = self
            .broker
            .issue(&self.request.branch, &self.request.role, self.request.credential_ttl)
            .await;
        let credential = match issued {
            Ok(credential) => Arc::new(credential),
            Err(e) => return self.finish(Err(e), None, None),
        };
        if cancel.is_cancelled() {
            self.enter(RestorePhase::CleaningUp);
            let revoked = Some(self.broker.revoke(&credential).await);
            return self.finish(Err(RestoreError::Cancelled), None, revoked);
        }

        // From here on the credential exists and must be revoked.
        let abort = cancel.child_token();
        let mut relay_addr = None;
        let mut services = None;
        let result = match self.start_services(&credential, &abort).await {
            Ok((addr, started)) => {
                relay_addr = Some(addr);
                services = Some(started);
                self.enter(RestorePhase::Restoring);
                self.restore(plan, &credential, addr, abort).await
            }
            Err(e) => Err(e),
        };

        self.enter(RestorePhase::CleaningUp);
        let service_error = match services {
            Some(services) => stop_services(services).await,
            None => None,
        };
        let revoked = Some(self.broker.revoke(&credential).await);

        // A failing relay or renewal cancels the loader; report the cause
        // rather than a cancellation nobody asked for.
        let result = match (result, service_error) {
            (Err(RestoreError::Cancelled), Some(cause)) if !cancel.is_cancelled() => Err(cause),
            (result, _) => result,
        };
        self.finish(result, relay_addr, revoked)
    }

    async fn validate(&self, cancel: &CancellationToken) -> Result<RestorePlan> {
        // Local checks first: no remote call happens for a bad request.
        let plan = RestorePlan::build(&self.request.config)?;
        info!(
            branch = %self.request.branch,
            tables = plan.tables.len(),
            views = plan.views.len(),
            "restore plan ready"
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(RestoreError::Cancelled),
            checked = self.broker.check_branch(&self.request.branch) => checked,
        }?;
        Ok(plan)
    }

    async fn start_services(
        &self,
        credential: &Arc<Credential>,
        abort: &CancellationToken,
    ) -> Result<(SocketAddr, Services)> {
        self.enter(RestorePhase::RelayStarting);
        let listener = RelayListener::bind(&self.request.local_addr).await?;
        let addr = listener.local_addr();
        let mut config = RelayConfig::from_credential(credential, self.request.remote_addr.clone());
        config.connect_timeout = self.request.connect_timeout;
        let relay = Relay::new(config);
        info!(
            local = %addr,
            remote = %relay.config().upstream_addr,
            "relay ready"
        );

        // Services outlive the loader's cancellation so in-flight statements
        // can finish; cleanup stops them.
        let token = CancellationToken::new();

        let relay_task = {
            let token = token.clone();
            let abort = abort.clone();
            let method = self.request.auth_method;
            tokio::spawn(async move {
                let served = relay.serve(listener, method, token).await;
                if let Err(e) = &served {
                    error!("relay stopped unexpectedly: {}", e);
                    abort.cancel();
                }
                served.map_err(RestoreError::from)
            })
        };

        let renewal_task = {
            let token = token.clone();
            let abort = abort.clone();
            let broker = self.broker.clone();
            let credential = credential.clone();
            tokio::spawn(async move {
                let renewed = broker.renew(&credential, token).await;
                if let Err(e) = &renewed {
                    error!("credential renewal failed, stopping the restore: {}", e);
                    abort.cancel();
                }
                renewed
            })
        };

        Ok((
            addr,
            Services {
                token,
                relay: relay_task,
                renewal: renewal_task,
            },
        ))
    }

    async fn restore(
        &self,
        plan: RestorePlan,
        credential: &Credential,
        relay_addr: SocketAddr,
        abort: CancellationToken,
    ) -> Result<RestoreSummary> {
        let config = &self.request.config;
        let login = LoginOptions::new(credential.username.clone(), credential.secret.clone());
        // A login through the relay waits on the relay's own upstream handshake.
        let connector = MySqlConnector::new(relay_addr.to_string(), login, config.database.clone())
            .with_timeout(self.request.connect_timeout * 3);
        let loader = Loader::new(config.clone(), Arc::new(connector));
        loader.run_plan(plan, abort).await
    }

    fn finish(
        &self,
        result: Result<RestoreSummary>,
        relay_addr: Option<SocketAddr>,
        credential_revoked: Option<bool>,
    ) -> RestoreOutcome {
        let phase = match &result {
            Ok(_) => RestorePhase::Succeeded,
            Err(e) if e.is_cancelled() => RestorePhase::Cancelled,
            Err(_) => RestorePhase::Failed,
        };
        self.enter(phase);
        match &result {
            Ok(summary) => info!(
                restored = summary.tables_restored.len(),
                failed = summary.failed_tables.len(),
                elapsed = ?summary.elapsed,
                "restore succeeded"
            ),
            Err(e) if e.is_cancelled() => warn!("restore cancelled"),
            Err(e) => error!("restore failed: {}", e),
        }
        RestoreOutcome {
            phase,
            result,
            relay_addr,
            credential_revoked,
        }
    }
}

/// Stops relay and renewal and waits for both. Returns the first failure
/// either task hit on its own.
async fn stop_services(services: Services) -> Option<RestoreError> {
    services.token.cancel();
    let mut failure = None;
    for (name, task) in [("relay", services.relay), ("renewal", services.renewal)] {
        match task.await {
            Ok(Ok(())) => debug!("{} stopped", name),
            Ok(Err(e)) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
            Err(e) => warn!("{} task did not finish cleanly: {}", name, e),
        }
    }
    failure
}
