use branchdump::{Orchestrator, RestorePhase, RestoreRequest};
use branchdump_broker::testing::FakeManagementApi;
use branchdump_broker::{BrokerOptions, CredentialBroker};
use branchdump_core::{BranchRef, RestoreConfig, RestoreError, TableRange};
use branchdump_mysql::testing::{FakeUpstream, FakeUpstreamConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const USER: &str = "branch-user";
const PASSWORD: &str = "pscale_pw_restore";

fn write_table(dir: &Path, table: &str) {
    std::fs::write(
        dir.join(format!("shop.{}-schema.sql", table)),
        format!("CREATE TABLE `{}` (\n  `id` int NOT NULL\n);\n", table),
    )
    .unwrap();
    std::fs::write(
        dir.join(format!("shop.{}.00001.sql", table)),
        format!("INSERT INTO `{}` VALUES (1),(2),(3);\n", table),
    )
    .unwrap();
}

fn dump(tables: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("shop-schema-create.sql"), "CREATE DATABASE `shop`;\n").unwrap();
    for table in tables {
        write_table(dir.path(), table);
    }
    dir
}

fn request(dir: &TempDir) -> RestoreRequest {
    let config = RestoreConfig {
        source_dir: dir.path().to_path_buf(),
        database: "shop".into(),
        ..Default::default()
    };
    RestoreRequest::new(BranchRef::new("acme", "shop", "main"), config)
}

fn orchestrator(api: &Arc<FakeManagementApi>, options: BrokerOptions, request: RestoreRequest) -> Orchestrator {
    let broker = CredentialBroker::new(api.clone(), options);
    Orchestrator::new(Arc::new(broker), request)
}

async fn upstream(config: FakeUpstreamConfig) -> (FakeUpstream, Arc<FakeManagementApi>) {
    let upstream = FakeUpstream::start(config).await.unwrap();
    let api = Arc::new(FakeManagementApi::new(upstream.addr().to_string(), USER, PASSWORD));
    (upstream, api)
}

#[tokio::test]
async fn test_restore_through_relay_succeeds_and_revokes() {
    let dir = dump(&["orders", "users"]);
    std::fs::write(
        dir.path().join("shop.recent_orders-schema-view.sql"),
        "CREATE VIEW `recent_orders` AS SELECT * FROM `orders`;\n",
    )
    .unwrap();
    let (upstream, api) = upstream(FakeUpstreamConfig::new(USER, PASSWORD)).await;

    let mut request = request(&dir);
    request.config.workers = 2;
    let orchestrator = orchestrator(&api, BrokerOptions::default(), request);
    let outcome = orchestrator.run(CancellationToken::new()).await;

    assert_eq!(outcome.phase, RestorePhase::Succeeded);
    assert_eq!(outcome.exit_code(), 0);
    let summary = outcome.result.unwrap();
    assert_eq!(summary.tables_restored, vec!["orders", "users"]);
    assert_eq!(summary.views_restored, vec!["recent_orders"]);
    assert!(outcome.relay_addr.is_some());
    assert_eq!(outcome.credential_revoked, Some(true));

    assert_eq!(upstream.tables(), vec!["orders", "users"]);
    assert_eq!(upstream.statements_containing("INSERT INTO"), 2);
    assert_eq!(upstream.statements_containing("CREATE DATABASE"), 0);
    assert!(upstream.logins() >= 1);
    assert_eq!(api.issued().len(), 1);
    assert_eq!(api.issued()[0].role, "admin");
    assert_eq!(api.revocations(), vec!["pw-1"]);
    assert_eq!(
        orchestrator.history(),
        vec![
            RestorePhase::Validating,
            RestorePhase::CredentialIssuing,
            RestorePhase::RelayStarting,
            RestorePhase::Restoring,
            RestorePhase::CleaningUp,
            RestorePhase::Succeeded,
        ]
    );
}

#[tokio::test]
async fn test_reversed_range_fails_before_any_api_call() {
    let dir = dump(&["accounts", "logs", "users"]);
    let api = Arc::new(FakeManagementApi::new("127.0.0.1:1", USER, PASSWORD));
    let mut request = request(&dir);
    request.config.tables = TableRange::new(Some("users".into()), Some("accounts".into()));

    let orchestrator = orchestrator(&api, BrokerOptions::default(), request);
    let outcome = orchestrator.run(CancellationToken::new()).await;

    assert_eq!(outcome.phase, RestorePhase::Failed);
    assert!(matches!(outcome.result, Err(RestoreError::Validation(_))));
    assert_eq!(outcome.credential_revoked, None);
    assert_eq!(api.total_calls(), 0);
    assert_eq!(orchestrator.history(), vec![RestorePhase::Validating, RestorePhase::Failed]);
}

#[tokio::test]
async fn test_branch_not_ready_issues_nothing() {
    let dir = dump(&["users"]);
    let api = Arc::new(FakeManagementApi::new("127.0.0.1:1", USER, PASSWORD).not_ready());

    let outcome = orchestrator(&api, BrokerOptions::default(), request(&dir))
        .run(CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, RestorePhase::Failed);
    let err = outcome.result.unwrap_err();
    assert!(matches!(err, RestoreError::NotReady(_)));
    assert!(err.to_string().contains("please try again in a few minutes"));
    assert!(api.issued().is_empty());
    assert!(api.revocations().is_empty());
}

#[tokio::test]
async fn test_collisions_are_reported_and_run_succeeds() {
    let dir = dump(&["accounts", "logs", "users"]);
    let (upstream, api) = upstream(FakeUpstreamConfig::new(USER, PASSWORD).with_table("logs")).await;

    let outcome = orchestrator(&api, BrokerOptions::default(), request(&dir))
        .run(CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, RestorePhase::Succeeded);
    let summary = outcome.result.unwrap();
    assert_eq!(summary.tables_restored, vec!["accounts", "users"]);
    assert_eq!(summary.failed_tables.len(), 1);
    assert_eq!(summary.failed_tables[0].table, "logs");
    assert_eq!(upstream.statements_containing("INSERT INTO `logs`"), 0);
    assert_eq!(api.revocations().len(), 1);
}

#[tokio::test]
async fn test_every_table_failing_still_revokes() {
    let dir = dump(&["accounts", "users"]);
    let (_upstream, api) = upstream(
        FakeUpstreamConfig::new(USER, PASSWORD)
            .with_table("accounts")
            .with_table("users"),
    )
    .await;

    let outcome = orchestrator(&api, BrokerOptions::default(), request(&dir))
        .run(CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, RestorePhase::Failed);
    assert_eq!(outcome.exit_code(), 1);
    assert!(matches!(outcome.result, Err(RestoreError::Statement { .. })));
    assert_eq!(api.revocations().len(), 1);
}

#[tokio::test]
async fn test_bind_failure_revokes_issued_credential() {
    let dir = dump(&["users"]);
    let api = Arc::new(FakeManagementApi::new("127.0.0.1:1", USER, PASSWORD));
    let mut request = request(&dir);
    request.local_addr = "not-an-address".into();

    let outcome = orchestrator(&api, BrokerOptions::default(), request)
        .run(CancellationToken::new())
        .await;

    assert_eq!(outcome.phase, RestorePhase::Failed);
    assert!(matches!(outcome.result, Err(RestoreError::Connection(_))));
    assert!(outcome.relay_addr.is_none());
    assert_eq!(api.revocations().len(), 1);
}

#[tokio::test]
async fn test_cancel_mid_restore_keeps_finished_work_and_revokes() {
    let tables = ["t1", "t2", "t3", "t4", "t5", "t6"];
    let dir = dump(&tables);
    let (upstream, api) = upstream(
        FakeUpstreamConfig::new(USER, PASSWORD).with_query_delay(Duration::from_millis(40)),
    )
    .await;

    let orchestrator = Arc::new(orchestrator(&api, BrokerOptions::default(), request(&dir)));
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });

    while !orchestrator.history().contains(&RestorePhase::Restoring) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(150)).await;
    cancel.cancel();
    let outcome = run.await.unwrap();

    assert_eq!(outcome.phase, RestorePhase::Cancelled);
    assert_eq!(outcome.exit_code(), 130);
    assert!(matches!(outcome.result, Err(RestoreError::Cancelled)));
    assert_eq!(api.revocations().len(), 1);
    assert!(upstream.statements_containing("INSERT INTO") < tables.len());
    // Inserts only ever follow their table's schema.
    assert!(upstream.statements_containing("INSERT INTO") <= upstream.statements_containing("CREATE TABLE"));
}

#[tokio::test]
async fn test_cancel_during_issuance_revokes_the_late_credential() {
    let dir = dump(&["users"]);
    let api = Arc::new(FakeManagementApi::new("127.0.0.1:1", USER, PASSWORD).slow_create(Duration::from_millis(200)));

    let orchestrator = Arc::new(orchestrator(&api, BrokerOptions::default(), request(&dir)));
    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.run(cancel).await }
    });

    while !orchestrator.history().contains(&RestorePhase::CredentialIssuing) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let outcome = run.await.unwrap();

    assert_eq!(outcome.phase, RestorePhase::Cancelled);
    assert!(matches!(outcome.result, Err(RestoreError::Cancelled)));
    assert!(outcome.relay_addr.is_none());
    assert_eq!(outcome.credential_revoked, Some(true));
    assert_eq!(api.issued().len(), 1);
    assert_eq!(api.revocations(), vec!["pw-1"]);
    assert_eq!(api.renewals(), 0);
    assert_eq!(
        orchestrator.history(),
        vec![
            RestorePhase::Validating,
            RestorePhase::CredentialIssuing,
            RestorePhase::CleaningUp,
            RestorePhase::Cancelled,
        ]
    );
}

#[tokio::test]
async fn test_single_renewal_failure_does_not_stop_restore() {
    let dir = dump(&["a", "b", "c"]);
    let config = FakeUpstreamConfig::new(USER, PASSWORD).with_query_delay(Duration::from_millis(40));
    let upstream = FakeUpstream::start(config).await.unwrap();
    let api = Arc::new(
        FakeManagementApi::new(upstream.addr().to_string(), USER, PASSWORD).renewals_script([false]),
    );
    let options = BrokerOptions {
        renew_interval: Some(Duration::from_millis(20)),
        ..Default::default()
    };

    let outcome = orchestrator(&api, options, request(&dir)).run(CancellationToken::new()).await;

    assert_eq!(outcome.phase, RestorePhase::Succeeded);
    assert!(api.renewals() >= 2);
    assert_eq!(upstream.tables(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_two_renewal_failures_fail_the_run() {
    let dir = dump(&["a", "b", "c", "d", "e"]);
    let config = FakeUpstreamConfig::new(USER, PASSWORD).with_query_delay(Duration::from_millis(40));
    let upstream = FakeUpstream::start(config).await.unwrap();
    let api = Arc::new(
        FakeManagementApi::new(upstream.addr().to_string(), USER, PASSWORD).renewals_script([false, false]),
    );
    let options = BrokerOptions {
        renew_interval: Some(Duration::from_millis(20)),
        ..Default::default()
    };

    let outcome = orchestrator(&api, options, request(&dir)).run(CancellationToken::new()).await;

    assert_eq!(outcome.phase, RestorePhase::Failed);
    assert!(matches!(outcome.result, Err(RestoreError::CredentialExpired(_))));
    assert_eq!(api.renewals(), 2);
    assert_eq!(api.revocations().len(), 1);
    assert!(upstream.tables().len() < 5);
}
