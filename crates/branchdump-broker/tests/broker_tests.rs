use branchdump_broker::testing::FakeManagementApi;
use branchdump_broker::{BrokerOptions, CredentialBroker, ADMIN_ROLE};
use branchdump_core::{BranchRef, RestoreError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TTL: Duration = Duration::from_secs(300);

fn branch() -> BranchRef {
    BranchRef::new("acme", "shop", "main")
}

fn broker(api: &Arc<FakeManagementApi>) -> CredentialBroker {
    CredentialBroker::new(api.clone(), BrokerOptions::default())
}

fn fake() -> FakeManagementApi {
    FakeManagementApi::new("shop.connect.example.com", "restore-user", "pscale_pw_1")
}

#[tokio::test]
async fn test_issue_returns_credential_for_ready_branch() {
    let api = Arc::new(fake());
    let credential = broker(&api).issue(&branch(), ADMIN_ROLE, TTL).await.unwrap();

    assert_eq!(credential.username, "restore-user");
    assert_eq!(credential.secret.expose(), "pscale_pw_1");
    assert_eq!(credential.remote_addr(), "shop.connect.example.com:3306");
    assert_eq!(credential.branch, branch());

    let issued = api.issued();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].role, "admin");
    assert_eq!(issued[0].ttl, 300);
    assert!(issued[0].name.starts_with("branchdump-restore-"));
}

#[tokio::test]
async fn test_issue_distinguishes_not_ready_and_missing_branch() {
    let api = Arc::new(fake().not_ready());
    let err = broker(&api).issue(&branch(), ADMIN_ROLE, TTL).await.unwrap_err();
    assert!(matches!(err, RestoreError::NotReady(_)));
    assert!(err.to_string().contains("not ready yet"));
    assert!(api.issued().is_empty());

    let api = Arc::new(fake().branch_error(404));
    let err = broker(&api).issue(&branch(), ADMIN_ROLE, TTL).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Not Found: branch main does not exist in database shop (organization: acme)"
    );

    let api = Arc::new(fake().branch_error(401));
    let err = broker(&api).issue(&branch(), ADMIN_ROLE, TTL).await.unwrap_err();
    assert!(matches!(err, RestoreError::Authorization(_)));
}

#[tokio::test(start_paused = true)]
async fn test_single_renewal_failure_is_tolerated() {
    let api = Arc::new(fake().renewals_script([false, true, true]));
    let broker = Arc::new(broker(&api));
    let credential = broker.issue(&branch(), ADMIN_ROLE, TTL).await.unwrap();

    let cancel = CancellationToken::new();
    let renewing = {
        let broker = broker.clone();
        let credential = credential.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { broker.renew(&credential, cancel).await })
    };

    tokio::time::sleep(Duration::from_secs(400)).await;
    assert!(!renewing.is_finished());
    cancel.cancel();

    assert!(renewing.await.unwrap().is_ok());
    assert!(api.renewals() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_two_consecutive_renewal_failures_escalate() {
    let api = Arc::new(fake().renewals_script([true, false, false]));
    let broker = broker(&api);
    let credential = broker.issue(&branch(), ADMIN_ROLE, TTL).await.unwrap();

    let err = broker
        .renew(&credential, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RestoreError::CredentialExpired(_)));
    assert_eq!(api.renewals(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_renews_once_then_follows_the_new_lease() {
    let api = Arc::new(fake());
    let broker = Arc::new(broker(&api));
    let mut credential = broker.issue(&branch(), ADMIN_ROLE, TTL).await.unwrap();
    credential.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);

    let cancel = CancellationToken::new();
    let renewing = {
        let broker = broker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { broker.renew(&credential, cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(api.renewals(), 1);

    // The renewed 300s lease puts the next call a quarter of it away.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.renewals(), 1);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(api.renewals(), 2);

    cancel.cancel();
    assert!(renewing.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_expired_credential_escalates_on_first_failure() {
    let api = Arc::new(fake().with_lease(Duration::ZERO).renewals_script([false]));
    let broker = broker(&api);
    let credential = broker.issue(&branch(), ADMIN_ROLE, TTL).await.unwrap();

    let err = broker
        .renew(&credential, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expired before it could be renewed"));
    assert_eq!(api.renewals(), 1);
}

#[tokio::test]
async fn test_revoke_runs_once_and_swallows_errors() {
    let api = Arc::new(fake().failing_delete());
    let broker = broker(&api);
    let credential = broker.issue(&branch(), ADMIN_ROLE, TTL).await.unwrap();

    assert!(!broker.revoke(&credential).await);
    assert!(!broker.revoke(&credential).await);
    assert!(broker.is_revoked());
    assert_eq!(api.revocations(), vec![credential.id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_revoke_is_bounded_by_its_own_timeout() {
    let api = Arc::new(fake().slow_delete(Duration::from_secs(60)));
    let broker = broker(&api);
    let credential = broker.issue(&branch(), ADMIN_ROLE, TTL).await.unwrap();

    let started = tokio::time::Instant::now();
    assert!(!broker.revoke(&credential).await);
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(api.revocations().len(), 1);
}
