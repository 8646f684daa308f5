//! End-to-end tests for logins and the certificate authority's lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{loopback_config, Cluster, NodeSpec, PASSWORD};
use tokio_util::sync::CancellationToken;
use warden_auth::{otp, AuthMethod, Expiry, PrivateKey, Role};
use warden_client::{connect_to_node, ClientError, HostTrust, TunnelClient};
use warden_core::AuditAction;
use warden_daemon::authserver::{open_authority, CA_STATE_KEY};
use warden_daemon::backend::{self, Backend, SqliteBackend};
use warden_daemon::identity::load_or_create_key;
use warden_daemon::Service;
use warden_proto::ErrorCode;

fn assert_rejected(result: Result<TunnelClient, ClientError>, expected: ErrorCode) {
    match result {
        Err(ClientError::AuthenticationFailed { code, .. }) => assert_eq!(code, expected),
        Err(e) => panic!("expected {expected}, got {e}"),
        Ok(_) => panic!("expected {expected}, login succeeded"),
    }
}

#[tokio::test]
async fn test_password_login_issues_user_cert() {
    let cluster = Cluster::start().await;
    let secret = cluster.enroll("alice", Role::User);

    let client = cluster.password_login("alice", &secret, 0).await.unwrap();
    let key = PrivateKey::generate();
    let cert = client
        .generate_user_cert(&key.public_key(), Duration::from_secs(600))
        .await
        .unwrap();
    assert_eq!(cert.principal(), "alice");
    assert_eq!(cert.role(), Role::User);
    assert!(matches!(cert.expiry(), Expiry::At(_)));

    let actions = cluster.audit.actions();
    assert!(actions.contains(&AuditAction::LoginSucceeded));
    assert!(actions.contains(&AuditAction::CertIssued));
}

#[tokio::test]
async fn test_one_time_codes_are_single_use() {
    let cluster = Cluster::start().await;
    let secret = cluster.enroll("alice", Role::User);

    cluster.password_login("alice", &secret, 0).await.unwrap();
    assert_rejected(
        cluster.password_login("alice", &secret, 0).await,
        ErrorCode::ReplayedOtp,
    );
    // Later codes within the lookahead window still work.
    cluster.password_login("alice", &secret, 3).await.unwrap();
    assert_rejected(
        cluster.password_login("alice", &secret, 2).await,
        ErrorCode::ReplayedOtp,
    );
}

#[tokio::test]
async fn test_wrong_code_and_password_rejected() {
    let cluster = Cluster::start().await;
    let secret = cluster.enroll("alice", Role::User);

    let bad_code = (0u32..)
        .map(|n| format!("{n:06}"))
        .find(|code| (0..=20).all(|counter| otp::hotp(&secret, counter) != *code))
        .unwrap();
    let method = AuthMethod::password(PASSWORD, bad_code);
    assert_rejected(
        TunnelClient::connect(&cluster.auth_addr(), cluster.trust(), "alice", method).await,
        ErrorCode::InvalidOtp,
    );

    let method = AuthMethod::password("wrong", otp::hotp(&secret, 0));
    assert_rejected(
        TunnelClient::connect(&cluster.auth_addr(), cluster.trust(), "alice", method).await,
        ErrorCode::AuthenticationFailed,
    );

    // Neither failure consumed code 0.
    cluster.password_login("alice", &secret, 0).await.unwrap();
    assert!(cluster.audit.actions().contains(&AuditAction::LoginFailed));
}

#[tokio::test]
async fn test_unknown_host_fingerprint_rejected() {
    let cluster = Cluster::start().await;
    let secret = cluster.enroll("alice", Role::User);

    let stranger = PrivateKey::generate().public_key().fingerprint();
    let result = TunnelClient::connect(
        &cluster.auth_addr(),
        HostTrust::Fingerprint(stranger),
        "alice",
        AuthMethod::password(PASSWORD, otp::hotp(&secret, 0)),
    )
    .await;
    assert!(matches!(result, Err(ClientError::UntrustedHost(_))));

    let result = TunnelClient::connect(
        &cluster.auth_addr(),
        HostTrust::Fingerprint(cluster.running.fingerprint.clone()),
        "alice",
        AuthMethod::password(PASSWORD, otp::hotp(&secret, 0)),
    )
    .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_user_cert_from_other_authority_rejected() {
    let cluster = Cluster::start().await;
    let node = cluster.start_node(NodeSpec::new("n1", "web-1")).await;
    let other = Cluster::start().await;
    let method = other.login("alice").await;

    let result = connect_to_node(&node.addr, &cluster.trust(), "alice", &method).await;
    match result {
        Err(ClientError::AuthenticationFailed { code, .. }) => {
            assert_eq!(code, ErrorCode::AuthenticationFailed)
        }
        Err(e) => panic!("expected AuthenticationFailed, got {e}"),
        Ok(_) => panic!("foreign certificate was accepted"),
    }
}

#[tokio::test]
async fn test_authority_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = loopback_config(dir.path(), "auth-1");
    config.auth.enabled = true;

    // First run: generate the authority and consume code 0.
    let running = Service::new(config.clone())
        .start(CancellationToken::new())
        .await
        .unwrap();
    let ca = running.ca.clone().unwrap();
    let trust = ca.trusted_authorities();
    let (url, _) = ca.upsert_password("alice", PASSWORD).unwrap();
    let secret = otp::secret_from_url(&url).unwrap();
    let addr = running.auth_addr.unwrap().to_string();
    let client = TunnelClient::connect(
        &addr,
        HostTrust::Authorities(trust.clone()),
        "alice",
        AuthMethod::password(PASSWORD, otp::hotp(&secret, 0)),
    )
    .await
    .unwrap();
    // Requests are served after the login is persisted.
    client.get_cert_authorities().await.unwrap();
    drop(client);
    let fingerprint = running.fingerprint.clone();
    running.shutdown();
    running.wait().await;
    drop(ca);

    // Offline: enroll a second user the way `wardend useradd` does.
    let storage: Arc<dyn Backend> = Arc::new(SqliteBackend::open(config.storage_path()).await.unwrap());
    let offline = open_authority(Some(storage.as_ref()), config.auth.ca_config())
        .await
        .unwrap();
    let (url, _) = offline.upsert_password("bob", PASSWORD).unwrap();
    let bob_secret = otp::secret_from_url(&url).unwrap();
    backend::put_json(storage.as_ref(), CA_STATE_KEY, &offline.export_state())
        .await
        .unwrap();
    drop(offline);
    drop(storage);

    // Second run: same keys, same consumed counter, new user visible.
    let running = Service::new(config.clone())
        .start(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(running.fingerprint, fingerprint);
    assert_eq!(running.ca.as_ref().unwrap().trusted_authorities(), trust);
    let key = load_or_create_key(&config.host_key_path(), None).unwrap();
    assert_eq!(key.public_key().fingerprint(), fingerprint);

    let addr = running.auth_addr.unwrap().to_string();
    let replay = TunnelClient::connect(
        &addr,
        HostTrust::Authorities(trust.clone()),
        "alice",
        AuthMethod::password(PASSWORD, otp::hotp(&secret, 0)),
    )
    .await;
    assert_rejected(replay, ErrorCode::ReplayedOtp);
    TunnelClient::connect(
        &addr,
        HostTrust::Authorities(trust.clone()),
        "bob",
        AuthMethod::password(PASSWORD, otp::hotp(&bob_secret, 0)),
    )
    .await
    .unwrap();

    running.shutdown();
    running.wait().await;
}
