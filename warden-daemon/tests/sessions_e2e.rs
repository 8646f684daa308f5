//! End-to-end tests for exec and shell sessions.
//!
//! Every test starts a real cluster on loopback: auth server and proxy in
//! one service, nodes as separate services with their own host certificates.

mod common;

use std::time::Duration;

use common::{Cluster, NodeSpec};
use warden_client::{connect_to_node, ClientError};
use warden_core::AuditAction;
use warden_proto::Route;

#[tokio::test]
async fn test_exec_on_node_directly() {
    let cluster = Cluster::start().await;
    let node = cluster.start_node(NodeSpec::new("n1", "web-1")).await;
    let method = cluster.login("alice").await;

    let mut client = connect_to_node(&node.addr, &cluster.trust(), "alice", &method)
        .await
        .unwrap();
    assert_eq!(client.route(), &Route::Direct);
    assert_eq!(client.host_cert().key_id(), "n1");
    assert_eq!(client.run("expr 3 + 5").await.unwrap(), "8\n");
}

#[tokio::test]
async fn test_exec_reports_failure_with_output() {
    let cluster = Cluster::start().await;
    let node = cluster.start_node(NodeSpec::new("n1", "web-1")).await;
    let method = cluster.login("alice").await;

    let mut client = connect_to_node(&node.addr, &cluster.trust(), "alice", &method)
        .await
        .unwrap();
    match client.run("echo partial; exit 3").await {
        Err(ClientError::CommandFailed { code, output }) => {
            assert_eq!(code, 3);
            assert_eq!(output, "partial\n");
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }

    // A node serves one session per connection; the client redials.
    assert_eq!(client.run("echo again").await.unwrap(), "again\n");
}

#[tokio::test]
async fn test_exec_through_proxy_is_audited() {
    let cluster = Cluster::start().await;
    let node = cluster.start_node(NodeSpec::new("n1", "web-1")).await;
    let method = cluster.login("alice").await;

    let mut proxy = cluster.proxy("alice", &method).await;
    cluster
        .wait_for_servers(&mut proxy, |nodes| nodes.iter().any(|n| n.hostname == "web-1"))
        .await;

    let mut client = proxy.connect_to_node(&node.hostname).await.unwrap();
    assert_eq!(client.route(), &Route::Direct);
    assert_eq!(client.run("expr 3 + 5").await.unwrap(), "8\n");

    let events = cluster.audit.events();
    let exec = events
        .iter()
        .find(|e| e.action == AuditAction::ExecStarted)
        .expect("exec was audited");
    assert_eq!(exec.actor.as_deref(), Some("alice"));
    assert_eq!(exec.metadata.get("command").map(String::as_str), Some("expr 3 + 5"));
    assert!(cluster.audit.actions().contains(&AuditAction::DialRouted));
}

#[tokio::test]
async fn test_shell_output_follows_input_order() {
    let cluster = Cluster::start().await;
    let node = cluster.start_node(NodeSpec::new("n1", "web-1")).await;
    let method = cluster.login("alice").await;

    let mut client = connect_to_node(&node.addr, &cluster.trust(), "alice", &method)
        .await
        .unwrap();
    let mut shell = client.shell().await.unwrap();
    shell.write(b"echo 33\n").await.unwrap();
    shell.write(b"expr 2 + 3\n").await.unwrap();
    shell.write(b"exit 7\n").await.unwrap();

    let mut output = Vec::new();
    while let Some(chunk) = shell.read().await.unwrap() {
        output.extend_from_slice(&chunk);
    }
    let output = String::from_utf8_lossy(&output);

    let first = output.find("33").expect("echo output");
    let second = output.find('5').expect("expr output");
    assert!(first < second, "out of order: {output:?}");
    assert_eq!(shell.exit_code(), Some(7));
}

/// Output lines up to the first that is not just a prompt, prompts stripped.
async fn reply(shell: &mut warden_client::Shell, pending: &mut String) -> Vec<String> {
    loop {
        if let Some(end) = pending.rfind('\n') {
            let lines: Vec<String> = pending[..end]
                .split('\n')
                .map(|line| line.trim_start_matches("$ ").to_string())
                .filter(|line| !line.is_empty())
                .collect();
            if !lines.is_empty() {
                pending.drain(..=end);
                return lines;
            }
        }
        let chunk = tokio::time::timeout(Duration::from_secs(10), shell.read())
            .await
            .expect("shell replied")
            .unwrap()
            .expect("shell still running");
        pending.push_str(&String::from_utf8_lossy(&chunk));
    }
}

#[tokio::test]
async fn test_shell_session_answers_successive_commands() {
    let cluster = Cluster::start().await;
    let node = cluster.start_node(NodeSpec::new("n1", "web-1")).await;
    let method = cluster.login("alice").await;

    let mut client = connect_to_node(&node.addr, &cluster.trust(), "alice", &method)
        .await
        .unwrap();
    let mut shell = client.shell().await.unwrap();
    let mut pending = String::new();

    shell.write(b"expr 11 + 22\n").await.unwrap();
    assert_eq!(reply(&mut shell, &mut pending).await, ["33"]);

    shell.write(b"expr 2 + 3\n").await.unwrap();
    assert_eq!(reply(&mut shell, &mut pending).await, ["5"]);

    shell.write(b"exit\n").await.unwrap();
    while shell.read().await.unwrap().is_some() {}
    assert_eq!(shell.exit_code(), Some(0));
}

#[tokio::test]
async fn test_shell_ends_when_input_closes() {
    let cluster = Cluster::start().await;
    let node = cluster.start_node(NodeSpec::new("n1", "web-1")).await;
    let method = cluster.login("alice").await;

    let mut client = connect_to_node(&node.addr, &cluster.trust(), "alice", &method)
        .await
        .unwrap();
    let mut shell = client.shell().await.unwrap();
    shell.write(b"echo bye\n").await.unwrap();
    shell.close_input().await.unwrap();

    let mut output = Vec::new();
    while let Some(chunk) = shell.read().await.unwrap() {
        output.extend_from_slice(&chunk);
    }
    assert!(String::from_utf8_lossy(&output).contains("bye"));
    assert_eq!(shell.exit_code(), Some(0));
}
