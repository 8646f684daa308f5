//! Proxy sessions: registry queries and routed dials.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};
use warden_auth::VerifiedIdentity;
use warden_client::{BoxedIo, Connection, HostTrust};
use warden_core::{AccessError, AuditAction, AuditEvent, AuditLog, AuditTarget, Node, NodeId};
use warden_proto::{recv_message, send_message, ErrorCode, Request, Response, Route};

use super::RouteError;
use crate::audit;
use crate::handshake::Authenticator;
use crate::reversetunnel::TunnelServer;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve RPCs until the client hangs up or a dial turns the connection into
/// a relay.
pub(super) async fn serve(
    mut io: BoxedIo,
    user: &VerifiedIdentity,
    auth: &Authenticator,
    tunnels: Option<&TunnelServer>,
    audit_log: &Arc<dyn AuditLog>,
) {
    loop {
        let request = match recv_message::<_, Request>(&mut io).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "proxy connection failed");
                return;
            }
        };

        let response = match request {
            Request::GetServers => servers(auth.trust().access().get_servers().await),
            Request::FindServers { key, value } => {
                servers(auth.trust().access().find_servers(&key, &value).await)
            }
            Request::Dial { target } => match dial(&target, user, auth, tunnels).await {
                Ok(routed) => {
                    relay(io, routed, user, audit_log).await;
                    return;
                }
                Err(e) => {
                    info!(user = %user.principal(), %target, error = %e, "dial failed");
                    audit::emit(
                        audit_log,
                        AuditEvent::new(
                            Some(user.principal()),
                            AuditAction::DialFailed,
                            AuditTarget::Node(NodeId::new(target.as_str())),
                        )
                        .with_metadata("error", e.to_string()),
                    );
                    Response::error(e.code(), e.to_string())
                }
            },
            other => {
                debug!(request = ?other, "unexpected request on proxy endpoint");
                Response::error(
                    ErrorCode::BadRequest,
                    "proxy endpoints serve registry queries and dials",
                )
            }
        };

        if let Err(e) = send_message(&mut io, &response).await {
            debug!(error = %e, "failed to send response");
            return;
        }
    }
}

fn servers(result: Result<Vec<Node>, AccessError>) -> Response {
    match result {
        Ok(nodes) => Response::Servers { nodes },
        Err(AccessError::Denied(reason)) => Response::error(ErrorCode::PermissionDenied, reason),
        Err(e) => Response::error(ErrorCode::Internal, e.to_string()),
    }
}

/// Exact ID first, then address or hostname.
fn resolve<'a>(nodes: &'a [Node], target: &str) -> Option<&'a Node> {
    nodes
        .iter()
        .find(|node| node.id.as_str() == target)
        .or_else(|| nodes.iter().find(|node| node.answers_to(target)))
}

struct Routed {
    node: Node,
    route: Route,
    conn: Connection,
}

async fn dial(
    target: &str,
    user: &VerifiedIdentity,
    auth: &Authenticator,
    tunnels: Option<&TunnelServer>,
) -> Result<Routed, RouteError> {
    let nodes = auth
        .trust()
        .access()
        .get_servers()
        .await
        .map_err(|e| RouteError::Dial(format!("registry unavailable: {e}")))?;
    let node = resolve(&nodes, target)
        .cloned()
        .ok_or_else(|| RouteError::NodeNotFound(target.to_string()))?;
    let trust = auth
        .trust()
        .current()
        .await
        .map_err(|e| RouteError::Dial(format!("no trust roots: {e}")))?;

    let (io, route): (BoxedIo, Route) = match &node.tunnel {
        Some(agent) => {
            let tunnels = tunnels.ok_or_else(|| RouteError::TunnelUnavailable(agent.clone()))?;
            let stream = tunnels.dial(agent, &node.addr).await?;
            (Box::new(stream) as BoxedIo, Route::Tunnel { agent: agent.clone() })
        }
        None => {
            let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&node.addr))
                .await
                .map_err(|_| RouteError::Dial(format!("{}: timed out", node.addr)))?
                .map_err(|e| RouteError::Dial(format!("{}: {e}", node.addr)))?;
            let _ = tcp.set_nodelay(true);
            (Box::new(tcp) as BoxedIo, Route::Direct)
        }
    };

    let node_err = |e: warden_client::ClientError| RouteError::Dial(format!("{}: {e}", node.id));
    let (tls, tls_key) = warden_client::tls::wrap(io).await.map_err(node_err)?;
    let conn = Connection::handshake(
        Box::new(tls),
        &tls_key,
        &HostTrust::Authorities((*trust).clone()),
        user.principal(),
        &auth.identity().delegate(user.role()),
    )
    .await
    .map_err(node_err)?;

    Ok(Routed { node, route, conn })
}

/// Confirm the dial, then pipe bytes between the client and the node.
async fn relay(
    mut io: BoxedIo,
    routed: Routed,
    user: &VerifiedIdentity,
    audit_log: &Arc<dyn AuditLog>,
) {
    let Routed { node, route, conn } = routed;
    let ok = Response::DialOk {
        route: route.clone(),
        host_cert: conn.host_cert().clone(),
    };
    if let Err(e) = send_message(&mut io, &ok).await {
        debug!(error = %e, "client left before dial completed");
        return;
    }

    info!(user = %user.principal(), node = %node.id, ?route, "session routed");
    let mut event = AuditEvent::new(
        Some(user.principal()),
        AuditAction::DialRouted,
        AuditTarget::Node(node.id.clone()),
    );
    event = match &route {
        Route::Direct => event.with_metadata("route", "direct"),
        Route::Tunnel { agent } => event
            .with_metadata("route", "tunnel")
            .with_metadata("agent", agent.as_str()),
    };
    audit::emit(audit_log, event);

    let mut upstream = conn.into_io();
    match tokio::io::copy_bidirectional(&mut io, &mut upstream).await {
        Ok((to_node, to_client)) => {
            debug!(node = %node.id, to_node, to_client, "relay finished");
        }
        Err(e) => debug!(node = %node.id, error = %e, "relay ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_prefers_exact_id() {
        let first = Node::new("10.0.0.1:3022", "db");
        // A node whose hostname collides with the other node's ID.
        let second = Node::new("10.0.0.2:3022", "10.0.0.1_3022");
        let nodes = vec![second.clone(), first.clone()];

        assert_eq!(resolve(&nodes, "10.0.0.1_3022"), Some(&first));
        assert_eq!(resolve(&nodes, "10.0.0.2:3022"), Some(&second));
        assert_eq!(resolve(&nodes, "db"), Some(&first));
        assert_eq!(resolve(&nodes, "missing"), None);
    }

    #[test]
    fn test_route_error_codes() {
        assert_eq!(RouteError::NodeNotFound("x".into()).code(), ErrorCode::NodeNotFound);
        assert_eq!(
            RouteError::TunnelUnavailable(warden_core::AgentId::new("a")).code(),
            ErrorCode::TunnelUnavailable
        );
        assert_eq!(RouteError::Dial("refused".into()).code(), ErrorCode::DialFailed);
    }
}
