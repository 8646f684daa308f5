//! Sessions on a node: exec and interactive shell.
//!
//! A node serves one session per connection. [`NodeClient`] keeps the
//! connection it was created with for the first session and dials again,
//! directly or through the same proxy, for every later one.

use bytes::Bytes;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use warden_auth::{AuthMethod, CertKind, Certificate};
use warden_proto::{recv_message, send_message, Request, Response, Route};

use crate::conn::{Connection, HostTrust};
use crate::error::{ClientError, Result};
use crate::io::BoxedIo;

/// Who we are and whom we trust, reused for every dial.
#[derive(Debug, Clone)]
pub(crate) struct Credentials {
    pub trust: HostTrust,
    pub user: String,
    pub method: AuthMethod,
}

impl Credentials {
    pub(crate) async fn dial(&self, addr: &str) -> Result<Connection> {
        Connection::dial(addr, &self.trust, &self.user, &self.method).await
    }
}

#[derive(Debug, Clone)]
pub(crate) enum NodeDialer {
    Direct { addr: String },
    Proxy { proxy: String, target: String },
}

impl NodeDialer {
    pub(crate) async fn dial(
        &self,
        credentials: &Credentials,
    ) -> Result<(Connection, Route, Certificate)> {
        match self {
            NodeDialer::Direct { addr } => {
                let conn = credentials.dial(addr).await?;
                let cert = conn.host_cert().clone();
                Ok((conn, Route::Direct, cert))
            }
            NodeDialer::Proxy { proxy, target } => {
                let mut conn = credentials.dial(proxy).await?;
                let response = conn
                    .call(&Request::Dial {
                        target: target.clone(),
                    })
                    .await?;
                let (route, host_cert) = match response {
                    Response::DialOk { route, host_cert } => (route, host_cert),
                    other => return Err(ClientError::unexpected(other)),
                };
                // The proxy checked the node's TLS key; we can still check
                // that its certificate is genuine.
                if let HostTrust::Authorities(trust) = &credentials.trust {
                    trust
                        .verify(&host_cert, CertKind::Host, warden_auth::unix_now())
                        .map_err(|e| ClientError::UntrustedHost(e.to_string()))?;
                }
                debug!(%proxy, %target, ?route, "routed through proxy");
                Ok((conn, route, host_cert))
            }
        }
    }
}

/// Client for exec and shell sessions on one node.
pub struct NodeClient {
    credentials: Credentials,
    dialer: NodeDialer,
    idle: Option<Connection>,
    route: Route,
    host_cert: Certificate,
}

impl NodeClient {
    pub(crate) async fn connect(credentials: Credentials, dialer: NodeDialer) -> Result<Self> {
        let (conn, route, host_cert) = dialer.dial(&credentials).await?;
        Ok(Self {
            credentials,
            dialer,
            idle: Some(conn),
            route,
            host_cert,
        })
    }

    /// How the most recent connection reached the node.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The node's host certificate.
    pub fn host_cert(&self) -> &Certificate {
        &self.host_cert
    }

    async fn session(&mut self) -> Result<Connection> {
        if let Some(conn) = self.idle.take() {
            return Ok(conn);
        }
        let (conn, route, host_cert) = self.dialer.dial(&self.credentials).await?;
        self.route = route;
        self.host_cert = host_cert;
        Ok(conn)
    }

    /// Run `command` to completion and return its combined output.
    ///
    /// # Errors
    ///
    /// `CommandFailed` carries the output of a non-zero exit;
    /// `TransportClosed` means the connection dropped before the exit status.
    pub async fn run(&mut self, command: &str) -> Result<String> {
        let mut conn = self.session().await?;
        conn.send(&Request::Exec {
            command: command.to_string(),
        })
        .await?;

        let mut output = Vec::new();
        loop {
            match conn.recv().await? {
                Response::Output { data } => output.extend_from_slice(&data),
                Response::Exit { code } => {
                    let output = String::from_utf8_lossy(&output).into_owned();
                    return if code == 0 {
                        Ok(output)
                    } else {
                        Err(ClientError::CommandFailed { code, output })
                    };
                }
                Response::Error { code, message } => {
                    return Err(ClientError::Remote { code, message })
                }
                other => return Err(ClientError::unexpected(other)),
            }
        }
    }

    /// Start an interactive shell.
    pub async fn shell(&mut self) -> Result<Shell> {
        let mut conn = self.session().await?;
        match conn.call(&Request::Shell).await? {
            Response::Ok => {}
            other => return Err(ClientError::unexpected(other)),
        }
        Ok(Shell::start(conn.into_io()))
    }
}

/// A running shell. Input and output are ordered byte streams.
pub struct Shell {
    writer: WriteHalf<BoxedIo>,
    events: mpsc::Receiver<Result<Response>>,
    reader: JoinHandle<()>,
    exit_code: Option<i32>,
}

impl Shell {
    fn start(io: BoxedIo) -> Self {
        let (mut reader, writer) = tokio::io::split(io);
        let (tx, events) = mpsc::channel(64);

        let reader = tokio::spawn(async move {
            loop {
                let event = match recv_message::<_, Response>(&mut reader).await {
                    Ok(Some(response)) => Ok(response),
                    Ok(None) => Err(ClientError::TransportClosed),
                    Err(e) => Err(ClientError::Io(e)),
                };
                let done = !matches!(event, Ok(Response::Output { .. }));
                if tx.send(event).await.is_err() || done {
                    break;
                }
            }
        });

        Self {
            writer,
            events,
            reader,
            exit_code: None,
        }
    }

    /// Send input to the shell.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        send_message(
            &mut self.writer,
            &Request::Data {
                data: Bytes::copy_from_slice(data),
            },
        )
        .await?;
        Ok(())
    }

    /// Close the shell's input.
    pub async fn close_input(&mut self) -> Result<()> {
        send_message(&mut self.writer, &Request::Eof).await?;
        Ok(())
    }

    /// Next chunk of output, or `None` once the shell has exited.
    ///
    /// Cancel safe.
    pub async fn read(&mut self) -> Result<Option<Bytes>> {
        if self.exit_code.is_some() {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(Ok(Response::Output { data })) => Ok(Some(data)),
            Some(Ok(Response::Exit { code })) => {
                self.exit_code = Some(code);
                Ok(None)
            }
            Some(Ok(Response::Error { code, message })) => {
                Err(ClientError::Remote { code, message })
            }
            Some(Ok(other)) => Err(ClientError::unexpected(other)),
            Some(Err(e)) => Err(e),
            None => Err(ClientError::TransportClosed),
        }
    }

    /// Exit status, once [`Self::read`] has returned `None`.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}

impl Drop for Shell {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
