//! Exec and shell sessions on this host.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warden_auth::authn::IdentitySource;
use warden_auth::VerifiedIdentity;
use warden_client::BoxedIo;
use warden_core::{AuditAction, AuditEvent, AuditLog, AuditTarget, NodeId};
use warden_proto::{recv_message, send_message, ErrorCode, Request, Response};

use super::pty::{self, Pty};
use crate::audit;
use crate::identity::HostIdentity;

const SHELL: &str = "/bin/sh";
const PROMPT: &str = "$ ";
const READ_CHUNK: usize = 8 * 1024;

enum SessionKind {
    Exec(String),
    Shell,
}

impl SessionKind {
    /// Start the process. Shells run on a terminal; exec commands get
    /// pipes.
    fn spawn(&self) -> std::io::Result<(Child, Option<Pty>)> {
        let mut cmd = Command::new(SHELL);
        cmd.kill_on_drop(true);
        match self {
            SessionKind::Exec(command) => {
                cmd.arg("-c")
                    .arg(command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
                Ok((cmd.spawn()?, None))
            }
            SessionKind::Shell => {
                // No line editing: the client sees only what commands print.
                cmd.args(["-i", "+o", "emacs", "+o", "vi"])
                    .env("PS1", PROMPT)
                    .env("TERM", "dumb");
                let (terminal, slave) = pty::open()?;
                Ok((pty::spawn(cmd, slave)?, Some(terminal)))
            }
        }
    }
}

/// Serve the single session this connection is for.
pub(super) async fn serve(
    mut io: BoxedIo,
    user: &VerifiedIdentity,
    host: &HostIdentity,
    audit_log: &Arc<dyn AuditLog>,
) {
    let kind = match recv_message::<_, Request>(&mut io).await {
        Ok(Some(Request::Exec { command })) => SessionKind::Exec(command),
        Ok(Some(Request::Shell)) => SessionKind::Shell,
        Ok(Some(other)) => {
            debug!(request = ?other, "unexpected request on node endpoint");
            let _ = send_message(
                &mut io,
                &Response::error(ErrorCode::BadRequest, "node endpoints serve exec and shell only"),
            )
            .await;
            return;
        }
        Ok(None) => return,
        Err(e) => {
            debug!(error = %e, "failed to read session request");
            return;
        }
    };

    let session = Uuid::new_v4().to_string();
    let target = AuditTarget::Node(NodeId::new(host.id()));
    let mut started = match &kind {
        SessionKind::Exec(command) => {
            info!(user = %user.principal(), %session, %command, "exec started");
            AuditEvent::new(Some(user.principal()), AuditAction::ExecStarted, target.clone())
                .with_metadata("command", command.as_str())
        }
        SessionKind::Shell => {
            info!(user = %user.principal(), %session, "shell started");
            AuditEvent::new(Some(user.principal()), AuditAction::ShellStarted, target.clone())
        }
    }
    .with_metadata("session", session.as_str());
    if let IdentitySource::Delegated { proxy } = user.source() {
        started = started.with_metadata("proxy", proxy.as_str());
    }
    audit::emit(audit_log, started);

    let outcome = run(io, &kind).await;

    let ended = AuditEvent::new(Some(user.principal()), AuditAction::SessionEnded, target)
        .with_metadata("session", session.as_str());
    let ended = match outcome {
        Outcome::Exited(code) => {
            info!(user = %user.principal(), %session, code, "session ended");
            ended.with_metadata("exit_code", code.to_string())
        }
        Outcome::Disconnected => {
            info!(user = %user.principal(), %session, "client disconnected, process killed");
            ended.with_metadata("reason", "disconnected")
        }
        Outcome::SpawnFailed(reason) => ended.with_metadata("error", reason),
    };
    audit::emit(audit_log, ended);
}

enum Outcome {
    Exited(i32),
    Disconnected,
    SpawnFailed(String),
}

async fn run(mut io: BoxedIo, kind: &SessionKind) -> Outcome {
    let (mut child, terminal) = match kind.spawn() {
        Ok(spawned) => spawned,
        Err(e) => {
            warn!(shell = SHELL, error = %e, "failed to spawn session process");
            let reason = e.to_string();
            let _ = send_message(&mut io, &Response::error(ErrorCode::Internal, &reason)).await;
            return Outcome::SpawnFailed(reason);
        }
    };

    if matches!(kind, SessionKind::Shell)
        && send_message(&mut io, &Response::Ok).await.is_err()
    {
        return Outcome::Disconnected;
    }

    let (output_tx, mut output) = mpsc::channel::<Bytes>(64);
    let terminal_input = terminal.map(|terminal| {
        let (terminal_output, terminal_input) = tokio::io::split(terminal);
        tokio::spawn(pump(terminal_output, output_tx.clone()));
        terminal_input
    });
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, output_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, output_tx.clone()));
    }
    drop(output_tx);

    let (reader, mut writer) = tokio::io::split(io);
    let mut input = tokio::spawn(forward_input(reader, terminal_input));

    // Output ends when every output stream closes, usually at exit.
    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(data) => {
                    if send_response(&mut writer, &Response::Output { data }).await.is_err() {
                        input.abort();
                        return Outcome::Disconnected;
                    }
                }
                None => break,
            },
            _ = &mut input => return Outcome::Disconnected,
        }
    }

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut input => return Outcome::Disconnected,
    };
    input.abort();

    let code = match status {
        Ok(status) => exit_code(status),
        Err(e) => {
            warn!(error = %e, "failed to wait for session process");
            -1
        }
    };
    let _ = send_response(&mut writer, &Response::Exit { code }).await;
    Outcome::Exited(code)
}

async fn send_response(writer: &mut WriteHalf<BoxedIo>, response: &Response) -> std::io::Result<()> {
    send_message(writer, response).await
}

/// Feed client input to the terminal until the client goes away. End of
/// input becomes the terminal's EOF character.
async fn forward_input<W: AsyncWrite + Unpin>(mut reader: ReadHalf<BoxedIo>, mut terminal: Option<W>) {
    loop {
        let data = match recv_message::<_, Request>(&mut reader).await {
            Ok(Some(Request::Data { data })) => data,
            Ok(Some(Request::Eof)) => Bytes::from_static(&[pty::EOF_CHAR]),
            Ok(Some(other)) => {
                debug!(request = ?other, "ignoring request during session");
                continue;
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "session transport failed");
                return;
            }
        };
        let Some(input) = terminal.as_mut() else {
            continue;
        };
        if input.write_all(&data).await.is_err() || input.flush().await.is_err() {
            debug!("terminal input closed");
            terminal = None;
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut pipe: R, output: mpsc::Sender<Bytes>) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buf.reserve(READ_CHUNK);
        match pipe.read_buf(&mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                if output.send(buf.split().freeze()).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(error = %e, "output pipe failed");
                return;
            }
        }
    }
}

/// Exit status as a shell reports it: signals become 128 + signal.
fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_proto::expect_message;

    async fn exec(command: &str) -> (Vec<u8>, i32) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server: BoxedIo = Box::new(server);
        let kind = SessionKind::Exec(command.to_string());
        let session = tokio::spawn(async move { run(server, &kind).await });

        let mut client = client;
        let mut output = Vec::new();
        let code = loop {
            match expect_message::<_, Response>(&mut client).await.unwrap() {
                Response::Output { data } => output.extend_from_slice(&data),
                Response::Exit { code } => break code,
                other => panic!("unexpected {other:?}"),
            }
        };
        assert!(matches!(session.await.unwrap(), Outcome::Exited(c) if c == code));
        (output, code)
    }

    struct ShellClient {
        io: tokio::io::DuplexStream,
        pending: String,
    }

    impl ShellClient {
        async fn start() -> (Self, tokio::task::JoinHandle<Outcome>) {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let server: BoxedIo = Box::new(server);
            let session = tokio::spawn(async move { run(server, &SessionKind::Shell).await });

            let mut io = client;
            let ready = expect_message::<_, Response>(&mut io).await.unwrap();
            assert_eq!(ready, Response::Ok);
            let shell = Self {
                io,
                pending: String::new(),
            };
            (shell, session)
        }

        async fn send(&mut self, input: &'static [u8]) {
            let request = Request::Data {
                data: Bytes::from_static(input),
            };
            send_message(&mut self.io, &request).await.unwrap();
        }

        /// Complete output lines up to the first one that is not just a
        /// prompt, with prompts stripped.
        async fn reply(&mut self) -> Vec<String> {
            loop {
                if let Some(end) = self.pending.rfind('\n') {
                    let lines: Vec<String> = self.pending[..end]
                        .split('\n')
                        .map(|line| line.trim_start_matches(PROMPT).to_string())
                        .filter(|line| !line.is_empty())
                        .collect();
                    if !lines.is_empty() {
                        self.pending.drain(..=end);
                        return lines;
                    }
                }
                let message = tokio::time::timeout(
                    std::time::Duration::from_secs(10),
                    expect_message::<_, Response>(&mut self.io),
                )
                .await
                .expect("shell replied")
                .unwrap();
                match message {
                    Response::Output { data } => self.pending.push_str(&String::from_utf8_lossy(&data)),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }

        async fn exit_code(&mut self) -> i32 {
            loop {
                match expect_message::<_, Response>(&mut self.io).await.unwrap() {
                    Response::Output { data } => self.pending.push_str(&String::from_utf8_lossy(&data)),
                    Response::Exit { code } => return code,
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_shell_runs_on_a_terminal() {
        let (mut shell, session) = ShellClient::start().await;
        shell.send(b"tty -s && echo on-a-tty\n").await;
        assert_eq!(shell.reply().await, ["on-a-tty"]);

        shell.send(b"exit 4\n").await;
        assert_eq!(shell.exit_code().await, 4);
        assert!(matches!(session.await.unwrap(), Outcome::Exited(4)));
        assert!(!shell.pending.contains("tty"), "stray output: {:?}", shell.pending);
    }

    #[tokio::test]
    async fn test_shell_answers_each_command_in_turn() {
        let (mut shell, _session) = ShellClient::start().await;

        shell.send(b"expr 11 + 22\n").await;
        assert_eq!(shell.reply().await, ["33"]);

        shell.send(b"expr 2 + 3\n").await;
        assert_eq!(shell.reply().await, ["5"]);
    }

    #[tokio::test]
    async fn test_shell_exits_on_end_of_input() {
        let (mut shell, _session) = ShellClient::start().await;
        shell.send(b"echo bye\n").await;
        assert_eq!(shell.reply().await, ["bye"]);

        send_message(&mut shell.io, &Request::Eof).await.unwrap();
        assert_eq!(shell.exit_code().await, 0);
    }

    #[tokio::test]
    async fn test_exec_output_and_status() {
        let (output, code) = exec("expr 3 + 5").await;
        assert_eq!(output, b"8\n");
        assert_eq!(code, 0);

        let (_, code) = exec("exit 3").await;
        assert_eq!(code, 3);
    }

    #[tokio::test]
    async fn test_exec_includes_stderr() {
        let (output, code) = exec("echo oops >&2; exit 1").await;
        assert_eq!(output, b"oops\n");
        assert_eq!(code, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_exit_code() {
        let (_, code) = exec("kill -TERM $$").await;
        assert_eq!(code, 128 + 15);
    }

    #[tokio::test]
    async fn test_disconnect_kills_process() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server: BoxedIo = Box::new(server);
        let kind = SessionKind::Exec("sleep 30".into());
        let session = tokio::spawn(async move { run(server, &kind).await });

        drop(client);
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), session)
            .await
            .expect("session should end when the client goes away")
            .unwrap();
        assert!(matches!(outcome, Outcome::Disconnected));
    }
}
