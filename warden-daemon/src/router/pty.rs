//! Pseudo-terminals for interactive shells.
//!
//! The shell gets the slave end as its controlling terminal. The master end
//! is non-blocking and driven through tokio's reactor.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{ready, Context, Poll};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, Command};

/// Byte the line discipline turns into end-of-file at the start of a line.
pub(super) const EOF_CHAR: u8 = 0x04;

const ROWS: u16 = 24;
const COLS: u16 = 80;

/// Master end of a pseudo-terminal.
#[derive(Debug)]
pub(super) struct Pty {
    master: AsyncFd<OwnedFd>,
}

/// Allocate a terminal pair. Echo and CR/LF translation are off so the
/// output stream carries exactly what the shell wrote.
pub(super) fn open() -> io::Result<(Pty, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut size = libc::winsize {
        ws_row: ROWS,
        ws_col: COLS,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut::<libc::termios>(),
            &mut size,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: openpty succeeded and nothing else owns these descriptors.
    let master = unsafe { OwnedFd::from_raw_fd(master) };
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };

    set_cloexec(master.as_raw_fd())?;
    set_cloexec(slave.as_raw_fd())?;
    set_nonblocking(master.as_raw_fd())?;
    raw_output(slave.as_raw_fd())?;

    Ok((
        Pty {
            master: AsyncFd::new(master)?,
        },
        slave,
    ))
}

/// Spawn `cmd` in a new session with `slave` as its controlling terminal
/// and standard streams.
pub(super) fn spawn(mut cmd: Command, slave: OwnedFd) -> io::Result<Child> {
    cmd.stdin(Stdio::from(slave.try_clone()?))
        .stdout(Stdio::from(slave.try_clone()?))
        .stderr(Stdio::from(slave));
    // Safety: only async-signal-safe calls between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    // Dropping `cmd` closes the parent's copies of the slave.
    cmd.spawn()
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn raw_output(fd: RawFd) -> io::Result<()> {
    // Safety: termios is plain data and tcgetattr fills it in.
    let mut attrs: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut attrs) } < 0 {
        return Err(io::Error::last_os_error());
    }
    attrs.c_lflag &= !(libc::ECHO | libc::ECHOE | libc::ECHOK | libc::ECHONL);
    attrs.c_oflag &= !libc::ONLCR;
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &attrs) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncRead for Pty {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.master.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(
                        inner.get_ref().as_raw_fd(),
                        unfilled.as_mut_ptr().cast(),
                        unfilled.len(),
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                // Linux reports EIO once every slave descriptor is closed.
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Poll::Ready(Ok(())),
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for Pty {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.master.poll_write_ready(cx))?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(inner.get_ref().as_raw_fd(), data.as_ptr().cast(), data.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_child_sees_a_terminal() {
        let (mut pty, slave) = open().unwrap();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("tty -s && echo interactive");
        let mut child = spawn(cmd, slave).unwrap();

        let mut output = Vec::new();
        pty.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"interactive\n");
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_input_is_not_echoed() {
        let (mut pty, slave) = open().unwrap();
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("read line; echo \"got $line\"");
        let mut child = spawn(cmd, slave).unwrap();

        pty.write_all(b"hello\n").await.unwrap();
        let mut output = Vec::new();
        pty.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"got hello\n");
        assert!(child.wait().await.unwrap().success());
    }
}
