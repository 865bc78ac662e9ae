//! Command execution inside a running guest, carried over the
//! hypervisor's vsock multiplex endpoint (a Unix socket on the host).
//!
//! After an ASCII `CONNECT <port>` / `OK <cid>` preamble the connection
//! switches to length-prefixed frames multiplexing stdin/stdout/stderr,
//! resize events, and the exit notification. One session per call; the
//! guest-reader is the only socket reader, and the stdin/resize forwarders
//! share the write half behind a mutex so frames never interleave.

pub mod frame;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

pub use frame::{encode_frame, read_frame, write_frame, Frame, StreamType};

/// Vsock port the in-guest agent listens on.
pub const GUEST_AGENT_PORT: u16 = 2222;

#[derive(Debug, Error)]
pub enum VsockError {
    #[error("vsock handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("unknown stream type {0}")]
    UnknownStream(u8),
    #[error("frame truncated mid-payload")]
    TruncatedFrame,
    #[error("connection closed before exit status was received")]
    UnexpectedEof,
    #[error("guest reported error: {0}")]
    Guest(String),
    #[error("invalid JSON payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Sent as the first stdin frame to start the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub tty: bool,
}

/// Carried by resize frames when the session has a TTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

/// The normal exit indication: an error frame whose payload is
/// `{"status":{"code":N}}`.
#[derive(Debug, Deserialize)]
struct ExitFrame {
    status: ExitCode,
}

#[derive(Debug, Deserialize)]
struct ExitCode {
    code: i32,
}

/// Channel endpoints wiring the caller to the session.
///
/// Closing `stdin` stops forwarding input; closing `resize` simply ends the
/// resize forwarder. Output sends are best-effort: a caller that stops
/// draining does not wedge the session reader.
pub struct ExecIo {
    pub stdin: mpsc::Receiver<Bytes>,
    pub resize: mpsc::Receiver<TerminalSize>,
    pub stdout: mpsc::Sender<Bytes>,
    pub stderr: mpsc::Sender<Bytes>,
}

/// Run `request` inside the guest behind `socket_path` and return the
/// command's exit code.
///
/// Dropping the returned future cancels the session; the forwarder tasks
/// wind down once the caller's channel ends close.
pub async fn exec(socket_path: &Path, request: &ExecRequest, io: ExecIo) -> Result<i32, VsockError> {
    let stream = UnixStream::connect(socket_path).await?;
    exec_on(stream, request, io).await
}

/// Session body, generic over the transport so tests can drive it with an
/// in-memory duplex pipe.
pub(crate) async fn exec_on<S>(
    stream: S,
    request: &ExecRequest,
    io: ExecIo,
) -> Result<i32, VsockError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let writer = Arc::new(Mutex::new(write_half));

    // ---- handshake ----
    {
        let mut w = writer.lock().await;
        w.write_all(format!("CONNECT {GUEST_AGENT_PORT}\n").as_bytes())
            .await?;
        w.flush().await?;
    }
    let mut reply = String::new();
    let n = reader.read_line(&mut reply).await?;
    if n == 0 {
        return Err(VsockError::UnexpectedEof);
    }
    let reply = reply.trim();
    let Some(cid) = reply.strip_prefix("OK ") else {
        return Err(VsockError::HandshakeRejected(reply.to_string()));
    };
    debug!(cid, "vsock session established");

    // ---- session start: the request rides the first stdin frame ----
    let request_payload = serde_json::to_vec(request)?;
    {
        let mut w = writer.lock().await;
        frame::write_frame(&mut *w, StreamType::Stdin, &request_payload).await?;
    }

    // ---- forwarders (the only writers after session start) ----
    let ExecIo {
        mut stdin,
        mut resize,
        stdout,
        stderr,
    } = io;

    let stdin_writer = Arc::clone(&writer);
    let stdin_task = tokio::spawn(async move {
        while let Some(chunk) = stdin.recv().await {
            let mut w = stdin_writer.lock().await;
            if frame::write_frame(&mut *w, StreamType::Stdin, &chunk)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let resize_writer = Arc::clone(&writer);
    let resize_task = tokio::spawn(async move {
        // A closed resize channel just ends this forwarder.
        while let Some(size) = resize.recv().await {
            let payload = match serde_json::to_vec(&size) {
                Ok(p) => p,
                Err(_) => break,
            };
            let mut w = resize_writer.lock().await;
            if frame::write_frame(&mut *w, StreamType::Resize, &payload)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    // ---- guest-to-host reader: sole reader of the socket ----
    let result = loop {
        match frame::read_frame(&mut reader).await {
            Ok(Some(f)) => match f.stream {
                StreamType::Stdout => {
                    let _ = stdout.send(f.payload).await;
                }
                StreamType::Stderr => {
                    let _ = stderr.send(f.payload).await;
                }
                StreamType::Error => {
                    match serde_json::from_slice::<ExitFrame>(&f.payload) {
                        Ok(exit) => break Ok(exit.status.code),
                        Err(_) => {
                            break Err(VsockError::Guest(
                                String::from_utf8_lossy(&f.payload).into_owned(),
                            ))
                        }
                    }
                }
                // Host-bound streams only; a well-behaved agent never sends
                // these back.
                StreamType::Stdin | StreamType::Resize => {}
            },
            Ok(None) => break Err(VsockError::UnexpectedEof),
            Err(e) => break Err(e),
        }
    };

    stdin_task.abort();
    resize_task.abort();
    result
}
