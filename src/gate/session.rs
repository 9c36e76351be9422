//! A live pairing of a connection and a spawned gate process.
//!
//! The session owns the gate's stdin/stdout as a framed stream and enforces
//! the protocol's cardinal rule: one request in flight, responses matched
//! 1:1 to requests in send order. Stderr is drained out-of-band into a log
//! buffer that error reports can surface.
//!
//! Any codec error, unexpected message, timeout, or early EOF poisons the
//! session. Poisoned sessions are closed and never reused; the dispatcher
//! spawns a fresh one on next demand.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::FramedRead;
use tracing::{debug, trace, warn};

use crate::codec::{encode_message, GateCodec, Message, DEFAULT_MAX_FRAME};
use crate::connection::{GatePipes, SharedConnection};
use crate::error::{Error, Result};

/// Default time allowed for the Hello exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake complete; a request may be sent.
    Ready,
    /// A protocol violation or transport failure occurred; do not reuse.
    Poisoned,
    /// Shutdown completed.
    Closed,
}

/// A gate process reachable over framed stdin/stdout.
pub struct GateSession {
    host: String,
    gate_hash: String,
    state: SessionState,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: FramedRead<Box<dyn AsyncRead + Send + Unpin>, GateCodec>,
    stderr_log: Arc<Mutex<String>>,
    /// Keeps the pooled connection alive for the session's lifetime.
    _connection: Option<SharedConnection>,
}

impl GateSession {
    /// Spawn a gate over a connection and complete the handshake.
    pub async fn spawn(
        connection: SharedConnection,
        command: &str,
        host: impl Into<String>,
        gate_hash: impl Into<String>,
    ) -> Result<Self> {
        let pipes = connection.open_pipes(command).await?;
        Self::from_pipes(pipes, host, gate_hash, Some(connection)).await
    }

    /// Build a session from raw pipes and complete the handshake.
    pub async fn from_pipes(
        pipes: GatePipes,
        host: impl Into<String>,
        gate_hash: impl Into<String>,
        connection: Option<SharedConnection>,
    ) -> Result<Self> {
        let GatePipes {
            stdin,
            stdout,
            mut stderr,
            exit: _exit,
        } = pipes;

        let stderr_log = Arc::new(Mutex::new(String::new()));
        let stderr_buf = stderr_log.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        stderr_buf
                            .lock()
                            .push_str(&String::from_utf8_lossy(&buf[..n]));
                    }
                }
            }
        });

        let mut session = Self {
            host: host.into(),
            gate_hash: gate_hash.into(),
            state: SessionState::Ready,
            writer: stdin,
            reader: FramedRead::new(stdout, GateCodec::new()),
            stderr_log,
            _connection: connection,
        };

        session.handshake().await?;
        Ok(session)
    }

    /// Exchange Hello messages. Any other reply is a protocol error.
    async fn handshake(&mut self) -> Result<()> {
        trace!(host = %self.host, "Gate handshake");
        self.send(Message::hello()).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.read_response())
            .await
            .map_err(|_| {
                self.poison();
                Error::UnexpectedMessage {
                    got: "nothing (handshake timeout)".to_string(),
                    expected: "Hello".to_string(),
                }
            })??;

        match reply {
            Message::Hello(_) => {
                debug!(host = %self.host, hash = %self.gate_hash, "Gate session ready");
                Ok(())
            }
            other => {
                self.poison();
                Err(Error::UnexpectedMessage {
                    got: other.kind().to_string(),
                    expected: "Hello".to_string(),
                })
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the session can take a request.
    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Content hash of the gate archive this session runs.
    pub fn gate_hash(&self) -> &str {
        &self.gate_hash
    }

    /// Host this session serves.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Everything the gate wrote to stderr so far.
    pub fn stderr_log(&self) -> String {
        self.stderr_log.lock().clone()
    }

    /// Mark the session unusable.
    pub fn poison(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Poisoned;
        }
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        let frame = match encode_message(&msg, DEFAULT_MAX_FRAME) {
            Ok(frame) => frame,
            Err(e) => {
                self.poison();
                return Err(Error::Codec(e));
            }
        };
        let written = match self.writer.write_all(&frame).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.poison();
            return Err(Error::Codec(crate::codec::CodecError::Io(e)));
        }
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Message> {
        match self.reader.next().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => {
                self.poison();
                Err(Error::Codec(e))
            }
            None => {
                self.poison();
                Err(Error::UnexpectedMessage {
                    got: "end of stream".to_string(),
                    expected: "a result frame".to_string(),
                })
            }
        }
    }

    /// Send one request and await its single corresponding result frame.
    ///
    /// The `&mut self` receiver serializes callers: the session processes
    /// exactly one request at a time, and response N can never arrive before
    /// response N-1 because nothing else reads the stream.
    pub async fn call(&mut self, request: Message) -> Result<Message> {
        if !self.is_ready() {
            return Err(Error::UnexpectedMessage {
                got: format!("session in state {:?}", self.state),
                expected: "Ready".to_string(),
            });
        }
        debug_assert!(matches!(
            request,
            Message::Module(_) | Message::FtlModule(_)
        ));

        self.send(request).await?;
        let reply = self.read_response().await?;

        match reply {
            Message::ModuleResult { .. }
            | Message::FtlModuleResult { .. }
            | Message::ModuleNotFound { .. }
            | Message::Error(_)
            | Message::GateSystemError(_) => Ok(reply),
            other => {
                self.poison();
                Err(Error::UnexpectedMessage {
                    got: other.kind().to_string(),
                    expected: "a result frame".to_string(),
                })
            }
        }
    }

    /// Drain-then-shutdown: send Shutdown, await Goodbye, close the pipes.
    ///
    /// In-flight work has necessarily finished before this can be called
    /// (the one-request-at-a-time discipline is enforced by `&mut self`).
    pub async fn shutdown(mut self) -> Result<()> {
        if self.state == SessionState::Poisoned {
            // Nothing orderly to do; dropping closes the pipes.
            return Ok(());
        }

        self.send(Message::Shutdown).await?;
        match tokio::time::timeout(Duration::from_secs(5), self.read_response()).await {
            Ok(Ok(Message::Goodbye)) => {
                debug!(host = %self.host, "Gate said goodbye");
            }
            Ok(Ok(other)) => {
                warn!(host = %self.host, got = %other.kind(), "Unexpected reply to Shutdown");
            }
            Ok(Err(e)) => {
                debug!(host = %self.host, error = %e, "Gate closed without Goodbye");
            }
            Err(_) => {
                warn!(host = %self.host, "Timed out waiting for Goodbye");
            }
        }
        self.state = SessionState::Closed;
        let _ = self.writer.shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for GateSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateSession")
            .field("host", &self.host)
            .field("gate_hash", &self.gate_hash)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ModuleRequest;
    use bytes::BytesMut;
    use tokio::sync::oneshot;
    use tokio_util::codec::Decoder;

    /// A scripted in-process gate: replies to Hello, then answers each
    /// request from the queue in order.
    fn fake_gate(replies: Vec<Message>) -> GatePipes {
        let (stdin_writer, mut stdin_reader) = tokio::io::duplex(64 * 1024);
        let (mut stdout_writer, stdout_reader) = tokio::io::duplex(64 * 1024);
        let (_stderr_writer, stderr_reader) = tokio::io::duplex(1024);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut codec = GateCodec::new();
            let mut buf = BytesMut::new();
            let mut replies = replies.into_iter();
            let mut chunk = vec![0u8; 4096];

            'outer: loop {
                let n = match stdin_reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);

                while let Ok(Some(request)) = codec.decode(&mut buf) {
                    let reply = match request {
                        Message::Hello(_) => Message::hello(),
                        Message::Shutdown => {
                            let frame =
                                encode_message(&Message::Goodbye, DEFAULT_MAX_FRAME).unwrap();
                            let _ = stdout_writer.write_all(&frame).await;
                            break 'outer;
                        }
                        _ => replies.next().unwrap_or(Message::GateSystemError(
                            crate::codec::ErrorReply {
                                message: "script exhausted".to_string(),
                                traceback: None,
                            },
                        )),
                    };
                    let frame = encode_message(&reply, DEFAULT_MAX_FRAME).unwrap();
                    if stdout_writer.write_all(&frame).await.is_err() {
                        break 'outer;
                    }
                }
            }
            let _ = exit_tx.send(0);
        });

        GatePipes {
            stdin: Box::new(stdin_writer),
            stdout: Box::new(stdout_reader),
            stderr: Box::new(stderr_reader),
            exit: exit_rx,
        }
    }

    fn module_request(name: &str) -> Message {
        Message::Module(ModuleRequest {
            module_name: name.to_string(),
            module: None,
            module_args: serde_json::Map::new(),
        })
    }

    #[tokio::test]
    async fn test_handshake_and_ready() {
        let pipes = fake_gate(vec![]);
        let session = GateSession::from_pipes(pipes, "h1", "hash", None)
            .await
            .unwrap();
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_responses_arrive_in_request_order() {
        let pipes = fake_gate(vec![
            Message::ModuleResult {
                stdout: "first".to_string(),
                stderr: String::new(),
            },
            Message::ModuleResult {
                stdout: "second".to_string(),
                stderr: String::new(),
            },
        ]);
        let mut session = GateSession::from_pipes(pipes, "h1", "hash", None)
            .await
            .unwrap();

        let r1 = session.call(module_request("a")).await.unwrap();
        let r2 = session.call(module_request("b")).await.unwrap();
        assert!(matches!(r1, Message::ModuleResult { stdout, .. } if stdout == "first"));
        assert!(matches!(r2, Message::ModuleResult { stdout, .. } if stdout == "second"));
        assert!(session.is_ready());
    }

    #[tokio::test]
    async fn test_module_not_found_reply() {
        let pipes = fake_gate(vec![Message::ModuleNotFound {
            message: "module 'nope' is not bundled in this gate".to_string(),
        }]);
        let mut session = GateSession::from_pipes(pipes, "h1", "hash", None)
            .await
            .unwrap();
        let reply = session.call(module_request("nope")).await.unwrap();
        assert!(matches!(reply, Message::ModuleNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unexpected_message_poisons() {
        let pipes = fake_gate(vec![Message::Goodbye]);
        let mut session = GateSession::from_pipes(pipes, "h1", "hash", None)
            .await
            .unwrap();
        let err = session.call(module_request("a")).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage { .. }));
        assert_eq!(session.state(), SessionState::Poisoned);

        // A poisoned session refuses further requests.
        assert!(session.call(module_request("b")).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_goodbye() {
        let pipes = fake_gate(vec![]);
        let session = GateSession::from_pipes(pipes, "h1", "hash", None)
            .await
            .unwrap();
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_mid_session_poisons() {
        // A gate that answers the handshake then exits.
        let (stdin_writer, _stdin_reader) = tokio::io::duplex(1024);
        let (mut stdout_writer, stdout_reader) = tokio::io::duplex(1024);
        let (_stderr_writer, stderr_reader) = tokio::io::duplex(64);
        let (exit_tx, exit_rx) = oneshot::channel();

        let hello = encode_message(&Message::hello(), DEFAULT_MAX_FRAME).unwrap();
        tokio::spawn(async move {
            let _ = stdout_writer.write_all(&hello).await;
            drop(stdout_writer);
            let _ = exit_tx.send(1);
        });

        let pipes = GatePipes {
            stdin: Box::new(stdin_writer),
            stdout: Box::new(stdout_reader),
            stderr: Box::new(stderr_reader),
            exit: exit_rx,
        };
        let mut session = GateSession::from_pipes(pipes, "h1", "hash", None)
            .await
            .unwrap();

        let err = session.call(module_request("a")).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage { .. }));
        assert_eq!(session.state(), SessionState::Poisoned);
    }
}
