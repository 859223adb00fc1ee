//! Persistent duplex socket transport.
//!
//! Envelopes travel as newline-delimited JSON over a single TCP
//! connection. `open` runs a credential preamble before any other
//! traffic: the first frame on the wire is an `auth` envelope carrying
//! the provider's bearer token, and the server must answer `auth.ok`
//! before the connection is usable. After the preamble, writes are
//! fire-and-forget; a spawned read loop pushes inbound envelopes to the
//! controller the moment they arrive and exits on EOF or a read error,
//! which closes the inbound channel and lets the controller count the
//! failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tether_core::envelope::{TYPE_AUTH, TYPE_AUTH_OK, TYPE_AUTH_REJECTED};
use tether_core::{AuthPayload, AuthProvider, Envelope, Error, Priority, Result};

use super::Transport;

/// How long to wait for the server's reply to the auth frame before the
/// open attempt is abandoned.
const AUTH_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport speaking newline-delimited JSON envelopes.
pub struct SocketTransport {
    addr: String,
    auth: Arc<dyn AuthProvider>,
    writer: Option<OwnedWriteHalf>,
    read_task: Option<JoinHandle<()>>,
}

impl SocketTransport {
    /// Creates a transport for the given `host:port` address.
    ///
    /// No connection is made until [`Transport::open`], which presents a
    /// bearer token from `auth` as its first frame.
    #[must_use]
    pub fn new(addr: impl Into<String>, auth: Arc<dyn AuthProvider>) -> Self {
        Self {
            addr: addr.into(),
            auth,
            writer: None,
            read_task: None,
        }
    }

    /// Runs the credential preamble on a fresh connection.
    ///
    /// Sends the `auth` envelope and waits for the server's verdict. An
    /// `auth.rejected` reply maps to [`Error::Auth`]; anything else that
    /// is not `auth.ok` is a protocol error.
    async fn authenticate(
        &self,
        writer: &mut OwnedWriteHalf,
        lines: &mut Lines<BufReader<OwnedReadHalf>>,
    ) -> Result<()> {
        let token = self.auth.bearer_token().await?;
        let frame = Envelope::new(
            TYPE_AUTH,
            AuthPayload::new(token).to_value()?,
            Priority::Critical,
        );
        let mut line = frame.to_json()?;
        line.push('\n');
        write_line(writer, &line)
            .await
            .map_err(|err| Error::transport_with_source("failed to send the auth frame", err))?;

        let reply = tokio::time::timeout(AUTH_REPLY_TIMEOUT, lines.next_line())
            .await
            .map_err(|_| Error::transport("timed out waiting for the auth reply"))?
            .map_err(|err| Error::transport_with_source("failed to read the auth reply", err))?
            .ok_or_else(|| Error::transport("connection closed before the auth reply"))?;
        let reply = Envelope::from_json(&reply)
            .map_err(|err| Error::protocol(format!("malformed auth reply: {err}")))?;

        match reply.message_type.as_str() {
            TYPE_AUTH_OK => Ok(()),
            TYPE_AUTH_REJECTED => Err(Error::auth(format!(
                "socket credentials rejected by {}",
                self.addr
            ))),
            other => Err(Error::protocol(format!(
                "expected an auth reply, got {other:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for SocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketTransport")
            .field("addr", &self.addr)
            .field("open", &self.writer.is_some())
            .finish()
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn open(&mut self, inbound: mpsc::UnboundedSender<Envelope>) -> Result<()> {
        self.close().await;

        let stream = TcpStream::connect(&self.addr).await.map_err(|err| {
            Error::transport_with_source(format!("socket connect to {} failed", self.addr), err)
        })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        self.authenticate(&mut write_half, &mut lines).await?;

        self.writer = Some(write_half);
        self.read_task = Some(tokio::spawn(read_loop(lines, inbound)));

        tracing::debug!(addr = %self.addr, "socket transport open");
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>> {
        let mut line = envelope.to_json()?;
        line.push('\n');

        let io_result = match self.writer.as_mut() {
            Some(writer) => write_line(writer, &line).await,
            None => return Err(Error::transport("socket is not open")),
        };

        if let Err(err) = io_result {
            // A broken pipe means the connection is gone; report closed
            // immediately instead of failing every subsequent send.
            self.close().await;
            return Err(Error::transport_with_source("socket write failed", err));
        }

        Ok(Vec::new())
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Reads newline-delimited envelopes until EOF or a read error.
///
/// Malformed lines are dropped with a warning; they are a peer bug, not a
/// connection failure. The inbound sender is dropped when the loop exits,
/// which is how the controller learns the socket died.
async fn read_loop(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    inbound: mpsc::UnboundedSender<Envelope>,
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match Envelope::from_json(&line) {
                    Ok(envelope) => {
                        if inbound.send(envelope).is_err() {
                            // Controller dropped the receiver; stop reading.
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping malformed inbound envelope");
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("socket read loop: peer closed the connection");
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "socket read loop: read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{Message, StaticTokenProvider};
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    fn transport(addr: String) -> SocketTransport {
        SocketTransport::new(addr, Arc::new(StaticTokenProvider::new("socket-secret")))
    }

    fn envelope(message_type: &str) -> Envelope {
        Envelope::from_message(&Message::new(
            message_type,
            serde_json::json!({"k": "v"}),
            Priority::Normal,
        ))
    }

    /// Accepts one connection, checks the first frame is the auth
    /// envelope, and replies `auth.ok`.
    async fn accept_with_auth(
        listener: TcpListener,
    ) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf, Envelope) {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let first = lines.next_line().await.unwrap().expect("auth frame");
        let frame = Envelope::from_json(&first).unwrap();
        assert_eq!(frame.message_type, TYPE_AUTH);

        let ok = format!("{}\n", envelope(TYPE_AUTH_OK).to_json().unwrap());
        write_half.write_all(ok.as_bytes()).await.unwrap();
        write_half.flush().await.unwrap();
        (lines, write_half, frame)
    }

    #[tokio::test]
    async fn open_connects_and_sends_newline_json() {
        let (listener, addr) = listener().await;
        let accept = tokio::spawn(async move {
            let (mut lines, _write_half, _auth) = accept_with_auth(listener).await;
            lines.next_line().await.unwrap().expect("task frame")
        });

        let mut transport = transport(addr);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        assert!(transport.is_open());

        let piggyback = transport.send(&envelope("task.submit")).await.unwrap();
        assert!(piggyback.is_empty(), "socket sends never piggyback");

        let wire = accept.await.unwrap();
        let parsed = Envelope::from_json(&wire).unwrap();
        assert_eq!(parsed.message_type, "task.submit");
        transport.close().await;
    }

    #[tokio::test]
    async fn auth_frame_is_first_on_the_wire_and_carries_the_token() {
        let (listener, addr) = listener().await;
        let accept = tokio::spawn(async move {
            // accept_with_auth asserts the auth frame precedes all traffic.
            let (mut lines, _write_half, auth_frame) = accept_with_auth(listener).await;
            let second = lines.next_line().await.unwrap().expect("task frame");
            (auth_frame, second)
        });

        let mut transport = transport(addr);
        let (tx, _rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        transport.send(&envelope("task.submit")).await.unwrap();

        let (auth_frame, second) = accept.await.unwrap();
        let payload = AuthPayload::from_value(&auth_frame.payload).unwrap();
        assert_eq!(payload.token, "socket-secret");
        let second = Envelope::from_json(&second).unwrap();
        assert_eq!(second.message_type, "task.submit");
        transport.close().await;
    }

    #[tokio::test]
    async fn rejected_credentials_surface_as_auth_error() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let _ = lines.next_line().await.unwrap();

            let no = format!("{}\n", envelope(TYPE_AUTH_REJECTED).to_json().unwrap());
            write_half.write_all(no.as_bytes()).await.unwrap();
            write_half.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut transport = transport(addr);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.open(tx).await.unwrap_err();
        assert!(matches!(err, Error::Auth { .. }), "got {err}");
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn unexpected_auth_reply_is_a_protocol_error() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let _ = lines.next_line().await.unwrap();

            let stray = format!("{}\n", envelope("server.event").to_json().unwrap());
            write_half.write_all(stray.as_bytes()).await.unwrap();
            write_half.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut transport = transport(addr);
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.open(tx).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }), "got {err}");
    }

    #[tokio::test]
    async fn inbound_envelopes_reach_the_channel() {
        let (listener, addr) = listener().await;
        let push = tokio::spawn(async move {
            let (_lines, mut write_half, _auth) = accept_with_auth(listener).await;
            let line = format!("{}\n", envelope("server.event").to_json().unwrap());
            write_half.write_all(line.as_bytes()).await.unwrap();
            write_half.flush().await.unwrap();
            // Keep the connection alive until the client is done.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut transport = transport(addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        let received = rx.recv().await.expect("pushed envelope arrives");
        assert_eq!(received.message_type, "server.event");

        transport.close().await;
        push.await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_drops_the_inbound_sender() {
        let (listener, addr) = listener().await;
        let accept = tokio::spawn(async move {
            let handshake = accept_with_auth(listener).await;
            drop(handshake);
        });

        let mut transport = transport(addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();
        accept.await.unwrap();

        // EOF ends the read loop, which drops the sender.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped_not_fatal() {
        let (listener, addr) = listener().await;
        let push = tokio::spawn(async move {
            let (_lines, mut write_half, _auth) = accept_with_auth(listener).await;
            let good = envelope("after.garbage").to_json().unwrap();
            let payload = format!("this is not json\n{good}\n");
            write_half.write_all(payload.as_bytes()).await.unwrap();
            write_half.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut transport = transport(addr);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.open(tx).await.unwrap();

        let received = rx.recv().await.expect("valid envelope still arrives");
        assert_eq!(received.message_type, "after.garbage");

        transport.close().await;
        push.await.unwrap();
    }

    #[tokio::test]
    async fn send_without_open_is_an_error() {
        let mut transport = transport("127.0.0.1:1".to_string());
        let err = transport.send(&envelope("x")).await.unwrap_err();
        assert!(err.to_string().contains("not open"));
    }

    #[tokio::test]
    async fn connect_failure_surfaces_as_transport_error() {
        // Port 1 is essentially never listening.
        let mut transport = transport("127.0.0.1:1".to_string());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.open(tx).await.unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut transport = transport("127.0.0.1:1".to_string());
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_open());
    }
}
