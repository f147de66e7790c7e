//! Per-connection protocol engine
//!
//! Each accepted QUIC connection runs one [`ConnectionHandler`] task that
//! drives the state machine
//!
//! ```text
//! AwaitControlStream → AwaitAuthMessage → Authorizing → AwaitDataStream
//!     → Relaying → Closed
//! ```
//!
//! The control stream is the client's single inbound unidirectional stream;
//! the data stream is the single bidirectional one. During Relaying the
//! handler concurrently consumes control messages (channel joins) and
//! relays data frames, while a separate writer task drains the client's
//! bounded outbound queue onto its data stream.
//!
//! Errors never cross the connection boundary: every failure tears this
//! connection down and is logged here.

use std::sync::Arc;

use bytes::Bytes;
use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthClient;
use crate::error::{RelayError, Result};
use crate::protocol::codec;
use crate::protocol::messages::{ControlMessage, FRAME_BUF, QUARANTINE_CHANNEL, RELAY_HEADER};
use crate::server::client::RelayClient;
use crate::server::registry::ClientRegistry;

/// Handler for one accepted connection
pub struct ConnectionHandler {
    connection: Connection,
    registry: Arc<ClientRegistry<RelayClient>>,
    auth: AuthClient,
    /// Per-connection cancellation, linked to server shutdown
    cancel: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        connection: Connection,
        registry: Arc<ClientRegistry<RelayClient>>,
        auth: AuthClient,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            registry,
            auth,
            cancel,
        }
    }

    /// Drive the connection until Closed. Never propagates an error to the
    /// listener; failures are logged and the connection disposed here.
    pub async fn run(self) {
        let remote = self.connection.remote_address();
        debug!("new connection from {}", remote);

        match self.drive().await {
            Ok(()) => {
                self.connection.close(0u32.into(), b"closed");
                debug!("connection from {} closed", remote);
            }
            Err(e) if e.is_benign() => {
                self.connection.close(0u32.into(), b"closed");
                debug!("connection from {} ended: {}", remote, e);
            }
            Err(e) => {
                warn!("connection from {} failed: {}", remote, e);
                self.connection.close(1u32.into(), b"protocol violation");
            }
        }
    }

    async fn drive(&self) -> Result<()> {
        let mut control = self.await_control_stream().await?;
        let (echo, username, password) = self.await_auth_message(&mut control).await?;
        self.authorize(&username, &password).await?;
        let (data_send, data_recv) = self.await_data_stream().await?;
        self.relay(control, data_send, data_recv, echo, username)
            .await
    }

    /// The first inbound stream must be unidirectional (readable only).
    async fn await_control_stream(&self) -> Result<RecvStream> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            stream = self.connection.accept_uni() => Ok(stream?),
            stream = self.connection.accept_bi() => {
                stream?;
                Err(RelayError::protocol(
                    "control stream must be unidirectional",
                ))
            }
        }
    }

    /// Read control messages until an authentication arrives. Anything else
    /// sent before authenticating is ignored, not a protocol error.
    async fn await_auth_message(
        &self,
        control: &mut RecvStream,
    ) -> Result<(bool, String, String)> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(RelayError::Cancelled),
                message = codec::read_control(control) => message?,
            };

            match message {
                ControlMessage::Authentication {
                    echo,
                    username,
                    password,
                } => return Ok((echo, username, password)),
                other => debug!("ignoring control message before authentication: {:?}", other),
            }
        }
    }

    /// One POST to the authorization service, bounded by its 5 s budget.
    async fn authorize(&self, username: &str, password: &str) -> Result<()> {
        let remote = self.connection.remote_address().to_string();
        if self.auth.authorize(username, password, &remote).await {
            info!("{} authorized as {}", remote, username);
            Ok(())
        } else {
            Err(RelayError::auth(format!(
                "authorization rejected for {}",
                username
            )))
        }
    }

    /// The second inbound stream must be bidirectional.
    async fn await_data_stream(&self) -> Result<(SendStream, RecvStream)> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            stream = self.connection.accept_bi() => Ok(stream?),
            stream = self.connection.accept_uni() => {
                stream?;
                Err(RelayError::protocol("data stream must be bidirectional"))
            }
        }
    }

    /// Relaying and, on any exit, Closed.
    async fn relay(
        &self,
        control: RecvStream,
        data_send: SendStream,
        mut data_recv: RecvStream,
        echo: bool,
        username: String,
    ) -> Result<()> {
        let id = self.registry.allocate_id();
        let remote = self.connection.remote_address();
        let (client, outbound_rx) = RelayClient::new(id, username, remote, echo);
        let client = Arc::new(client);

        // The send half is shared between the writer task and the echo
        // path; the lock also guarantees an in-progress write finishes
        // before teardown resets the stream.
        let data_send = Arc::new(Mutex::new(data_send));

        // Every client starts quarantined on channel 0.
        self.registry.add(&client, QUARANTINE_CHANNEL).await;
        info!(client = id, "{} relaying (echo: {})", remote, echo);

        let writer = tokio::spawn(drain_outbound(
            outbound_rx,
            Arc::clone(&data_send),
            id,
        ));

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::Cancelled),
            result = self.consume_control(control, &client) => result,
            result = self.relay_frames(&mut data_recv, &data_send, &client) => result,
        };

        // Closed: unregister before dropping anything owned, so no
        // concurrent fan-out resolves a stale handle. The control stream
        // was owned by its consumer future and is already stopped by the
        // select ending.
        self.registry.remove(id).await;
        client.close_outbound();
        {
            let mut send = data_send.lock().await;
            let _ = send.reset(0u32.into());
        }
        let _ = data_recv.stop(0u32.into());
        self.cancel.cancel();
        let _ = writer.await;

        info!(client = id, "{} disconnected", remote);
        result
    }

    /// Consume control messages for the lifetime of the connection. A
    /// decode error is fatal and tears the whole connection down.
    async fn consume_control(
        &self,
        mut control: RecvStream,
        client: &Arc<RelayClient>,
    ) -> Result<()> {
        loop {
            match codec::read_control(&mut control).await? {
                ControlMessage::Authentication { username, .. } => {
                    debug!(
                        client = client.id(),
                        "ignoring repeated authentication as {}", username
                    );
                }
                ControlMessage::JoinChannel { channel_id } => {
                    if self.registry.add(client, channel_id).await {
                        debug!(client = client.id(), channel = channel_id, "joined channel");
                    }
                }
                ControlMessage::Invalid { ty } => {
                    warn!(
                        client = client.id(),
                        "ignoring control message with unknown type {}", ty
                    );
                }
            }
        }
    }

    /// Read data frames and fan them out. The sender ID is stamped into the
    /// scratch buffer once; each inbound frame then lands directly behind
    /// it in server→client layout.
    async fn relay_frames(
        &self,
        recv: &mut RecvStream,
        own_stream: &Arc<Mutex<SendStream>>,
        client: &Arc<RelayClient>,
    ) -> Result<()> {
        let mut buf = [0u8; FRAME_BUF];
        codec::stamp_sender(&mut buf, client.id());

        loop {
            let len = codec::read_data_frame(recv, &mut buf).await?;
            if len == 0 {
                // keep-alive
                continue;
            }
            let framed = &buf[..RELAY_HEADER + len as usize];

            if client.echo() {
                let mut send = own_stream.lock().await;
                send.write_all(framed).await?;
                continue;
            }

            // Snapshot taken at dispatch: peers joining now miss this
            // frame, peers leaving may still get it enqueued, which their
            // teardown discards.
            for peer in self
                .registry
                .peers_on_same_channel(client.id(), true)
                .await
            {
                if let Err(e) = peer.try_enqueue(Bytes::copy_from_slice(framed)) {
                    error!(sender = client.id(), peer = peer.id(), "{}", e);
                }
            }
        }
    }
}

/// Writer task: the sole consumer of one client's outbound queue. Frames
/// are written in FIFO order; the task exits when the queue closes or a
/// write fails.
async fn drain_outbound(
    mut outbound: mpsc::Receiver<Bytes>,
    stream: Arc<Mutex<SendStream>>,
    client_id: u32,
) {
    while let Some(frame) = outbound.recv().await {
        let mut send = stream.lock().await;
        if let Err(e) = send.write_all(&frame).await {
            debug!(client = client_id, "outbound write ended: {}", e);
            break;
        }
    }
}
