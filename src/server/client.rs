//! Per-connection client handle
//!
//! A [`RelayClient`] is the piece of a connection the rest of the server is
//! allowed to touch: identity for introspection and the bounded outbound
//! queue peers push frames into. Streams and the scratch buffer stay owned
//! by the connection handler.

use std::net::SocketAddr;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};
use crate::server::registry::ClientInfo;

/// Outbound queue depth per client. Producers never block; a full queue
/// drops the frame for that peer only.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 128;

/// Handle to one authenticated, relaying client
#[derive(Debug)]
pub struct RelayClient {
    id: u32,
    alias: String,
    remote: SocketAddr,
    echo: bool,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl RelayClient {
    /// Create a handle together with the receiving half of its outbound
    /// queue. The receiver goes to the client's writer task; it is the
    /// queue's single consumer.
    pub fn new(
        id: u32,
        alias: String,
        remote: SocketAddr,
        echo: bool,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let client = Self {
            id,
            alias,
            remote,
            echo,
            outbound: Mutex::new(Some(tx)),
        };
        (client, rx)
    }

    /// Process-unique client ID
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this client's own frames are echoed back instead of fanned out
    pub fn echo(&self) -> bool {
        self.echo
    }

    /// Push one framed message onto the outbound queue without blocking.
    ///
    /// A closed queue means the client is tearing down; the frame is dropped
    /// silently, matching a peer leaving mid-fan-out. A full queue is a
    /// backpressure error the caller logs; the sender is never blocked.
    pub fn try_enqueue(&self, frame: Bytes) -> Result<()> {
        let outbound = self.outbound.lock().expect("outbound lock poisoned");
        let Some(tx) = outbound.as_ref() else {
            return Ok(());
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(RelayError::backpressure(format!(
                "outbound queue for client {} is full",
                self.id
            ))),
        }
    }

    /// Close the outbound queue. Queue closure is the writer task's sole
    /// termination signal; teardown calls this before aborting the data
    /// stream.
    pub fn close_outbound(&self) {
        self.outbound.lock().expect("outbound lock poisoned").take();
    }
}

impl ClientInfo for RelayClient {
    fn id(&self) -> u32 {
        self.id
    }

    fn alias(&self) -> Option<String> {
        Some(self.alias.clone())
    }

    fn remote(&self) -> String {
        self.remote.to_string()
    }
}
