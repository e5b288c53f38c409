//! In-process transport.
//!
//! `MemoryTransport` connects to a [`MemoryHub`] instead of a server. The hub
//! plays the server's role: it pushes frames to the live connections of a
//! channel, ends them, and can make the next connect attempt fail. Tests use
//! it to drive the session layer deterministically.

use async_trait::async_trait;
use bytes::Bytes;
use parley_protocol::{codec, Frame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{ConnectParams, Connection, ConnectionId, Transport, TransportError};

enum Incoming {
    Data(Bytes),
    End(Option<TransportError>),
}

struct Peer {
    id: ConnectionId,
    params: ConnectParams,
    tx: mpsc::UnboundedSender<Incoming>,
    open: Arc<AtomicBool>,
}

impl Peer {
    fn is_live(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

#[derive(Default)]
struct HubState {
    peers: Vec<Peer>,
    fail_next: VecDeque<TransportError>,
    connect_delay: Option<Duration>,
    connects: usize,
}

/// Server side of the in-memory transport.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that connects to this hub.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport { hub: self.clone() }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a raw transport message to every live connection of a channel.
    ///
    /// Returns the number of connections that received it.
    pub fn push(&self, channel_id: &str, data: impl Into<Bytes>) -> usize {
        let data = data.into();
        let state = self.lock();
        state
            .peers
            .iter()
            .filter(|p| p.is_live() && p.params.channel_id == channel_id)
            .filter(|p| p.tx.send(Incoming::Data(data.clone())).is_ok())
            .count()
    }

    /// Encode and deliver one frame to every live connection of a channel.
    pub fn push_frame(&self, channel_id: &str, frame: &Frame) -> usize {
        match codec::encode(frame) {
            Ok(data) => self.push(channel_id, data),
            Err(_) => 0,
        }
    }

    /// Close every live connection of a channel from the server side.
    pub fn end(&self, channel_id: &str) -> usize {
        self.finish(channel_id, None)
    }

    /// Break every live connection of a channel with an error.
    pub fn fail(&self, channel_id: &str, error: TransportError) -> usize {
        self.finish(channel_id, Some(error))
    }

    fn finish(&self, channel_id: &str, error: Option<TransportError>) -> usize {
        let state = self.lock();
        state
            .peers
            .iter()
            .filter(|p| p.is_live() && p.params.channel_id == channel_id)
            .filter(|p| p.tx.send(Incoming::End(error.clone())).is_ok())
            .count()
    }

    /// Make the next connect attempt fail with the given error.
    ///
    /// Calls queue up: each one fails one further attempt.
    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().fail_next.push_back(error);
    }

    /// Delay every connect attempt, simulating a slow handshake.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.lock().connect_delay = delay;
    }

    /// Number of connections that are still open on both ends.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.lock().peers.iter().filter(|p| p.is_live()).count()
    }

    /// Number of open connections for one channel.
    #[must_use]
    pub fn live_connections_for(&self, channel_id: &str) -> usize {
        self.lock()
            .peers
            .iter()
            .filter(|p| p.is_live() && p.params.channel_id == channel_id)
            .count()
    }

    /// Number of connect attempts made so far, failed ones included.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Parameters of the most recent successful connection.
    #[must_use]
    pub fn last_params(&self) -> Option<ConnectParams> {
        self.lock().peers.last().map(|p| p.params.clone())
    }
}

/// Client side of the in-memory transport.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, TransportError> {
        let delay = {
            let mut state = self.hub.lock();
            state.connects += 1;
            if let Some(err) = state.fail_next.pop_front() {
                return Err(err);
            }
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let id = ConnectionId::generate();

        let mut state = self.hub.lock();
        state.peers.retain(Peer::is_live);
        state.peers.push(Peer {
            id: id.clone(),
            params: params.clone(),
            tx,
            open: Arc::clone(&open),
        });
        debug!(channel = %params.channel_id, connection = %id, "Memory connection opened");

        Ok(Box::new(MemoryConnection { id, rx, open }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A connection to a [`MemoryHub`].
pub struct MemoryConnection {
    id: ConnectionId,
    rx: mpsc::UnboundedReceiver<Incoming>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Ok(None);
        }

        match self.rx.recv().await {
            Some(Incoming::Data(data)) => Ok(Some(data)),
            Some(Incoming::End(Some(err))) => {
                self.open.store(false, Ordering::SeqCst);
                Err(err)
            }
            Some(Incoming::End(None)) | None => {
                self.open.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        self.rx.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
