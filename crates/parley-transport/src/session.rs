//! Transport session lifecycle.
//!
//! A [`TransportSession`] owns at most one live connection for one channel
//! activation. It runs the connection on its own task and reports what
//! happens as [`SessionMessage`]s on a queue consumed by the session's
//! owner. Every message is tagged with the generation the session was opened
//! with, so the owner can discard messages from sessions it already replaced.

use bytes::Bytes;
use parley_protocol::ChannelId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::traits::{ConnectParams, ConnectionId, Transport, TransportError};

/// Monotonic tag distinguishing one session (or activation) from the next.
pub type Generation = u64;

/// Lifecycle notifications emitted by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The connection is established.
    Opened {
        /// Identifier of the new connection.
        connection: ConnectionId,
    },
    /// One transport message, possibly holding several frames.
    Frame(Bytes),
    /// The remote side closed the connection.
    Closed,
    /// The connection could not be opened or broke.
    Error(TransportError),
}

/// A session event tagged with its origin.
#[derive(Debug)]
pub struct SessionMessage {
    /// Generation the session was opened with.
    pub generation: Generation,
    /// Channel the session is scoped to.
    pub channel_id: ChannelId,
    /// What happened.
    pub event: SessionEvent,
}

/// One live connection attempt, scoped to one channel.
///
/// Dropping the session closes it, same as calling [`TransportSession::close`].
pub struct TransportSession {
    generation: Generation,
    params: ConnectParams,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    /// Start connecting and return immediately.
    ///
    /// Events are delivered on `events` until the connection ends or the
    /// session is closed. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn open(
        transport: Arc<dyn Transport>,
        params: ConnectParams,
        generation: Generation,
        events: mpsc::UnboundedSender<SessionMessage>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(
            channel = %params.channel_id,
            generation,
            transport = transport.name(),
            "Opening transport session"
        );

        let task = tokio::spawn(run_session(
            transport,
            params.clone(),
            generation,
            events,
            shutdown_rx,
        ));

        Self {
            generation,
            params,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Generation this session was opened with.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Channel this session is scoped to.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.params.channel_id
    }

    /// Connection parameters.
    #[must_use]
    pub fn params(&self) -> &ConnectParams {
        &self.params
    }

    /// Whether the session task has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Close the session. No further events are emitted once the session
    /// task observes the close.
    pub fn close(mut self) {
        self.signal_shutdown();
    }

    /// Close the session and wait until the connection is released.
    pub async fn close_and_wait(mut self) {
        self.signal_shutdown();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(channel = %self.params.channel_id, "Session task failed: {}", e);
            }
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            debug!(channel = %self.params.channel_id, generation = self.generation, "Closing transport session");
            let _ = tx.send(());
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

async fn run_session(
    transport: Arc<dyn Transport>,
    params: ConnectParams,
    generation: Generation,
    events: mpsc::UnboundedSender<SessionMessage>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let emit = |event: SessionEvent| {
        events
            .send(SessionMessage {
                generation,
                channel_id: params.channel_id.clone(),
                event,
            })
            .is_ok()
    };

    let mut conn = tokio::select! {
        biased;

        _ = &mut shutdown => {
            debug!(channel = %params.channel_id, generation, "Session closed before connect completed");
            return;
        }

        result = transport.connect(&params) => match result {
            Ok(conn) => conn,
            Err(e) => {
                warn!(channel = %params.channel_id, generation, error = %e, "Transport connect failed");
                emit(SessionEvent::Error(e));
                return;
            }
        }
    };

    if !emit(SessionEvent::Opened {
        connection: conn.id().clone(),
    }) {
        let _ = conn.close().await;
        return;
    }

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                if let Err(e) = conn.close().await {
                    debug!(channel = %params.channel_id, error = %e, "Close handshake failed");
                }
                debug!(channel = %params.channel_id, generation, connection = %conn.id(), "Session closed locally");
                return;
            }

            result = conn.recv() => match result {
                Ok(Some(data)) => {
                    if !emit(SessionEvent::Frame(data)) {
                        let _ = conn.close().await;
                        return;
                    }
                }
                Ok(None) => {
                    info!(channel = %params.channel_id, generation, "Transport session closed by remote");
                    emit(SessionEvent::Closed);
                    return;
                }
                Err(e) => {
                    warn!(channel = %params.channel_id, generation, error = %e, "Transport session failed");
                    emit(SessionEvent::Error(e));
                    return;
                }
            }
        }
    }
}
