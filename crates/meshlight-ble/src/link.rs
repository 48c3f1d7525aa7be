//! Gateway link management
//!
//! [`LinkManager`] owns the single BLE connection. Each connection session
//! runs in its own spawned task that connects (with retries and exponential
//! backoff), subscribes to notifications, and forwards everything it sees to
//! the controller as [`LinkEvent`]s. The manager itself is owned by the
//! controller loop and applies those events to the [`LinkState`] machine.
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ok──► Connected
//!      ▲                          │                 │ stream ended
//!      │◄──── attempts exhausted ─┘                 ▼
//!      └─────────────────────────────────────── Reconnecting
//! ```

use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{MeshConfig, ReconnectConfig};
use crate::error::LinkError;
use crate::interface::{BleTransport, LinkState, NotificationStream};

/// Connection session counter
pub type SessionId = u64;

/// Event sent from a session task to the controller
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Connected and subscribed
    Connected {
        /// Originating session
        session: SessionId,
    },
    /// Every connection attempt failed
    ConnectFailed {
        /// Originating session
        session: SessionId,
        /// Last attempt's error
        error: LinkError,
    },
    /// Raw notification payload
    Notification {
        /// Originating session
        session: SessionId,
        /// Payload bytes
        data: Bytes,
    },
    /// The notification stream ended
    Dropped {
        /// Originating session
        session: SessionId,
    },
}

impl LinkEvent {
    /// Session the event belongs to
    pub fn session(&self) -> SessionId {
        match self {
            LinkEvent::Connected { session }
            | LinkEvent::ConnectFailed { session, .. }
            | LinkEvent::Notification { session, .. }
            | LinkEvent::Dropped { session } => *session,
        }
    }
}

/// What the controller must react to after a [`LinkEvent`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkUpdate {
    /// The link came up
    Connected,
    /// The link dropped and a new session is trying to restore it
    Reconnecting,
    /// The link is down and will not be retried
    Disconnected(Option<LinkError>),
    /// Notification payload to decode
    Notification(Bytes),
}

/// Owner of the physical gateway connection
pub struct LinkManager<T: BleTransport> {
    transport: Arc<T>,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
    write_timeout: Duration,
    state: LinkState,
    session: SessionId,
    task: Option<JoinHandle<()>>,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl<T: BleTransport> LinkManager<T> {
    /// Create a manager and the receiver its session tasks report to
    pub fn new(transport: Arc<T>, config: &MeshConfig) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::channel(config.controller.event_channel_size);
        let manager = Self {
            transport,
            reconnect: config.reconnect.clone(),
            connect_timeout: config.device.connect_timeout,
            write_timeout: config.device.write_timeout,
            state: LinkState::Disconnected,
            session: 0,
            task: None,
            events_tx,
        };
        (manager, events_rx)
    }

    /// Current link state
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Current session number
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Transport name (for logging)
    pub fn name(&self) -> &str {
        self.transport.name()
    }

    /// Start connecting
    ///
    /// Returns the new state, or `None` when a session is already active.
    pub fn connect(&mut self) -> Option<LinkState> {
        if self.state != LinkState::Disconnected {
            debug!(state = %self.state, "Connect requested while link active");
            return None;
        }
        info!(transport = self.transport.name(), "Connecting to mesh gateway");
        self.start_session();
        self.state = LinkState::Connecting;
        Some(self.state)
    }

    /// Tear the link down; it is not retried afterwards
    ///
    /// Returns whether the state changed.
    pub async fn disconnect(&mut self) -> bool {
        self.stop_session();
        if self.state == LinkState::Disconnected {
            return false;
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "Error disconnecting from gateway");
        }
        info!("Disconnected from mesh gateway");
        self.state = LinkState::Disconnected;
        true
    }

    /// Write one encoded frame
    pub async fn write(&self, data: &[u8]) -> Result<(), LinkError> {
        if self.state != LinkState::Connected {
            return Err(LinkError::Disconnected);
        }
        trace!(len = data.len(), "Writing frame");
        match tokio::time::timeout(self.write_timeout, self.transport.write(data)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(LinkError::Disconnected)) => Err(LinkError::Disconnected),
            Ok(Err(LinkError::WriteFailed(reason))) => Err(LinkError::WriteFailed(reason)),
            Ok(Err(other)) => Err(LinkError::WriteFailed(other.to_string())),
            Err(_) => Err(LinkError::WriteFailed(format!(
                "timed out after {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }

    /// Apply an event from a session task
    pub fn handle_event(&mut self, event: LinkEvent) -> Option<LinkUpdate> {
        if event.session() != self.session {
            trace!(
                session = event.session(),
                current = self.session,
                "Ignoring event from superseded session"
            );
            return None;
        }

        match event {
            LinkEvent::Connected { .. } => {
                info!(transport = self.transport.name(), "Mesh gateway link up");
                self.state = LinkState::Connected;
                Some(LinkUpdate::Connected)
            }
            LinkEvent::ConnectFailed { error, .. } => {
                error!(error = %error, code = error.error_code(), "Giving up on mesh gateway");
                self.task = None;
                self.state = LinkState::Disconnected;
                Some(LinkUpdate::Disconnected(Some(error)))
            }
            LinkEvent::Notification { data, .. } => {
                if self.state == LinkState::Connected {
                    Some(LinkUpdate::Notification(data))
                } else {
                    None
                }
            }
            LinkEvent::Dropped { .. } => {
                self.task = None;
                if self.reconnect.enabled {
                    warn!("Mesh gateway link dropped, reconnecting");
                    self.start_session();
                    self.state = LinkState::Reconnecting;
                    Some(LinkUpdate::Reconnecting)
                } else {
                    warn!("Mesh gateway link dropped");
                    self.state = LinkState::Disconnected;
                    Some(LinkUpdate::Disconnected(Some(LinkError::Disconnected)))
                }
            }
        }
    }

    fn start_session(&mut self) {
        self.stop_session();
        self.session += 1;
        let session = SessionTask {
            transport: Arc::clone(&self.transport),
            session: self.session,
            reconnect: self.reconnect.clone(),
            connect_timeout: self.connect_timeout,
            events_tx: self.events_tx.clone(),
        };
        self.task = Some(tokio::spawn(session.run()));
    }

    fn stop_session(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        // Anything still in flight from the old session is now stale
        self.session += 1;
    }
}

impl<T: BleTransport> Drop for LinkManager<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// One connection session: connect, then pump notifications until the
/// stream ends
struct SessionTask<T: BleTransport> {
    transport: Arc<T>,
    session: SessionId,
    reconnect: ReconnectConfig,
    connect_timeout: Duration,
    events_tx: mpsc::Sender<LinkEvent>,
}

impl<T: BleTransport> SessionTask<T> {
    async fn run(self) {
        let session = self.session;
        let Some(mut stream) = self.establish().await else {
            return;
        };

        if self.events_tx.send(LinkEvent::Connected { session }).await.is_err() {
            return;
        }

        while let Some(data) = stream.next().await {
            let event = LinkEvent::Notification { session, data };
            if self.events_tx.send(event).await.is_err() {
                return;
            }
        }

        debug!(session, "Notification stream ended");
        let _ = self.events_tx.send(LinkEvent::Dropped { session }).await;
    }

    /// Retry until connected or out of attempts
    async fn establish(&self) -> Option<NotificationStream> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(session = self.session, attempt, "Connection attempt");

            let error = match tokio::time::timeout(self.connect_timeout, self.attempt()).await {
                Ok(Ok(stream)) => return Some(stream),
                Ok(Err(e)) => e,
                Err(_) => LinkError::ConnectTimeout {
                    duration_ms: self.connect_timeout.as_millis() as u64,
                },
            };
            warn!(
                session = self.session,
                attempt,
                error = %error,
                "Connection attempt failed"
            );

            // Clear any half-open connection before the next attempt
            if let Err(e) = self.transport.disconnect().await {
                trace!(error = %e, "Cleanup after failed attempt");
            }

            if !error.is_retriable() || self.reconnect.exhausted(attempt) {
                let event = LinkEvent::ConnectFailed {
                    session: self.session,
                    error,
                };
                let _ = self.events_tx.send(event).await;
                return None;
            }

            tokio::time::sleep(self.reconnect.backoff_delay(attempt)).await;
        }
    }

    async fn attempt(&self) -> Result<NotificationStream, LinkError> {
        self.transport.connect().await?;
        self.transport.notifications().await
    }
}
