//! MeshController - serialized protocol engine
//!
//! The controller owns the [`AddressTable`], the [`CommandQueue`], the
//! [`MeshCodec`] and the [`LinkManager`], and mutates them from a single
//! task. Callers talk to it through a cloneable [`MeshHandle`]; results come
//! back over oneshot replies and a broadcast stream of [`MeshEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  commands   ┌──────────────────────────────┐
//! │ MeshHandle   │────────────►│ MeshController::run          │
//! │ (clone)      │◄────────────│                              │
//! └──────────────┘   events    │  CommandQueue  AddressTable  │
//!                              │  MeshCodec     LinkManager   │
//! ┌──────────────┐ LinkEvent   │                              │
//! │ session task │────────────►│                              │
//! └──────────────┘             └──────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use meshlight_ble::{MeshConfig, MeshController};
//!
//! let (controller, handle) = MeshController::new(transport, &config)?;
//! tokio::spawn(controller.run());
//!
//! handle.connect().await?;
//! handle.register(3, "lamp1").await?;
//! let outcome = handle.set_brightness(3, 180).await?.outcome().await;
//! ```

use bytes::Bytes;
use chrono::Utc;
use meshlight_protocol::{to_hex, FrameBody, MeshCodec, MeshFrame, BROADCAST_ADDRESS};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::{ControllerConfig, MeshConfig};
use crate::error::{LinkError, MeshError, Result};
use crate::interface::{BleTransport, LinkState};
use crate::link::{LinkEvent, LinkManager, LinkUpdate};
use crate::queue::{
    CancelResult, CommandOutcome, CommandQueue, CompletionSender, QueueStats, TransactionTag,
};
use crate::table::{AddressTable, SubDevice};

/// Events published by the controller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshEvent {
    /// A sub-device's observable state changed
    StateChanged {
        /// Sub-device address
        address: u8,
        /// Snapshot after the change
        device: SubDevice,
    },
    /// The gateway link changed state
    LinkStateChanged(LinkState),
    /// A sub-device stopped answering
    SubDeviceStale {
        /// Sub-device address
        address: u8,
    },
    /// A command finished without success
    CommandCompleted {
        /// Command tag
        tag: TransactionTag,
        /// Target address
        address: u8,
        /// Final outcome
        outcome: CommandOutcome,
    },
}

/// Commands that can be sent to the controller
#[derive(Debug)]
enum ControllerCommand {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    Submit {
        frame: MeshFrame,
        completion: CompletionSender,
        reply: oneshot::Sender<TransactionTag>,
    },
    Cancel {
        tag: TransactionTag,
        reply: oneshot::Sender<CancelResult>,
    },
    WriteRaw {
        data: Bytes,
        reply: oneshot::Sender<Result<()>>,
    },
    Register {
        address: u8,
        label: String,
        reply: oneshot::Sender<Result<SubDevice>>,
    },
    Unregister {
        address: u8,
        reply: oneshot::Sender<Option<SubDevice>>,
    },
    Get {
        address: u8,
        reply: oneshot::Sender<Option<SubDevice>>,
    },
    List(oneshot::Sender<Vec<SubDevice>>),
    LinkState(oneshot::Sender<LinkState>),
    Stats(oneshot::Sender<ControllerStats>),
    Shutdown,
}

/// Controller statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    /// Notifications received from the gateway
    pub notifications: u64,
    /// Frames discarded because they failed to decode
    pub decode_errors: u64,
    /// StateChanged events published
    pub state_changes: u64,
    /// Keep-alive queries submitted
    pub keep_alives: u64,
    /// Raw debug writes
    pub raw_writes: u64,
    /// Times the link dropped and started reconnecting
    pub reconnects: u64,
    /// Entries in the address table
    pub sub_devices: usize,
    /// Commands waiting for dispatch
    pub queued: usize,
    /// Command queue counters
    pub queue: QueueStats,
}

/// Handle for controlling the MeshController
#[derive(Clone)]
pub struct MeshHandle {
    command_tx: mpsc::Sender<ControllerCommand>,
    event_tx: broadcast::Sender<MeshEvent>,
}

impl MeshHandle {
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> ControllerCommand,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(build(tx)).await?;
        Ok(rx.await?)
    }

    /// Connect to the gateway; resolves once the link is up or given up on
    pub async fn connect(&self) -> Result<()> {
        self.request(ControllerCommand::Connect).await?
    }

    /// Disconnect from the gateway; pending commands complete `LinkLost`
    pub async fn disconnect(&self) -> Result<()> {
        self.request(ControllerCommand::Disconnect).await
    }

    /// Current link state
    pub async fn link_state(&self) -> Result<LinkState> {
        self.request(ControllerCommand::LinkState).await
    }

    /// Register (or relabel) a sub-device
    pub async fn register(&self, address: u8, label: impl Into<String>) -> Result<SubDevice> {
        let label = label.into();
        self.request(|reply| ControllerCommand::Register {
            address,
            label,
            reply,
        })
        .await?
    }

    /// Remove a sub-device
    pub async fn unregister(&self, address: u8) -> Result<Option<SubDevice>> {
        self.request(|reply| ControllerCommand::Unregister { address, reply })
            .await
    }

    /// Snapshot of one sub-device
    pub async fn sub_device(&self, address: u8) -> Result<Option<SubDevice>> {
        self.request(|reply| ControllerCommand::Get { address, reply })
            .await
    }

    /// Snapshot of every sub-device in registration order
    pub async fn sub_devices(&self) -> Result<Vec<SubDevice>> {
        self.request(ControllerCommand::List).await
    }

    /// Queue an arbitrary command frame
    pub async fn submit(&self, frame: MeshFrame) -> Result<CommandHandle> {
        let (completion, outcome_rx) = oneshot::channel();
        let tag = self
            .request(|reply| ControllerCommand::Submit {
                frame,
                completion,
                reply,
            })
            .await?;
        Ok(CommandHandle {
            tag,
            address: frame.address(),
            outcome_rx,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Switch a sub-device on or off
    pub async fn set_power(&self, address: u8, on: bool) -> Result<CommandHandle> {
        self.submit(MeshFrame::set_power(address, on)).await
    }

    /// Set a sub-device's brightness; out-of-range levels are clamped
    pub async fn set_brightness(&self, address: u8, level: i32) -> Result<CommandHandle> {
        self.submit(MeshFrame::set_brightness(address, level)).await
    }

    /// Ask a sub-device to report its state
    pub async fn query_state(&self, address: u8) -> Result<CommandHandle> {
        self.submit(MeshFrame::query_state(address)).await
    }

    /// Write raw bytes to the gateway, bypassing the queue
    pub async fn write_raw(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        self.request(|reply| ControllerCommand::WriteRaw { data, reply })
            .await?
    }

    /// Controller statistics
    pub async fn stats(&self) -> Result<ControllerStats> {
        self.request(ControllerCommand::Stats).await
    }

    /// Subscribe to controller events
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.event_tx.subscribe()
    }

    /// Stop the controller; the link is closed and pending commands are lost
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx
            .send(ControllerCommand::Shutdown)
            .await
            .map_err(|_| MeshError::ControllerStopped)
    }
}

/// Caller's view of one submitted command
#[derive(Debug)]
pub struct CommandHandle {
    tag: TransactionTag,
    address: u8,
    outcome_rx: oneshot::Receiver<CommandOutcome>,
    command_tx: mpsc::Sender<ControllerCommand>,
}

impl CommandHandle {
    /// Transaction tag of this submission
    pub fn tag(&self) -> TransactionTag {
        self.tag
    }

    /// Target address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Cancel the command if it has not been dispatched yet
    pub async fn cancel(&self) -> Result<CancelResult> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(ControllerCommand::Cancel {
                tag: self.tag,
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Wait for the final outcome
    ///
    /// A controller that stopped without answering counts as `LinkLost`.
    pub async fn outcome(self) -> CommandOutcome {
        self.outcome_rx.await.unwrap_or(CommandOutcome::LinkLost)
    }
}

/// Serialized protocol engine for one gateway
pub struct MeshController<T: BleTransport> {
    link: LinkManager<T>,
    link_rx: mpsc::Receiver<LinkEvent>,
    codec: MeshCodec,
    table: AddressTable,
    queue: CommandQueue,
    command_rx: mpsc::Receiver<ControllerCommand>,
    event_tx: broadcast::Sender<MeshEvent>,
    config: ControllerConfig,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    stats: ControllerStats,
    last_activity: Instant,
    /// Tag of the outstanding keep-alive query
    keep_alive_tag: Option<TransactionTag>,
}

impl<T: BleTransport> MeshController<T> {
    /// Create a controller and its handle
    ///
    /// Sub-devices listed in the configuration are registered up front.
    pub fn new(transport: T, config: &MeshConfig) -> Result<(Self, MeshHandle)> {
        config.validate()?;
        let codec = MeshCodec::new(config.opcodes)?;

        let mut table = AddressTable::new();
        for sub in &config.sub_devices {
            table.register(sub.address, sub.label.clone())?;
        }

        let (link, link_rx) = LinkManager::new(Arc::new(transport), config);
        let (command_tx, command_rx) = mpsc::channel(config.controller.command_channel_size);
        let (event_tx, _) = broadcast::channel(config.controller.event_channel_size);

        let handle = MeshHandle {
            command_tx,
            event_tx: event_tx.clone(),
        };
        let controller = Self {
            link,
            link_rx,
            codec,
            table,
            queue: CommandQueue::new(config.queue.clone()),
            command_rx,
            event_tx,
            config: config.controller.clone(),
            connect_waiters: Vec::new(),
            stats: ControllerStats::default(),
            last_activity: Instant::now(),
            keep_alive_tag: None,
        };

        Ok((controller, handle))
    }

    /// Run the controller loop until shutdown or until every handle is dropped
    pub async fn run(mut self) -> Result<()> {
        info!(
            transport = self.link.name(),
            sub_devices = self.table.len(),
            "Starting mesh controller"
        );

        let mut housekeeping = tokio::time::interval(self.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.queue.next_deadline();

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ControllerCommand::Shutdown) => {
                            info!("Mesh controller shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            debug!("All handles dropped");
                            break;
                        }
                    }
                }

                Some(event) = self.link_rx.recv() => {
                    self.handle_link_event(event);
                }

                _ = wait_until(deadline) => {}

                _ = housekeeping.tick() => {
                    self.housekeeping();
                }
            }

            self.drive().await;
            self.flush_completed();
        }

        self.stop().await;
        info!("Mesh controller stopped");
        Ok(())
    }

    async fn handle_command(&mut self, cmd: ControllerCommand) {
        match cmd {
            ControllerCommand::Connect(reply) => match self.link.state() {
                LinkState::Connected => {
                    let _ = reply.send(Ok(()));
                }
                _ => {
                    if let Some(state) = self.link.connect() {
                        self.emit(MeshEvent::LinkStateChanged(state));
                    }
                    self.connect_waiters.push(reply);
                }
            },
            ControllerCommand::Disconnect(reply) => {
                if self.link.disconnect().await {
                    self.queue.link_down();
                    self.emit(MeshEvent::LinkStateChanged(LinkState::Disconnected));
                }
                self.resolve_connect_waiters(Err(LinkError::Disconnected));
                let _ = reply.send(());
            }
            ControllerCommand::Submit {
                frame,
                completion,
                reply,
            } => {
                let tag = if self.link.state() == LinkState::Disconnected {
                    debug!(frame = %frame, "Rejecting command while disconnected");
                    self.queue
                        .reject(frame, completion, CommandOutcome::LinkLost)
                } else {
                    self.queue.submit(frame, completion, Instant::now())
                };
                let _ = reply.send(tag);
            }
            ControllerCommand::Cancel { tag, reply } => {
                let _ = reply.send(self.queue.cancel(tag));
            }
            ControllerCommand::WriteRaw { data, reply } => {
                info!(data = %to_hex(&data), "Raw write");
                self.stats.raw_writes += 1;
                let result = self.link.write(&data).await.map_err(MeshError::from);
                if result.is_ok() {
                    self.last_activity = Instant::now();
                }
                let _ = reply.send(result);
            }
            ControllerCommand::Register {
                address,
                label,
                reply,
            } => {
                let result = self.table.register(address, label).cloned();
                if let Ok(device) = &result {
                    info!(address, label = %device.label, "Sub-device registered");
                }
                let _ = reply.send(result);
            }
            ControllerCommand::Unregister { address, reply } => {
                let removed = self.table.unregister(address);
                if removed.is_some() {
                    info!(address, "Sub-device unregistered");
                }
                let _ = reply.send(removed);
            }
            ControllerCommand::Get { address, reply } => {
                let _ = reply.send(self.table.get(address).cloned());
            }
            ControllerCommand::List(reply) => {
                let _ = reply.send(self.table.all().cloned().collect());
            }
            ControllerCommand::LinkState(reply) => {
                let _ = reply.send(self.link.state());
            }
            ControllerCommand::Stats(reply) => {
                let mut stats = self.stats.clone();
                stats.sub_devices = self.table.len();
                stats.queued = self.queue.queued_len();
                stats.queue = self.queue.stats().clone();
                let _ = reply.send(stats);
            }
            // Handled by the run loop
            ControllerCommand::Shutdown => {}
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(update) = self.link.handle_event(event) else {
            return;
        };

        match update {
            LinkUpdate::Connected => {
                self.last_activity = Instant::now();
                self.resolve_connect_waiters(Ok(()));
                self.emit(MeshEvent::LinkStateChanged(LinkState::Connected));
            }
            LinkUpdate::Reconnecting => {
                self.stats.reconnects += 1;
                self.queue.link_dropped();
                self.emit(MeshEvent::LinkStateChanged(LinkState::Reconnecting));
            }
            LinkUpdate::Disconnected(error) => {
                self.queue.link_down();
                self.resolve_connect_waiters(Err(error.unwrap_or(LinkError::Disconnected)));
                self.emit(MeshEvent::LinkStateChanged(LinkState::Disconnected));
            }
            LinkUpdate::Notification(data) => self.handle_notification(&data),
        }
    }

    fn handle_notification(&mut self, data: &[u8]) {
        self.stats.notifications += 1;
        self.last_activity = Instant::now();
        trace!(data = %to_hex(data), "Notification");

        for result in self.codec.decode_stream(data) {
            match result {
                Ok(frame) => self.handle_frame(frame),
                Err(e) => {
                    self.stats.decode_errors += 1;
                    warn!(
                        error = %e,
                        kind = %e.kind(),
                        data = %to_hex(data),
                        "Discarding undecodable frame"
                    );
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: MeshFrame) {
        let FrameBody::StateReport { level } = frame.body() else {
            debug!(frame = %frame, "Ignoring non-report frame from gateway");
            return;
        };

        if let Some(tag) = self.queue.acknowledge(&frame) {
            debug!(tag, address = frame.address(), "Command acknowledged");
        }

        // Level zero means off; keep the last brightness for the next power-on
        let (power, brightness) = if level == 0 {
            (Some(false), None)
        } else {
            (Some(true), Some(level))
        };

        let changed = if frame.is_broadcast() {
            self.table.update_all(power, brightness)
        } else if self.table.update(frame.address(), power, brightness) {
            vec![frame.address()]
        } else {
            Vec::new()
        };

        for address in changed {
            if let Some(device) = self.table.get(address).cloned() {
                self.stats.state_changes += 1;
                self.emit(MeshEvent::StateChanged { address, device });
            }
        }
    }

    /// Hand due frames to the link until the queue has nothing to write
    async fn drive(&mut self) {
        loop {
            let link_ready = self.link.state().is_connected();
            let Some(dispatch) = self.queue.poll(Instant::now(), link_ready) else {
                return;
            };

            let bytes = self.codec.encode(&dispatch.frame);
            debug!(
                tag = dispatch.tag,
                attempt = dispatch.attempt,
                frame = %dispatch.frame,
                bytes = %to_hex(&bytes),
                "Writing command"
            );

            match self.link.write(&bytes).await {
                Ok(()) => {
                    self.last_activity = Instant::now();
                    return;
                }
                Err(e) => {
                    warn!(tag = dispatch.tag, error = %e, "Command write failed");
                    self.queue.write_failed(Instant::now());
                }
            }
        }
    }

    fn flush_completed(&mut self) {
        for completed in self.queue.drain_completed() {
            let address = completed.frame.address();
            if self.keep_alive_tag == Some(completed.tag) {
                self.keep_alive_tag = None;
                debug!(outcome = %completed.outcome, "Keep-alive query finished");
                continue;
            }
            if completed.outcome == CommandOutcome::Timeout
                && address != BROADCAST_ADDRESS
                && self.table.mark_stale(address)
            {
                self.emit(MeshEvent::SubDeviceStale { address });
            }
            if !completed.outcome.is_success() {
                self.emit(MeshEvent::CommandCompleted {
                    tag: completed.tag,
                    address,
                    outcome: completed.outcome,
                });
            }
        }
    }

    fn housekeeping(&mut self) {
        if let Ok(window) = chrono::Duration::from_std(self.config.stale_after) {
            for address in self.table.mark_stale_before(Utc::now() - window) {
                debug!(address, "Sub-device went stale");
                self.emit(MeshEvent::SubDeviceStale { address });
            }
        }

        let Some(interval) = self.config.keep_alive_interval else {
            return;
        };
        if self.link.state().is_connected()
            && self.queue.is_idle()
            && self.last_activity.elapsed() >= interval
        {
            trace!("Sending keep-alive query");
            // Nobody waits on the keep-alive outcome
            let (completion, _) = oneshot::channel();
            let now = Instant::now();
            let tag =
                self.queue
                    .submit_once(MeshFrame::query_state(BROADCAST_ADDRESS), completion, now);
            self.keep_alive_tag = Some(tag);
            self.stats.keep_alives += 1;
            self.last_activity = now;
        }

        trace!(
            link = %self.link.state(),
            queued = self.queue.queued_len(),
            notifications = self.stats.notifications,
            "Controller stats"
        );
    }

    async fn stop(&mut self) {
        if self.link.disconnect().await {
            self.emit(MeshEvent::LinkStateChanged(LinkState::Disconnected));
        }
        self.queue.link_down();
        self.flush_completed();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(MeshError::ControllerStopped));
        }
    }

    fn resolve_connect_waiters(&mut self, result: std::result::Result<(), LinkError>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(result.clone().map_err(MeshError::from));
        }
    }

    fn emit(&self, event: MeshEvent) {
        trace!(?event, "Publishing event");
        // No subscribers is not an error
        let _ = self.event_tx.send(event);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
