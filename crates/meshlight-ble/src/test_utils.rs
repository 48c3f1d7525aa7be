//! Test utilities for exercising the controller without a radio
//!
//! [`MockTransport`] stands in for the BLE gateway. It records every frame
//! written to it, lets a test inject notifications or drop the link, and can
//! optionally answer commands like a real gateway via [`MockTransport::with_responder`].
//!
//! # Example
//!
//! ```rust,ignore
//! use meshlight_ble::test_utils::TestFixture;
//!
//! let fixture = TestFixture::with_responder();
//! let (controller, handle) = fixture.controller().unwrap();
//! tokio::spawn(controller.run());
//! handle.connect().await.unwrap();
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as stream_mpsc;
use meshlight_protocol::{FrameBody, MeshCodec, MeshFrame, BROADCAST_ADDRESS};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

use crate::config::{MeshConfig, MeshConfigBuilder};
use crate::controller::{MeshController, MeshHandle};
use crate::error::{LinkError, Result};
use crate::interface::{BleTransport, NotificationStream};

/// Gateway simulation used by the responder
#[derive(Debug)]
struct Responder {
    codec: MeshCodec,
    levels: BTreeMap<u8, u8>,
    muted: HashSet<u8>,
}

impl Responder {
    fn reply(&mut self, data: &[u8]) -> Vec<Bytes> {
        let Ok(frame) = self.codec.decode(data) else {
            return Vec::new();
        };
        let address = frame.address();

        let targets: Vec<u8> = if address == BROADCAST_ADDRESS {
            self.levels.keys().copied().collect()
        } else {
            vec![address]
        };

        let mut replies = Vec::new();
        for target in targets {
            let level = self.levels.entry(target).or_insert(0);
            match frame.body() {
                FrameBody::SetPower { on: true } if *level == 0 => *level = u8::MAX,
                FrameBody::SetPower { on: false } => *level = 0,
                FrameBody::SetBrightness { level: requested } => *level = requested,
                _ => {}
            }
            if !self.muted.contains(&target) {
                let report = MeshFrame::state_report(target, i32::from(*level));
                replies.push(self.codec.encode(&report));
            }
        }
        replies
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    connect_attempts: u32,
    fail_connects: u32,
    connect_delay: Option<Duration>,
    fail_writes: u32,
    writes: Vec<Bytes>,
    disconnects: u32,
    notify_tx: Option<stream_mpsc::UnboundedSender<Bytes>>,
    responder: Option<Responder>,
}

/// In-memory BLE transport
///
/// Clones share state, so a test keeps one clone while the controller owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that answers every command with a state report
    pub fn with_responder(codec: MeshCodec) -> Self {
        let transport = Self::new();
        transport.state.lock().responder = Some(Responder {
            codec,
            levels: BTreeMap::new(),
            muted: HashSet::new(),
        });
        transport
    }

    /// Stop answering commands for one address
    pub fn mute(&self, address: u8) {
        if let Some(responder) = self.state.lock().responder.as_mut() {
            responder.muted.insert(address);
        }
    }

    /// Resume answering commands for one address
    pub fn unmute(&self, address: u8) {
        if let Some(responder) = self.state.lock().responder.as_mut() {
            responder.muted.remove(&address);
        }
    }

    /// Fail the next `n` connection attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().fail_connects = n;
    }

    /// Delay every connection attempt
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    /// Fail the next `n` writes
    pub fn fail_next_writes(&self, n: u32) {
        self.state.lock().fail_writes = n;
    }

    /// Inject a notification from the gateway
    ///
    /// Returns false when nobody is subscribed.
    pub fn notify(&self, data: impl Into<Bytes>) -> bool {
        match &self.state.lock().notify_tx {
            Some(tx) => tx.unbounded_send(data.into()).is_ok(),
            None => false,
        }
    }

    /// Simulate the gateway dropping the connection
    pub fn drop_link(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.notify_tx = None;
    }

    /// Frames written so far
    pub fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    /// Number of frames written so far
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    /// Number of connection attempts so far
    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    /// Number of disconnect calls so far
    pub fn disconnects(&self) -> u32 {
        self.state.lock().disconnects
    }

    /// Wait until at least `n` frames were written
    ///
    /// Polls every 10ms; with a paused test clock the wait costs no real
    /// time.
    pub async fn wait_for_writes(&self, n: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.write_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn connect(&self) -> std::result::Result<(), LinkError> {
        let delay = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(LinkError::ConnectFailed {
                device: "mock".to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> std::result::Result<(), LinkError> {
        let mut state = self.state.lock();
        state.connected = false;
        state.notify_tx = None;
        state.disconnects += 1;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn write(&self, data: &[u8]) -> std::result::Result<(), LinkError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(LinkError::WriteFailed("simulated failure".to_string()));
        }

        trace!(len = data.len(), "Mock write");
        state.writes.push(Bytes::copy_from_slice(data));

        let replies = match state.responder.as_mut() {
            Some(responder) => responder.reply(data),
            None => Vec::new(),
        };
        if let Some(tx) = &state.notify_tx {
            for reply in replies {
                let _ = tx.unbounded_send(reply);
            }
        }
        Ok(())
    }

    async fn notifications(&self) -> std::result::Result<NotificationStream, LinkError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(LinkError::Disconnected);
        }
        let (tx, rx) = stream_mpsc::unbounded();
        state.notify_tx = Some(tx);
        Ok(Box::pin(rx))
    }

    fn name(&self) -> &str {
        "MockTransport"
    }
}

/// Test configuration: keep-alive off, short timeouts
pub fn test_config() -> MeshConfig {
    MeshConfigBuilder::new()
        .keep_alive(None)
        .ack_timeout(Duration::from_millis(500))
        .retry_backoff(Duration::from_millis(100))
        .build()
}

/// Pre-configured transport and configuration for controller tests
pub struct TestFixture {
    /// Mock transport (clone shared with the controller)
    pub transport: MockTransport,
    /// Test configuration
    pub config: MeshConfig,
}

impl TestFixture {
    /// Silent gateway: writes are recorded, nothing is reported back
    pub fn new() -> Self {
        Self {
            transport: MockTransport::new(),
            config: test_config(),
        }
    }

    /// Gateway that answers every command
    pub fn with_responder() -> Self {
        Self {
            transport: MockTransport::with_responder(MeshCodec::default()),
            config: test_config(),
        }
    }

    /// Add a sub-device to the start-up configuration
    pub fn sub_device(mut self, address: u8, label: &str) -> Self {
        self.config.sub_devices.push(crate::config::SubDeviceConfig {
            address,
            label: label.to_string(),
        });
        self
    }

    /// Build a controller over a clone of the transport
    pub fn controller(&self) -> Result<(MeshController<MockTransport>, MeshHandle)> {
        MeshController::new(self.transport.clone(), &self.config)
    }

    /// Encode a state report the way the gateway would
    pub fn report(&self, address: u8, level: i32) -> Bytes {
        MeshCodec::new(self.config.opcodes)
            .unwrap_or_default()
            .encode(&MeshFrame::state_report(address, level))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_mock_records_writes() {
        let transport = MockTransport::new();
        assert!(transport.write(&[1, 2, 3]).await.is_err());

        transport.connect().await.unwrap();
        transport.write(&[1, 2, 3]).await.unwrap();
        assert_eq!(transport.writes(), vec![Bytes::from_static(&[1, 2, 3])]);
    }

    #[tokio::test]
    async fn test_mock_failures() {
        let transport = MockTransport::new();
        transport.fail_next_connects(1);
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.connect_attempts(), 2);

        transport.fail_next_writes(1);
        assert!(matches!(
            transport.write(&[0]).await,
            Err(LinkError::WriteFailed(_))
        ));
        assert!(transport.write(&[0]).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_ends_stream() {
        let transport = MockTransport::new();
        transport.connect().await.unwrap();
        let mut stream = transport.notifications().await.unwrap();

        assert!(transport.notify(vec![9u8]));
        assert_eq!(stream.next().await, Some(Bytes::from_static(&[9])));

        transport.drop_link();
        assert_eq!(stream.next().await, None);
        assert!(!transport.notify(vec![9u8]));
    }

    #[tokio::test]
    async fn test_responder_reports_state() {
        let codec = MeshCodec::default();
        let transport = MockTransport::with_responder(codec.clone());
        transport.connect().await.unwrap();
        let mut stream = transport.notifications().await.unwrap();

        transport
            .write(&codec.encode(&MeshFrame::set_brightness(3, 180)))
            .await
            .unwrap();
        let report = codec.decode(&stream.next().await.unwrap()).unwrap();
        assert_eq!(report, MeshFrame::state_report(3, 180));

        transport.mute(3);
        transport
            .write(&codec.encode(&MeshFrame::query_state(3)))
            .await
            .unwrap();
        transport.unmute(3);
        transport
            .write(&codec.encode(&MeshFrame::set_power(3, false)))
            .await
            .unwrap();
        let report = codec.decode(&stream.next().await.unwrap()).unwrap();
        assert_eq!(report, MeshFrame::state_report(3, 0));
    }
}
