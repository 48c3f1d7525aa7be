//! End-to-end tests driving a MeshController over the mock transport

use std::time::Duration;

use meshlight_ble::{
    CancelResult, CommandOutcome, LinkState, MeshCodec, MeshEvent, MeshFrame, MeshHandle,
    TestFixture,
};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(30);

async fn start(fixture: &TestFixture) -> MeshHandle {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("meshlight_ble=debug")
        .with_test_writer()
        .try_init();

    let (controller, handle) = fixture.controller().unwrap();
    tokio::spawn(controller.run());
    handle.connect().await.unwrap();
    handle
}

async fn next_matching(
    events: &mut broadcast::Receiver<MeshEvent>,
    predicate: impl Fn(&MeshEvent) -> bool,
) -> MeshEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("no matching event")
}

async fn next_state_change(events: &mut broadcast::Receiver<MeshEvent>) -> MeshEvent {
    next_matching(events, |e| matches!(e, MeshEvent::StateChanged { .. })).await
}

fn encode(frame: MeshFrame) -> Vec<u8> {
    MeshCodec::default().encode(&frame).to_vec()
}

#[tokio::test(start_paused = true)]
async fn test_brightness_scenario() {
    let fixture = TestFixture::new().sub_device(3, "lamp1");
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    let command = handle.set_brightness(3, 180).await.unwrap();
    assert!(fixture.transport.wait_for_writes(1, WAIT).await);
    assert_eq!(fixture.transport.writes()[0].as_ref(), &[0x02, 0x03, 0xB4, 0xB9]);

    assert!(fixture.transport.notify(fixture.report(3, 180)));
    assert_eq!(command.outcome().await, CommandOutcome::Success);

    match next_state_change(&mut events).await {
        MeshEvent::StateChanged { address, device } => {
            assert_eq!(address, 3);
            assert_eq!(device.label, "lamp1");
            assert!(device.power);
            assert_eq!(device.brightness, 180);
            assert!(device.last_updated.is_some());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_brightness_is_clamped() {
    let fixture = TestFixture::with_responder();
    let handle = start(&fixture).await;

    let command = handle.set_brightness(3, 400).await.unwrap();
    assert_eq!(command.outcome().await, CommandOutcome::Success);
    assert_eq!(
        fixture.transport.writes()[0].as_ref(),
        encode(MeshFrame::set_brightness(3, 255)).as_slice()
    );
}

#[tokio::test(start_paused = true)]
async fn test_coalescing_sends_latest_value_once() {
    let fixture = TestFixture::new();
    let handle = start(&fixture).await;

    let blocker = handle.set_power(1, true).await.unwrap();
    let first = handle.set_brightness(3, 50).await.unwrap();
    let second = handle.set_brightness(3, 200).await.unwrap();
    assert_ne!(first.tag(), second.tag());
    assert!(fixture.transport.wait_for_writes(1, WAIT).await);

    fixture.transport.notify(fixture.report(1, 255));
    assert_eq!(blocker.outcome().await, CommandOutcome::Success);

    assert!(fixture.transport.wait_for_writes(2, WAIT).await);
    fixture.transport.notify(fixture.report(3, 200));
    assert_eq!(first.outcome().await, CommandOutcome::Success);
    assert_eq!(second.outcome().await, CommandOutcome::Success);

    let writes = fixture.transport.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].as_ref(), encode(MeshFrame::set_brightness(3, 200)).as_slice());
    assert_eq!(handle.stats().await.unwrap().queue.coalesced, 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_after_retry_limit() {
    let fixture = TestFixture::new().sub_device(4, "porch");
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    let command = handle.set_power(4, true).await.unwrap();
    assert_eq!(command.outcome().await, CommandOutcome::Timeout);

    let writes = fixture.transport.writes();
    assert_eq!(writes.len(), 1 + fixture.config.queue.retry_limit as usize);
    assert!(writes.iter().all(|w| w == &writes[0]));

    let stale = next_matching(&mut events, |e| matches!(e, MeshEvent::SubDeviceStale { .. })).await;
    assert_eq!(stale, MeshEvent::SubDeviceStale { address: 4 });
    let completed =
        next_matching(&mut events, |e| matches!(e, MeshEvent::CommandCompleted { .. })).await;
    assert!(matches!(
        completed,
        MeshEvent::CommandCompleted {
            address: 4,
            outcome: CommandOutcome::Timeout,
            ..
        }
    ));
    assert!(handle.sub_device(4).await.unwrap().unwrap().stale);

    // The queue keeps working afterwards
    let retry = handle.query_state(4).await.unwrap();
    assert!(fixture.transport.wait_for_writes(5, WAIT).await);
    fixture.transport.notify(fixture.report(4, 10));
    assert_eq!(retry.outcome().await, CommandOutcome::Success);
    assert!(!handle.sub_device(4).await.unwrap().unwrap().stale);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_report_clears_stale_with_event() {
    let fixture = TestFixture::new().sub_device(4, "porch");
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    fixture.transport.notify(fixture.report(4, 10));
    next_state_change(&mut events).await;

    let command = handle.set_power(4, true).await.unwrap();
    assert_eq!(command.outcome().await, CommandOutcome::Timeout);
    next_matching(&mut events, |e| matches!(e, MeshEvent::SubDeviceStale { .. })).await;
    assert!(handle.sub_device(4).await.unwrap().unwrap().stale);

    // Same power and brightness as before; only freshness changes
    fixture.transport.notify(fixture.report(4, 10));
    match next_state_change(&mut events).await {
        MeshEvent::StateChanged { address, device } => {
            assert_eq!(address, 4);
            assert!(!device.stale);
            assert!(device.power);
            assert_eq!(device.brightness, 10);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_is_retried() {
    let fixture = TestFixture::with_responder();
    let handle = start(&fixture).await;

    fixture.transport.fail_next_writes(2);
    let command = handle.set_power(2, true).await.unwrap();
    assert_eq!(command.outcome().await, CommandOutcome::Success);
    assert_eq!(fixture.transport.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_cascade() {
    let mut fixture = TestFixture::new();
    fixture.config.reconnect.enabled = false;
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    let mut commands = Vec::new();
    for address in 1..=3 {
        commands.push(handle.set_power(address, true).await.unwrap());
    }
    assert!(fixture.transport.wait_for_writes(1, WAIT).await);

    fixture.transport.drop_link();
    for command in commands {
        assert_eq!(command.outcome().await, CommandOutcome::LinkLost);
    }

    let state = next_matching(&mut events, |e| matches!(e, MeshEvent::LinkStateChanged(_))).await;
    assert_eq!(state, MeshEvent::LinkStateChanged(LinkState::Disconnected));
    assert_eq!(handle.link_state().await.unwrap(), LinkState::Disconnected);
    assert_eq!(handle.stats().await.unwrap().queue.link_lost, 3);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_preserves_queued_commands() {
    let fixture = TestFixture::new();
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    let in_flight = handle.set_power(1, true).await.unwrap();
    let queued = handle.set_power(2, true).await.unwrap();
    assert!(fixture.transport.wait_for_writes(1, WAIT).await);

    fixture.transport.drop_link();
    assert_eq!(in_flight.outcome().await, CommandOutcome::LinkLost);

    let reconnecting =
        next_matching(&mut events, |e| matches!(e, MeshEvent::LinkStateChanged(_))).await;
    assert_eq!(reconnecting, MeshEvent::LinkStateChanged(LinkState::Reconnecting));
    let connected =
        next_matching(&mut events, |e| matches!(e, MeshEvent::LinkStateChanged(_))).await;
    assert_eq!(connected, MeshEvent::LinkStateChanged(LinkState::Connected));

    assert!(fixture.transport.wait_for_writes(2, WAIT).await);
    assert_eq!(
        fixture.transport.writes()[1].as_ref(),
        encode(MeshFrame::set_power(2, true)).as_slice()
    );
    fixture.transport.notify(fixture.report(2, 255));
    assert_eq!(queued.outcome().await, CommandOutcome::Success);
    assert_eq!(fixture.transport.connect_attempts(), 2);
    assert_eq!(handle.stats().await.unwrap().reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_pending_commands() {
    let fixture = TestFixture::new();
    let handle = start(&fixture).await;

    let first = handle.set_power(1, true).await.unwrap();
    let second = handle.set_power(2, false).await.unwrap();
    handle.disconnect().await.unwrap();

    assert_eq!(first.outcome().await, CommandOutcome::LinkLost);
    assert_eq!(second.outcome().await, CommandOutcome::LinkLost);
    assert_eq!(handle.link_state().await.unwrap(), LinkState::Disconnected);

    // Disconnect is terminal
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fixture.transport.connect_attempts(), 1);
    let late = handle.set_power(1, true).await.unwrap();
    assert_eq!(late.outcome().await, CommandOutcome::LinkLost);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_only_before_dispatch() {
    let fixture = TestFixture::new();
    let handle = start(&fixture).await;

    let in_flight = handle.set_power(1, true).await.unwrap();
    let queued = handle.set_power(2, true).await.unwrap();

    assert_eq!(in_flight.cancel().await.unwrap(), CancelResult::InFlight);
    assert_eq!(queued.cancel().await.unwrap(), CancelResult::Cancelled);
    assert_eq!(queued.outcome().await, CommandOutcome::Cancelled);

    fixture.transport.notify(fixture.report(1, 255));
    assert_eq!(in_flight.outcome().await, CommandOutcome::Success);
    assert_eq!(fixture.transport.write_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_queued_command_expires() {
    let mut fixture = TestFixture::new();
    fixture.config.queue.max_staleness = Duration::from_secs(1);
    let handle = start(&fixture).await;

    let in_flight = handle.set_power(1, true).await.unwrap();
    let queued = handle.set_power(2, true).await.unwrap();

    assert_eq!(queued.outcome().await, CommandOutcome::Expired);
    assert_eq!(in_flight.outcome().await, CommandOutcome::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_address_creates_shadow() {
    let fixture = TestFixture::new();
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    fixture.transport.notify(fixture.report(9, 10));
    match next_state_change(&mut events).await {
        MeshEvent::StateChanged { address, device } => {
            assert_eq!(address, 9);
            assert!(device.unregistered);
            assert!(device.label.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }

    let promoted = handle.register(9, "porch").await.unwrap();
    assert!(!promoted.unregistered);
    assert_eq!(promoted.brightness, 10);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_report_emits_once() {
    let fixture = TestFixture::new().sub_device(3, "lamp1");
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    fixture.transport.notify(fixture.report(3, 180));
    fixture.transport.notify(fixture.report(3, 180));
    fixture.transport.notify(fixture.report(3, 90));

    let levels: Vec<u8> = [
        next_state_change(&mut events).await,
        next_state_change(&mut events).await,
    ]
    .into_iter()
    .map(|e| match e {
        MeshEvent::StateChanged { device, .. } => device.brightness,
        _ => 0,
    })
    .collect();
    assert_eq!(levels, vec![180, 90]);
    assert_eq!(handle.stats().await.unwrap().state_changes, 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_level_turns_off_and_keeps_brightness() {
    let fixture = TestFixture::new().sub_device(3, "lamp1");
    let handle = start(&fixture).await;

    fixture.transport.notify(fixture.report(3, 120));
    fixture.transport.notify(fixture.report(3, 0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let device = handle.sub_device(3).await.unwrap().unwrap();
    assert!(!device.power);
    assert_eq!(device.brightness, 120);
}

#[tokio::test(start_paused = true)]
async fn test_garbage_is_discarded() {
    let fixture = TestFixture::new().sub_device(3, "lamp1");
    let handle = start(&fixture).await;
    let mut events = handle.subscribe();

    fixture.transport.notify(vec![0xFF, 0x01, 0x02]);
    fixture.transport.notify(vec![0x04, 0x03, 0xB4, 0x00]);
    fixture.transport.notify(fixture.report(3, 180));

    assert!(matches!(
        next_state_change(&mut events).await,
        MeshEvent::StateChanged { address: 3, .. }
    ));
    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.decode_errors, 2);
    assert_eq!(stats.notifications, 3);
}

#[tokio::test(start_paused = true)]
async fn test_back_to_back_frames_in_one_notification() {
    let fixture = TestFixture::new().sub_device(1, "a").sub_device(2, "b");
    let handle = start(&fixture).await;

    let mut data = fixture.report(1, 10).to_vec();
    data.extend_from_slice(&fixture.report(2, 20));
    fixture.transport.notify(data);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handle.sub_device(1).await.unwrap().unwrap().brightness, 10);
    assert_eq!(handle.sub_device(2).await.unwrap().unwrap().brightness, 20);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_report_updates_every_sub_device() {
    let fixture = TestFixture::new().sub_device(1, "a").sub_device(2, "b");
    let handle = start(&fixture).await;

    fixture.transport.notify(fixture.report(0, 50));
    tokio::time::sleep(Duration::from_millis(50)).await;

    for device in handle.sub_devices().await.unwrap() {
        assert!(device.power);
        assert_eq!(device.brightness, 50);
    }
}

#[tokio::test(start_paused = true)]
async fn test_responder_round_trip() {
    let fixture = TestFixture::with_responder().sub_device(3, "lamp1");
    let handle = start(&fixture).await;

    let on = handle.set_power(3, true).await.unwrap();
    assert_eq!(on.outcome().await, CommandOutcome::Success);
    let dim = handle.set_brightness(3, 42).await.unwrap();
    assert_eq!(dim.outcome().await, CommandOutcome::Success);

    let device = handle.sub_device(3).await.unwrap().unwrap();
    assert!(device.power);
    assert_eq!(device.brightness, 42);
    assert_eq!(handle.stats().await.unwrap().queue.succeeded, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connect_failure_reported() {
    let fixture = TestFixture::new();
    fixture.transport.fail_next_connects(10);
    let (controller, handle) = fixture.controller().unwrap();
    tokio::spawn(controller.run());

    assert!(handle.connect().await.is_err());
    assert_eq!(fixture.transport.connect_attempts(), 3);
    assert_eq!(handle.link_state().await.unwrap(), LinkState::Disconnected);
}
