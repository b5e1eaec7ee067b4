//! Auto-update liveness and channel-contention tests over the mock transport.

use std::sync::Arc;
use std::time::Duration;

use async_instrument::action::ActionTracker;
use async_instrument::config::ControllerSettings;
use async_instrument::controller::{ConnectionState, DeviceController};
use async_instrument::mock::{mock_device, MockTransport};
use async_instrument::updater::UpdaterEvent;
use tokio::sync::broadcast;

fn polling_settings(interval: Duration) -> ControllerSettings {
    ControllerSettings {
        auto_update_enabled: true,
        auto_update_interval: interval,
        ..ControllerSettings::default()
    }
}

fn power_meter(settings: ControllerSettings) -> (DeviceController, Arc<MockTransport>) {
    let transport = Arc::new(MockTransport::new());
    let device = mock_device(Arc::clone(&transport));
    let controller =
        DeviceController::new(device, transport.clone(), settings, ActionTracker::new());
    (controller, transport)
}

async fn count_cycles(events: &mut broadcast::Receiver<UpdaterEvent>, target: usize) {
    let mut cycles = 0;
    while cycles < target {
        match events.recv().await {
            Ok(UpdaterEvent::CycleCompleted) => cycles += 1,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("updater channel closed early"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_connect_starts_polling_and_values_track_the_device() {
    let (controller, transport) = power_meter(polling_settings(Duration::from_millis(20)));
    let mut cycles = controller.updater().subscribe();

    controller.connect();
    controller.join_connect().await;
    assert!(controller.updater().is_running());

    count_cycles(&mut cycles, 3).await;

    // Change the device; polling picks the new value up without any caller
    // involvement.
    transport.script("READ:POW?", "2.5");
    let power = controller.device().property("power_mw").expect("declared");
    while power.value_string() != "2.5" {
        count_cycles(&mut cycles, 1).await;
    }

    controller.shutdown().await;
    assert!(!controller.updater().is_running());
    assert_eq!(controller.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_polling_and_user_calls_share_the_channel_cleanly() {
    let (controller, transport) =
        power_meter(polling_settings(Duration::from_millis(10)));
    controller.connect();
    controller.join_connect().await;

    // Hammer the wavelength property from "the user" while the updater sweeps
    // in the background. The transport must only ever see one exchange at a
    // time.
    let wavelength = Arc::clone(
        controller
            .device()
            .property("wavelength_nm")
            .expect("declared"),
    );
    for step in 0..20u32 {
        wavelength.write_string(&format!("{}", 700 + step));
        wavelength.join_write().await;
        wavelength.join_read().await;
    }

    assert!(!transport.overlap_detected());
    // A sweep read that raced the last write may have cached a stale value;
    // the polling loop converges on the device's final state.
    let mut cycles = controller.updater().subscribe();
    while wavelength.value_string() != "719" {
        count_cycles(&mut cycles, 1).await;
    }

    controller.shutdown().await;
    assert!(!transport.overlap_detected());
}

#[tokio::test(start_paused = true)]
async fn test_manual_mode_never_starts_the_loop() {
    let (controller, _transport) = power_meter(ControllerSettings {
        auto_update_enabled: false,
        ..ControllerSettings::default()
    });

    controller.connect();
    controller.join_connect().await;
    assert_eq!(controller.state(), ConnectionState::Connected);
    assert!(!controller.updater().is_running());

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_waits_for_loop_exit() {
    let transport = Arc::new(MockTransport::new().with_latency(Duration::from_millis(5)));
    let device = mock_device(Arc::clone(&transport));
    let controller = DeviceController::new(
        device,
        transport.clone(),
        polling_settings(Duration::from_millis(10)),
        ActionTracker::new(),
    );

    controller.connect();
    controller.join_connect().await;
    assert!(controller.updater().is_running());

    controller.disconnect();
    controller.join_disconnect().await;

    // The loop has actually exited, not merely been asked to: no further
    // exchanges happen after the session closed.
    assert!(!controller.updater().is_running());
    assert_eq!(transport.open_session_count(), 0);
    let settled = transport.exchange_log().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.exchange_log().len(), settled);
}
