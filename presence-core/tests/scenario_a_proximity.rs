use presence_core::{
    config::ProximityConfig,
    proximity::{
        estimate, BeaconReading, ConnectionState, ProximityError, ProximityEvent, ProximityMonitor, SignalStrength,
    },
    simulation::{ManualRadio, SimulatedBeacon, SimulatedRadio},
    test_utils::fast_proximity_config,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn scenario_a_reference_numbers() {
    let config = ProximityConfig::default();
    let est = estimate(&BeaconReading::new("beacon_001", -45), &config);
    assert!((est.distance_meters - 5.01).abs() < 0.01);
    assert!(est.in_range);
}

#[test]
fn stronger_signal_is_always_closer() {
    let mut rng = SmallRng::seed_from_u64(0xA11CE);
    for _ in 0..2_000 {
        let config = ProximityConfig {
            tx_power: rng.gen_range(-80.0..-40.0),
            path_loss_exponent: rng.gen_range(1.5..4.5),
            ..ProximityConfig::default()
        };
        let weak: i32 = rng.gen_range(-110..-21);
        let strong = weak + rng.gen_range(1..20);
        let d_weak = estimate(&BeaconReading::new("b", weak), &config).distance_meters;
        let d_strong = estimate(&BeaconReading::new("b", strong), &config).distance_meters;
        assert!(d_strong < d_weak, "rssi {} vs {} under {:?}", strong, weak, config);
        assert!(d_strong >= 0.0);
    }
}

#[tokio::test]
async fn simulated_beacon_in_classroom_connects() {
    let radio = Arc::new(SimulatedRadio::new(
        vec![
            SimulatedBeacon::new("beacon_001", -45, 0),
            SimulatedBeacon::new("hallway_beacon", -50, 0),
        ],
        Duration::from_millis(20),
        1,
    ));
    let monitor = ProximityMonitor::new(radio.clone(), fast_proximity_config());
    let mut session = monitor.start("beacon_001").await.unwrap();

    let est = session.wait_for_in_range(Duration::from_secs(2)).await.unwrap();
    assert_eq!(est.beacon_id, "beacon_001");
    assert!((est.distance_meters - 5.01).abs() < 0.01);
    assert_eq!(session.state(), ConnectionState::Connected);
    // The buffer keeps the neighbouring beacon too
    assert!(session.latest("hallway_beacon").await.is_some());

    let mut saw_estimate = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), session.next_event()).await {
        if let ProximityEvent::Estimate { estimate, strength, rssi } = event {
            if estimate.beacon_id == "beacon_001" {
                assert_eq!(rssi, -45);
                assert_eq!(strength, SignalStrength::Excellent);
                saw_estimate = true;
                break;
            }
        }
    }
    assert!(saw_estimate);

    session.stop().await;
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test]
async fn distant_beacon_times_out() {
    let radio = Arc::new(SimulatedRadio::new(
        vec![SimulatedBeacon::new("beacon_001", -95, 2)],
        Duration::from_millis(10),
        2,
    ));
    let monitor = ProximityMonitor::new(radio.clone(), fast_proximity_config());
    let session = monitor.start("beacon_001").await.unwrap();

    let err = session.wait_for_in_range(Duration::from_millis(150)).await.unwrap_err();
    assert_eq!(err, ProximityError::Timeout { after: Duration::from_millis(150) });
    assert_eq!(session.state(), ConnectionState::Scanning);
    assert!(session.latest_estimate().await.map_or(false, |e| !e.in_range));
    session.stop().await;
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test]
async fn denied_permission_never_scans() {
    let radio = Arc::new(
        SimulatedRadio::new(vec![SimulatedBeacon::new("beacon_001", -45, 0)], Duration::from_millis(10), 3)
            .deny_permission(),
    );
    let monitor = ProximityMonitor::new(radio.clone(), fast_proximity_config());
    assert_eq!(monitor.start("beacon_001").await.err(), Some(ProximityError::PermissionDenied));
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test]
async fn unavailable_radio_is_reported() {
    let radio = Arc::new(ManualRadio::new(true));
    radio.set_available(false);
    let monitor = ProximityMonitor::new(radio.clone(), fast_proximity_config());
    let err = monitor.start("beacon_001").await.err();
    assert!(matches!(err, Some(ProximityError::RadioUnavailable(_))));
    assert_eq!(radio.active_scans(), 0);
}

#[tokio::test]
async fn moving_out_of_range_drops_back_to_scanning() {
    let radio = Arc::new(ManualRadio::new(true));
    let config = ProximityConfig {
        staleness_window: Duration::from_secs(5),
        ..fast_proximity_config()
    };
    let monitor = ProximityMonitor::new(radio.clone(), config);
    let session = monitor.start("beacon_001").await.unwrap();
    let mut state = session.subscribe_state();

    radio.emit(BeaconReading::new("beacon_001", -45)).await;
    session.wait_for_in_range(Duration::from_secs(1)).await.unwrap();

    radio.emit(BeaconReading::new("beacon_001", -90)).await;
    tokio::time::timeout(Duration::from_secs(1), state.wait_for(|s| *s == ConnectionState::Scanning))
        .await
        .expect("should drop back to scanning")
        .unwrap();
    // Only the newest reading is kept
    assert_eq!(session.latest("beacon_001").await.map(|r| r.rssi), Some(-90));
    session.stop().await;
}
