use smartcloset::accessory::{Accessory, AccessorySet};
use smartcloset::actuator::{
    ActuatorCoordinator, ActuatorMap, CoordinatorConfig, CoordinatorError, CoordinatorState,
    DeployOutcome, LinkProbe, RecordingLink, RetractOutcome,
};
use smartcloset::bus::{handler_fn, EventBus, HandlerError};
use smartcloset::events::{Event, EventKind};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SETTLE: Duration = Duration::from_millis(500);

struct Rig {
    bus: Arc<EventBus>,
    coordinator: Arc<ActuatorCoordinator>,
    probe: LinkProbe,
    captures: Arc<AtomicUsize>,
}

fn config(mapping: ActuatorMap) -> CoordinatorConfig {
    CoordinatorConfig {
        mapping,
        settle: SETTLE,
        startup_settle: Duration::from_millis(200),
        response_timeout: Duration::from_millis(10),
    }
}

async fn rig_with(mapping: ActuatorMap) -> Rig {
    let bus = Arc::new(EventBus::new());
    let link = RecordingLink::new();
    let probe = link.probe();

    let captures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&captures);
    bus.subscribe(
        EventKind::CaptureRequested,
        handler_fn("capture.counter", move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }),
    );

    let coordinator = Arc::new(ActuatorCoordinator::new(
        Arc::clone(&bus),
        Box::new(link),
        config(mapping),
    ));
    coordinator.start().await.unwrap();
    // start forces a known state; tests look only at what follows
    assert_eq!(probe.sent(), vec!["0"]);
    probe.clear();

    Rig {
        bus,
        coordinator,
        probe,
        captures,
    }
}

async fn rig() -> Rig {
    rig_with(ActuatorMap::default()).await
}

fn set(items: &[Accessory]) -> AccessorySet {
    items.iter().copied().collect()
}

#[tokio::test(start_paused = true)]
async fn test_start_forces_known_state() {
    let rig = rig().await;
    let status = rig.coordinator.status().await;

    assert_eq!(status.state, CoordinatorState::Idle);
    assert!(status.active.is_empty());
    assert!(!status.latched);
    assert!(status.link_open);
    assert_eq!(status.commands_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_fails_when_link_cannot_open() {
    let bus = Arc::new(EventBus::new());
    let coordinator = ActuatorCoordinator::new(
        bus,
        Box::new(RecordingLink::refusing()),
        CoordinatorConfig::default(),
    );

    let err = coordinator.start().await.unwrap_err();
    assert!(matches!(err, CoordinatorError::ChannelOpen(_)));
    assert!(!coordinator.status().await.link_open);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_sends_sorted_indices() {
    let rig = rig().await;

    let outcome = rig
        .coordinator
        .request_deploy(&set(&[Accessory::Warmth, Accessory::Umbrella, Accessory::Mask]))
        .await;

    assert_eq!(outcome, DeployOutcome::Deployed);
    assert_eq!(rig.probe.sent(), vec!["134"]);
    let status = rig.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Deployed);
    assert!(status.latched);
    assert_eq!(
        status.active,
        set(&[Accessory::Umbrella, Accessory::Mask, Accessory::Warmth])
    );
}

#[tokio::test(start_paused = true)]
async fn test_shared_actuator_collapses_to_one_digit() {
    let table: BTreeMap<Accessory, u8> = [
        (Accessory::Umbrella, 1),
        (Accessory::SunProtection, 3),
        (Accessory::Mask, 4),
        (Accessory::Warmth, 3),
    ]
    .into_iter()
    .collect();
    let rig = rig_with(ActuatorMap::new(table).unwrap()).await;

    rig.coordinator
        .request_deploy(&set(&Accessory::ALL))
        .await;

    assert_eq!(rig.probe.sent(), vec!["134"]);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_is_suppressed_while_latched() {
    let rig = rig().await;
    rig.coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    rig.probe.clear();

    let requests = [
        set(&[Accessory::Mask]),
        set(&[]),
        set(&[Accessory::Umbrella, Accessory::Warmth]),
        set(&Accessory::ALL),
    ];
    for needed in &requests {
        assert_eq!(
            rig.coordinator.request_deploy(needed).await,
            DeployOutcome::Suppressed
        );
    }

    assert!(rig.probe.sent().is_empty());
    let status = rig.coordinator.status().await;
    assert_eq!(status.active, set(&[Accessory::Umbrella]));
    assert!(status.latched);
    assert_eq!(status.suppressed_requests, requests.len() as u32);
}

#[tokio::test(start_paused = true)]
async fn test_empty_request_always_retracts() {
    let rig = rig().await;

    // From idle
    assert_eq!(
        rig.coordinator.request_deploy(&set(&[])).await,
        DeployOutcome::RetractedEmpty
    );
    assert_eq!(
        rig.coordinator.request_deploy(&set(&[])).await,
        DeployOutcome::RetractedEmpty
    );
    assert_eq!(rig.probe.sent(), vec!["0", "0"]);
    assert!(!rig.coordinator.status().await.latched);

    // After a full occupancy cycle
    rig.coordinator
        .request_deploy(&set(&[Accessory::Mask]))
        .await;
    rig.coordinator.request_retract().await;
    rig.probe.clear();

    assert_eq!(
        rig.coordinator.request_deploy(&set(&[])).await,
        DeployOutcome::RetractedEmpty
    );
    assert_eq!(rig.probe.sent(), vec!["0"]);
    assert_eq!(rig.coordinator.state().await, CoordinatorState::Idle);
    // An empty deploy is not a retraction; no capture
    assert_eq!(rig.captures.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unmapped_accessories_are_dropped() {
    let table: BTreeMap<Accessory, u8> = [(Accessory::Umbrella, 2)].into_iter().collect();
    let rig = rig_with(ActuatorMap::new(table).unwrap()).await;

    let outcome = rig
        .coordinator
        .request_deploy(&set(&[Accessory::Umbrella, Accessory::Mask]))
        .await;
    assert_eq!(outcome, DeployOutcome::Deployed);
    assert_eq!(rig.probe.sent(), vec!["2"]);
    assert_eq!(
        rig.coordinator.status().await.active,
        set(&[Accessory::Umbrella])
    );

    rig.coordinator.request_retract().await;
    rig.probe.clear();

    // Nothing mappable is the same as nothing needed
    let outcome = rig
        .coordinator
        .request_deploy(&set(&[Accessory::Mask]))
        .await;
    assert_eq!(outcome, DeployOutcome::RetractedEmpty);
    assert_eq!(rig.probe.sent(), vec!["0"]);
    assert!(!rig.coordinator.status().await.latched);
}

#[tokio::test(start_paused = true)]
async fn test_retract_twice_is_one_command_and_one_capture() {
    let rig = rig().await;
    rig.coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    rig.probe.clear();

    assert_eq!(
        rig.coordinator.request_retract().await,
        RetractOutcome::Retracted
    );
    assert_eq!(
        rig.coordinator.request_retract().await,
        RetractOutcome::AlreadyIdle
    );

    assert_eq!(rig.probe.sent(), vec!["0"]);
    assert_eq!(rig.captures.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retract_when_idle_does_nothing() {
    let rig = rig().await;

    assert_eq!(
        rig.coordinator.request_retract().await,
        RetractOutcome::AlreadyIdle
    );
    assert!(rig.probe.sent().is_empty());
    assert_eq!(rig.captures.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deploy_retract_round_trip() {
    let rig = rig().await;
    let initial = rig.coordinator.status().await;

    rig.coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    rig.coordinator.request_retract().await;

    let after = rig.coordinator.status().await;
    assert_eq!(after.state, initial.state);
    assert_eq!(after.active, initial.active);
    assert_eq!(after.latched, initial.latched);

    // The next occupancy deploys again
    assert_eq!(
        rig.coordinator
            .request_deploy(&set(&[Accessory::SunProtection]))
            .await,
        DeployOutcome::Deployed
    );
    assert_eq!(rig.probe.sent(), vec!["1", "0", "2"]);
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_link_drops_request_then_recovers() {
    let rig = rig().await;
    rig.probe.set_unavailable(true);

    let outcome = rig
        .coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    assert_eq!(outcome, DeployOutcome::Dropped);

    let status = rig.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Idle);
    assert!(status.active.is_empty());
    assert_eq!(status.dropped_requests, 1);
    assert!(rig.probe.sent().is_empty());

    // Board comes back; the coordinator reopens the link on the next request
    rig.probe.set_unavailable(false);
    let outcome = rig
        .coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    assert_eq!(outcome, DeployOutcome::Deployed);
    assert_eq!(rig.probe.sent(), vec!["1"]);
    assert!(rig.probe.open_count() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_retract_keeps_state_and_skips_capture() {
    let rig = rig().await;
    rig.coordinator
        .request_deploy(&set(&[Accessory::Mask]))
        .await;
    rig.probe.set_fail_writes(true);

    assert_eq!(
        rig.coordinator.request_retract().await,
        RetractOutcome::Dropped
    );
    let status = rig.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Deployed);
    assert_eq!(status.active, set(&[Accessory::Mask]));
    assert_eq!(rig.captures.load(Ordering::SeqCst), 0);

    rig.probe.set_fail_writes(false);
    assert_eq!(
        rig.coordinator.request_retract().await,
        RetractOutcome::Retracted
    );
    assert_eq!(rig.captures.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_each_command_holds_for_settle_time() {
    let rig = rig().await;
    let before = tokio::time::Instant::now();

    rig.coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    rig.coordinator.request_retract().await;

    assert!(before.elapsed() >= SETTLE * 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_deploys_latch_once() {
    let rig = rig().await;
    let a = Arc::clone(&rig.coordinator);
    let b = Arc::clone(&rig.coordinator);
    let needed = set(&[Accessory::Umbrella]);
    let needed_b = needed.clone();

    let (first, second) = tokio::join!(
        async move { a.request_deploy(&needed).await },
        async move { b.request_deploy(&needed_b).await },
    );

    let mut outcomes = [first, second];
    outcomes.sort_by_key(|o| *o == DeployOutcome::Suppressed);
    assert_eq!(outcomes, [DeployOutcome::Deployed, DeployOutcome::Suppressed]);
    assert_eq!(rig.probe.sent(), vec!["1"]);
}

#[tokio::test(start_paused = true)]
async fn test_stop_retracts_and_always_closes() {
    let rig = rig().await;
    rig.coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    rig.probe.clear();

    rig.coordinator.stop().await.unwrap();

    // Retract for the occupancy, then the final retract-all
    assert_eq!(rig.probe.sent(), vec!["0", "0"]);
    assert_eq!(rig.captures.load(Ordering::SeqCst), 1);
    assert!(!rig.probe.is_open());
    assert_eq!(rig.probe.close_count(), 1);
    assert_eq!(rig.coordinator.state().await, CoordinatorState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stop_closes_even_when_writes_fail() {
    let rig = rig().await;
    rig.coordinator
        .request_deploy(&set(&[Accessory::Umbrella]))
        .await;
    rig.probe.set_fail_writes(true);

    rig.coordinator.stop().await.unwrap();

    assert!(!rig.probe.is_open());
    assert_eq!(rig.probe.close_count(), 1);
    assert_eq!(rig.captures.load(Ordering::SeqCst), 0);

    // A stopped coordinator does not reopen the link
    rig.probe.set_fail_writes(false);
    assert_eq!(
        rig.coordinator.request_retract().await,
        RetractOutcome::Dropped
    );
    assert_eq!(rig.probe.open_count(), 1);
    assert_eq!(rig.probe.sent(), vec!["1"]);
}

#[tokio::test(start_paused = true)]
async fn test_bus_drives_deploy_and_retract() {
    let rig = rig().await;
    rig.coordinator.attach();

    rig.bus
        .publish(Event::accessories_needed(&set(&[Accessory::Mask])))
        .await
        .unwrap();
    assert_eq!(rig.coordinator.state().await, CoordinatorState::Deployed);

    rig.bus.publish(Event::presence_left(None)).await.unwrap();
    assert_eq!(rig.coordinator.state().await, CoordinatorState::Idle);

    assert_eq!(rig.probe.sent(), vec!["3", "0"]);
    assert_eq!(rig.captures.load(Ordering::SeqCst), 1);
}
