use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use bridge_actor::{ActorConfig, BridgeActor, BrokerLink, RegisterBus, TelemetryCycle};
use modbus_client::ClientError;
use mqtt_link::{apply_command, LinkError};
use register_map::{DecodeKind, Reading, RegisterDef};
use types::SetpointCell;

type EventLog = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Default)]
struct FakeBus {
    log: EventLog,
    fail_all_reads: Arc<AtomicBool>,
    fail_addresses: Arc<Mutex<HashSet<u16>>>,
    writes: Arc<Mutex<Vec<(u16, u16)>>>,
}

#[async_trait]
impl RegisterBus for FakeBus {
    async fn read_pair(&self, _unit_id: u8, address: u16) -> Result<[u16; 2], ClientError> {
        self.log.lock().unwrap().push(format!("read {address}"));
        if self.fail_all_reads.load(Ordering::SeqCst)
            || self.fail_addresses.lock().unwrap().contains(&address)
        {
            return Err(ClientError::Timeout { timeout_ms: 1 });
        }
        Ok([0, 7])
    }

    async fn write_register(
        &self,
        _unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ClientError> {
        self.log.lock().unwrap().push(format!("write {address}"));
        self.writes.lock().unwrap().push((address, value));
        Ok(())
    }
}

#[derive(Clone, Default)]
struct FakeLink {
    log: EventLog,
    alive: Arc<AtomicBool>,
    fail_connect: Arc<AtomicBool>,
    fail_publish: Arc<AtomicBool>,
    connects: Arc<AtomicUsize>,
    publishes: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl BrokerLink for FakeLink {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push("connect".to_string());
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        self.log.lock().unwrap().push("subscribe".to_string());
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), LinkError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        self.log.lock().unwrap().push(format!("publish {topic}"));
        self.publishes
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

fn power_catalog() -> Vec<RegisterDef> {
    vec![
        RegisterDef::new("P_DC", 30_961, DecodeKind::RawSigned),
        RegisterDef::new("P_AC", 30_775, DecodeKind::RawSigned),
    ]
}

fn shared_log() -> (EventLog, FakeBus, FakeLink) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let bus = FakeBus {
        log: log.clone(),
        ..FakeBus::default()
    };
    let link = FakeLink {
        log: log.clone(),
        ..FakeLink::default()
    };
    (log, bus, link)
}

fn actor_with(
    bus: FakeBus,
    link: FakeLink,
    target: Arc<SetpointCell>,
    telemetry: Duration,
    setpoint: Duration,
) -> (BridgeActor<FakeBus, FakeLink>, watch::Sender<bool>) {
    let config = ActorConfig {
        telemetry_interval: telemetry,
        setpoint_interval: setpoint,
        ..ActorConfig::default()
    };
    let (tx, rx) = watch::channel(false);
    let actor = BridgeActor::new(bus, link, power_catalog(), target, config, rx);
    (actor, tx)
}

#[tokio::test]
async fn first_tick_connects_but_runs_no_cycle() {
    let (log, bus, link) = shared_log();
    let (mut actor, _shutdown) = actor_with(
        bus.clone(),
        link.clone(),
        Arc::new(SetpointCell::new(52)),
        Duration::from_secs(2),
        Duration::from_secs(20),
    );

    actor.tick(Instant::now()).await;

    assert_eq!(link.connects.load(Ordering::SeqCst), 1);
    assert_eq!(*log.lock().unwrap(), vec!["connect", "subscribe"]);
    assert!(link.publishes.lock().unwrap().is_empty());
    assert!(bus.writes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn telemetry_pass_publishes_online_marker_first() {
    let (_log, bus, link) = shared_log();
    let (mut actor, _shutdown) = actor_with(
        bus,
        link.clone(),
        Arc::new(SetpointCell::new(52)),
        Duration::from_secs(2),
        Duration::from_secs(20),
    );

    let start = Instant::now();
    actor.tick(start + Duration::from_secs(2)).await;

    let publishes = link.publishes.lock().unwrap().clone();
    assert_eq!(
        publishes,
        vec![
            ("sma/online".to_string(), "online".to_string()),
            ("sma/P_DC".to_string(), "7".to_string()),
            ("sma/P_AC".to_string(), "7".to_string()),
        ]
    );
}

#[tokio::test]
async fn failed_read_aborts_whole_pass() {
    let (log, bus, link) = shared_log();
    bus.fail_addresses.lock().unwrap().insert(30_775);
    let (mut actor, _shutdown) = actor_with(
        bus.clone(),
        link.clone(),
        Arc::new(SetpointCell::new(52)),
        Duration::from_secs(2),
        Duration::from_secs(60),
    );

    let start = Instant::now();
    actor.tick(start + Duration::from_secs(2)).await;

    // Both reads were attempted, the second failed, nothing was published.
    let events = log.lock().unwrap().clone();
    assert!(events.contains(&"read 30961".to_string()));
    assert!(events.contains(&"read 30775".to_string()));
    assert!(link.publishes.lock().unwrap().is_empty());
    assert!(actor.telemetry().last_batch().is_none());

    // A later healthy pass replaces the batch wholesale.
    bus.fail_addresses.lock().unwrap().clear();
    actor.tick(start + Duration::from_secs(4)).await;
    assert_eq!(link.publishes.lock().unwrap().len(), 3);
    let healthy = actor.telemetry().last_batch().cloned();
    assert!(healthy.is_some());

    // The next failing pass leaves the previous batch untouched.
    bus.fail_all_reads.store(true, Ordering::SeqCst);
    actor.tick(start + Duration::from_secs(6)).await;
    assert_eq!(link.publishes.lock().unwrap().len(), 3);
    assert_eq!(actor.telemetry().last_batch().cloned(), healthy);
}

#[tokio::test]
async fn failing_telemetry_does_not_block_setpoint_cadence() {
    let (_log, bus, link) = shared_log();
    bus.fail_all_reads.store(true, Ordering::SeqCst);
    let target = Arc::new(SetpointCell::new(52));
    let (mut actor, _shutdown) = actor_with(
        bus.clone(),
        link.clone(),
        target,
        Duration::from_secs(2),
        Duration::from_secs(4),
    );

    let start = Instant::now();
    actor.tick(start + Duration::from_secs(2)).await;
    assert!(bus.writes.lock().unwrap().is_empty());

    actor.tick(start + Duration::from_secs(4)).await;
    assert_eq!(*bus.writes.lock().unwrap(), vec![(40_016, 52)]);
}

#[tokio::test]
async fn setpoint_write_uses_latest_inbound_target() {
    let (_log, bus, link) = shared_log();
    bus.fail_all_reads.store(true, Ordering::SeqCst);
    let target = Arc::new(SetpointCell::new(52));
    let (mut actor, _shutdown) = actor_with(
        bus.clone(),
        link,
        target.clone(),
        Duration::from_secs(2),
        Duration::from_secs(20),
    );

    // Inbound command arrives between ticks, as the delivery task would do.
    apply_command(&target, b"75");

    let start = Instant::now();
    actor.tick(start + Duration::from_secs(20)).await;
    assert_eq!(*bus.writes.lock().unwrap(), vec![(40_016, 75)]);
}

#[tokio::test]
async fn reconnect_once_and_resubscribe_before_any_work() {
    let (log, bus, link) = shared_log();
    let (mut actor, _shutdown) = actor_with(
        bus,
        link.clone(),
        Arc::new(SetpointCell::new(52)),
        Duration::from_secs(2),
        Duration::from_secs(20),
    );

    let start = Instant::now();
    actor.tick(start + Duration::from_secs(2)).await;
    {
        let events = log.lock().unwrap();
        assert_eq!(events[0], "connect");
        assert_eq!(events[1], "subscribe");
        assert!(events.len() > 2);
    }

    // A healthy link is not reconnected.
    actor.tick(start + Duration::from_secs(4)).await;
    assert_eq!(link.connects.load(Ordering::SeqCst), 1);

    // After a drop, the next tick performs exactly one new attempt.
    link.alive.store(false, Ordering::SeqCst);
    actor.tick(start + Duration::from_secs(6)).await;
    assert_eq!(link.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_reconnect_skips_all_work_that_tick() {
    let (log, bus, link) = shared_log();
    link.fail_connect.store(true, Ordering::SeqCst);
    let (mut actor, _shutdown) = actor_with(
        bus.clone(),
        link.clone(),
        Arc::new(SetpointCell::new(52)),
        Duration::from_secs(2),
        Duration::from_secs(2),
    );

    let start = Instant::now();
    actor.tick(start + Duration::from_secs(2)).await;

    assert_eq!(*log.lock().unwrap(), vec!["connect"]);
    assert!(bus.writes.lock().unwrap().is_empty());
    assert!(link.publishes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn publish_failure_still_records_read_batch() {
    let (_log, bus, link) = shared_log();
    link.fail_publish.store(true, Ordering::SeqCst);

    let mut cycle = TelemetryCycle::new(power_catalog(), "sma", 3);
    assert!(cycle.run_once(&bus, &link).await.is_err());
    assert_eq!(
        cycle.last_batch().cloned(),
        Some(vec![
            ("P_DC".to_string(), Reading::Integer(7)),
            ("P_AC".to_string(), Reading::Integer(7)),
        ])
    );
}

#[tokio::test]
async fn run_loop_exits_on_shutdown_signal() {
    let (_log, bus, link) = shared_log();
    let config = ActorConfig {
        telemetry_interval: Duration::from_millis(10),
        setpoint_interval: Duration::from_millis(10),
        ..ActorConfig::default()
    };
    let (tx, rx) = watch::channel(false);
    let actor = BridgeActor::new(
        bus,
        link.clone(),
        power_catalog(),
        Arc::new(SetpointCell::new(52)),
        config,
        rx,
    );

    let handle = tokio::spawn(actor.run());
    sleep(Duration::from_millis(60)).await;
    tx.send(true).expect("signal shutdown");

    timeout(Duration::from_secs(1), handle)
        .await
        .expect("loop exits")
        .expect("loop task joins");
    assert!(link.connects.load(Ordering::SeqCst) >= 1);
    assert!(!link.publishes.lock().unwrap().is_empty());
}
