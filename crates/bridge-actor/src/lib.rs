#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use modbus_client::{ClientError, ModbusClient};
use mqtt_link::{LinkError, MqttLink};
use register_map::{decode, Reading, RegisterDef};
use types::topics::{self, ONLINE_PAYLOAD};
use types::SetpointCell;

#[derive(Debug, Clone)]
pub struct ActorConfig {
    pub telemetry_interval: Duration,
    pub setpoint_interval: Duration,
    pub unit_id: u8,
    pub setpoint_address: u16,
    pub namespace: String,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            telemetry_interval: Duration::from_secs(2),
            setpoint_interval: Duration::from_secs(20),
            unit_id: 3,
            setpoint_address: register_map::DEFAULT_SETPOINT_ADDRESS,
            namespace: "sma".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("register transport error: {0}")]
    Transport(#[from] ClientError),
    #[error("broker link error: {0}")]
    Link(#[from] LinkError),
}

/// Register transport boundary as the bridge consumes it.
#[async_trait]
pub trait RegisterBus: Send + Sync {
    async fn read_pair(&self, unit_id: u8, address: u16) -> Result<[u16; 2], ClientError>;
    async fn write_register(&self, unit_id: u8, address: u16, value: u16)
        -> Result<(), ClientError>;
}

#[async_trait]
impl RegisterBus for ModbusClient {
    async fn read_pair(&self, unit_id: u8, address: u16) -> Result<[u16; 2], ClientError> {
        ModbusClient::read_pair(self, unit_id, address).await
    }

    async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ClientError> {
        ModbusClient::write_register(self, unit_id, address, value).await
    }
}

/// Publish/subscribe boundary as the bridge consumes it.
#[async_trait]
pub trait BrokerLink: Send {
    fn is_alive(&self) -> bool;
    async fn ensure_connected(&mut self) -> Result<(), LinkError>;
    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), LinkError>;
}

#[async_trait]
impl BrokerLink for MqttLink {
    fn is_alive(&self) -> bool {
        MqttLink::is_alive(self)
    }

    async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        MqttLink::ensure_connected(self).await
    }

    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), LinkError> {
        MqttLink::publish_retained(self, topic, payload).await
    }
}

pub type ReadingBatch = Vec<(String, Reading)>;

/// Reads every catalog entry and publishes the decoded batch, retained, with
/// the online status marker first. All-or-nothing per pass.
pub struct TelemetryCycle {
    catalog: Vec<RegisterDef>,
    namespace: String,
    unit_id: u8,
    last_batch: Option<ReadingBatch>,
}

impl TelemetryCycle {
    pub fn new(catalog: Vec<RegisterDef>, namespace: impl Into<String>, unit_id: u8) -> Self {
        Self {
            catalog,
            namespace: namespace.into(),
            unit_id,
            last_batch: None,
        }
    }

    /// Batch of the most recent fully successful read pass.
    pub fn last_batch(&self) -> Option<&ReadingBatch> {
        self.last_batch.as_ref()
    }

    pub async fn run_once<B, L>(&mut self, bus: &B, link: &L) -> Result<(), CycleError>
    where
        B: RegisterBus + ?Sized,
        L: BrokerLink + ?Sized,
    {
        let batch = self.read_all(bus).await?;
        let published = Self::publish_batch(&self.namespace, &batch, link).await;
        self.last_batch = Some(batch);
        published
    }

    async fn read_all<B>(&self, bus: &B) -> Result<ReadingBatch, ClientError>
    where
        B: RegisterBus + ?Sized,
    {
        let mut batch = Vec::with_capacity(self.catalog.len());
        for def in &self.catalog {
            // First failed read aborts the pass; no partial batch escapes.
            let words = bus.read_pair(self.unit_id, def.address).await?;
            batch.push((def.name.clone(), decode(def.kind, words)));
        }
        Ok(batch)
    }

    async fn publish_batch<L>(
        namespace: &str,
        batch: &ReadingBatch,
        link: &L,
    ) -> Result<(), CycleError>
    where
        L: BrokerLink + ?Sized,
    {
        link.publish_retained(&topics::status_topic(namespace), ONLINE_PAYLOAD)
            .await?;
        for (name, reading) in batch {
            link.publish_retained(&topics::reading_topic(namespace, name), &reading.to_string())
                .await?;
        }
        Ok(())
    }
}

/// Writes the current target to the control register on its own cadence,
/// independent of the telemetry outcome that tick.
pub struct SetpointChannel {
    target: Arc<SetpointCell>,
    unit_id: u8,
    address: u16,
}

impl SetpointChannel {
    pub fn new(target: Arc<SetpointCell>, unit_id: u8, address: u16) -> Self {
        Self {
            target,
            unit_id,
            address,
        }
    }

    pub async fn write_once<B>(&self, bus: &B) -> Result<(), ClientError>
    where
        B: RegisterBus + ?Sized,
    {
        let value = self.target.get() as u16;
        bus.write_register(self.unit_id, self.address, value).await
    }
}

/// Single scheduling loop driving both cycles over one device session and one
/// broker link. Never exits except through the shutdown channel.
pub struct BridgeActor<B, L> {
    bus: B,
    link: L,
    telemetry: TelemetryCycle,
    setpoint: SetpointChannel,
    config: ActorConfig,
    shutdown: watch::Receiver<bool>,
    telemetry_mark: Instant,
    setpoint_mark: Instant,
}

impl<B, L> BridgeActor<B, L>
where
    B: RegisterBus,
    L: BrokerLink,
{
    pub fn new(
        bus: B,
        link: L,
        catalog: Vec<RegisterDef>,
        target: Arc<SetpointCell>,
        config: ActorConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let now = Instant::now();
        let telemetry = TelemetryCycle::new(catalog, config.namespace.clone(), config.unit_id);
        let setpoint = SetpointChannel::new(target, config.unit_id, config.setpoint_address);
        Self {
            bus,
            link,
            telemetry,
            setpoint,
            config,
            shutdown,
            // Both marks start now, so each cycle first fires one full
            // interval after startup.
            telemetry_mark: now,
            setpoint_mark: now,
        }
    }

    pub fn telemetry(&self) -> &TelemetryCycle {
        &self.telemetry
    }

    fn tick_interval(&self) -> Duration {
        self.config
            .telemetry_interval
            .min(self.config.setpoint_interval)
    }

    /// One scheduling pass. Cadence marks advance on every attempt, failed or
    /// not, so a persistently failing transport cannot tight-loop a cycle.
    pub async fn tick(&mut self, now: Instant) {
        if !self.link.is_alive() {
            if let Err(err) = self.link.ensure_connected().await {
                warn!(error = %err, "broker reconnect failed");
                return;
            }
            info!("broker link restored");
        }

        if now.duration_since(self.telemetry_mark) >= self.config.telemetry_interval {
            self.telemetry_mark = now;
            if let Err(err) = self.telemetry.run_once(&self.bus, &self.link).await {
                warn!(error = %err, "telemetry cycle failed");
            }
        }

        if now.duration_since(self.setpoint_mark) >= self.config.setpoint_interval {
            self.setpoint_mark = now;
            if let Err(err) = self.setpoint.write_once(&self.bus).await {
                warn!(error = %err, "setpoint write failed");
            }
        }
    }

    pub async fn run(mut self) {
        let tick = self.tick_interval();
        info!(
            telemetry_ms = self.config.telemetry_interval.as_millis(),
            setpoint_ms = self.config.setpoint_interval.as_millis(),
            "bridge loop started"
        );

        loop {
            if *self.shutdown.borrow() {
                info!("bridge shutdown requested");
                break;
            }

            self.tick(Instant::now()).await;

            tokio::select! {
                _ = sleep(tick) => {}
                changed = self.shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("bridge shutdown requested");
                        break;
                    }
                }
            }
        }
    }
}
