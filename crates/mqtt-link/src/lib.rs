#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, QoS,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use types::topics::{self, OFFLINE_PAYLOAD};
use types::SetpointCell;

/// Configuration options for the broker session.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keepalive_secs: u64,
    /// Topic prefix for the status and reading topics.
    pub namespace: String,
    /// Topic carrying inbound target power commands.
    pub command_topic: String,
    /// Request queue capacity handed to the client.
    pub channel_capacity: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "sma2mqtt".to_string(),
            keepalive_secs: 60,
            namespace: "sma".to_string(),
            command_topic: "Solar/targetpower".to_string(),
            channel_capacity: 16,
        }
    }
}

impl LinkConfig {
    pub fn status_topic(&self) -> String {
        topics::status_topic(&self.namespace)
    }

    pub fn reading_topic(&self, name: &str) -> String {
        topics::reading_topic(&self.namespace, name)
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("mqtt request error: {0}")]
    Request(#[from] rumqttc::ClientError),
    #[error("mqtt connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("broker refused session: {0:?}")]
    Refused(ConnectReturnCode),
    #[error("not connected to broker")]
    NotConnected,
}

/// Supervised broker link. Owns the connection health flag and the reconnect
/// policy; inbound command payloads are routed into the shared setpoint cell
/// by a background delivery task that lives and dies with the session.
pub struct MqttLink {
    config: LinkConfig,
    options: MqttOptions,
    client: Option<AsyncClient>,
    alive: Arc<AtomicBool>,
    last_attempt: Option<Instant>,
    setpoint: Arc<SetpointCell>,
}

impl MqttLink {
    /// The last will is registered here, before any session is attempted, so
    /// the broker itself announces `offline` if the session drops uncleanly.
    /// It is never re-registered.
    pub fn new(config: LinkConfig, setpoint: Arc<SetpointCell>) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            config.status_topic(),
            OFFLINE_PAYLOAD,
            QoS::AtLeastOnce,
            true,
        ));

        Self {
            config,
            options,
            client: None,
            alive: Arc::new(AtomicBool::new(false)),
            last_attempt: None,
            setpoint,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    /// One synchronous connect attempt: establish the session, issue the
    /// command-topic subscription, then hand delivery to a background task.
    /// Session and delivery task are replaced together as one unit; a failed
    /// attempt leaves the link down until the next call.
    pub async fn ensure_connected(&mut self) -> Result<(), LinkError> {
        if self.is_alive() {
            return Ok(());
        }

        self.last_attempt = Some(Instant::now());
        let (client, mut eventloop) =
            AsyncClient::new(self.options.clone(), self.config.channel_capacity);

        // Drive the handshake up to the ConnAck before anything is queued.
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(LinkError::Refused(ack.code));
                }
                event => debug!(?event, "mqtt handshake event"),
            }
        }

        client
            .subscribe(&self.config.command_topic, QoS::AtMostOnce)
            .await?;

        self.alive.store(true, Ordering::Release);
        tokio::spawn(deliver(
            eventloop,
            self.alive.clone(),
            self.setpoint.clone(),
            self.config.command_topic.clone(),
        ));
        self.client = Some(client);

        info!(host = %self.config.host, port = self.config.port, "mqtt session established");
        Ok(())
    }

    pub async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), LinkError> {
        let client = self.client.as_ref().ok_or(LinkError::NotConnected)?;
        client
            .publish(topic, QoS::AtMostOnce, true, payload)
            .await?;
        debug!(topic, payload, "published retained");
        Ok(())
    }
}

/// Background delivery task: feeds inbound commands into the setpoint cell
/// and drops the alive flag on the first connection error, leaving the
/// supervisor to rebuild session and delivery together on its next tick.
async fn deliver(
    mut eventloop: EventLoop,
    alive: Arc<AtomicBool>,
    setpoint: Arc<SetpointCell>,
    command_topic: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == command_topic {
                    apply_command(&setpoint, &publish.payload);
                } else {
                    debug!(topic = %publish.topic, "ignoring publish on unexpected topic");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker requested disconnect");
                alive.store(false, Ordering::Release);
                break;
            }
            Ok(event) => debug!(?event, "mqtt event"),
            Err(err) => {
                warn!(error = %err, "mqtt connection lost");
                alive.store(false, Ordering::Release);
                break;
            }
        }
    }
}

/// Inbound payloads are decimal integers; anything else is discarded. No
/// range check, the inverter clips out-of-range targets itself.
pub fn apply_command(setpoint: &SetpointCell, payload: &[u8]) {
    let parsed = std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse::<i64>().ok());
    match parsed {
        Some(value) => {
            info!(value, "target power updated");
            setpoint.set(value);
        }
        None => warn!("discarding malformed target power payload"),
    }
}
