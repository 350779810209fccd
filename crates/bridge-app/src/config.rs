use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use bridge_actor::ActorConfig;
use modbus_client::ClientConfig;
use mqtt_link::LinkConfig;
use register_map::{default_catalog, validate_catalog, DecodeKind, RegisterDef};

const DEFAULT_UNIT_ID: u8 = 3;
const DEFAULT_TARGET: i64 = 52;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub modbus: ClientConfig,
    pub link: LinkConfig,
    pub actor: ActorConfig,
    pub catalog: Vec<RegisterDef>,
    pub default_target: i64,
    pub debug: bool,
}

impl BridgeConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.modbus.port == 0 {
            anyhow::bail!("inverter.port must be between 1 and 65535");
        }
        if self.modbus.timeout_ms == 0 {
            anyhow::bail!("inverter.timeout_ms must be >= 1");
        }
        if self.link.port == 0 {
            anyhow::bail!("broker.port must be between 1 and 65535");
        }
        if self.link.client_id.trim().is_empty() {
            anyhow::bail!("broker.client_id must be non-empty");
        }
        if self.link.keepalive_secs == 0 {
            anyhow::bail!("broker.keepalive_secs must be >= 1");
        }
        if self.link.channel_capacity == 0 {
            anyhow::bail!("broker.channel_capacity must be >= 1");
        }
        validate_topic_segment(&self.link.namespace, "broker.namespace")?;
        validate_topic(&self.link.command_topic, "broker.command_topic")?;
        if self.actor.telemetry_interval.as_millis() == 0 {
            anyhow::bail!("bridge.telemetry_interval_ms must be >= 1");
        }
        if self.actor.setpoint_interval.as_millis() == 0 {
            anyhow::bail!("bridge.setpoint_interval_ms must be >= 1");
        }
        validate_catalog(&self.catalog).context("registers")?;

        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let link = LinkConfig::default();
        let actor = ActorConfig {
            unit_id: DEFAULT_UNIT_ID,
            namespace: link.namespace.clone(),
            ..ActorConfig::default()
        };
        Self {
            modbus: ClientConfig::default(),
            link,
            actor,
            catalog: default_catalog(),
            default_target: DEFAULT_TARGET,
            debug: false,
        }
    }
}

fn apply_env_overrides(config: &mut BridgeConfig) {
    if let Ok(value) = env::var("SMA_BRIDGE_INVERTER_HOST") {
        config.modbus.host = value;
    }
    if let Some(port) = parse_env_u16("SMA_BRIDGE_INVERTER_PORT") {
        config.modbus.port = port;
    }
    if let Some(timeout_ms) = parse_env_u64("SMA_BRIDGE_MODBUS_TIMEOUT_MS") {
        config.modbus.timeout_ms = timeout_ms;
    }
    if let Some(unit_id) = parse_env_u8("SMA_BRIDGE_UNIT_ID") {
        config.actor.unit_id = unit_id;
    }

    if let Ok(value) = env::var("SMA_BRIDGE_BROKER_HOST") {
        config.link.host = value;
    }
    if let Some(port) = parse_env_u16("SMA_BRIDGE_BROKER_PORT") {
        config.link.port = port;
    }
    if let Ok(value) = env::var("SMA_BRIDGE_CLIENT_ID") {
        config.link.client_id = value;
    }
    if let Some(secs) = parse_env_u64("SMA_BRIDGE_KEEPALIVE_SECS") {
        config.link.keepalive_secs = secs;
    }
    if let Ok(value) = env::var("SMA_BRIDGE_NAMESPACE") {
        config.link.namespace = value.clone();
        config.actor.namespace = value;
    }
    if let Ok(value) = env::var("SMA_BRIDGE_COMMAND_TOPIC") {
        config.link.command_topic = value;
    }

    if let Some(interval_ms) = parse_env_u64("SMA_BRIDGE_TELEMETRY_INTERVAL_MS") {
        config.actor.telemetry_interval = Duration::from_millis(interval_ms);
    }
    if let Some(interval_ms) = parse_env_u64("SMA_BRIDGE_SETPOINT_INTERVAL_MS") {
        config.actor.setpoint_interval = Duration::from_millis(interval_ms);
    }
    if let Some(address) = parse_env_u16("SMA_BRIDGE_SETPOINT_ADDRESS") {
        config.actor.setpoint_address = address;
    }
    if let Some(target) = parse_env_i64("SMA_BRIDGE_DEFAULT_TARGET") {
        config.default_target = target;
    }
    if let Some(debug) = parse_env_bool("SMA_BRIDGE_DEBUG") {
        config.debug = debug;
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    inverter: Option<FileInverterConfig>,
    broker: Option<FileBrokerConfig>,
    bridge: Option<FileBridgeConfig>,
    registers: Option<Vec<FileRegisterConfig>>,
}

#[derive(Debug, Deserialize)]
struct FileInverterConfig {
    host: Option<String>,
    port: Option<u16>,
    unit_id: Option<u8>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileBrokerConfig {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    keepalive_secs: Option<u64>,
    namespace: Option<String>,
    command_topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileBridgeConfig {
    telemetry_interval_ms: Option<u64>,
    setpoint_interval_ms: Option<u64>,
    setpoint_address: Option<u16>,
    default_target: Option<i64>,
    debug: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct FileRegisterConfig {
    name: String,
    address: u16,
    kind: DecodeKind,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("SMA_BRIDGE_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path).with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut BridgeConfig, file: FileConfig) {
    if let Some(inverter) = file.inverter {
        if let Some(host) = inverter.host {
            config.modbus.host = host;
        }
        if let Some(port) = inverter.port {
            config.modbus.port = port;
        }
        if let Some(unit_id) = inverter.unit_id {
            config.actor.unit_id = unit_id;
        }
        if let Some(timeout_ms) = inverter.timeout_ms {
            config.modbus.timeout_ms = timeout_ms;
        }
    }

    if let Some(broker) = file.broker {
        if let Some(host) = broker.host {
            config.link.host = host;
        }
        if let Some(port) = broker.port {
            config.link.port = port;
        }
        if let Some(client_id) = broker.client_id {
            config.link.client_id = client_id;
        }
        if let Some(secs) = broker.keepalive_secs {
            config.link.keepalive_secs = secs;
        }
        if let Some(namespace) = broker.namespace {
            config.link.namespace = namespace.clone();
            config.actor.namespace = namespace;
        }
        if let Some(topic) = broker.command_topic {
            config.link.command_topic = topic;
        }
    }

    if let Some(bridge) = file.bridge {
        if let Some(interval_ms) = bridge.telemetry_interval_ms {
            config.actor.telemetry_interval = Duration::from_millis(interval_ms);
        }
        if let Some(interval_ms) = bridge.setpoint_interval_ms {
            config.actor.setpoint_interval = Duration::from_millis(interval_ms);
        }
        if let Some(address) = bridge.setpoint_address {
            config.actor.setpoint_address = address;
        }
        if let Some(target) = bridge.default_target {
            config.default_target = target;
        }
        if let Some(debug) = bridge.debug {
            config.debug = debug;
        }
    }

    if let Some(registers) = file.registers {
        config.catalog = registers
            .into_iter()
            .map(|register| RegisterDef {
                name: register.name,
                address: register.address,
                kind: register.kind,
            })
            .collect();
    }
}

fn validate_topic_segment(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{field} must be non-empty");
    }
    if value.contains(['/', '+', '#']) {
        anyhow::bail!("{field} must not contain '/', '+' or '#'");
    }
    Ok(())
}

fn validate_topic(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{field} must be non-empty");
    }
    if value.contains(['+', '#']) {
        anyhow::bail!("{field} must not contain wildcards");
    }
    Ok(())
}

fn parse_env_u8(key: &str) -> Option<u8> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_i64(key: &str) -> Option<i64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_bool(key: &str) -> Option<bool> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
