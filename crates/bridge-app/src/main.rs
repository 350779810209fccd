use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

use bridge_actor::BridgeActor;
use bridge_app::BridgeConfig;
use modbus_client::ModbusClient;
use mqtt_link::MqttLink;
use types::SetpointCell;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = parse_config_arg();
    let config = BridgeConfig::load_with_path(config_path).context("load config failed")?;
    config.validate().context("config validation failed")?;
    init_tracing(config.debug);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let target = Arc::new(SetpointCell::new(config.default_target));
    let bus = ModbusClient::new(config.modbus.clone());
    let link = MqttLink::new(config.link.clone(), target.clone());
    let actor = BridgeActor::new(
        bus,
        link,
        config.catalog.clone(),
        target,
        config.actor.clone(),
        shutdown_rx.clone(),
    );

    info!(
        inverter = %config.modbus.host,
        broker = %config.link.host,
        namespace = %config.link.namespace,
        "bridge starting"
    );

    let mut actor_handle = tokio::spawn(actor.run());

    notify_ready();
    let watchdog_handle = start_watchdog(shutdown_rx.clone());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("install ctrl-c handler")?;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            let _ = (&mut actor_handle).await;
        }
        result = &mut actor_handle => {
            if let Err(err) = result {
                warn!(error = %err, "bridge loop task failed");
            }
            let _ = shutdown_tx.send(true);
        }
    }

    if let Some(handle) = watchdog_handle {
        let _ = handle.await;
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn parse_config_arg() -> Option<String> {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn notify_ready() {
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %err, "systemd ready notify failed");
    }
}

#[cfg(not(target_os = "linux"))]
fn notify_ready() {}

#[cfg(target_os = "linux")]
fn start_watchdog(mut shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = watchdog_interval()?;
    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(interval) => {
                    if let Err(err) = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]) {
                        warn!(error = %err, "systemd watchdog notify failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }))
}

#[cfg(not(target_os = "linux"))]
fn start_watchdog(_shutdown: watch::Receiver<bool>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

#[cfg(target_os = "linux")]
fn watchdog_interval() -> Option<Duration> {
    let watchdog_usec = env::var("WATCHDOG_USEC").ok()?.parse::<u64>().ok()?;
    if let Some(pid) = env::var("WATCHDOG_PID")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
    {
        if pid != std::process::id() {
            return None;
        }
    }

    let interval = watchdog_usec.saturating_div(2).max(100_000);
    Some(Duration::from_micros(interval))
}
