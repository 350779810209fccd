#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::{Reader, Slave, SlaveContext, Writer};
use tracing::{debug, warn};

/// Configuration options for the Modbus TCP connection to the inverter.
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Per-request timeout in milliseconds, also bounding the TCP connect.
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 502,
            timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid socket address {0}:{1}")]
    InvalidAddress(String, u16),
    #[error("modbus transport error: {0}")]
    Modbus(std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("register {address} returned {got} words, expected {expected}")]
    WordCount {
        address: u16,
        expected: usize,
        got: usize,
    },
}

/// Modbus TCP client for a single device. The session is opened lazily on the
/// first request and dropped on any transport error, so the next request
/// starts with a fresh connect.
#[derive(Debug)]
pub struct ModbusClient {
    config: ClientConfig,
    context: Mutex<Option<Context>>,
}

impl ModbusClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            context: Mutex::new(None),
        }
    }

    /// Reads the two 16-bit words backing one 32-bit register, high word
    /// first. Any other word count in the response is a protocol violation
    /// reported as a transport error.
    pub async fn read_pair(&self, unit_id: u8, address: u16) -> Result<[u16; 2], ClientError> {
        let words = self.read_words(unit_id, address, 2).await?;
        <[u16; 2]>::try_from(words.as_slice()).map_err(|_| ClientError::WordCount {
            address,
            expected: 2,
            got: words.len(),
        })
    }

    pub async fn read_words(
        &self,
        unit_id: u8,
        address: u16,
        count: u16,
    ) -> Result<Vec<u16>, ClientError> {
        let mut guard = self.context.lock().await;
        let mut ctx = match guard.take() {
            Some(ctx) => ctx,
            None => self.open().await?,
        };

        ctx.set_slave(Slave(unit_id));
        let request = ctx.read_holding_registers(address, count);
        match timeout(Duration::from_millis(self.config.timeout_ms), request).await {
            Ok(Ok(words)) => {
                debug!(unit_id, address, count, "modbus read ok");
                *guard = Some(ctx);
                Ok(words)
            }
            Ok(Err(err)) => {
                warn!(unit_id, address, count, error = %err, "modbus read error");
                Err(ClientError::Modbus(err))
            }
            Err(_) => {
                warn!(unit_id, address, count, "modbus read timeout");
                Err(ClientError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }

    pub async fn write_register(
        &self,
        unit_id: u8,
        address: u16,
        value: u16,
    ) -> Result<(), ClientError> {
        let mut guard = self.context.lock().await;
        let mut ctx = match guard.take() {
            Some(ctx) => ctx,
            None => self.open().await?,
        };

        ctx.set_slave(Slave(unit_id));
        let request = ctx.write_single_register(address, value);
        match timeout(Duration::from_millis(self.config.timeout_ms), request).await {
            Ok(Ok(())) => {
                debug!(unit_id, address, value, "modbus write ok");
                *guard = Some(ctx);
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(unit_id, address, value, error = %err, "modbus write error");
                Err(ClientError::Modbus(err))
            }
            Err(_) => {
                warn!(unit_id, address, value, "modbus write timeout");
                Err(ClientError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }

    async fn open(&self) -> Result<Context, ClientError> {
        let addr = format!("{}:{}", self.config.host, self.config.port)
            .parse::<SocketAddr>()
            .map_err(|_| ClientError::InvalidAddress(self.config.host.clone(), self.config.port))?;
        let ctx = timeout(
            Duration::from_millis(self.config.timeout_ms),
            tcp::connect(addr),
        )
        .await
        .map_err(|_| ClientError::Timeout {
            timeout_ms: self.config.timeout_ms,
        })??;
        debug!(host = %self.config.host, port = self.config.port, "modbus session established");
        Ok(ctx)
    }
}
