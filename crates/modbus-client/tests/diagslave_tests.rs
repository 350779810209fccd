use modbus_client::{ClientConfig, ModbusClient};

#[tokio::test]
async fn diagslave_integration_read_pair() {
    let host = match std::env::var("MODBUS_TEST_HOST") {
        Ok(value) => value,
        Err(_) => return,
    };

    let port = env_u16("MODBUS_TEST_PORT").unwrap_or(1502);
    let unit_id = env_u16("MODBUS_TEST_UNIT_ID").unwrap_or(1) as u8;
    let address = env_u16("MODBUS_TEST_ADDRESS").unwrap_or(0);

    let mut config = ClientConfig::default();
    config.host = host;
    config.port = port;
    config.timeout_ms = env_u64("MODBUS_TEST_TIMEOUT_MS").unwrap_or(1_000);

    let client = ModbusClient::new(config);
    let words = client.read_pair(unit_id, address).await.expect("read");
    assert_eq!(words.len(), 2);

    // A second request reuses the cached session.
    client.read_pair(unit_id, address).await.expect("reread");
}

#[tokio::test]
async fn unreachable_device_reports_transport_error() {
    let mut config = ClientConfig::default();
    // Reserved TEST-NET-1 address, nothing listens there.
    config.host = "192.0.2.1".to_string();
    config.port = 502;
    config.timeout_ms = 100;

    let client = ModbusClient::new(config);
    assert!(client.read_pair(1, 30_775).await.is_err());
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
