//! Configuration loading from disk

mod common;

use std::sync::Arc;
use wallet_sync::*;

#[test]
fn test_load_from_file() {
    let path = std::env::temp_dir().join(format!("wallet-sync-config-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
        endpoints = ["ws://primary.test/websocket", "ws://backup.test/websocket"]
        history_page_size = 20

        [client.reconnect]
        max_attempts = 2
        base_delay_ms = 250
        "#,
    )
    .unwrap();

    let config = WalletConfig::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.endpoints.len(), 2);
    assert_eq!(config.history_page_size, 20);
    assert_eq!(config.client.reconnect.max_attempts, 2);
    assert_eq!(config.client.reconnect.base_delay_ms, 250);
    assert_eq!(config.client.reconnect.max_delay_ms, ReconnectConfig::default().max_delay_ms);
    assert_eq!(config.client.max_attempts, DEFAULT_MAX_ATTEMPTS);
}

#[test]
fn test_missing_file_is_a_configuration_error() {
    let result = WalletConfig::load("/nonexistent/wallet-sync.toml");
    assert!(matches!(result, Err(WalletError::Configuration(_))));
}

#[test]
fn test_engine_rejects_invalid_config() {
    let config = WalletConfig {
        history_page_size: 0,
        ..WalletConfig::default()
    };
    let connector = Arc::new(common::MockIndexer::new().connector());

    let result = WalletEngine::new(config, connector, common::oracle());
    assert!(matches!(result, Err(WalletError::Configuration(_))));
}
