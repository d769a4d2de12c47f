use std::time::Duration;

use anyhow::Result;

use crate::db::DbConfig;
use crate::messaging::BrokerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    /// Namespace mixed into derived user ids.
    pub id_namespace: String,
    /// How long shutdown waits for the consumer to stop.
    pub shutdown_timeout: Duration,
    pub database: DbConfig,
    pub broker: BrokerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("DCART_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("DCART_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let id_namespace =
            std::env::var("DCART_ID_NAMESPACE").unwrap_or_else(|_| "dcart".to_string());

        let shutdown_timeout = match std::env::var("DCART_SHUTDOWN_TIMEOUT_SECS") {
            Ok(secs) => Duration::from_secs(secs.parse()?),
            Err(_) => Duration::from_secs(10),
        };

        Ok(Self {
            log_level,
            dev_mode,
            id_namespace,
            shutdown_timeout,
            database: DbConfig::from_env(),
            broker: BrokerConfig::from_env(),
        })
    }
}
