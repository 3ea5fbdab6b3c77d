//! Broker and experiment configuration

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Connection settings for the message broker
///
/// `run_id` namespaces the two exchanges so concurrent experiments can share
/// one broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker hostname
    pub hostname: String,
    /// Broker port
    pub port: u16,
    /// Broker user
    pub user: String,
    /// Broker password
    pub password: String,
    /// Run-unique identifier appended to the exchange names
    pub run_id: String,
}

impl BrokerConfig {
    /// Local broker on the default port with a fresh run id
    pub fn local(port: u16) -> Self {
        BrokerConfig {
            hostname: "127.0.0.1".to_string(),
            port,
            user: "guest".to_string(),
            password: "guest".to_string(),
            run_id: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    /// Validate configuration constraints
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(SyncError::Configuration(
                "broker hostname must not be empty".to_string(),
            ));
        }
        if self.run_id.is_empty() {
            return Err(SyncError::Configuration(
                "run id must not be empty".to_string(),
            ));
        }
        if self.run_id.contains('.') {
            return Err(SyncError::Configuration(
                "run id must not contain routing-key separators".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load a broker configuration from a TOML file with `SYNCMESH_*`
/// environment overrides
pub fn load_broker_config(path: &Path) -> Result<BrokerConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(config::Environment::with_prefix("SYNCMESH"))
        .build()
        .map_err(|e| SyncError::Configuration(e.to_string()))?;
    let broker: BrokerConfig = cfg
        .try_deserialize()
        .map_err(|e| SyncError::Configuration(e.to_string()))?;
    broker.validate()?;
    Ok(broker)
}
