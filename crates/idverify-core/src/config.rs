//! Client configuration

use crate::error::IdentityError;
use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_CONTRACT_ADDRESS: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
pub const DEFAULT_VERIFIER_ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Identity registry contract
    #[serde(default = "default_contract_address")]
    pub contract_address: Address,

    /// Verifier account seeded into the in-memory ledger
    #[serde(default = "default_verifier_address")]
    pub verifier_address: Address,

    /// Buffered live events per subscriber before the stream reports lag
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default)]
    pub routes: RouteConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            contract_address: default_contract_address(),
            verifier_address: default_verifier_address(),
            event_channel_capacity: default_event_channel_capacity(),
            routes: RouteConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Redirect targets used by route guards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Target when no wallet session is connected
    #[serde(default = "default_home_route")]
    pub home: String,

    /// Target when the account lacks the verifier role
    #[serde(default = "default_verifier_login_route")]
    pub verifier_login: String,
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            home: default_home_route(),
            verifier_login: default_verifier_login_route(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_contract_address() -> Address {
    Address::from_known(DEFAULT_CONTRACT_ADDRESS)
}

fn default_verifier_address() -> Address {
    Address::from_known(DEFAULT_VERIFIER_ADDRESS)
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_home_route() -> String {
    "/".to_string()
}

fn default_verifier_login_route() -> String {
    "/verifier-login".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ClientConfig {
    /// Load configuration from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            IdentityError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            IdentityError::Config(format!("failed to parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.event_channel_capacity == 0 {
            return Err(IdentityError::Config(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        for (name, route) in [
            ("routes.home", &self.routes.home),
            ("routes.verifier_login", &self.routes.verifier_login),
        ] {
            if !route.starts_with('/') {
                return Err(IdentityError::Config(format!(
                    "{name} must be an absolute path, got '{route}'"
                )));
            }
        }
        if self.routes.home == self.routes.verifier_login {
            return Err(IdentityError::Config(
                "routes.home and routes.verifier_login must differ".to_string(),
            ));
        }
        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(IdentityError::Config(format!(
                "unknown log level '{}'",
                self.logging.level
            )));
        }
        Ok(())
    }
}
