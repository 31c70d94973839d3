// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Values are layered with figment, later sources winning:
//!
//! 1. built-in defaults
//! 2. the YAML configuration file
//! 3. `DBFLEET_*` environment variables (global keys only)
//!
//! # Example Configuration
//!
//! ```yaml
//! log_level: info
//! servers:
//!   - name: orders
//!     gcp_project_id: acme-prod
//!     gcp_cloudsql_instance_id: orders-primary
//!     gcp_pubsub_subscription: projects/acme-prod/subscriptions/pg-logs
//!     gcp_credentials_file: /etc/dbfleet/gcp.json
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stream::{ServerIdentifier, LOG_STREAM_BUFFER_LEN};

pub const ENV_PREFIX: &str = "DBFLEET_";
pub const DEFAULT_CONFIG_FILE: &str = "dbfleet.yaml";
pub const DEFAULT_SYSTEM_TYPE: &str = "google_cloudsql";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Global agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Strict validation mode: setup errors are returned instead of skipped.
    pub test_run: bool,
    /// Capacity of the channel between provider adapters and the transformer.
    pub log_stream_buffer_len: usize,
    /// Log lines older than this, relative to transformer start, are dropped.
    pub freshness_window_secs: u64,
    /// Cool-down before a failed subscription is received from again.
    pub retry_interval_secs: u64,
    pub gcp_pubsub_max_messages: u32,
    /// Overrides the Pub/Sub API endpoint, e.g. to point at an emulator.
    pub gcp_pubsub_endpoint: Option<String>,
    pub servers: Vec<ServerConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            test_run: false,
            log_stream_buffer_len: LOG_STREAM_BUFFER_LEN,
            freshness_window_secs: 60,
            retry_interval_secs: 60,
            gcp_pubsub_max_messages: 100,
            gcp_pubsub_endpoint: None,
            servers: Vec::new(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    #[must_use]
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.log_stream_buffer_len == 0 {
            return Err(ConfigError::Invalid(
                "log_stream_buffer_len must be greater than 0".to_string(),
            ));
        }
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "retry_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.gcp_pubsub_max_messages == 0 {
            return Err(ConfigError::Invalid(
                "gcp_pubsub_max_messages must be greater than 0".to_string(),
            ));
        }
        if let Some(endpoint) = &self.gcp_pubsub_endpoint {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "gcp_pubsub_endpoint cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// One monitored database server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Section name, used to label this server's log output.
    pub name: String,
    pub gcp_project_id: String,
    /// Cloud SQL instance id, or AlloyDB cluster id.
    pub gcp_cloudsql_instance_id: String,
    /// `projects/PROJECT_NAME/subscriptions/SUBSCRIPTION_NAME`
    pub gcp_pubsub_subscription: Option<String>,
    /// Service account key or authorized user credentials. When unset the metadata
    /// server is used.
    pub gcp_credentials_file: Option<String>,
    pub system_id: Option<String>,
    pub system_type: Option<String>,
    pub system_scope: Option<String>,
}

impl ServerConfig {
    #[must_use]
    pub fn identifier(&self) -> ServerIdentifier {
        ServerIdentifier {
            system_id: self.system_id.clone().unwrap_or_else(|| {
                format!("{}:{}", self.gcp_project_id, self.gcp_cloudsql_instance_id)
            }),
            system_type: self
                .system_type
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_TYPE.to_string()),
            system_scope: self.system_scope.clone().unwrap_or_default(),
        }
    }

    /// The subscription this server's logs arrive on, if it has one.
    #[must_use]
    pub fn pubsub_subscription(&self) -> Option<&str> {
        self.gcp_pubsub_subscription
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Loads the configuration from `path` and the environment, then validates it.
pub fn get_config(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["servers", "config"]))
        .extract()?;

    config.validate()?;
    Ok(config)
}
