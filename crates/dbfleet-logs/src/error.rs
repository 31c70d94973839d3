// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the log stream pipeline.
//!
//! Only [`ConfigError`] and [`SetupError`] ever reach a caller, and [`SetupError`] only
//! in test-run mode. Everything that happens once the streams are running is contained
//! inside the worker that hit it.

/// Errors raised while loading or validating the agent configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

/// Errors raised while setting up the log subscription of a single server.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(
        "Unsupported subscription format - must be \"projects/PROJECT_NAME/subscriptions/SUBSCRIPTION_NAME\", got: {0}"
    )]
    InvalidSubscription(String),

    #[error("Failed to read credentials file {path}: {reason}")]
    Credentials { path: String, reason: String },

    #[error("Failed to create Google PubSub client: {0}")]
    Client(String),
}

/// Per-message decoding failures. The message is dropped, the stream keeps going.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Error parsing JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Error decoding message data: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Failures of a provider receive call.
///
/// `Cancelled` is a clean shutdown signal and must never be retried.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("receive cancelled")]
    Cancelled,

    #[error("{0}")]
    Transport(String),
}

impl ReceiveError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ReceiveError::Cancelled)
    }
}

impl From<reqwest::Error> for ReceiveError {
    fn from(err: reqwest::Error) -> Self {
        ReceiveError::Transport(err.to_string())
    }
}
