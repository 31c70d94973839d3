// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Google Cloud Pub/Sub log delivery for Cloud SQL and AlloyDB.

pub mod auth;
pub mod envelope;
pub mod pubsub;

use std::fmt::Display;
use std::str::FromStr;

use tracing::debug;

use crate::config::{Config, ServerConfig};
use crate::error::SetupError;
use crate::subscriber::{LogSubscriber, SubscriberContext, SubscriptionWorker};
use auth::TokenSource;
use envelope::CloudLoggingDecoder;
use pubsub::{PubSubClient, DEFAULT_ENDPOINT};

/// Set by the Pub/Sub emulator tooling; requests then go there unauthenticated.
pub const EMULATOR_HOST_ENV: &str = "PUBSUB_EMULATOR_HOST";

/// A fully qualified `projects/PROJECT_NAME/subscriptions/SUBSCRIPTION_NAME`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionPath {
    project: String,
    name: String,
}

impl SubscriptionPath {
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for SubscriptionPath {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SetupError::InvalidSubscription(s.to_string());

        let parts: Vec<&str> = s.split('/').collect();
        let [projects, project, subscriptions, name] = parts.as_slice() else {
            return Err(invalid());
        };
        if *projects != "projects"
            || *subscriptions != "subscriptions"
            || project.is_empty()
            || name.is_empty()
        {
            return Err(invalid());
        }

        Ok(Self {
            project: (*project).to_string(),
            name: (*name).to_string(),
        })
    }
}

impl Display for SubscriptionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "projects/{}/subscriptions/{}", self.project, self.name)
    }
}

/// Receives Cloud Logging exports of Cloud SQL and AlloyDB PostgreSQL logs from
/// Pub/Sub pull subscriptions.
#[derive(Debug, Clone)]
pub struct GooglePubSubSubscriber {
    endpoint: String,
    max_messages: u32,
    anonymous: bool,
}

impl GooglePubSubSubscriber {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, max_messages: u32) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_messages,
            anonymous: false,
        }
    }

    /// Talks to an emulator at `host` (`HOST:PORT`) without credentials.
    #[must_use]
    pub fn emulator(host: &str, max_messages: u32) -> Self {
        Self {
            endpoint: format!("http://{host}"),
            max_messages,
            anonymous: true,
        }
    }

    /// Honors [`EMULATOR_HOST_ENV`] before the configured endpoint.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        match std::env::var(EMULATOR_HOST_ENV) {
            Ok(host) if !host.trim().is_empty() => {
                Self::emulator(host.trim(), config.gcp_pubsub_max_messages)
            }
            _ => Self::new(
                config
                    .gcp_pubsub_endpoint
                    .as_deref()
                    .unwrap_or(DEFAULT_ENDPOINT),
                config.gcp_pubsub_max_messages,
            ),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn token_source(&self, server: &ServerConfig) -> Result<TokenSource, SetupError> {
        if self.anonymous {
            return Ok(TokenSource::anonymous());
        }
        match server.gcp_credentials_file.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => {
                debug!("Using GCP credentials file {path}");
                TokenSource::from_credentials_file(path)
            }
            _ => {
                debug!("Using GCP metadata server credentials");
                Ok(TokenSource::metadata_server())
            }
        }
    }
}

impl LogSubscriber for GooglePubSubSubscriber {
    fn name(&self) -> &'static str {
        "google_pubsub"
    }

    fn subscription_key(&self, server: &ServerConfig) -> Option<String> {
        server.pubsub_subscription().map(str::to_string)
    }

    fn start(&self, server: &ServerConfig, context: &SubscriberContext) -> Result<(), SetupError> {
        let Some(subscription) = server.pubsub_subscription() else {
            return Ok(());
        };
        let subscription: SubscriptionPath = subscription.parse()?;
        let token_source = self.token_source(server)?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| SetupError::Client(e.to_string()))?;

        let client = PubSubClient::new(
            http,
            &self.endpoint,
            &subscription,
            self.max_messages,
            token_source,
        );
        debug!("Starting Pub/Sub receiver at {}", client.pull_url());

        SubscriptionWorker::new(
            subscription.to_string(),
            client,
            CloudLoggingDecoder,
            context,
        )
        .spawn(&context.tracker);
        Ok(())
    }
}
