// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull subscriber over the Pub/Sub REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::auth::TokenSource;
use super::SubscriptionPath;
use crate::error::ReceiveError;
use crate::subscriber::{MessageReceiver, ReceivedMessage};

pub const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
pub const DEFAULT_MAX_MESSAGES: u32 = 100;

// Pull requests are long polls; the server answers earlier when messages arrive.
const PULL_TIMEOUT: Duration = Duration::from_secs(90);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct PullResponse {
    received_messages: Vec<WireReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceivedMessage {
    ack_id: String,
    #[serde(default)]
    message: PubsubMessage,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct PubsubMessage {
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest {
    ack_ids: Vec<String>,
}

/// Receives messages from one subscription.
///
/// Message data is handed on as the base64 text found on the wire; the envelope
/// decoder takes care of decoding it so a corrupt message only drops itself.
#[derive(Debug)]
pub struct PubSubClient {
    http: reqwest::Client,
    pull_url: String,
    acknowledge_url: String,
    max_messages: u32,
    token_source: TokenSource,
}

impl PubSubClient {
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        endpoint: &str,
        subscription: &SubscriptionPath,
        max_messages: u32,
        token_source: TokenSource,
    ) -> Self {
        let base = format!("{}/v1/{subscription}", endpoint.trim_end_matches('/'));
        Self {
            http,
            pull_url: format!("{base}:pull"),
            acknowledge_url: format!("{base}:acknowledge"),
            max_messages: max_messages.max(1),
            token_source,
        }
    }

    #[must_use]
    pub fn pull_url(&self) -> &str {
        &self.pull_url
    }

    async fn authorize(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ReceiveError> {
        Ok(match self.token_source.token(&self.http).await? {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ReceiveError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(ReceiveError::Transport(format!(
        "Pub/Sub request to {url} failed: {status}: {body}"
    )))
}

#[async_trait]
impl MessageReceiver for PubSubClient {
    async fn receive(&self) -> Result<Vec<ReceivedMessage>, ReceiveError> {
        let request = self
            .http
            .post(&self.pull_url)
            .timeout(PULL_TIMEOUT)
            .json(&PullRequest {
                max_messages: self.max_messages,
            });
        let response = match self.authorize(request).await?.send().await {
            Ok(response) => check_status(response).await?,
            // An idle long poll, not a failure.
            Err(e) if e.is_timeout() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let pulled: PullResponse = response.json().await?;

        debug!(
            "Pulled {} messages from {}",
            pulled.received_messages.len(),
            self.pull_url
        );

        Ok(pulled
            .received_messages
            .into_iter()
            .map(|received| ReceivedMessage {
                ack_id: received.ack_id,
                data: received.message.data.into_bytes(),
            })
            .collect())
    }

    async fn acknowledge(&self, ack_ids: Vec<String>) -> Result<(), ReceiveError> {
        let request = self
            .http
            .post(&self.acknowledge_url)
            .timeout(REQUEST_TIMEOUT)
            .json(&AcknowledgeRequest { ack_ids });
        check_status(self.authorize(request).await?.send().await?).await?;
        Ok(())
    }
}
