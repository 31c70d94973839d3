// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Provider adapters and the receive loop they share.
//!
//! A provider plugs in at two levels:
//!
//! - [`LogSubscriber`] is what the coordinator sees: it knows which subscription a
//!   server uses and how to start receiving from it.
//! - [`MessageReceiver`] and [`EnvelopeDecoder`] are the provider transport and message
//!   format, driven by the provider-agnostic [`SubscriptionWorker`].
//!
//! The worker acknowledges every batch before decoding it. A crash between the
//! acknowledgement and the emission loses those messages; redelivery is not attempted.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, Instrument};

use crate::config::ServerConfig;
use crate::error::{DecodeError, ReceiveError, SetupError};
use crate::stream::LogStreamItem;

/// Default cool-down before a failed receive loop is restarted.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Pause after an empty batch, for endpoints that answer a pull without waiting.
pub const EMPTY_BATCH_BACKOFF: Duration = Duration::from_secs(1);

/// A raw message as delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Provider handle used to acknowledge the message.
    pub ack_id: String,
    pub data: Vec<u8>,
}

/// Provider transport for one subscription.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Waits for the next batch of messages. An empty batch is not an error.
    async fn receive(&self) -> Result<Vec<ReceivedMessage>, ReceiveError>;

    /// Tells the provider the messages were consumed and must not be redelivered.
    async fn acknowledge(&self, ack_ids: Vec<String>) -> Result<(), ReceiveError>;
}

/// Provider message format.
pub trait EnvelopeDecoder: Send + Sync {
    /// Decodes one message. `Ok(None)` means the message was filtered out.
    fn decode(&self, data: &[u8]) -> Result<Option<LogStreamItem>, DecodeError>;
}

/// Everything a started subscription needs from the pipeline.
#[derive(Debug, Clone)]
pub struct SubscriberContext {
    pub cancel_token: CancellationToken,
    pub tracker: TaskTracker,
    pub log_stream: mpsc::Sender<LogStreamItem>,
    pub retry_interval: Duration,
}

/// One cloud log-delivery mechanism.
pub trait LogSubscriber: Send + Sync {
    /// Short provider name, used in logs.
    fn name(&self) -> &'static str;

    /// The subscription `server` receives its logs on through this provider, if any.
    /// Servers returning the same key share one receive loop.
    fn subscription_key(&self, server: &ServerConfig) -> Option<String>;

    /// Validates `server`'s settings and spawns its receive loop on
    /// `context.tracker`. Must not block.
    fn start(&self, server: &ServerConfig, context: &SubscriberContext) -> Result<(), SetupError>;
}

/// Supervised receive loop for a single subscription.
pub struct SubscriptionWorker<R, D> {
    subscription: String,
    receiver: R,
    decoder: D,
    log_stream: mpsc::Sender<LogStreamItem>,
    cancel_token: CancellationToken,
    retry_interval: Duration,
}

impl<R, D> SubscriptionWorker<R, D>
where
    R: MessageReceiver + 'static,
    D: EnvelopeDecoder + 'static,
{
    pub fn new(
        subscription: impl Into<String>,
        receiver: R,
        decoder: D,
        context: &SubscriberContext,
    ) -> Self {
        Self {
            subscription: subscription.into(),
            receiver,
            decoder,
            log_stream: context.log_stream.clone(),
            cancel_token: context.cancel_token.clone(),
            retry_interval: context.retry_interval,
        }
    }

    /// Spawns [`Self::run`] on `tracker`, inside the caller's current span.
    pub fn spawn(self, tracker: &TaskTracker) -> JoinHandle<()> {
        tracker.spawn(self.run().in_current_span())
    }

    /// Receives until cancelled, restarting after `retry_interval` whenever the
    /// provider fails.
    pub async fn run(self) {
        loop {
            debug!("Initializing receiver for {}", self.subscription);

            match self.receive_until_failure().await {
                Ok(()) => {
                    debug!("Log stream closed, stopping receiver for {}", self.subscription);
                    break;
                }
                Err(ReceiveError::Cancelled) => break,
                Err(e) => {
                    error!(
                        "Failed to receive from {}, retrying in {}s: {}",
                        self.subscription,
                        self.retry_interval.as_secs(),
                        e
                    );
                    tokio::select! {
                        () = tokio::time::sleep(self.retry_interval) => {}
                        () = self.cancel_token.cancelled() => break,
                    }
                }
            }
        }

        debug!("Receiver for {} stopped", self.subscription);
    }

    /// Returns `Ok(())` once nobody reads the log stream anymore.
    async fn receive_until_failure(&self) -> Result<(), ReceiveError> {
        loop {
            let messages = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return Err(ReceiveError::Cancelled),
                result = self.receiver.receive() => result?,
            };
            if messages.is_empty() {
                tokio::select! {
                    biased;
                    () = self.cancel_token.cancelled() => return Err(ReceiveError::Cancelled),
                    () = tokio::time::sleep(EMPTY_BATCH_BACKOFF) => {}
                }
                continue;
            }

            let ack_ids = messages.iter().map(|m| m.ack_id.clone()).collect();
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return Err(ReceiveError::Cancelled),
                result = self.receiver.acknowledge(ack_ids) => result?,
            }

            for message in messages {
                let item = match self.decoder.decode(&message.data) {
                    Ok(Some(item)) => item,
                    Ok(None) => continue,
                    Err(e) => {
                        error!("{e}");
                        continue;
                    }
                };

                // Blocks while the transformer is behind.
                tokio::select! {
                    biased;
                    () = self.cancel_token.cancelled() => return Err(ReceiveError::Cancelled),
                    sent = self.log_stream.send(item) => {
                        if sent.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
