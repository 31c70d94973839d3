// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup of the log stream pipeline.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info_span, warn};

use crate::config::Config;
use crate::error::SetupError;
use crate::parser::LineParser;
use crate::registry::SubscriptionRegistry;
use crate::stream::{LogStreamItem, ParsedLogStreamItem};
use crate::subscriber::{LogSubscriber, SubscriberContext};
use crate::transformer::LogTransformer;

/// Starts the transformer and one receive loop per distinct subscription referenced
/// by `config.servers`.
///
/// Every task is spawned on `tracker` and observes `cancel_token`; shut down by
/// cancelling, closing the tracker and waiting on it. Setup failures skip the server
/// with a warning, unless `config.test_run` is set, in which case the first failure
/// is returned. Tasks started before that failure keep running until cancelled.
pub fn setup_log_subscriber(
    config: &Config,
    subscribers: &[Arc<dyn LogSubscriber>],
    parser: Arc<dyn LineParser>,
    out: mpsc::Sender<ParsedLogStreamItem>,
    cancel_token: &CancellationToken,
    tracker: &TaskTracker,
) -> Result<(), SetupError> {
    let (log_stream, rx) = mpsc::channel::<LogStreamItem>(config.log_stream_buffer_len);

    LogTransformer::new(
        Arc::new(config.servers.clone()),
        parser,
        rx,
        out,
        cancel_token.clone(),
        config.freshness_window(),
    )
    .spawn(tracker);

    let context = SubscriberContext {
        cancel_token: cancel_token.clone(),
        tracker: tracker.clone(),
        log_stream,
        retry_interval: config.retry_interval(),
    };
    let mut registry = SubscriptionRegistry::new();

    for server in &config.servers {
        let span = info_span!("server", name = %server.name);
        let _enter = span.enter();

        for subscriber in subscribers {
            let Some(key) = subscriber.subscription_key(server) else {
                continue;
            };
            if !registry.should_start(&key) {
                debug!("Subscription {key} already running, sharing it");
                continue;
            }

            debug!("Setting up {} log subscriber for {key}", subscriber.name());
            if let Err(e) = subscriber.start(server, &context) {
                registry.release(&key);
                if config.test_run {
                    return Err(e);
                }
                warn!("Skipping logs, could not setup log subscriber: {e}");
            }
        }
    }

    debug!("Started {} log subscriptions", registry.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::parser::LogLine;
    use crate::parser::PostgresLineParser;
    use crate::subscriber::tests::{message, PipeDecoder, ScriptedReceiver};
    use crate::subscriber::SubscriptionWorker;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;
    use tracing_test::traced_test;

    /// Records every start; fails for subscriptions containing "broken" and feeds
    /// the subscription's scripted messages otherwise.
    #[derive(Default)]
    struct RecordingSubscriber {
        started: Mutex<Vec<String>>,
        messages: Vec<(String, String)>,
    }

    impl LogSubscriber for RecordingSubscriber {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn subscription_key(&self, server: &ServerConfig) -> Option<String> {
            server.pubsub_subscription().map(str::to_string)
        }

        fn start(
            &self,
            server: &ServerConfig,
            context: &SubscriberContext,
        ) -> Result<(), SetupError> {
            let key = self.subscription_key(server).unwrap_or_default();
            self.started.lock().unwrap().push(key.clone());
            if key.contains("broken") {
                return Err(SetupError::InvalidSubscription(key));
            }

            let batch = self
                .messages
                .iter()
                .enumerate()
                .filter(|(_, (subscription, _))| *subscription == key)
                .map(|(i, (_, data))| message(&i.to_string(), data))
                .collect::<Vec<_>>();
            let receiver = ScriptedReceiver::new(vec![Ok(batch)]);
            SubscriptionWorker::new(key, receiver, PipeDecoder, context).spawn(&context.tracker);
            Ok(())
        }
    }

    fn server(name: &str, instance: &str, subscription: &str) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            gcp_project_id: "p1".to_string(),
            gcp_cloudsql_instance_id: instance.to_string(),
            gcp_pubsub_subscription: Some(subscription.to_string()),
            ..Default::default()
        }
    }

    async fn shutdown(cancel_token: &CancellationToken, tracker: &TaskTracker) {
        cancel_token.cancel();
        tracker.close();
        timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("every task should stop");
    }

    #[tokio::test]
    async fn test_shared_subscription_starts_once() {
        let subscriber = Arc::new(RecordingSubscriber::default());
        let config = Config {
            servers: vec![
                server("a", "i1", "projects/p1/subscriptions/shared"),
                server("b", "i2", "projects/p1/subscriptions/shared"),
                server("c", "i3", "projects/p1/subscriptions/other"),
                server("d", "i4", ""),
            ],
            ..Default::default()
        };
        let (out, _rx) = mpsc::channel(10);
        let cancel_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        setup_log_subscriber(
            &config,
            &[subscriber.clone() as Arc<dyn LogSubscriber>],
            Arc::new(PostgresLineParser),
            out,
            &cancel_token,
            &tracker,
        )
        .unwrap();

        assert_eq!(
            *subscriber.started.lock().unwrap(),
            vec![
                "projects/p1/subscriptions/shared",
                "projects/p1/subscriptions/other"
            ]
        );
        // transformer + two receive loops
        assert_eq!(tracker.len(), 3);
        shutdown(&cancel_token, &tracker).await;
    }

    #[tokio::test]
    #[traced_test]
    async fn test_setup_failure_is_skipped() {
        let subscriber = Arc::new(RecordingSubscriber::default());
        let config = Config {
            servers: vec![
                server("a", "i1", "projects/p1/subscriptions/broken"),
                server("b", "i2", "projects/p1/subscriptions/broken"),
                server("c", "i3", "projects/p1/subscriptions/ok"),
            ],
            ..Default::default()
        };
        let (out, _rx) = mpsc::channel(10);
        let cancel_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        setup_log_subscriber(
            &config,
            &[subscriber.clone() as Arc<dyn LogSubscriber>],
            Arc::new(PostgresLineParser),
            out,
            &cancel_token,
            &tracker,
        )
        .expect("failures are skipped outside of test runs");

        // a failed key is released, so the next server sharing it tries again
        assert_eq!(
            *subscriber.started.lock().unwrap(),
            vec![
                "projects/p1/subscriptions/broken",
                "projects/p1/subscriptions/broken",
                "projects/p1/subscriptions/ok"
            ]
        );
        assert!(logs_contain("Skipping logs, could not setup log subscriber"));
        assert!(logs_contain("server{name=a}"));
        shutdown(&cancel_token, &tracker).await;
    }

    #[tokio::test]
    async fn test_setup_failure_is_returned_in_test_run() {
        let subscriber = Arc::new(RecordingSubscriber::default());
        let config = Config {
            test_run: true,
            servers: vec![
                server("a", "i1", "projects/p1/subscriptions/broken"),
                server("b", "i2", "projects/p1/subscriptions/ok"),
            ],
            ..Default::default()
        };
        let (out, _rx) = mpsc::channel(10);
        let cancel_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        let err = setup_log_subscriber(
            &config,
            &[subscriber.clone() as Arc<dyn LogSubscriber>],
            Arc::new(PostgresLineParser),
            out,
            &cancel_token,
            &tracker,
        )
        .unwrap_err();

        assert!(matches!(err, SetupError::InvalidSubscription(_)));
        assert_eq!(subscriber.started.lock().unwrap().len(), 1);
        shutdown(&cancel_token, &tracker).await;
    }

    #[tokio::test]
    async fn test_records_reach_matching_servers() {
        let subscriber = Arc::new(RecordingSubscriber {
            messages: vec![
                (
                    "projects/p1/subscriptions/shared".to_string(),
                    "p1|i1|[7]: [1-1] db=app,user=app LOG:  checkpoint complete".to_string(),
                ),
                (
                    "projects/p1/subscriptions/shared".to_string(),
                    "p1|i9|LOG:  nobody listens".to_string(),
                ),
                (
                    "projects/p1/subscriptions/shared".to_string(),
                    "p1|i2|ERROR:  deadlock detected".to_string(),
                ),
            ],
            ..Default::default()
        });
        let config = Config {
            servers: vec![
                server("a", "i1", "projects/p1/subscriptions/shared"),
                server("b", "i2", "projects/p1/subscriptions/shared"),
            ],
            ..Default::default()
        };
        let (out, mut rx) = mpsc::channel(10);
        let cancel_token = CancellationToken::new();
        let tracker = TaskTracker::new();

        setup_log_subscriber(
            &config,
            &[subscriber.clone() as Arc<dyn LogSubscriber>],
            Arc::new(PostgresLineParser),
            out,
            &cancel_token,
            &tracker,
        )
        .unwrap();

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.identifier.system_id, "p1:i1");
        assert_eq!(
            first.log_line,
            LogLine {
                occurred_at: None,
                log_level: crate::parser::LogLevel::Log,
                backend_pid: Some(7),
                database: Some("app".to_string()),
                username: Some("app".to_string()),
                content: "checkpoint complete".to_string(),
            }
        );
        assert_eq!(second.identifier.system_id, "p1:i2");
        assert_eq!(second.log_line.content, "deadlock detected");

        shutdown(&cancel_token, &tracker).await;
        assert!(rx.recv().await.is_none());
    }
}
