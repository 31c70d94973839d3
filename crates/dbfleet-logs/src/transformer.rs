// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns intermediate records into parsed log lines for every server they belong to.
//!
//! ```text
//!   adapter   adapter   adapter
//!       \        |        /
//!        v       v       v
//!   ┌─────────────────────────┐
//!   │  log stream (bounded)   │
//!   └────────────┬────────────┘
//!                v
//!   ┌─────────────────────────┐
//!   │     LogTransformer      │  parse, freshness filter, fan-out
//!   └────────────┬────────────┘
//!                v
//!   ┌─────────────────────────┐
//!   │       output sink       │
//!   └─────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

use crate::config::ServerConfig;
use crate::parser::LineParser;
use crate::stream::{LogStreamItem, ParsedLogStreamItem};

/// Consumes the shared log stream and feeds the output sink.
pub struct LogTransformer {
    servers: Arc<Vec<ServerConfig>>,
    parser: Arc<dyn LineParser>,
    rx: mpsc::Receiver<LogStreamItem>,
    out: mpsc::Sender<ParsedLogStreamItem>,
    cancel_token: CancellationToken,
    /// Freshness horizon, fixed when the transformer is created.
    lines_newer_than: DateTime<Utc>,
}

impl LogTransformer {
    /// Creates a transformer that drops lines written more than `freshness_window`
    /// before now.
    pub fn new(
        servers: Arc<Vec<ServerConfig>>,
        parser: Arc<dyn LineParser>,
        rx: mpsc::Receiver<LogStreamItem>,
        out: mpsc::Sender<ParsedLogStreamItem>,
        cancel_token: CancellationToken,
        freshness_window: Duration,
    ) -> Self {
        let window = TimeDelta::from_std(freshness_window).unwrap_or(TimeDelta::MAX);
        let lines_newer_than = Utc::now()
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Self {
            servers,
            parser,
            rx,
            out,
            cancel_token,
            lines_newer_than,
        }
    }

    #[must_use]
    pub fn lines_newer_than(&self) -> DateTime<Utc> {
        self.lines_newer_than
    }

    pub fn spawn(self, tracker: &TaskTracker) -> JoinHandle<()> {
        tracker.spawn(self.run())
    }

    /// Runs until cancelled, or until either channel is closed.
    pub async fn run(mut self) {
        debug!(
            "Log transformer started, ignoring lines older than {}",
            self.lines_newer_than
        );

        'receive: loop {
            let item = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                item = self.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            for parsed in self.transform(item) {
                tokio::select! {
                    biased;
                    () = self.cancel_token.cancelled() => break 'receive,
                    sent = self.out.send(parsed) => {
                        if sent.is_err() {
                            debug!("Output closed, stopping log transformer");
                            break 'receive;
                        }
                    }
                }
            }
        }

        debug!("Log transformer stopped");
    }

    /// Parses `item` and addresses it to every matching server. Returns nothing for
    /// unparseable, stale, or unmatched records.
    fn transform(&self, item: LogStreamItem) -> Vec<ParsedLogStreamItem> {
        let Some(mut log_line) = self
            .parser
            .parse("", &restore_line_terminator(&item.content))
        else {
            error!("Can't parse log line: \"{}\"", item.content);
            return Vec::new();
        };
        log_line.occurred_at = item.occurred_at;

        if is_stale(log_line.occurred_at, self.lines_newer_than) {
            trace!("Ignoring log line outside of time window: {:?}", log_line.occurred_at);
            return Vec::new();
        }

        matching_servers(&self.servers, &item)
            .map(|server| ParsedLogStreamItem {
                identifier: server.identifier(),
                log_line: log_line.clone(),
            })
            .collect()
    }
}

/// Providers strip the trailing newline the line parser relies on.
#[must_use]
pub fn restore_line_terminator(content: &str) -> String {
    let mut line = String::with_capacity(content.len() + 1);
    line.push_str(content);
    line.push('\n');
    line
}

/// A line is stale when its timestamp is known and strictly before `horizon`.
#[must_use]
pub fn is_stale(occurred_at: Option<DateTime<Utc>>, horizon: DateTime<Utc>) -> bool {
    occurred_at.is_some_and(|t| t < horizon)
}

/// Servers whose project and instance both equal the item's.
pub fn matching_servers<'a>(
    servers: &'a [ServerConfig],
    item: &'a LogStreamItem,
) -> impl Iterator<Item = &'a ServerConfig> + 'a {
    servers.iter().filter(move |server| {
        server.gcp_project_id == item.project_id
            && server.gcp_cloudsql_instance_id == item.instance_id
    })
}
