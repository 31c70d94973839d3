// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records flowing through the log stream pipeline.
//!
//! Provider adapters produce [`LogStreamItem`]s on a shared intermediate channel, the
//! transformer turns each one into zero or more [`ParsedLogStreamItem`]s on the output
//! sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::parser::LogLine;

/// Capacity of the intermediate channel between adapters and the transformer.
pub const LOG_STREAM_BUFFER_LEN: usize = 1000;

/// Provider-agnostic record produced by an adapter for every accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogStreamItem {
    /// Cloud project (or account) the log originated in.
    pub project_id: String,
    /// Database instance (or cluster) the log originated from.
    pub instance_id: String,
    /// When the provider says the entry was written. `None` when missing or unparsable.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Raw text payload, without its trailing line terminator.
    pub content: String,
}

/// Stable identity of a monitored server, used to route output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentifier {
    pub system_id: String,
    pub system_type: String,
    pub system_scope: String,
}

impl fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.system_scope.is_empty() {
            write!(f, "{}/{}", self.system_type, self.system_id)
        } else {
            write!(
                f,
                "{}/{}/{}",
                self.system_type, self.system_scope, self.system_id
            )
        }
    }
}

/// A parsed log line addressed to one monitored server. This is the unit placed on the
/// output sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedLogStreamItem {
    pub identifier: ServerIdentifier,
    pub log_line: LogLine,
}
