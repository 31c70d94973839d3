// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cloud Logging entries exported to Pub/Sub.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::DecodeError;
use crate::stream::LogStreamItem;
use crate::subscriber::EnvelopeDecoder;

pub const CLOUDSQL_RESOURCE_TYPE: &str = "cloudsql_database";
pub const ALLOYDB_RESOURCE_TYPE: &str = "alloydb.googleapis.com/Instance";
pub const POSTGRES_LOG_NAME_SUFFIX: &str = "postgres.log";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MonitoredResource {
    #[serde(rename = "type")]
    resource_type: String,
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct LogEntry {
    log_name: String,
    resource: MonitoredResource,
    text_payload: String,
    timestamp: String,
}

/// Decodes base64 Pub/Sub message data holding a Cloud Logging `LogEntry`, keeping
/// only PostgreSQL server logs of Cloud SQL and AlloyDB instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloudLoggingDecoder;

impl EnvelopeDecoder for CloudLoggingDecoder {
    fn decode(&self, data: &[u8]) -> Result<Option<LogStreamItem>, DecodeError> {
        let json = STANDARD.decode(data)?;
        decode_log_entry(&json)
    }
}

/// Decodes the JSON `LogEntry` itself. `Ok(None)` for entries that are not PostgreSQL
/// logs or lack routing labels.
pub fn decode_log_entry(json: &[u8]) -> Result<Option<LogStreamItem>, DecodeError> {
    let entry: LogEntry = serde_json::from_slice(json)?;

    if !entry.log_name.ends_with(POSTGRES_LOG_NAME_SUFFIX) {
        return Ok(None);
    }
    let Some((project_id, instance_id)) = routing_ids(&entry.resource) else {
        return Ok(None);
    };

    Ok(Some(LogStreamItem {
        project_id,
        instance_id,
        occurred_at: parse_timestamp(&entry.timestamp),
        content: entry.text_payload,
    }))
}

fn routing_ids(resource: &MonitoredResource) -> Option<(String, String)> {
    match resource.resource_type.as_str() {
        ALLOYDB_RESOURCE_TYPE => cluster_ids(&resource.labels),
        CLOUDSQL_RESOURCE_TYPE => {
            cluster_ids(&resource.labels).or_else(|| database_ids(&resource.labels))
        }
        _ => None,
    }
}

/// `resource_container` ("projects/PROJECT_ID") and `cluster_id` labels.
fn cluster_ids(labels: &HashMap<String, String>) -> Option<(String, String)> {
    let container = labels.get("resource_container")?;
    if container.matches('/').count() != 1 {
        return None;
    }
    let (_, project_id) = container.split_once('/')?;
    let cluster_id = labels.get("cluster_id")?;
    Some((project_id.to_string(), cluster_id.to_string()))
}

/// `database_id` label ("PROJECT_ID:INSTANCE_ID"). Domain-scoped projects contain a
/// colon themselves, so the instance is whatever follows the last one.
fn database_ids(labels: &HashMap<String, String>) -> Option<(String, String)> {
    let database_id = labels.get("database_id")?;
    let (project_id, instance_id) = database_id.rsplit_once(':')?;
    let project_id = labels.get("project_id").map_or(project_id, String::as_str);
    Some((project_id.to_string(), instance_id.to_string()))
}

fn parse_timestamp(timestamp: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
