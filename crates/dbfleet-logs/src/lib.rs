// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # dbfleet logs
//!
//! Ingestion of database server logs delivered through cloud streaming channels.
//!
//! ## Overview
//!
//! Provider adapters receive raw messages, decode them into [`stream::LogStreamItem`]s
//! and push them onto one bounded channel. A single [`transformer::LogTransformer`]
//! parses each record, drops backlog older than the freshness window and emits one
//! [`stream::ParsedLogStreamItem`] per monitored server the record belongs to.
//!
//! ## Architecture
//!
//! - [`pipeline`]: startup of the transformer and the deduplicated subscriptions
//! - [`subscriber`]: the provider capability and the shared receive loop
//! - [`gcp`]: Google Cloud Pub/Sub carrying Cloud SQL and AlloyDB logs
//! - [`parser`]: the line parsing contract and the PostgreSQL parser

#![deny(clippy::all)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]

/// Layered YAML and environment configuration
pub mod config;

pub mod error;

/// Google Cloud Pub/Sub provider
pub mod gcp;

pub mod parser;

pub mod pipeline;

/// Deduplication of shared subscriptions
pub mod registry;

pub mod stream;

pub mod subscriber;

pub mod transformer;
