// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line parsing.
//!
//! The transformer only depends on the [`LineParser`] contract. [`PostgresLineParser`]
//! is the default implementation and understands the `log_line_prefix` output used by
//! Cloud SQL and AlloyDB, for example:
//!
//! ```text
//! [2372]: [3-1] db=postgres,user=admin LOG:  duration: 2.190 ms  statement: SELECT 1
//! ```

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

/// Severity of a PostgreSQL log line, including the secondary
/// `DETAIL`/`HINT`/`STATEMENT` style lines that belong to a primary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug5,
    Debug4,
    Debug3,
    Debug2,
    Debug1,
    Info,
    Notice,
    Warning,
    Error,
    Log,
    Fatal,
    Panic,
    Detail,
    Hint,
    Context,
    Statement,
    Query,
    Location,
}

impl LogLevel {
    pub fn from_name(name: &str) -> Option<Self> {
        let level = match name {
            "DEBUG5" => Self::Debug5,
            "DEBUG4" => Self::Debug4,
            "DEBUG3" => Self::Debug3,
            "DEBUG2" => Self::Debug2,
            "DEBUG1" => Self::Debug1,
            "INFO" => Self::Info,
            "NOTICE" => Self::Notice,
            "WARNING" => Self::Warning,
            "ERROR" => Self::Error,
            "LOG" => Self::Log,
            "FATAL" => Self::Fatal,
            "PANIC" => Self::Panic,
            "DETAIL" => Self::Detail,
            "HINT" => Self::Hint,
            "CONTEXT" => Self::Context,
            "STATEMENT" => Self::Statement,
            "QUERY" => Self::Query,
            "LOCATION" => Self::Location,
            _ => return None,
        };
        Some(level)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug5 => "DEBUG5",
            Self::Debug4 => "DEBUG4",
            Self::Debug3 => "DEBUG3",
            Self::Debug2 => "DEBUG2",
            Self::Debug1 => "DEBUG1",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Log => "LOG",
            Self::Fatal => "FATAL",
            Self::Panic => "PANIC",
            Self::Detail => "DETAIL",
            Self::Hint => "HINT",
            Self::Context => "CONTEXT",
            Self::Statement => "STATEMENT",
            Self::Query => "QUERY",
            Self::Location => "LOCATION",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A well-formed log entry, possibly reconstructed from several physical lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// When the entry was written. The transformer overwrites this with the provider's
    /// timestamp, which is authoritative.
    pub occurred_at: Option<DateTime<Utc>>,
    pub log_level: LogLevel,
    pub backend_pid: Option<i32>,
    pub database: Option<String>,
    pub username: Option<String>,
    /// Message text following the level marker. Continuation lines are kept, separated
    /// by `\n`.
    pub content: String,
}

/// Turns raw log text into a [`LogLine`].
///
/// `text` must end with a line terminator. Implementations return `None` for input they
/// cannot make sense of, and must not keep state between calls.
pub trait LineParser: Send + Sync {
    fn parse(&self, prefix: &str, text: &str) -> Option<LogLine>;
}

/// Parser for PostgreSQL server log output.
#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresLineParser;

fn level_regex() -> &'static Regex {
    static LEVEL: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    LEVEL.get_or_init(|| {
        Regex::new(
            r"(?s)^(?P<prefix>[^\n]*?)(?:^|[ \t])(?P<level>DEBUG[1-5]|INFO|NOTICE|WARNING|ERROR|LOG|FATAL|PANIC|DETAIL|HINT|CONTEXT|STATEMENT|QUERY|LOCATION):[ \t]+(?P<content>.*)$",
        )
        .expect("invalid log level regex")
    })
}

fn prefix_regex() -> &'static Regex {
    static PREFIX: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PREFIX.get_or_init(|| {
        Regex::new(r"\[(?P<pid>\d+)\]|db=(?P<db>[^,\s\]]+)|user=(?P<user>[^,\s\]]+)")
            .expect("invalid log line prefix regex")
    })
}

impl LineParser for PostgresLineParser {
    fn parse(&self, prefix: &str, text: &str) -> Option<LogLine> {
        let line = text.strip_suffix('\n')?;
        let line = line.strip_suffix('\r').unwrap_or(line);
        let line = line.strip_prefix(prefix)?;

        let captures = level_regex().captures(line)?;
        let log_level = LogLevel::from_name(&captures["level"])?;

        let mut log_line = LogLine {
            occurred_at: None,
            log_level,
            backend_pid: None,
            database: None,
            username: None,
            content: captures["content"].to_string(),
        };

        for prefix_field in prefix_regex().captures_iter(&captures["prefix"]) {
            if let Some(pid) = prefix_field.name("pid") {
                if log_line.backend_pid.is_none() {
                    log_line.backend_pid = pid.as_str().parse().ok();
                }
            } else if let Some(db) = prefix_field.name("db") {
                log_line.database.get_or_insert_with(|| db.as_str().to_string());
            } else if let Some(user) = prefix_field.name("user") {
                log_line
                    .username
                    .get_or_insert_with(|| user.as_str().to_string());
            }
        }

        Some(log_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parse(text: &str) -> Option<LogLine> {
        PostgresLineParser.parse("", text)
    }

    #[test]
    fn test_parse_bare_level_and_content() {
        let line = parse("LOG:  checkpoint starting: time\n").expect("should parse");
        assert_eq!(line.log_level, LogLevel::Log);
        assert_eq!(line.content, "checkpoint starting: time");
        assert_eq!(line.backend_pid, None);
        assert_eq!(line.occurred_at, None);
    }

    #[test]
    fn test_parse_cloudsql_prefix() {
        let line = parse(
            "[2372]: [3-1] db=postgres,user=admin LOG:  duration: 2.190 ms  statement: SELECT 1\n",
        )
        .expect("should parse");
        assert_eq!(line.log_level, LogLevel::Log);
        assert_eq!(line.backend_pid, Some(2372));
        assert_eq!(line.database.as_deref(), Some("postgres"));
        assert_eq!(line.username.as_deref(), Some("admin"));
        assert_eq!(line.content, "duration: 2.190 ms  statement: SELECT 1");
    }

    #[test]
    fn test_parse_multi_line_entry() {
        let line = parse("[10]: [1-1] db=app,user=app ERROR:  syntax error at or near \"FORM\"\nLINE 1: SELECT * FORM t\n                 ^\n")
            .expect("should parse");
        assert_eq!(line.log_level, LogLevel::Error);
        assert_eq!(
            line.content,
            "syntax error at or near \"FORM\"\nLINE 1: SELECT * FORM t\n                 ^"
        );
    }

    #[test]
    fn test_parse_level_only_recognized_on_first_line() {
        assert!(parse("some unrelated text\nLOG:  hidden\n").is_none());
    }

    #[test]
    fn test_parse_requires_line_terminator() {
        assert!(parse("LOG:  no newline").is_none());
    }

    #[test]
    fn test_parse_unknown_level() {
        assert!(parse("VERBOSE:  not a postgres level\n").is_none());
        assert!(parse("just some text\n").is_none());
        assert!(parse("\n").is_none());
    }

    #[test]
    fn test_parse_level_must_be_its_own_word() {
        assert!(parse("CATALOG:  nope\n").is_none());
    }

    #[test]
    fn test_parse_with_prefix() {
        let line = PostgresLineParser
            .parse("2024-01-01 00:00:00 UTC ", "2024-01-01 00:00:00 UTC [7]: WARNING:  careful\n")
            .expect("should parse");
        assert_eq!(line.log_level, LogLevel::Warning);
        assert_eq!(line.backend_pid, Some(7));
        assert_eq!(line.content, "careful");

        assert!(PostgresLineParser
            .parse("other prefix ", "2024-01-01 00:00:00 UTC [7]: WARNING:  careful\n")
            .is_none());
    }

    #[test]
    fn test_parse_crlf_terminator() {
        let line = parse("FATAL:  terminating connection\r\n").expect("should parse");
        assert_eq!(line.log_level, LogLevel::Fatal);
        assert_eq!(line.content, "terminating connection");
    }

    #[test]
    fn test_log_level_names_round_trip() {
        for name in ["DEBUG1", "INFO", "NOTICE", "STATEMENT", "LOCATION", "PANIC"] {
            let level = LogLevel::from_name(name).expect("known level");
            assert_eq!(level.as_str(), name);
        }
        assert_eq!(LogLevel::from_name("log"), None);
    }

    proptest! {
        #[test]
        fn parsed_content_is_the_message(
            level in prop::sample::select(vec!["LOG", "ERROR", "WARNING", "DETAIL", "STATEMENT"]),
            message in "[a-zA-Z0-9 ,.:=()]{0,40}",
        ) {
            let text = format!("[42]: [1-1] db=d,user=u {level}:  {message}\n");
            let line = parse(&text).expect("should parse");
            prop_assert_eq!(line.log_level.as_str(), level);
            prop_assert_eq!(line.backend_pid, Some(42));
            prop_assert_eq!(line.content, message.trim_start().to_string());
        }
    }
}
