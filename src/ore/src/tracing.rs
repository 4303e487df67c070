// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tracing utilities.
//!
//! This module contains application tracing utilities built on top of the
//! [`tracing`] library. The key export is the **[`configure`]** function,
//! which configures the `tracing` crate with sensible defaults and should be
//! called during initialization of every control-plane binary.

use std::io::{self, IsTerminal};
use std::str::FromStr;

use anyhow::Context;
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::format::{Writer, format};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Command-line arguments that configure tracing, for flattening into a
/// binary's own arguments.
#[derive(Debug, Clone, clap::Args)]
pub struct TracingCliArgs {
    /// Which tracing events to log to stderr.
    ///
    /// Accepts a comma-separated list of `target=level` directives, or a bare
    /// level that applies to every target.
    #[clap(
        long,
        env = "PGHA_LOG_FILTER",
        value_name = "FILTER",
        default_value = "info"
    )]
    pub log_filter: String,
    /// An optional prefix for each stderr log line.
    #[clap(long, env = "PGHA_LOG_PREFIX", value_name = "PREFIX")]
    pub log_prefix: Option<String>,
}

impl TracingCliArgs {
    /// Converts the arguments into a [`TracingConfig`].
    pub fn to_config(&self) -> Result<TracingConfig, anyhow::Error> {
        let filter = Targets::from_str(&self.log_filter)
            .with_context(|| format!("invalid log filter {:?}", self.log_filter))?;
        Ok(TracingConfig {
            stderr_log: StderrLogConfig {
                prefix: self.log_prefix.clone(),
                filter,
            },
        })
    }
}

/// Application tracing configuration.
///
/// See the [`configure`] function for details.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Configuration of the stderr log.
    pub stderr_log: StderrLogConfig,
}

/// Configures the stderr log.
#[derive(Debug, Clone)]
pub struct StderrLogConfig {
    /// An optional prefix for each stderr log line.
    pub prefix: Option<String>,
    /// A filter which determines which events are emitted to the log.
    pub filter: Targets,
}

/// Enables application tracing via the [`tracing`] library.
///
/// Events are emitted as textual log lines to stderr. ANSI colors are used
/// only when stderr is a terminal. Returns an error if a global subscriber
/// has already been installed.
pub fn configure<C>(config: C) -> Result<(), anyhow::Error>
where
    C: Into<TracingConfig>,
{
    let config = config.into();
    let stderr_log_layer = fmt::layer()
        .event_format(PrefixFormat {
            inner: format(),
            prefix: config.stderr_log.prefix,
        })
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_filter(config.stderr_log.filter);

    tracing_subscriber::registry()
        .with(stderr_log_layer)
        .try_init()
        .context("installing global tracing subscriber")?;
    Ok(())
}

/// A wrapper around a [`FormatEvent`] that adds an optional prefix to each
/// event.
#[derive(Debug)]
pub struct PrefixFormat<F> {
    inner: F,
    prefix: Option<String>,
}

impl<F, C, N> FormatEvent<C, N> for PrefixFormat<F>
where
    C: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<C, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, C, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        match &self.prefix {
            None => self.inner.format_event(ctx, writer, event)?,
            Some(prefix) => {
                if writer.has_ansi_escapes() {
                    write!(writer, "\x1b[1m{}:\x1b[0m ", prefix)?;
                } else {
                    write!(writer, "{}: ", prefix)?;
                }
                self.inner.format_event(ctx, writer, event)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use tracing::Level;

    use super::*;

    fn target_level(targets: &Targets, target: &str) -> Level {
        if targets.would_enable(target, &Level::TRACE) {
            Level::TRACE
        } else if targets.would_enable(target, &Level::DEBUG) {
            Level::DEBUG
        } else if targets.would_enable(target, &Level::INFO) {
            Level::INFO
        } else if targets.would_enable(target, &Level::WARN) {
            Level::WARN
        } else {
            Level::ERROR
        }
    }

    #[derive(Debug, clap::Parser)]
    struct Args {
        #[clap(flatten)]
        tracing: TracingCliArgs,
    }

    #[test]
    fn filter_directives_parse() {
        let args = Args::try_parse_from([
            "bin",
            "--log-filter",
            "warn,pgha_registry_bootstrap=debug",
            "--log-prefix",
            "etcd-1",
        ])
        .unwrap();
        let config = args.tracing.to_config().unwrap();
        assert_eq!(config.stderr_log.prefix.as_deref(), Some("etcd-1"));
        assert_eq!(
            target_level(&config.stderr_log.filter, "pgha_registry_bootstrap"),
            Level::DEBUG
        );
        assert_eq!(
            target_level(&config.stderr_log.filter, "reqwest"),
            Level::WARN
        );
    }

    #[test]
    fn invalid_filter_is_rejected() {
        let args = TracingCliArgs {
            log_filter: "pgha=loud".into(),
            log_prefix: None,
        };
        assert!(args.to_config().is_err());
    }
}
