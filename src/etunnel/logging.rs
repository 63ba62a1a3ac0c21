use std::{io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, filter::filter_fn, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::etunnel::{config, relay::PAYLOAD_TARGET};

#[derive(Debug)]
pub struct LoggingRuntime {
    _guards: Vec<WorkerGuard>,
}

/// Installs the global subscriber.
///
/// With `echo_payload`, relayed payload events go to stdout on their own
/// layer, whatever `logging.output` says.
pub fn init(logging: &config::LoggingConfig, echo_payload: bool) -> anyhow::Result<LoggingRuntime> {
    let level = logging.level.trim().to_ascii_lowercase();
    let fmt = logging.format.trim().to_ascii_lowercase();
    let out = logging.output.trim();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level_directive(&level)))
        .context("logging: init filter")?;

    let (writer, guard) = make_writer(out)?;
    let mut guards = vec![guard];

    let base_fmt = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text")
        .with_target(true)
        .with_file(logging.add_source)
        .with_line_number(logging.add_source);

    let base_fmt = if fmt == "json" {
        base_fmt.json().boxed()
    } else {
        base_fmt.boxed()
    };

    let base = base_fmt
        .with_filter(filter)
        .with_filter(filter_fn(|meta| meta.target() != PAYLOAD_TARGET))
        .boxed();

    let payload = if echo_payload {
        let (writer, guard) = tracing_appender::non_blocking(io::stdout());
        guards.push(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_level(false)
                .without_time()
                .with_filter(filter_fn(|meta| meta.target() == PAYLOAD_TARGET))
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(base)
        .with(payload)
        .try_init()
        .context("logging: install subscriber")?;

    Ok(LoggingRuntime { _guards: guards })
}

fn level_directive(level: &str) -> &'static str {
    match level {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    }
}

fn make_writer(
    output: &str,
) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    match output {
        "stderr" => Ok(tracing_appender::non_blocking(io::stderr())),
        "stdout" => Ok(tracing_appender::non_blocking(io::stdout())),
        "discard" => Ok(tracing_appender::non_blocking(io::sink())),
        other => {
            let p = Path::new(other);
            if let Some(parent) = p.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("logging: mkdir {}", parent.display()))?;
                }
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("logging: open {}", p.display()))?;
            Ok(tracing_appender::non_blocking(file))
        }
    }
}
