//! Log output for the relay process
//!
//! The relay's own crates log at the configured level while chatty transport
//! dependencies are capped, so `level = "debug"` shows per-session detail
//! without every hyper connection event. Each relay connection runs inside a
//! [`connection_span`], so events emitted deep in the router still carry the
//! connection's identity.

use anyhow::Context;
use std::sync::Arc;
use tracing::{Level, Span};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::models::{CameraId, ConnectionId, Role, UserType};

/// Dependencies never logged above the given level
const CAPPED_TARGETS: &[(&str, Level)] = &[
    ("tower_http", Level::INFO),
    ("hyper", Level::WARN),
    ("hyper_util", Level::WARN),
    ("reqwest", Level::WARN),
    ("tungstenite", Level::WARN),
];

/// Install the global subscriber
///
/// `RUST_LOG`, when set, replaces the directives derived from `config.level`.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(config)?;

    let (writer, ansi) = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        // Span close events record how long each relay connection lived
        let layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    } else {
        let layer = fmt::layer()
            .pretty()
            .with_ansi(ansi)
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer);
        registry.with(layer).try_init()?;
    }

    Ok(())
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let level = parse_log_level(&config.level)?;
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(default_directives(level)).context("Invalid log filter")
}

/// Filter directives for a configured level
///
/// `info` becomes `info,tower_http=info,hyper=warn,...`; a stricter level
/// such as `error` also applies to the capped targets.
#[must_use]
pub fn default_directives(level: Level) -> String {
    let mut directives = vec![directive(level)];
    directives.extend(
        CAPPED_TARGETS
            .iter()
            .map(|(target, cap)| format!("{target}={}", directive(level.min(*cap)))),
    );
    directives.join(",")
}

fn directive(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}

/// Span covering one relay connection from registration to teardown
#[must_use]
pub fn connection_span(
    connection_id: &ConnectionId,
    role: Role,
    user_type: UserType,
    camera_id: &CameraId,
) -> Span {
    tracing::info_span!(
        "relay_connection",
        connection_id = %connection_id,
        role = %role,
        user_type = %user_type,
        camera_id = %camera_id,
    )
}

pub(crate) fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
