//! Logging for sandboxed plugins.
//!
//! Logs go two ways: a compact human-readable stream on stderr and, through
//! [`LogForwardLayer`], structured `log` messages sent to the supervisor.
//! Both sit behind a single reloadable [`EnvFilter`] so the supervisor can
//! change verbosity at runtime with `setLogLevel`.
//!
//! Protocol level names are wider than `tracing`'s and collapse onto it:
//!
//! | protocol | tracing |
//! |---|---|
//! | `error` | ERROR |
//! | `warn` | WARN |
//! | `info`, `http` | INFO |
//! | `verbose`, `debug` | DEBUG |
//! | `silly`, `trace` | TRACE |
//! | `off` | OFF |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt as fmt_layer, reload};

use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::protocol::{LogRecord, OutboundMessage};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// Levels
// ---------------------------------------------------------------------------

/// Verbosity accepted by `setLogLevel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    fn env_filter(self) -> EnvFilter {
        EnvFilter::new(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" | "http" => Ok(Self::Info),
            "verbose" | "debug" => Ok(Self::Debug),
            "silly" | "trace" => Ok(Self::Trace),
            _ => Err(SandboxError::InvalidLogLevel(s.to_owned())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime level control
// ---------------------------------------------------------------------------

/// Adjusts the verbosity of every attached log output.
pub trait LogLevelControl: Send + Sync {
    fn set_level(&self, level: LogLevel) -> Result<()>;
}

/// Handle onto the reloadable filter installed by [`init_tracing`].
#[derive(Clone)]
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl fmt::Debug for LogLevelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogLevelHandle").finish_non_exhaustive()
    }
}

impl LogLevelControl for LogLevelHandle {
    fn set_level(&self, level: LogLevel) -> Result<()> {
        self.handle
            .reload(level.env_filter())
            .map_err(|e| SandboxError::Logging(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Forwarding layer
// ---------------------------------------------------------------------------

/// A [`Layer`] that turns every event into an outbound `log` message.
pub struct LogForwardLayer {
    transport: Arc<dyn Transport>,
}

impl LogForwardLayer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        self.transport.send(OutboundMessage::Log(LogRecord {
            level: meta.level().as_str().to_ascii_lowercase(),
            message: visitor.message,
            target: meta.target().to_owned(),
            fields: visitor.fields,
        }));
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl RecordVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_owned(), value);
    }
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.insert(field, Value::String(format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.insert(field, Value::String(value.to_owned()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::Bool(value));
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Build the sandbox subscriber without installing it.
///
/// The initial verbosity is `config.log_level`; `RUST_LOG` overrides it
/// when set.
pub fn subscriber(
    config: &SandboxConfig,
    transport: Arc<dyn Transport>,
) -> Result<(impl Subscriber + Send + Sync + 'static, LogLevelHandle)> {
    let level: LogLevel = config.log_level.parse()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.env_filter());
    Ok(with_filter(filter, transport))
}

fn with_filter(
    filter: EnvFilter,
    transport: Arc<dyn Transport>,
) -> (impl Subscriber + Send + Sync + 'static, LogLevelHandle) {
    let (filter, handle) = reload::Layer::new(filter);
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt_layer::layer()
                .with_target(false)
                .compact()
                .with_writer(std::io::stderr),
        )
        .with(LogForwardLayer::new(transport));
    (subscriber, LogLevelHandle { handle })
}

/// Install the sandbox subscriber as the global default.
pub fn init_tracing(config: &SandboxConfig, transport: Arc<dyn Transport>) -> Result<LogLevelHandle> {
    let (subscriber, handle) = subscriber(config, transport)?;
    subscriber
        .try_init()
        .map_err(|e| SandboxError::Logging(e.to_string()))?;
    Ok(handle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
