use std::{
    fmt,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TelemetrySettings;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Per-instance detail.
    Debug,
    /// Lifecycle events.
    Info,
    /// Recoverable anomalies such as skipped evidence.
    Warn,
    /// Failed operations.
    Error,
}

/// One JSON line in the fusion log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// Component emitting the record.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Event name, e.g. `fusion.model.calibrated`.
    pub message: String,
    /// Structured fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

/// Builder for [`FusionTelemetry`].
pub struct FusionTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
}

impl FusionTelemetryBuilder {
    /// Sets the JSON-lines file.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops records below `level`.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Opens the sink (creating parent directories) and builds the handle.
    pub fn build(self) -> Result<FusionTelemetry> {
        let sink = match self.log_path {
            Some(path) => Some(LogSink::open(path)?),
            None => None,
        };
        Ok(FusionTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                min_level: self.min_level,
                sink,
            }),
        })
    }
}

/// Shared structured-logging handle. Cloning shares the sink.
#[derive(Clone)]
pub struct FusionTelemetry {
    inner: Arc<TelemetryInner>,
}

struct TelemetryInner {
    module: String,
    min_level: LogLevel,
    sink: Option<LogSink>,
}

struct LogSink {
    path: PathBuf,
    writer: Mutex<File>,
}

impl LogSink {
    fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    fn write(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }
}

impl fmt::Debug for FusionTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionTelemetry")
            .field("module", &self.inner.module)
            .field("min_level", &self.inner.min_level)
            .finish_non_exhaustive()
    }
}

impl FusionTelemetry {
    /// Starts a builder for `module`.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> FusionTelemetryBuilder {
        FusionTelemetryBuilder {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Info,
        }
    }

    /// Builds a handle from the `[telemetry]` config section.
    pub fn from_settings(module: impl Into<String>, settings: &TelemetrySettings) -> Result<Self> {
        let mut builder = Self::builder(module).min_level(settings.min_level);
        if let Some(path) = &settings.log_path {
            builder = builder.log_path(path);
        }
        builder.build()
    }

    /// File backing the log, if any.
    #[must_use]
    pub fn log_path(&self) -> Option<&Path> {
        self.inner.sink.as_ref().map(|sink| sink.path.as_path())
    }

    /// Appends a record when `level` passes the filter.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        let Some(sink) = &self.inner.sink else {
            return Ok(());
        };
        if level < self.inner.min_level {
            return Ok(());
        }
        let metadata = match metadata {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        sink.write(&LogRecord {
            timestamp: Utc::now(),
            module: self.inner.module.clone(),
            level,
            message: message.into(),
            metadata,
        })
    }
}

/// Logs through an optional handle, swallowing sink failures so logging never
/// fails the fusion path.
pub(crate) fn emit(telemetry: Option<&FusionTelemetry>, level: LogLevel, message: &str, metadata: Value) {
    if let Some(telemetry) = telemetry {
        let _ = telemetry.log(level, message, metadata);
    }
}
