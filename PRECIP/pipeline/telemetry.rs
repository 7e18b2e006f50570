use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord};

/// Builder for pipeline telemetry sinks.
pub struct PipelineTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
}

impl PipelineTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            min_level: LogLevel::Debug,
        }
    }

    /// Sets the JSON-lines log path.
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

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<PipelineTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            None => None,
        };
        Ok(PipelineTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
            }),
        })
    }
}

/// Cloneable logging handle shared by the accumulator, generators and trainer.
#[derive(Clone)]
pub struct PipelineTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for PipelineTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineTelemetry")
            .field("module", &self.inner.module)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
}

impl PipelineTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> PipelineTelemetryBuilder {
        PipelineTelemetryBuilder::new(module)
    }

    /// Logs a structured record.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            logger.log(&record)?;
        }
        Ok(())
    }
}

/// Logs through optional telemetry; logging failures never interrupt the pipeline.
pub(crate) fn emit(telemetry: Option<&PipelineTelemetry>, level: LogLevel, message: &str, metadata: Value) {
    if let Some(telemetry) = telemetry {
        let _ = telemetry.log(level, message, metadata);
    }
}
