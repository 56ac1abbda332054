use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over the configured level. Returns an error if
/// a global subscriber is already installed.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().compact())
            .with(filter)
            .try_init()?;
    }

    tracing::info!("Agent worktree telemetry initialized with structured logging");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Create a span with common agent coordination attributes
pub fn create_coordination_span(
    operation: &str,
    agent_id: Option<&str>,
    feature_id: Option<&str>,
    correlation_id: Option<&str>,
) -> tracing::Span {
    tracing::info_span!(
        "agent_coordination",
        operation = operation,
        agent.id = agent_id,
        feature.id = feature_id,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}

pub type SpanHandle = u64;
pub type SpanAttributes = Vec<(&'static str, String)>;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Unknown span handle: {0}")]
    UnknownSpan(SpanHandle),
    #[error("Telemetry backend unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Span emission interface used by the instrumentation layer.
///
/// Callers treat emission as fire-and-forget: an error here is logged and
/// never changes the outcome of the wrapped operation.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn begin(&self, operation: &str, attributes: SpanAttributes) -> Result<SpanHandle, TelemetryError>;
    async fn end(&self, handle: SpanHandle, success: bool, error_message: Option<String>) -> Result<(), TelemetryError>;
}

/// Drops everything
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    async fn begin(&self, _operation: &str, _attributes: SpanAttributes) -> Result<SpanHandle, TelemetryError> {
        Ok(0)
    }

    async fn end(&self, _handle: SpanHandle, _success: bool, _error_message: Option<String>) -> Result<(), TelemetryError> {
        Ok(())
    }
}

struct OpenSpan {
    operation: String,
    span: tracing::Span,
    started: Instant,
}

/// Emits each operation as a `tracing` span plus a completion event
#[derive(Default)]
pub struct TracingSink {
    next_handle: AtomicU64,
    open: Mutex<HashMap<SpanHandle, OpenSpan>>,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spans begun but not yet ended
    pub fn open_spans(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }
}

#[async_trait]
impl TelemetrySink for TracingSink {
    async fn begin(&self, operation: &str, attributes: SpanAttributes) -> Result<SpanHandle, TelemetryError> {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed) + 1;
        let span = tracing::info_span!(
            "engine_operation",
            otel.name = operation,
            operation = operation,
            span.handle = handle
        );
        span.in_scope(|| {
            let attrs: Vec<String> = attributes.iter().map(|(k, v)| format!("{k}={v}")).collect();
            tracing::debug!(attributes = ?attrs, "Operation started");
        });

        self.open
            .lock()
            .map_err(|_| TelemetryError::Unavailable {
                reason: "span table poisoned".to_string(),
            })?
            .insert(
                handle,
                OpenSpan {
                    operation: operation.to_string(),
                    span,
                    started: Instant::now(),
                },
            );
        Ok(handle)
    }

    async fn end(&self, handle: SpanHandle, success: bool, error_message: Option<String>) -> Result<(), TelemetryError> {
        let open = self
            .open
            .lock()
            .map_err(|_| TelemetryError::Unavailable {
                reason: "span table poisoned".to_string(),
            })?
            .remove(&handle)
            .ok_or(TelemetryError::UnknownSpan(handle))?;

        let duration_ms = open.started.elapsed().as_millis() as u64;
        open.span.in_scope(|| {
            if success {
                tracing::info!(operation = %open.operation, duration_ms, "Operation completed");
            } else {
                tracing::warn!(
                    operation = %open.operation,
                    duration_ms,
                    error = error_message.as_deref().unwrap_or("unknown"),
                    "Operation failed"
                );
            }
        });
        Ok(())
    }
}
