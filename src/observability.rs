// Centralized observability infrastructure for shardgraph
// Structured logging, metrics counters and trace propagation shared by the
// shard server and the cluster orchestrator.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for metrics
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static TRAVERSAL_COUNTER: AtomicU64 = AtomicU64::new(0);
static RPC_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Verbosity of the process-wide subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Errors only. Also ignores `RUST_LOG`: a muted shard stays muted.
    Quiet,
    /// Warnings and errors from this crate, errors from dependencies.
    #[default]
    Normal,
    /// Debug from this crate, info from dependencies.
    Verbose,
}

impl LogLevel {
    fn directives(self) -> &'static str {
        match self {
            LogLevel::Quiet => "error",
            LogLevel::Normal => "shardgraph=warn,error",
            LogLevel::Verbose => "shardgraph=debug,info",
        }
    }

    fn allows_env_override(self) -> bool {
        self != LogLevel::Quiet
    }
}

/// Initialize the logging and tracing infrastructure at the default level.
/// This should be called once at application startup.
pub fn init_logging() -> Result<()> {
    init_logging_at(LogLevel::default())
}

/// Initialize logging at an explicit level. `RUST_LOG` widens or narrows the
/// filter for every level except `Quiet`.
pub fn init_logging_at(level: LogLevel) -> Result<()> {
    let filter = if level.allows_env_override() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directives()))
    } else {
        EnvFilter::new(level.directives())
    };

    // Quiet output drops the per-event target so an errors-only stream stays
    // a bare line per failure.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(level.allows_env_override())
        .with_ansi(true);

    let fresh = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();
    // A second call (tests share the process) leaves the existing
    // subscriber in place.
    if fresh && level != LogLevel::Quiet {
        info!(?level, "shardgraph observability initialized");
    }
    Ok(())
}

/// Represents different types of operations for structured logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    // Storage operations
    NodeCreate {
        node_id: u32,
        property_count: usize,
    },
    NodeDelete {
        node_id: u32,
    },
    EdgeCreate {
        edge_id: u32,
        from: u32,
        to: u32,
    },
    EdgeDelete {
        edge_id: u32,
    },

    // Query operations
    PropertyScan {
        kind: String,
        result_count: usize,
    },
    Traversal {
        start: u32,
        hops: u32,
        result_count: usize,
    },

    // Cluster operations
    ShardRpc {
        endpoint: String,
        path: String,
    },

    // System operations
    Startup {
        version: String,
    },
    Shutdown {
        reason: String,
    },
}

/// Metric types for performance monitoring
#[derive(Debug, Clone)]
pub enum MetricType {
    Counter {
        name: &'static str,
        value: u64,
    },
    Gauge {
        name: &'static str,
        value: f64,
    },
    Timer {
        name: &'static str,
        duration: Duration,
    },
}

/// Operation context for tracing through the system
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub trace_id: Uuid,
    pub span_id: Uuid,
    pub parent_span_id: Option<Uuid>,
    pub operation: String,
    pub start_time: Instant,
}

impl OperationContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            trace_id: Uuid::new_v4(),
            span_id: Uuid::new_v4(),
            parent_span_id: None,
            operation: operation.into(),
            start_time: Instant::now(),
        }
    }

    pub fn child(&self, operation: impl Into<String>) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: Uuid::new_v4(),
            parent_span_id: Some(self.span_id),
            operation: operation.into(),
            start_time: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Log an operation with full context
#[instrument(skip(ctx))]
pub fn log_operation(ctx: &OperationContext, op: &Operation, result: &Result<()>) {
    let elapsed = ctx.elapsed();

    match result {
        Ok(()) => {
            info!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                "Operation completed: {:?}", op
            );
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            error!(
                trace_id = %ctx.trace_id,
                span_id = %ctx.span_id,
                parent_span_id = ?ctx.parent_span_id,
                operation = %ctx.operation,
                elapsed_ms = elapsed.as_millis(),
                error = %e,
                "Operation failed: {:?}", op
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
    }

    match op {
        Operation::Traversal { .. } => {
            TRAVERSAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        Operation::ShardRpc { .. } => {
            RPC_COUNTER.fetch_add(1, Ordering::Relaxed);
        }
        _ => {}
    }
}

/// Record a metric
pub fn record_metric(metric: MetricType) {
    match metric {
        MetricType::Counter { name, value } => {
            debug!("metric.counter {} = {}", name, value);
        }
        MetricType::Gauge { name, value } => {
            debug!("metric.gauge {} = {}", name, value);
        }
        MetricType::Timer { name, duration } => {
            debug!("metric.timer {} = {:?}", name, duration);
        }
    }
}

/// Execute a closure with a trace context
pub async fn with_trace_id<F, T>(operation: &str, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let ctx = OperationContext::new(operation);
    let trace_id = ctx.trace_id;
    let span_id = ctx.span_id;

    debug!(
        trace_id = %trace_id,
        span_id = %span_id,
        "Starting operation: {}", operation
    );

    let start = Instant::now();
    let result = f.await;
    let elapsed = start.elapsed();

    match &result {
        Ok(_) => {
            debug!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms = elapsed.as_millis(),
                "Operation completed successfully: {}", operation
            );
            OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
            record_metric(MetricType::Timer {
                name: "operation.duration",
                duration: elapsed,
            });
        }
        Err(e) => {
            error!(
                trace_id = %trace_id,
                span_id = %span_id,
                elapsed_ms = elapsed.as_millis(),
                error = %e,
                "Operation failed: {}", operation
            );
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
            record_metric(MetricType::Counter {
                name: "operation.errors",
                value: 1,
            });
        }
    }

    result
}

/// Get current metrics snapshot
pub fn get_metrics() -> serde_json::Value {
    serde_json::json!({
        "operations": {
            "total": OPERATION_COUNTER.load(Ordering::Relaxed),
            "errors": ERROR_COUNTER.load(Ordering::Relaxed),
            "traversals": TRAVERSAL_COUNTER.load(Ordering::Relaxed),
            "shard_rpcs": RPC_COUNTER.load(Ordering::Relaxed),
        },
        "timestamp": Utc::now().to_rfc3339(),
    })
}
