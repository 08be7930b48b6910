//! Utility functions for logging and method-call tracing

mod logging;
mod tracer;

pub use logging::{setup_logging, LogConfig};
pub use tracer::{ExecutionTracer, MethodCall, MethodStats, TraceGuard, TracedExecution, MAX_TRACED_EXECUTIONS};
