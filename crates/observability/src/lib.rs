//! Tracing/logging setup shared by the worker, its child processes and tools.

/// Initialize process-wide tracing, writing to stdout.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogTarget::Stdout);
}

/// Initialize tracing, writing to stderr.
///
/// For processes whose stdout carries data: the isolated child (one result
/// message) and the operator commands (JSON output).
pub fn init_stderr() {
    tracing::init(tracing::LogTarget::Stderr);
}

/// Tracing configuration (filters, formats, targets).
pub mod tracing;
