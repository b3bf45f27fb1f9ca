//! Process exit codes for any binary hosting the orchestrator.
//!
//! This crate defines the constants; it does not run a process loop or call
//! `std::process::exit` itself — that's a hosting binary's job.

/// Normal shutdown, no error.
pub const OK: u8 = 0;

/// Configuration failed validation at load (e.g. timeout hierarchy violation,
/// unknown agent/tool name).
pub const CONFIG_INVALID: u8 = 64;

/// A required dependency (model provider, vector store, SQL store) was
/// unavailable at startup and fail-fast is enabled.
pub const DEPENDENCY_UNAVAILABLE: u8 = 69;

/// Unrecoverable internal error outside the taxonomy in `ConductorError`.
pub const INTERNAL_ERROR: u8 = 70;
