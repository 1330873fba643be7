//! Shared building blocks for kubelive
//!
//! kubelive serves a captured support bundle through an ephemeral Kubernetes
//! control plane so that ordinary cluster tooling can inspect it as though
//! the cluster were still running.
//!
//! # Modules
//!
//! - [`bundle`] - Read-only access to a captured cluster snapshot
//! - [`retry`] - Exponential backoff with jitter for transient failures
//! - [`telemetry`] - Logging initialization for the binaries

#![deny(missing_docs)]

pub mod bundle;
pub mod retry;
pub mod telemetry;

pub use bundle::{Bundle, BundleError, DirectoryBundle, LogKey, MemoryBundle};
pub use retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default address the emulation proxy listens on
pub const DEFAULT_PROXY_ADDR: &str = "127.0.0.1:8080";

/// Annotation prefix used by the bundle loader to preserve fields that the
/// ephemeral API server would otherwise overwrite
pub const ORIGINAL_FIELD_ANNOTATION_PREFIX: &str = "kubelive.dev/original-";
