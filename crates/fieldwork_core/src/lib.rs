//! Core types for Fieldwork.
//!
//! This crate provides the foundational types used throughout fieldwork:
//! - `deferred`: Resolve-once shared values
//! - `metadata`: Cache tags, contexts and max-age
//! - `error`: Error taxonomy
//! - `diagnostics`: Configuration check reporting

pub mod deferred;
pub mod diagnostics;
pub mod error;
pub mod metadata;

pub use deferred::{wait_all, Deferred};
pub use diagnostics::{Diagnostic, DiagnosticBag, DiagnosticSeverity, Label};
pub use error::{BufferError, ConfigError, ResolveError, ResolveResult};
pub use metadata::{CacheableMetadata, MaxAge};
