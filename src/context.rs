//! Per-request context: resolved namespace plus a cooperative cancel handle.
//!
//! Passed explicitly down every call so no component reads ambient state.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEFAULT_NAMESPACE: &str = "default";
pub const NAMESPACE_HEADER: &str = "x-namespace";

/// One-shot cancellation flag shared between a job and its workers.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancellation poll point: errors out once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug)]
pub struct RequestContext {
    pub namespace: String,
    pub cancel: CancelFlag,
}

impl RequestContext {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel(namespace: impl Into<String>, cancel: CancelFlag) -> Self {
        Self {
            namespace: namespace.into(),
            cancel,
        }
    }
}

/// Resolve the namespace for an operation: explicit argument wins, then the
/// request header, then `default`.
pub fn resolve_namespace(explicit: Option<&str>, header: Option<&str>) -> Result<String> {
    let candidate = explicit
        .filter(|s| !s.trim().is_empty())
        .or(header.filter(|s| !s.trim().is_empty()))
        .unwrap_or(DEFAULT_NAMESPACE);
    if !valid_namespace(candidate) {
        return Err(Error::invalid_input(format!(
            "invalid namespace '{}': expected [A-Za-z0-9._-], 1-64 chars",
            candidate
        )));
    }
    Ok(candidate.to_string())
}

/// Namespaces become directory names, so the charset is tight.
pub fn valid_namespace(ns: &str) -> bool {
    !ns.is_empty()
        && ns.len() <= 64
        && ns
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !ns.starts_with('.')
}
