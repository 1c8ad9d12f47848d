//! Explicit logger handles built on `tracing`.
//!
//! The original system leaned on a single process-wide logger singleton.
//! Per the re-architecture guidance this crate threads a small handle into
//! each component constructor instead: `init()` wires up the global
//! `tracing` subscriber exactly once at program start, and every component
//! receives its own [`Logger`], scoped by name, rather than reaching for a
//! global.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the process-wide `tracing` subscriber. Safe to call more than
/// once; only the first call takes effect.
pub fn init(verbose: bool) {
    INIT.call_once(|| {
        let filter = if verbose {
            tracing_subscriber::EnvFilter::new("debug")
        } else {
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .init();
    });
}

/// A named handle threaded through component constructors. Cheap to clone;
/// carries no state of its own beyond the component name used as the
/// `tracing` target.
#[derive(Clone, Copy, Debug)]
pub struct Logger {
    component: &'static str,
}

impl Logger {
    pub const fn new(component: &'static str) -> Self {
        Self { component }
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        tracing::debug!(target: "hindsight", component = self.component, "{}", msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        tracing::info!(target: "hindsight", component = self.component, "{}", msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        tracing::warn!(target: "hindsight", component = self.component, "{}", msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        tracing::error!(target: "hindsight", component = self.component, "{}", msg.as_ref());
    }
}
