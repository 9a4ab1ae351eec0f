//! Configuration for e2e runs.
//!
//! This module provides:
//! - The e2e config file (variables, named wait intervals, extra scenarios)
//! - Environment variable parsing with type safety (`CAPC_E2E_*`)
//! - Source tracking for debugging
//! - Harness settings assembled from the environment

pub mod e2e;
pub mod env;
pub mod settings;
pub mod source;

pub use e2e::{E2EConfig, KUBERNETES_VERSION, VariableValue};
pub use env::{EnvError, EnvParser, expand_home};
pub use settings::HarnessSettings;
pub use source::{ConfigSource, Sourced};

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}
