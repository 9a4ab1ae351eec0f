//! Test support shared by unit and integration tests.

pub mod log;

pub use log::{TestGuard, TestLogEntry, TestLogger, TestPhase, init_global_test_logging, test_log_dir};
