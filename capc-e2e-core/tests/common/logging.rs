/// JSONL to `target/test-logs/all_tests.jsonl` plus the test writer.
/// Level via `CAPC_E2E_TEST_LOG_LEVEL`.
pub fn init_test_logging() {
    capc_e2e_core::testing::init_global_test_logging();
}

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*);
    };
}
