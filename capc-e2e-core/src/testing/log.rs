//! JSONL logging for harness tests.
//!
//! Scenario tests are timing-sensitive, so every test run leaves a trace
//! that can be inspected after a CI failure:
//!
//! ```ignore
//! use capc_e2e_core::testing::init_global_test_logging;
//!
//! #[ctor::ctor]
//! fn setup() {
//!     init_global_test_logging();
//! }
//! ```
//!
//! Per-test phase logs go through [`TestGuard`] (or the `test_guard!` macro),
//! which records PASS or FAIL when dropped.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use std::time::Instant;

use serde::Serialize;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

/// Phase of a scenario test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Setup,
    Submit,
    Poll,
    Verify,
    Teardown,
}

impl std::fmt::Display for TestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Setup => write!(f, "setup"),
            Self::Submit => write!(f, "submit"),
            Self::Poll => write!(f, "poll"),
            Self::Verify => write!(f, "verify"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install a global subscriber writing every event as JSON to
/// `target/test-logs/all_tests.jsonl` and a compact copy to the test writer.
///
/// Idempotent. Environment:
/// - `CAPC_E2E_TEST_LOG_FILE`: log file path override
/// - `CAPC_E2E_TEST_LOG_LEVEL`: filter level (default `info`)
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_global_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("CAPC_E2E_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "capc_e2e_core={level},capc_e2e={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(test_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_global_log_file() -> Option<std::fs::File> {
    if let Ok(custom) = std::env::var("CAPC_E2E_TEST_LOG_FILE") {
        let path = PathBuf::from(custom);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(path).ok();
    }

    let log_dir = test_log_dir();
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("all_tests.jsonl")).ok()
}

/// `<target>/test-logs`, honouring `CARGO_TARGET_DIR` and otherwise
/// searching upwards for a `target/` directory.
pub fn test_log_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir).join("test-logs");
    }
    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target.join("test-logs");
        }
        if !cwd.pop() {
            return PathBuf::from("target/test-logs");
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestLogEntry {
    pub timestamp: String,
    pub test_name: String,
    pub phase: TestPhase,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub elapsed_ms: u64,
}

/// Per-test JSONL logger writing `target/test-logs/<test>.jsonl`.
pub struct TestLogger {
    test_name: String,
    start: Instant,
    entries: Mutex<Vec<TestLogEntry>>,
    file: Option<Mutex<std::fs::File>>,
}

impl TestLogger {
    pub fn for_test(test_name: &str) -> Self {
        let safe_name = test_name.replace("::", "_").replace(['/', '\\'], "_");
        let dir = test_log_dir();
        let file = std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::File::create(dir.join(format!("{safe_name}.jsonl"))))
            .ok();

        let logger = Self {
            test_name: test_name.to_string(),
            start: Instant::now(),
            entries: Mutex::new(Vec::new()),
            file: file.map(Mutex::new),
        };
        logger.log(TestPhase::Setup, "TEST START");
        logger
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        self.write(phase, message.into(), None);
    }

    pub fn log_with_data(&self, phase: TestPhase, message: impl Into<String>, data: serde_json::Value) {
        self.write(phase, message.into(), Some(data));
    }

    pub fn entries(&self) -> Vec<TestLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn write(&self, phase: TestPhase, message: String, data: Option<serde_json::Value>) {
        let entry = TestLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            test_name: self.test_name.clone(),
            phase,
            message,
            data,
            elapsed_ms: u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        if let Some(file) = &self.file
            && let Ok(mut f) = file.lock()
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(f, "{json}");
        }
        tracing::info!(
            test = %self.test_name,
            phase = %entry.phase,
            elapsed_ms = entry.elapsed_ms,
            "{}",
            entry.message
        );
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

/// Logs TEST PASS on normal drop and TEST FAIL when dropped while panicking.
pub struct TestGuard {
    logger: TestLogger,
}

impl TestGuard {
    pub fn new(test_name: &str) -> Self {
        init_global_test_logging();
        Self {
            logger: TestLogger::for_test(test_name),
        }
    }

    pub fn log(&self, phase: TestPhase, message: impl Into<String>) {
        self.logger.log(phase, message);
    }

    pub fn log_with_data(&self, phase: TestPhase, message: impl Into<String>, data: serde_json::Value) {
        self.logger.log_with_data(phase, message, data);
    }
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.logger.log(TestPhase::Verify, "TEST FAIL");
        } else {
            self.logger.log(TestPhase::Verify, "TEST PASS");
        }
    }
}

/// [`TestGuard`] named after the enclosing function.
///
/// Inside `#[tokio::test]` bodies the path ends in `{{closure}}` segments,
/// which are skipped.
#[macro_export]
macro_rules! test_guard {
    () => {{
        fn _f() {}
        fn _type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = _type_name_of(_f);
        let name = name.strip_suffix("::_f").unwrap_or(name);
        let name = name
            .rsplit("::")
            .find(|segment| !segment.starts_with("{{"))
            .unwrap_or(name);
        $crate::testing::TestGuard::new(name)
    }};
}
