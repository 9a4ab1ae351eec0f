#![allow(dead_code)]

pub mod fixtures;
pub mod logging;

pub use fixtures::{LogTree, ScenarioFixture};
pub use logging::init_test_logging;
