//! Negative-outcome convergence harness for CAPC e2e scenarios.
//!
//! A scenario submits a workload cluster that the provider is expected to
//! reject, then waits for the rejection to show up in the controller logs
//! collected under the artifact folder:
//! - [`signature`] scans log trees for an expected substring
//! - [`poll`] drives a probe on a fixed interval under a deadline budget
//! - [`scenario`] sequences setup, submission, polling and assertion
//! - [`cleanup`] tears down scenario resources exactly once
//!
//! Collaborators (orchestration endpoint, template renderer) sit behind the
//! traits in [`collab`]; [`kubectl`] implements them over the real CLIs and
//! [`mock`] provides in-memory doubles for tests.

pub mod cancel;
pub mod cleanup;
pub mod collab;
pub mod config;
pub mod errors;
pub mod kubectl;
pub mod logging;
pub mod mock;
pub mod poll;
pub mod scenario;
pub mod signature;
pub mod testing;
pub mod util;

pub use cancel::{CancelSource, CancelToken};
pub use cleanup::{CleanupGuarantor, CleanupReport, ScenarioResources};
pub use collab::{
    ClusterRef, ClusterTemplateRequest, NamespaceRef, OrchestrationEndpoint, TemplateDocument,
    TemplateRenderer, WatchSubscription,
};
pub use config::{E2EConfig, HarnessSettings};
pub use errors::{CleanupError, ConfigError, EndpointError, ScenarioError, SetupError};
pub use logging::{LogConfig, LogFormat, LoggingGuards, init_logging};
pub use poll::{DeadlineBudget, PollOutcome, PollReport, PollResult, Probe, StopFlag, poll_until};
pub use scenario::{
    ConfiguredScenario, NegativeScenario, ScenarioCatalog, ScenarioDefinition, ScenarioInput,
    ScenarioReport, ScenarioState,
};
pub use signature::{ExpectedSignature, LogFileFilter, SignatureMatcher, scan};
