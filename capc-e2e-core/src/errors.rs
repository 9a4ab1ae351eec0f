//! Error taxonomy for scenario runs.
//!
//! | Error            | Raised by                  | Effect                                 |
//! |------------------|----------------------------|----------------------------------------|
//! | `SetupError`     | configure / namespace prep | scenario never reaches submission      |
//! | `ScenarioError`  | controller                 | scenario fails, cleanup still runs     |
//! | `CleanupError`   | cleanup guarantor          | logged, never replaces primary outcome |
//! | `ConfigError`    | e2e config file            | surfaced as `SetupError::Config`       |
//! | `EndpointError`  | orchestration collaborators| wrapped by the above                   |

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Errors loading or querying the e2e configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read e2e config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse e2e config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Variable {0} is not set in the e2e config or the environment")]
    MissingVariable(String),

    #[error("No intervals configured for {spec}/{key} (and no default/{key} fallback)")]
    MissingIntervals { spec: String, key: String },

    #[error("Invalid interval for {name}: {message}")]
    InvalidInterval { name: String, message: String },

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Invalid scenario definition {name}: {message}")]
    InvalidScenario { name: String, message: String },
}

/// Failure reported by an orchestration collaborator.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("{command} failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl EndpointError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The scenario could not be started; nothing was submitted.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Invalid argument for {scenario}: {message}")]
    InvalidInput { scenario: String, message: String },

    #[error("Clusterctl config {0} must be an existing file")]
    MissingConfigFile(PathBuf),

    #[error("Artifact folder {path} can't be created: {source}")]
    ArtifactFolder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to prepare namespace for {scenario}: {source}")]
    Namespace {
        scenario: String,
        #[source]
        source: EndpointError,
    },
}

/// Why the poll phase ended without the expected signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LastPollState {
    NotFound,
    Error,
}

/// A scenario that started but did not succeed.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("{scenario}: submission rejected by {endpoint}: {source}")]
    Submission {
        scenario: String,
        endpoint: String,
        #[source]
        source: EndpointError,
    },

    #[error(
        "{scenario}: expected signature {signature:?} not found after {attempts} polls in {elapsed:?} (last poll state: NotFound)"
    )]
    PollTimeout {
        scenario: String,
        signature: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("{scenario}: scanning for {signature:?} failed (last poll state: Error): {cause}")]
    Scan {
        scenario: String,
        signature: String,
        cause: String,
    },

    #[error("{scenario}: cancelled while waiting for {signature:?}")]
    Cancelled { scenario: String, signature: String },

    #[error("{scenario}: panicked during run: {message}")]
    Panicked { scenario: String, message: String },
}

impl ScenarioError {
    /// Short machine-readable kind used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::Submission { .. } => "submission",
            Self::PollTimeout { .. } => "poll_timeout",
            Self::Scan { .. } => "scan",
            Self::Cancelled { .. } => "cancelled",
            Self::Panicked { .. } => "panicked",
        }
    }

    /// Last poll state for failures that reached the poll phase.
    pub fn last_poll_state(&self) -> Option<LastPollState> {
        match self {
            Self::PollTimeout { .. } => Some(LastPollState::NotFound),
            Self::Scan { .. } => Some(LastPollState::Error),
            _ => None,
        }
    }
}

/// Best-effort teardown step that failed.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Failed to dump resources of namespace {namespace}: {source}")]
    Dump {
        namespace: String,
        #[source]
        source: EndpointError,
    },

    #[error("Failed to delete cluster {namespace}/{name}: {source}")]
    DeleteCluster {
        namespace: String,
        name: String,
        #[source]
        source: EndpointError,
    },

    #[error("Cluster {namespace}/{name} still present after {waited:?}")]
    ClusterDeletionTimeout {
        namespace: String,
        name: String,
        waited: Duration,
    },

    #[error("Failed to delete namespace {namespace}: {source}")]
    DeleteNamespace {
        namespace: String,
        #[source]
        source: EndpointError,
    },
}
