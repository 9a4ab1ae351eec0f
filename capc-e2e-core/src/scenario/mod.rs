//! Negative-outcome scenarios.
//!
//! Lifecycle of one run:
//!
//! ```text
//! Init -> Configured -> ActionSubmitted -> Polling -> {Succeeded | Failed} -> CleanedUp
//! ```
//!
//! `Init -> Configured` happens in [`NegativeScenario::configure`] and fails
//! with a `SetupError` before anything is created. Everything after runs in
//! [`ConfiguredScenario::run`], which always ends in `CleanedUp` and returns a
//! [`ScenarioReport`].

mod controller;
mod definition;

pub use controller::{ConfiguredScenario, NegativeScenario, ScenarioInput};
pub use definition::{
    INVALID_WORKER_OFFERING, INVALID_WORKER_OFFERING_VARIABLE, ScenarioDefinition,
    WAIT_DELETE_CLUSTER, WAIT_ERRORS,
};

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cleanup::CleanupReport;
use crate::config::E2EConfig;
use crate::errors::{ConfigError, LastPollState, ScenarioError};
use crate::poll::PollReport;
use crate::util::sanitize_component;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Init,
    Configured,
    ActionSubmitted,
    Polling,
    Succeeded,
    Failed,
    CleanedUp,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "Init",
            Self::Configured => "Configured",
            Self::ActionSubmitted => "ActionSubmitted",
            Self::Polling => "Polling",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::CleanedUp => "CleanedUp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub state: ScenarioState,
    pub at: DateTime<Utc>,
}

impl Transition {
    pub fn now(state: ScenarioState) -> Self {
        Self { state, at: Utc::now() }
    }
}

/// Two-valued scenario result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureSummary {
    pub kind: &'static str,
    pub message: String,
    pub last_poll_state: Option<LastPollState>,
}

/// Outcome of one scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub endpoint: String,
    pub namespace: Option<String>,
    pub cluster_name: String,
    pub expected_signature: String,
    pub verdict: Verdict,
    pub transitions: Vec<Transition>,
    pub final_state: Option<ScenarioState>,
    pub poll: Option<PollReport>,
    pub cleanup: CleanupReport,
    pub failure: Option<FailureSummary>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip)]
    error: Option<ScenarioError>,
}

impl ScenarioReport {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scenario: String,
        endpoint: String,
        namespace: Option<String>,
        cluster_name: String,
        expected_signature: String,
        transitions: Vec<Transition>,
        poll: Option<PollReport>,
        cleanup: CleanupReport,
        error: Option<ScenarioError>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let failure = error.as_ref().map(|e| FailureSummary {
            kind: e.kind(),
            message: e.to_string(),
            last_poll_state: e.last_poll_state(),
        });
        Self {
            scenario,
            endpoint,
            namespace,
            cluster_name,
            expected_signature,
            verdict: if error.is_none() {
                Verdict::Succeeded
            } else {
                Verdict::Failed
            },
            final_state: transitions.last().map(|t| t.state),
            transitions,
            poll,
            cleanup,
            failure,
            started_at,
            finished_at: Utc::now(),
            error,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.verdict == Verdict::Succeeded
    }

    pub fn final_state(&self) -> Option<ScenarioState> {
        self.final_state
    }

    /// Number of times the run entered `state`.
    pub fn times_entered(&self, state: ScenarioState) -> usize {
        self.transitions.iter().filter(|t| t.state == state).count()
    }

    pub fn error(&self) -> Option<&ScenarioError> {
        self.error.as_ref()
    }

    /// Panic unless the scenario succeeded, naming the scenario, the
    /// expected signature and the last poll state.
    #[track_caller]
    pub fn assert_succeeded(&self) {
        if let Some(error) = &self.error {
            let last_poll = self
                .poll
                .as_ref()
                .map_or_else(|| "never polled".to_string(), |p| p.outcome.to_string());
            panic!(
                "scenario {} failed: expected signature {:?}, last poll state: {}: {}",
                self.scenario, self.expected_signature, last_poll, error
            );
        }
    }

    pub fn into_result(mut self) -> Result<Self, ScenarioError> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }

    /// `<artifacts>/<scenario>/<cluster>-report.json`
    pub fn path_under(&self, artifacts: &Path) -> PathBuf {
        artifacts
            .join(sanitize_component(&self.scenario))
            .join(format!("{}-report.json", sanitize_component(&self.cluster_name)))
    }

    /// Write the report as pretty JSON under `artifacts`; returns the path.
    pub fn write_json(&self, artifacts: &Path) -> io::Result<PathBuf> {
        let path = self.path_under(artifacts);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        fs::write(&path, json)?;
        Ok(path)
    }
}

/// Known scenario definitions by name.
#[derive(Debug, Clone)]
pub struct ScenarioCatalog {
    definitions: BTreeMap<String, ScenarioDefinition>,
}

impl ScenarioCatalog {
    pub fn builtin() -> Self {
        let def = ScenarioDefinition::invalid_worker_offering();
        Self {
            definitions: BTreeMap::from([(def.name.clone(), def)]),
        }
    }

    /// Built-ins plus the `scenarios` table of `config`; config entries
    /// replace built-ins of the same name.
    pub fn with_config(config: &E2EConfig) -> Result<Self, ConfigError> {
        let mut catalog = Self::builtin();
        for (key, def) in &config.scenarios {
            let mut def = def.clone();
            if def.name.is_empty() {
                def.name = key.clone();
            }
            def.validate().map_err(|message| ConfigError::InvalidScenario {
                name: key.clone(),
                message,
            })?;
            catalog.definitions.insert(def.name.clone(), def);
        }
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Result<&ScenarioDefinition, ConfigError> {
        self.definitions
            .get(name)
            .ok_or_else(|| ConfigError::UnknownScenario(name.to_string()))
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ScenarioDefinition> {
        self.definitions.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}
