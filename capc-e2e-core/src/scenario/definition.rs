//! Per-scenario data: which template to render and which rejection to
//! expect in which log files.

use serde::{Deserialize, Serialize};

use crate::signature::{CAPC_CONTROLLER_MARKER, LogFileFilter, MANAGER_LOG_MARKER, NO_MATCH_FOUND_PREFIX};

pub const INVALID_WORKER_OFFERING: &str = "invalid-worker-offering";
pub const INVALID_WORKER_OFFERING_VARIABLE: &str = "CLOUDSTACK_INVALID_WORKER_MACHINE_OFFERING_NAME";
pub const WAIT_ERRORS: &str = "wait-errors";
pub const WAIT_DELETE_CLUSTER: &str = "wait-delete-cluster";

/// A negative-outcome scenario.
///
/// May be declared under `scenarios` in the e2e config; unset fields take
/// the CAPC defaults (controller manager log, `No match found for `
/// signature, one control-plane and one worker machine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioDefinition {
    pub name: String,
    /// Template flavor; empty means "same as `name`".
    pub flavor: String,
    pub signature_prefix: String,
    /// E2E config variable whose value completes the signature.
    pub signature_variable: String,
    pub component_marker: String,
    pub log_file_marker: String,
    /// Interval table key for the signature wait.
    pub wait_key: String,
    pub control_plane_machine_count: u32,
    pub worker_machine_count: u32,
    pub infrastructure_provider: String,
}

impl Default for ScenarioDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            flavor: String::new(),
            signature_prefix: NO_MATCH_FOUND_PREFIX.to_string(),
            signature_variable: String::new(),
            component_marker: CAPC_CONTROLLER_MARKER.to_string(),
            log_file_marker: MANAGER_LOG_MARKER.to_string(),
            wait_key: WAIT_ERRORS.to_string(),
            control_plane_machine_count: 1,
            worker_machine_count: 1,
            infrastructure_provider: "cloudstack".to_string(),
        }
    }
}

impl ScenarioDefinition {
    /// Worker machine offering that does not exist: the controller logs
    /// `No match found for <offering>` and never provisions the workers.
    pub fn invalid_worker_offering() -> Self {
        Self {
            name: INVALID_WORKER_OFFERING.to_string(),
            flavor: INVALID_WORKER_OFFERING.to_string(),
            signature_variable: INVALID_WORKER_OFFERING_VARIABLE.to_string(),
            ..Self::default()
        }
    }

    /// Flavor to render, honouring an explicit override.
    pub fn effective_flavor<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested {
            Some(flavor) if !flavor.is_empty() => flavor,
            _ if self.flavor.is_empty() => &self.name,
            _ => &self.flavor,
        }
    }

    pub fn log_filter(&self) -> LogFileFilter {
        LogFileFilter::all_of([self.component_marker.as_str(), self.log_file_marker.as_str()])
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("scenario name is empty".to_string());
        }
        if self.signature_variable.trim().is_empty() {
            return Err(format!("{}: signature_variable is empty", self.name));
        }
        if self.wait_key.trim().is_empty() {
            return Err(format!("{}: wait_key is empty", self.name));
        }
        Ok(())
    }
}
