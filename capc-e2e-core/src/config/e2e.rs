//! The e2e config file.
//!
//! Same shape as a clusterctl e2e config, so an existing suite's YAML can be
//! pointed at directly; only the keys the harness uses are read:
//!
//! ```yaml
//! variables:
//!   KUBERNETES_VERSION: "v1.27.2"
//!   CLOUDSTACK_INVALID_WORKER_MACHINE_OFFERING_NAME: "OfferingXXXX"
//! intervals:
//!   default/wait-errors: ["5m", "10s"]
//!   default/wait-delete-cluster: ["20m", "10s"]
//! ```
//!
//! TOML files (`.toml`) with the same tables are accepted too. Interval
//! entries are `[deadline, interval]` in humantime notation.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::poll::{DeadlineBudget, MAX_WAIT};
use crate::scenario::ScenarioDefinition;

/// Variable holding the workload cluster's Kubernetes version.
pub const KUBERNETES_VERSION: &str = "KUBERNETES_VERSION";

/// Scalar variable value; YAML configs sometimes leave numbers unquoted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VariableValue {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Float(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct E2EConfig {
    pub variables: BTreeMap<String, VariableValue>,
    pub intervals: BTreeMap<String, Vec<String>>,
    pub scenarios: BTreeMap<String, ScenarioDefinition>,
}

impl E2EConfig {
    /// Load from disk; `.toml` is parsed as TOML, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            Self::from_toml_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        };
        parsed.map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, String> {
        serde_yaml_ng::from_str(contents).map_err(|e| e.to_string())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, String> {
        toml::from_str(contents).map_err(|e| e.to_string())
    }

    /// Set or replace a variable (builder style, mostly for tests).
    pub fn with_variable(mut self, name: &str, value: &str) -> Self {
        self.variables
            .insert(name.to_string(), VariableValue::String(value.to_string()));
        self
    }

    /// Set or replace an interval entry, e.g. `("default/wait-errors", "5m", "10s")`.
    pub fn with_interval(mut self, name: &str, deadline: &str, interval: &str) -> Self {
        self.intervals
            .insert(name.to_string(), vec![deadline.to_string(), interval.to_string()]);
        self
    }

    /// Value of `name`; a process environment variable of the same name
    /// takes precedence over the file.
    pub fn get_variable(&self, name: &str) -> Result<String, ConfigError> {
        if let Ok(value) = std::env::var(name) {
            return Ok(value);
        }
        self.variables
            .get(name)
            .map(ToString::to_string)
            .ok_or_else(|| ConfigError::MissingVariable(name.to_string()))
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.get_variable(name).is_ok()
    }

    /// Budget for `spec/key`, falling back to `default/key`.
    pub fn get_intervals(&self, spec: &str, key: &str) -> Result<DeadlineBudget, ConfigError> {
        for name in [format!("{spec}/{key}"), format!("default/{key}")] {
            if let Some(values) = self.intervals.get(&name) {
                return parse_budget(&name, values);
            }
        }
        Err(ConfigError::MissingIntervals {
            spec: spec.to_string(),
            key: key.to_string(),
        })
    }
}

fn parse_budget(name: &str, values: &[String]) -> Result<DeadlineBudget, ConfigError> {
    let [deadline, interval] = values else {
        return Err(ConfigError::InvalidInterval {
            name: name.to_string(),
            message: format!("expected [deadline, interval], got {} value(s)", values.len()),
        });
    };
    let parse = |raw: &str| {
        let value = humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidInterval {
            name: name.to_string(),
            message: format!("{raw:?}: {e}"),
        })?;
        if value > MAX_WAIT {
            return Err(ConfigError::InvalidInterval {
                name: name.to_string(),
                message: format!("{raw:?} exceeds {}", humantime::format_duration(MAX_WAIT)),
            });
        }
        Ok(value)
    };
    Ok(DeadlineBudget::new(parse(deadline)?, parse(interval)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const YAML: &str = r#"
managementClusterName: capi-test
images:
  - name: gcr.io/k8s-staging-capi-cloudstack/capi-cloudstack-controller:dev
    loadBehavior: tryLoad
variables:
  KUBERNETES_VERSION: "v1.27.2"
  CONTROL_PLANE_MACHINE_COUNT: 1
  CLOUDSTACK_INVALID_WORKER_MACHINE_OFFERING_NAME: "OfferingXXXX"
intervals:
  default/wait-errors: ["5m", "10s"]
  invalid-worker-offering/wait-errors: ["2m", "5s"]
"#;

    #[test]
    fn test_parse_clusterctl_style_yaml() {
        let config = E2EConfig::from_yaml_str(YAML).unwrap();
        assert_eq!(config.get_variable(KUBERNETES_VERSION).unwrap(), "v1.27.2");
        assert_eq!(
            config.variables.get("CONTROL_PLANE_MACHINE_COUNT").unwrap().to_string(),
            "1"
        );
    }

    #[test]
    fn test_intervals_prefer_spec_then_default() {
        let config = E2EConfig::from_yaml_str(YAML).unwrap();
        let spec = config.get_intervals("invalid-worker-offering", "wait-errors").unwrap();
        assert_eq!(spec.deadline, Duration::from_secs(120));
        assert_eq!(spec.interval, Duration::from_secs(5));

        let fallback = config.get_intervals("other-spec", "wait-errors").unwrap();
        assert_eq!(fallback.deadline, Duration::from_secs(300));
        assert_eq!(fallback.interval, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_intervals_is_error() {
        let config = E2EConfig::from_yaml_str(YAML).unwrap();
        let err = config
            .get_intervals("invalid-worker-offering", "wait-delete-cluster")
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingIntervals { .. }));
    }

    #[test]
    fn test_malformed_intervals_rejected() {
        let config = E2EConfig::default()
            .with_interval("default/wait-errors", "five minutes", "10s");
        assert!(matches!(
            config.get_intervals("x", "wait-errors"),
            Err(ConfigError::InvalidInterval { .. })
        ));

        let mut config = E2EConfig::default();
        config
            .intervals
            .insert("default/wait-errors".to_string(), vec!["5m".to_string()]);
        assert!(matches!(
            config.get_intervals("x", "wait-errors"),
            Err(ConfigError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_oversized_intervals_rejected() {
        let config = E2EConfig::default()
            .with_interval("default/wait-errors", "18446744073709551615s", "1s");
        let err = config.get_intervals("x", "wait-errors").unwrap_err();
        match err {
            ConfigError::InvalidInterval { name, message } => {
                assert_eq!(name, "default/wait-errors");
                assert!(message.contains("exceeds"), "{message}");
            }
            other => panic!("unexpected error: {other}"),
        }

        let config = E2EConfig::default().with_interval("default/wait-errors", "5m", "400days");
        assert!(matches!(
            config.get_intervals("x", "wait-errors"),
            Err(ConfigError::InvalidInterval { .. })
        ));

        let config = E2EConfig::default().with_interval("default/wait-errors", "365days", "1s");
        assert_eq!(config.get_intervals("x", "wait-errors").unwrap().deadline, MAX_WAIT);
    }

    #[test]
    fn test_parse_toml() {
        let config = E2EConfig::from_toml_str(
            r#"
[variables]
KUBERNETES_VERSION = "v1.28.0"

[intervals]
"default/wait-errors" = ["90s", "1s"]
"#,
        )
        .unwrap();
        assert_eq!(config.get_variable(KUBERNETES_VERSION).unwrap(), "v1.28.0");
        assert_eq!(
            config.get_intervals("any", "wait-errors").unwrap().deadline,
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_missing_variable() {
        let config = E2EConfig::default();
        assert!(matches!(
            config.get_variable("CAPC_E2E_SURELY_UNSET_VARIABLE_NAME"),
            Err(ConfigError::MissingVariable(_))
        ));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let yaml = dir.path().join("e2e.yaml");
        fs::write(&yaml, YAML).unwrap();
        assert!(E2EConfig::load(&yaml).is_ok());

        let toml_path = dir.path().join("e2e.toml");
        fs::write(&toml_path, "[variables]\nKUBERNETES_VERSION = \"v1\"\n").unwrap();
        assert!(E2EConfig::load(&toml_path).is_ok());

        let err = E2EConfig::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
