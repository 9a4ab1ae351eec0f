//! Log signature matching.
//!
//! Controller logs are collected into the artifact folder by an external log
//! collector and keep growing while a scenario runs. A scan walks the tree
//! lazily, re-reads every matching file in full, and reports the first file
//! that contains the expected signature. File order is whatever the walk
//! yields; callers must not depend on which file is reported when several
//! match.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use memchr::memmem;
use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::E2EConfig;
use crate::errors::ConfigError;
use crate::poll::{PollResult, Probe, StopFlag};

/// Path marker of the CAPC controller manager's log directory.
pub const CAPC_CONTROLLER_MARKER: &str = "capc-controller-manager";
/// File-name marker of a controller manager log.
pub const MANAGER_LOG_MARKER: &str = "manager.log";
/// Prefix the provider uses when an offering/template lookup fails.
pub const NO_MATCH_FOUND_PREFIX: &str = "No match found for ";

/// The text a scenario waits for. Computed once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ExpectedSignature(String);

impl ExpectedSignature {
    pub fn new(prefix: &str, value: &str) -> Self {
        Self(format!("{prefix}{value}"))
    }

    /// `prefix` + the value of `variable` in `config`.
    pub fn from_variable(
        config: &E2EConfig,
        prefix: &str,
        variable: &str,
    ) -> Result<Self, ConfigError> {
        let value = config.get_variable(variable)?;
        Ok(Self::new(prefix, &value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExpectedSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Selects log files by substrings of their path; all markers must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogFileFilter {
    markers: Vec<String>,
}

impl LogFileFilter {
    pub fn all_of<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers.into_iter().map(Into::into).collect(),
        }
    }

    /// `manager.log` files under the given controller's directory.
    pub fn controller_manager_log(component: &str) -> Self {
        Self::all_of([component, MANAGER_LOG_MARKER])
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    pub fn matches(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.markers.iter().all(|marker| path.contains(marker.as_str()))
    }
}

/// Scan `root` for a file accepted by `predicate` that contains `needle`.
pub fn scan<F>(root: &Path, predicate: F, needle: &str) -> PollResult
where
    F: Fn(&Path) -> bool,
{
    scan_until_stopped(root, predicate, needle, &StopFlag::new())
}

/// [`scan`] that gives up (with `NotFound`) once `stop` is raised.
///
/// - a root that does not exist yet is `NotFound`: the log collector may not
///   have created it
/// - any other failure to walk the root is `Error`
/// - failures below the root and unreadable files are skipped
pub fn scan_until_stopped<F>(root: &Path, predicate: F, needle: &str, stop: &StopFlag) -> PollResult
where
    F: Fn(&Path) -> bool,
{
    let finder = memmem::Finder::new(needle.as_bytes());

    for entry in WalkDir::new(root) {
        if stop.is_raised() {
            debug!(root = %root.display(), "Scan stopped");
            return PollResult::NotFound;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                let missing = err
                    .io_error()
                    .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
                if missing {
                    debug!(root = %root.display(), "Log root does not exist yet");
                    return PollResult::NotFound;
                }
                return PollResult::Error(format!("walking {}: {err}", root.display()));
            }
            Err(err) => {
                debug!(error = %err, "Skipping unreadable entry");
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path();
        if !predicate(path) {
            continue;
        }

        match fs::read(path) {
            Ok(contents) => {
                if finder.find(&contents).is_some() {
                    return PollResult::Found(path.display().to_string());
                }
            }
            // Rotated or still being created; the next tick re-reads it.
            Err(err) => debug!(path = %path.display(), error = %err, "Skipping unreadable log"),
        }
    }

    PollResult::NotFound
}

/// Probe that looks for one signature in one log tree.
#[derive(Debug, Clone, Serialize)]
pub struct SignatureMatcher {
    root: PathBuf,
    filter: LogFileFilter,
    signature: ExpectedSignature,
}

impl SignatureMatcher {
    pub fn new(root: impl Into<PathBuf>, filter: LogFileFilter, signature: ExpectedSignature) -> Self {
        Self {
            root: root.into(),
            filter,
            signature,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn signature(&self) -> &ExpectedSignature {
        &self.signature
    }

    /// Synchronous single scan.
    pub fn scan_once(&self) -> PollResult {
        scan(&self.root, |p| self.filter.matches(p), self.signature.as_str())
    }
}

#[async_trait]
impl Probe for SignatureMatcher {
    fn describe(&self) -> String {
        format!("{:?} under {}", self.signature.as_str(), self.root.display())
    }

    async fn probe(&self, stop: &StopFlag) -> PollResult {
        let matcher = self.clone();
        let stop = stop.clone();
        match tokio::task::spawn_blocking(move || {
            scan_until_stopped(
                &matcher.root,
                |p| matcher.filter.matches(p),
                matcher.signature.as_str(),
                &stop,
            )
        })
        .await
        {
            Ok(result) => result,
            Err(err) => PollResult::Error(format!("scan task failed: {err}")),
        }
    }
}
