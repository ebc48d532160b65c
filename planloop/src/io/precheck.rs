//! Environment precheck.
//!
//! Before handing the repository to an agent, infer the project's test
//! command from marker files and run it with a timeout. The result is
//! reported to the agent in its prompt so it can repair a broken environment
//! before implementing anything.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::io::process::run_shell_with_timeout;

const OUTPUT_TAIL_LINES: usize = 20;
const OUTPUT_LIMIT_BYTES: usize = 200_000;

/// Result of one precheck run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecheckReport {
    pub passed: bool,
    pub output_tail: String,
}

/// Infer the project's test command from marker files.
///
/// Returns `None` when no known project layout is detected.
pub fn detect_test_command(root: &Path) -> Option<String> {
    if root.join("pyproject.toml").exists()
        || root.join("pytest.ini").exists()
        || root.join("setup.cfg").exists()
        || root.join("conftest.py").exists()
        || root.join("tests").is_dir()
    {
        return Some("python3 -m pytest -x -q -m 'not slow'".to_string());
    }
    if root.join("package.json").exists() {
        return Some("npm test --silent".to_string());
    }
    if root.join("Cargo.toml").exists() {
        return Some("cargo test 2>&1".to_string());
    }
    if root.join("go.mod").exists() {
        return Some("go test ./... 2>&1".to_string());
    }
    None
}

/// Run the inferred test command with a timeout.
///
/// A repository with no detectable test command passes trivially. Failures
/// to even launch the command are reported as a failing precheck rather
/// than aborting the loop.
#[instrument(skip_all)]
pub fn run_precheck(root: &Path, timeout: Duration) -> PrecheckReport {
    let Some(command) = detect_test_command(root) else {
        debug!("no test command detected");
        return PrecheckReport {
            passed: true,
            output_tail: "No test command detected".to_string(),
        };
    };

    debug!(%command, "running precheck");
    match run_shell_with_timeout(&command, root, timeout, OUTPUT_LIMIT_BYTES) {
        Ok(output) if output.timed_out => PrecheckReport {
            passed: false,
            output_tail: format!("Test run timed out after {}s", timeout.as_secs()),
        },
        Ok(output) => PrecheckReport {
            passed: output.status.success(),
            output_tail: output.tail(OUTPUT_TAIL_LINES),
        },
        Err(err) => {
            warn!(%err, "precheck failed to run");
            PrecheckReport {
                passed: false,
                output_tail: format!("Precheck error: {err:#}"),
            }
        }
    }
}
