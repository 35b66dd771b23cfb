//! Runs a node's actions.
//! Unaware of the build graph and of staleness; just action execution.

use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;

type Func = dyn Fn() -> anyhow::Result<Vec<u8>> + Send + Sync;

/// One executable step of a node.
#[derive(Clone)]
pub enum Action {
    /// A command line run through the shell.  Non-zero exit is an error.
    Command(String),
    /// A function run in-process.  The label identifies the function for
    /// display and for fingerprinting, so two different functions must not
    /// share a label.
    Func { label: String, f: Arc<Func> },
}

impl Action {
    pub fn command(cmdline: impl Into<String>) -> Self {
        Action::Command(cmdline.into())
    }

    pub fn func<F>(label: impl Into<String>, f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        Action::Func {
            label: label.into(),
            f: Arc::new(f),
        }
    }

    /// Text identifying the action; feeds into the node fingerprint.
    pub fn describe(&self) -> &str {
        match self {
            Action::Command(cmdline) => cmdline,
            Action::Func { label, .. } => label,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command(cmdline) => f.debug_tuple("Command").field(cmdline).finish(),
            Action::Func { label, .. } => f.debug_tuple("Func").field(label).finish(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("command {cmdline:?} failed: {status}")]
    Command {
        cmdline: String,
        status: ExitStatus,
        /// Console output of the failed command.
        output: Vec<u8>,
    },

    #[error("command {cmdline:?} could not be started: {source}")]
    Spawn {
        cmdline: String,
        source: std::io::Error,
    },

    #[error("{label}: {source:#}")]
    Func {
        label: String,
        source: anyhow::Error,
    },
}

impl ActionError {
    /// Console output captured before the failure, if any.
    pub fn output(&self) -> &[u8] {
        match self {
            ActionError::Command { output, .. } => output,
            _ => &[],
        }
    }
}

/// Executes a command line through the shell, capturing stdout and stderr
/// into one buffer.
fn run_command(cmdline: &str) -> Result<Vec<u8>, ActionError> {
    #[cfg(unix)]
    let result = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(cmdline)
        .output();
    #[cfg(windows)]
    let result = std::process::Command::new("cmd")
        .arg("/c")
        .arg(cmdline)
        .output();

    let mut cmd = result.map_err(|source| ActionError::Spawn {
        cmdline: cmdline.to_string(),
        source,
    })?;
    let mut output = Vec::new();
    output.append(&mut cmd.stdout);
    output.append(&mut cmd.stderr);

    if !cmd.status.success() {
        return Err(ActionError::Command {
            cmdline: cmdline.to_string(),
            status: cmd.status,
            output,
        });
    }
    Ok(output)
}

/// Runs actions strictly in order, stopping at the first failure.
/// Returns the concatenated console output of all actions.
pub fn invoke(actions: &[Action]) -> Result<Vec<u8>, ActionError> {
    let mut output = Vec::new();
    for action in actions {
        let mut out = match action {
            Action::Command(cmdline) => run_command(cmdline)?,
            Action::Func { label, f } => f().map_err(|source| ActionError::Func {
                label: label.clone(),
                source,
            })?,
        };
        output.append(&mut out);
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn stops_at_first_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = |calls: &Arc<AtomicUsize>| {
            let calls = calls.clone();
            move || -> anyhow::Result<Vec<u8>> {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        };
        let actions = vec![
            Action::func("first", counter(&calls)),
            Action::func("boom", || anyhow::bail!("broken")),
            Action::func("never", counter(&calls)),
        ];
        let err = invoke(&actions).unwrap_err();
        assert_eq!(err.to_string(), "boom: broken");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn collects_output() {
        let actions = vec![
            Action::func("a", || Ok(b"a\n".to_vec())),
            Action::func("b", || Ok(b"b\n".to_vec())),
        ];
        assert_eq!(invoke(&actions).unwrap(), b"a\nb\n");
    }

    #[cfg(unix)]
    #[test]
    fn command_exit_status() {
        assert_eq!(invoke(&[Action::command("echo hi")]).unwrap(), b"hi\n");

        let err = invoke(&[Action::command("echo oops >&2; exit 3")]).unwrap_err();
        match &err {
            ActionError::Command { status, .. } => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.output(), b"oops\n");
    }
}
