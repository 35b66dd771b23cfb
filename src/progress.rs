//! Build progress reporting, for the purpose of display to the user.

use crate::graph::BuildNode;
use crate::work::Outcome;
use std::io::Write;

/// Trait for build progress notifications.  Called from the scheduler
/// thread only.
pub trait Progress {
    /// Called when a node is handed to a worker.
    fn task_started(&mut self, node: &BuildNode);

    /// Called when a node completes, whether or not it had to run.
    fn task_finished(&mut self, node: &BuildNode, outcome: &Outcome);

    /// Called when a node will not run because a dependency failed.
    fn task_skipped(&mut self, node: &BuildNode);

    /// Log a line of output.
    fn log(&mut self, msg: &str);
}

/// Progress implementation for a plain console, one line per event.
#[derive(Default)]
pub struct DumbConsoleProgress {
    /// Whether to also print actions as they start and up-to-date nodes.
    verbose: bool,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        DumbConsoleProgress { verbose }
    }

    fn write_output(&self, output: &[u8]) {
        if output.is_empty() {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        // A closed stdout is not worth failing the build over.
        let _ = stdout.write_all(output);
        if !output.ends_with(b"\n") {
            let _ = stdout.write_all(b"\n");
        }
    }
}

impl Progress for DumbConsoleProgress {
    fn task_started(&mut self, node: &BuildNode) {
        if self.verbose {
            for action in &node.actions {
                self.log(&format!("{}: {}", node.name, action.describe()));
            }
        }
    }

    fn task_finished(&mut self, node: &BuildNode, outcome: &Outcome) {
        match outcome {
            Outcome::Ran { output } => {
                self.log(&format!(".  {}", node.name));
                self.write_output(output);
            }
            Outcome::UpToDate => {
                if self.verbose && !node.is_meta() {
                    self.log(&format!("-- {}", node.name));
                }
            }
            Outcome::Failed { message, output } => {
                self.log(&format!("failed: {}", node.name));
                self.write_output(output);
                self.log(message);
            }
        }
    }

    fn task_skipped(&mut self, node: &BuildNode) {
        if self.verbose {
            self.log(&format!("skipped: {}", node.name));
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Progress implementation that prints nothing.
#[derive(Default)]
pub struct NoProgress {}

impl Progress for NoProgress {
    fn task_started(&mut self, _node: &BuildNode) {}
    fn task_finished(&mut self, _node: &BuildNode, _outcome: &Outcome) {}
    fn task_skipped(&mut self, _node: &BuildNode) {}
    fn log(&mut self, _msg: &str) {}
}
