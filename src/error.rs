//! Errors in the task declarations themselves.  All of these are fatal and
//! are reported before any action runs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate task {0:?}")]
    DuplicateTask(String),

    #[error("unknown task {name:?}{}", referenced_suffix(.referenced_by))]
    UnknownTask {
        name: String,
        referenced_by: Option<String>,
    },

    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("target {target:?} is declared by both {first:?} and {second:?}")]
    TargetConflict {
        target: String,
        first: String,
        second: String,
    },
}

fn referenced_suffix(by: &Option<String>) -> String {
    match by {
        Some(by) => format!(", referenced by {:?}", by),
        None => String::new(),
    }
}

impl ConfigError {
    pub fn unknown_task(name: impl Into<String>) -> Self {
        ConfigError::UnknownTask {
            name: name.into(),
            referenced_by: None,
        }
    }
}
