//! Removes build outputs and forgets their recorded state.

use crate::db::StateStore;
use crate::error::ConfigError;
use crate::graph::{Graph, NodeKind};
use crate::stale;
use anyhow::Context;

/// Removes the targets of the named tasks, or of every task when `names` is
/// empty.  Naming a generating task also cleans its sub-tasks.  Returns the
/// paths actually removed.
pub fn clean(
    graph: &Graph,
    store: &dyn StateStore,
    names: &[String],
) -> anyhow::Result<Vec<String>> {
    for name in names {
        if graph.lookup(name).is_none() {
            return Err(ConfigError::unknown_task(name.as_str()).into());
        }
    }
    let selected = |name: &str, kind: &NodeKind| {
        names.is_empty()
            || names.iter().any(|n| n == name)
            || matches!(kind, NodeKind::SubTask { parent } if names.contains(parent))
    };

    let mut removed = Vec::new();
    for id in graph.all_ids() {
        let node = graph.node(id);
        if !selected(&node.name, &node.kind) {
            continue;
        }
        for target in &node.targets {
            match std::fs::remove_file(target) {
                Ok(()) => {
                    tracing::debug!("clean: removed {}", target);
                    removed.push(target.clone());
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err).with_context(|| format!("remove {}", target)),
            }
        }
        store.delete(&stale::state_keys(node))?;
    }
    Ok(removed)
}
