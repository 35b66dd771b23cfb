//! Decides whether a node must run.

use crate::db::{StateKey, StateStore};
use crate::fs::{FileSystem, MTime};
use crate::graph::{BuildNode, Graph};
use crate::hash::{self, Fingerprint, StalenessError};
use std::fmt;

/// Why a node needs to run.
#[derive(Debug)]
pub enum Reason {
    /// A predecessor ran during this build.
    UpstreamRan,
    MissingTarget(String),
    /// Nothing recorded from a previous build.
    NoRecord,
    /// Inputs differ from those recorded.
    Changed,
    /// The fingerprint could not be computed; assume stale and let the
    /// actions surface the real problem.
    Unhashable(StalenessError),
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::UpstreamRan => write!(f, "a dependency ran"),
            Reason::MissingTarget(path) => write!(f, "target {:?} missing", path),
            Reason::NoRecord => write!(f, "never built"),
            Reason::Changed => write!(f, "inputs changed"),
            Reason::Unhashable(err) => write!(f, "{}", err),
        }
    }
}

/// Keys under which a node's fingerprint is recorded: one per target, or a
/// single node key for nodes that produce no files.
pub fn state_keys(node: &BuildNode) -> Vec<StateKey> {
    if node.targets.is_empty() {
        vec![StateKey::Node(node.name.clone())]
    } else {
        node.targets
            .iter()
            .map(|t| StateKey::Target(t.clone()))
            .collect()
    }
}

/// The fingerprints last recorded for each of a node's predecessors,
/// ordered by predecessor name so that node numbering does not matter.
/// All of a node's keys share one fingerprint, so the first key stands for
/// the node.
pub fn upstream_fingerprints(
    graph: &Graph,
    store: &dyn StateStore,
    node: &BuildNode,
) -> Vec<Option<Fingerprint>> {
    let mut preds: Vec<&BuildNode> = node.preds().iter().map(|&id| graph.node(id)).collect();
    preds.sort_by(|a, b| a.name.cmp(&b.name));
    preds
        .into_iter()
        .map(|pred| state_keys(pred).first().and_then(|key| store.get(key)))
        .collect()
}

/// Checks a node against the recorded state.  Returns the first reason
/// found to run it, or None if it is up to date.  Reads only; calling it
/// twice with nothing built in between gives the same answer.
pub fn check(
    fs: &dyn FileSystem,
    store: &dyn StateStore,
    graph: &Graph,
    node: &BuildNode,
    upstream_ran: bool,
) -> Option<Reason> {
    if upstream_ran {
        return Some(Reason::UpstreamRan);
    }
    for target in &node.targets {
        match fs.stat(target) {
            Ok(MTime::Stamp(_)) => {}
            Ok(MTime::Missing) => return Some(Reason::MissingTarget(target.clone())),
            Err(source) => {
                return Some(Reason::Unhashable(StalenessError::Stat {
                    path: target.clone(),
                    source,
                }))
            }
        }
    }
    let upstream = upstream_fingerprints(graph, store, node);
    let fingerprint = match hash::hash_node(fs, node, &upstream) {
        Ok(f) => f,
        Err(err) => return Some(Reason::Unhashable(err)),
    };
    for key in state_keys(node) {
        match store.get(&key) {
            None => return Some(Reason::NoRecord),
            Some(last) if last != fingerprint => return Some(Reason::Changed),
            Some(_) => {}
        }
    }
    None
}

pub fn is_stale(
    fs: &dyn FileSystem,
    store: &dyn StateStore,
    graph: &Graph,
    node: &BuildNode,
    upstream_ran: bool,
) -> bool {
    check(fs, store, graph, node, upstream_ran).is_some()
}
