//! A single hash over a node's inputs is recorded and used to determine when
//! those inputs change.
//!
//! The hash covers the node's name, its actions, its declared values and
//! task dependencies, the fingerprints recorded for its predecessors, the
//! mtimes of the files it reads, and the mtimes of the files it writes.
//! Including the targets means a target modified behind our back also makes
//! the node stale.  Including the predecessors means a node that did not get
//! to run after its upstream rebuilt stays stale until it does.

use crate::fs::{FileSystem, MTime};
use crate::graph::BuildNode;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Digest of a node's inputs; compared against the recorded digest to decide
/// whether the node is up to date.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Fingerprint(pub u64);

#[derive(Debug, Error)]
pub enum StalenessError {
    #[error("input {0:?} missing")]
    MissingInput(String),

    #[error("stat {path:?}: {source}")]
    Stat {
        path: String,
        source: std::io::Error,
    },
}

/// A trait for computing the node's fingerprint.  Indirected as a trait so
/// the same walk can produce a readable dump for debugging.
trait NodeHasher {
    fn write_strs<'a>(&mut self, section: &str, strs: impl Iterator<Item = &'a str>);
    fn write_files(&mut self, section: &str, files: &[(&str, MTime)]);
}

const UNIT_SEPARATOR: u8 = 0x1F;

/// The hasher used during builds.  FxHasher has no random seed, so equal
/// inputs give equal fingerprints in every process.
#[derive(Default)]
struct TerseHash(FxHasher);

impl TerseHash {
    fn write_separator(&mut self) {
        self.0.write_u8(UNIT_SEPARATOR);
    }
}

fn mtime_nanos(mtime: MTime) -> u128 {
    match mtime {
        MTime::Missing => 0,
        MTime::Stamp(t) => match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() + 1,
            // Before the epoch; still needs to be distinct from Missing.
            Err(e) => u128::MAX - e.duration().as_nanos(),
        },
    }
}

impl NodeHasher for TerseHash {
    fn write_strs<'a>(&mut self, _section: &str, strs: impl Iterator<Item = &'a str>) {
        for s in strs {
            s.hash(&mut self.0);
        }
        self.write_separator();
    }

    fn write_files(&mut self, _section: &str, files: &[(&str, MTime)]) {
        for &(name, mtime) in files {
            name.hash(&mut self.0);
            self.0.write_u128(mtime_nanos(mtime));
        }
        self.write_separator();
    }
}

/// Readable dump of everything that goes into the fingerprint.
#[derive(Default)]
struct ExplainHash(String);

impl NodeHasher for ExplainHash {
    fn write_strs<'a>(&mut self, section: &str, strs: impl Iterator<Item = &'a str>) {
        for s in strs {
            self.0.push_str(&format!("  {} {}\n", section, s));
        }
    }

    fn write_files(&mut self, section: &str, files: &[(&str, MTime)]) {
        for &(name, mtime) in files {
            let stamp = match mtime {
                MTime::Missing => "missing".to_string(),
                MTime::Stamp(_) => mtime_nanos(mtime).to_string(),
            };
            self.0.push_str(&format!("  {} {} {}\n", section, name, stamp));
        }
    }
}

fn stat_all<'a>(
    fs: &dyn FileSystem,
    paths: &'a [String],
) -> Result<Vec<(&'a str, MTime)>, StalenessError> {
    paths
        .iter()
        .map(|path| {
            let mtime = fs.stat(path).map_err(|source| StalenessError::Stat {
                path: path.clone(),
                source,
            })?;
            Ok((path.as_str(), mtime))
        })
        .collect()
}

fn hash_node_with_hasher<H: NodeHasher>(
    hasher: &mut H,
    fs: &dyn FileSystem,
    node: &BuildNode,
    upstream: &[Option<Fingerprint>],
) -> Result<(), StalenessError> {
    let inputs = stat_all(fs, &node.file_deps)?;
    if let Some(&(name, _)) = inputs.iter().find(|(_, mtime)| *mtime == MTime::Missing) {
        return Err(StalenessError::MissingInput(name.to_string()));
    }
    let outputs = stat_all(fs, &node.targets)?;

    hasher.write_strs("node", std::iter::once(node.name.as_str()));
    hasher.write_strs("action", node.actions.iter().map(|a| a.describe()));
    hasher.write_strs("value", node.values.iter().map(String::as_str));
    hasher.write_strs("task_dep", node.task_deps.iter().map(String::as_str));
    let upstream: Vec<String> = upstream
        .iter()
        .map(|f| match f {
            Some(f) => format!("{:016x}", f.0),
            None => "none".to_string(),
        })
        .collect();
    hasher.write_strs("upstream", upstream.iter().map(String::as_str));
    hasher.write_files("in", &inputs);
    hasher.write_files("out", &outputs);
    Ok(())
}

/// Computes a node's fingerprint from the current state of the filesystem
/// and the fingerprints last recorded for its predecessors (see
/// [crate::stale::upstream_fingerprints]).  Fails if an input file is
/// missing or cannot be stat()ed.
pub fn hash_node(
    fs: &dyn FileSystem,
    node: &BuildNode,
    upstream: &[Option<Fingerprint>],
) -> Result<Fingerprint, StalenessError> {
    let mut hasher = TerseHash::default();
    hash_node_with_hasher(&mut hasher, fs, node, upstream)?;
    Ok(Fingerprint(hasher.0.finish()))
}

/// Describes the fingerprint inputs, for debug logging.
pub fn explain_node(
    fs: &dyn FileSystem,
    node: &BuildNode,
    upstream: &[Option<Fingerprint>],
) -> String {
    let mut explain = ExplainHash::default();
    match hash_node_with_hasher(&mut explain, fs, node, upstream) {
        Ok(()) => explain.0,
        Err(err) => format!("  {}\n", err),
    }
}
