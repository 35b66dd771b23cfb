//! Build runner, choosing and executing nodes as determined by out of date
//! inputs.
//!
//! The scheduler loop runs on the calling thread.  It tracks node status,
//! hands ready nodes to a fixed pool of worker threads, and collects their
//! results over a channel.  Workers check staleness, run actions and record
//! fingerprints themselves; the build state is the only thing they share.

use crate::config::Config;
use crate::db::StateStore;
use crate::densemap::DenseMap;
use crate::error::ConfigError;
use crate::fs::{FileSystem, MTime};
use crate::graph::{BuildNode, Graph, NodeId};
use crate::progress::Progress;
use crate::{hash, stale, task};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;

/// Build status of a node within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting on predecessors.
    Pending,
    /// Predecessors done; queued for a worker.
    Ready,
    Running,
    Done,
    Failed,
    /// A predecessor failed.
    Skipped,
}

/// How a node ended.
#[derive(Debug)]
pub enum Outcome {
    /// The node was stale and its actions succeeded.
    Ran { output: Vec<u8> },
    /// Nothing to do.
    UpToDate,
    Failed { message: String, output: Vec<u8> },
}

/// Counts of wanted nodes by final status.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StateCounts {
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Failure {
    pub node: String,
    pub message: String,
}

/// Summary of one run.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub counts: StateCounts,
    /// Nodes whose actions were executed, in completion order.
    pub ran: Vec<String>,
    pub failures: Vec<Failure>,
    pub skipped: Vec<String>,
    /// The run was cancelled before every wanted node was dispatched.
    pub interrupted: bool,
}

impl BuildReport {
    /// True iff every wanted node reached done.
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty() && !self.interrupted
    }
}

struct Finished {
    id: NodeId,
    outcome: Outcome,
}

/// Target directories are created before a node runs, so actions can write
/// straight to their targets.
fn create_target_dirs(node: &BuildNode) -> std::io::Result<()> {
    for target in &node.targets {
        if let Some(parent) = std::path::Path::new(target).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

/// Records the fingerprint of a node that just ran successfully.
fn record(
    fs: &dyn FileSystem,
    store: &dyn StateStore,
    graph: &Graph,
    node: &BuildNode,
) -> anyhow::Result<()> {
    for target in &node.targets {
        if let Ok(MTime::Missing) = fs.stat(target) {
            tracing::warn!("{}: target {:?} was not produced", node.name, target);
        }
    }
    let upstream = stale::upstream_fingerprints(graph, store, node);
    let fingerprint = match hash::hash_node(fs, node, &upstream) {
        Ok(f) => f,
        Err(err) => {
            // Leaves the node stale, so the next run retries it.
            tracing::warn!("{}: not recording state: {}", node.name, err);
            return Ok(());
        }
    };
    let entries: Vec<_> = stale::state_keys(node)
        .into_iter()
        .map(|key| (key, fingerprint))
        .collect();
    store.set(&entries)
}

/// Records the fingerprint of an action-less node, so that its dependents
/// see a change whenever anything below it changed.  Writes only when the
/// stored value differs.
fn record_meta(
    fs: &dyn FileSystem,
    store: &dyn StateStore,
    graph: &Graph,
    node: &BuildNode,
) -> anyhow::Result<()> {
    let upstream = stale::upstream_fingerprints(graph, store, node);
    let fingerprint = match hash::hash_node(fs, node, &upstream) {
        Ok(f) => f,
        Err(err) => {
            tracing::debug!("{}: not recording state: {}", node.name, err);
            return Ok(());
        }
    };
    let entries: Vec<_> = stale::state_keys(node)
        .into_iter()
        .filter(|key| store.get(key) != Some(fingerprint))
        .map(|key| (key, fingerprint))
        .collect();
    if entries.is_empty() {
        return Ok(());
    }
    store.set(&entries)
}

/// Runs on a worker: decides staleness, runs actions, records the result.
fn execute(
    fs: &dyn FileSystem,
    store: &dyn StateStore,
    graph: &Graph,
    node: &BuildNode,
    upstream_ran: bool,
) -> Outcome {
    match stale::check(fs, store, graph, node, upstream_ran) {
        None => return Outcome::UpToDate,
        Some(reason) => {
            tracing::debug!("{} is stale: {}", node.name, reason);
            if tracing::enabled!(tracing::Level::TRACE) {
                let upstream = stale::upstream_fingerprints(graph, store, node);
                let inputs = hash::explain_node(fs, node, &upstream);
                tracing::trace!("{} fingerprint inputs:\n{}", node.name, inputs);
            }
        }
    }

    if let Err(err) = create_target_dirs(node) {
        return Outcome::Failed {
            message: format!("creating target directory: {}", err),
            output: Vec::new(),
        };
    }
    let output = match task::invoke(&node.actions) {
        Ok(output) => output,
        Err(err) => {
            return Outcome::Failed {
                message: err.to_string(),
                output: err.output().to_vec(),
            }
        }
    };
    match record(fs, store, graph, node) {
        Ok(()) => Outcome::Ran { output },
        Err(err) => Outcome::Failed {
            message: format!("recording build state: {:#}", err),
            output,
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

static NEVER_CANCELLED: AtomicBool = AtomicBool::new(false);

pub struct Work<'a> {
    graph: &'a Graph,
    store: &'a dyn StateStore,
    fs: &'a dyn FileSystem,
    progress: &'a mut dyn Progress,
    parallelism: usize,
    cancel: &'a AtomicBool,

    want: DenseMap<NodeId, bool>,
    status: DenseMap<NodeId, Status>,
    /// Number of predecessors not yet done.
    pending: DenseMap<NodeId, usize>,
    /// Whether any predecessor ran in this build.
    upstream_ran: DenseMap<NodeId, bool>,
    ready: VecDeque<NodeId>,
    report: BuildReport,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: &'a Graph,
        store: &'a dyn StateStore,
        fs: &'a dyn FileSystem,
        progress: &'a mut dyn Progress,
        config: &Config,
    ) -> Self {
        let nodes = graph.nodes();
        Work {
            graph,
            store,
            fs,
            progress,
            parallelism: config.parallelism.max(1),
            cancel: &NEVER_CANCELLED,
            want: DenseMap::filled_like(nodes, false),
            status: DenseMap::filled_like(nodes, Status::Pending),
            pending: DenseMap::filled_like(nodes, 0),
            upstream_ran: DenseMap::filled_like(nodes, false),
            ready: VecDeque::new(),
            report: BuildReport::default(),
        }
    }

    /// Stop dispatching once `flag` is set.
    pub fn set_cancel(&mut self, flag: &'a AtomicBool) {
        self.cancel = flag;
    }

    /// Marks a node, and everything it depends on, as wanted.
    pub fn want(&mut self, name: &str) -> Result<(), ConfigError> {
        let id = self
            .graph
            .lookup(name)
            .ok_or_else(|| ConfigError::unknown_task(name))?;
        self.want_id(id);
        Ok(())
    }

    pub fn want_all(&mut self) {
        let graph = self.graph;
        for id in graph.all_ids() {
            self.want_id(id);
        }
    }

    fn want_id(&mut self, id: NodeId) {
        let graph = self.graph;
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            if self.want[id] {
                continue;
            }
            self.want[id] = true;
            stack.extend_from_slice(graph.node(id).preds());
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Runs all wanted nodes, returning once nothing more can be done.
    pub fn run(&mut self) -> anyhow::Result<BuildReport> {
        let (graph, store, fs) = (self.graph, self.store, self.fs);
        for id in graph.all_ids() {
            if !self.want[id] {
                continue;
            }
            // A wanted node's predecessors are all wanted.
            self.pending[id] = graph.node(id).preds().len();
            if self.pending[id] == 0 {
                self.status[id] = Status::Ready;
                self.ready.push_back(id);
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .thread_name(|i| format!("kiln-worker-{}", i))
            .build()?;
        let (tx, rx) = mpsc::channel::<Finished>();

        pool.in_place_scope(|scope| -> anyhow::Result<()> {
            let mut running = 0;
            loop {
                while running < self.parallelism && !self.cancelled() {
                    let Some(id) = self.ready.pop_front() else {
                        break;
                    };
                    let node = graph.node(id);
                    if let Some(error) = &node.error {
                        self.finish(
                            id,
                            Outcome::Failed {
                                message: error.clone(),
                                output: Vec::new(),
                            },
                        );
                        continue;
                    }
                    if node.is_meta() {
                        let outcome = match record_meta(fs, store, graph, node) {
                            Ok(()) => Outcome::UpToDate,
                            Err(err) => Outcome::Failed {
                                message: format!("recording build state: {:#}", err),
                                output: Vec::new(),
                            },
                        };
                        self.finish(id, outcome);
                        continue;
                    }

                    self.status[id] = Status::Running;
                    self.progress.task_started(node);
                    tracing::debug!("dispatch {}", node.name);
                    let upstream_ran = self.upstream_ran[id];
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            execute(fs, store, graph, node, upstream_ran)
                        }))
                        .unwrap_or_else(|payload| Outcome::Failed {
                            message: format!("panicked: {}", panic_message(payload.as_ref())),
                            output: Vec::new(),
                        });
                        // The send only fails if the scheduler has gone away.
                        let _ = tx.send(Finished { id, outcome });
                    });
                    running += 1;
                }

                if running == 0 {
                    break;
                }
                let finished = rx.recv()?;
                running -= 1;
                self.finish(finished.id, finished.outcome);
            }
            Ok(())
        })?;

        if self.cancelled() {
            self.report.interrupted = true;
        }
        tracing::info!(
            "build finished: {} done, {} ran, {} failed, {} skipped",
            self.report.counts.done,
            self.report.ran.len(),
            self.report.counts.failed,
            self.report.counts.skipped
        );
        Ok(std::mem::take(&mut self.report))
    }

    fn finish(&mut self, id: NodeId, outcome: Outcome) {
        let graph = self.graph;
        let node = graph.node(id);
        self.progress.task_finished(node, &outcome);
        match outcome {
            Outcome::Failed { message, .. } => {
                self.status[id] = Status::Failed;
                self.report.counts.failed += 1;
                self.report.failures.push(Failure {
                    node: node.name.clone(),
                    message,
                });
                self.skip_dependents(id);
            }
            Outcome::Ran { .. } => {
                self.status[id] = Status::Done;
                self.report.counts.done += 1;
                self.report.ran.push(node.name.clone());
                self.release_dependents(id, true);
            }
            Outcome::UpToDate => {
                self.status[id] = Status::Done;
                self.report.counts.done += 1;
                // Aggregating nodes pass on whether anything below them ran.
                let ran = node.is_meta() && self.upstream_ran[id];
                self.release_dependents(id, ran);
            }
        }
    }

    fn release_dependents(&mut self, id: NodeId, ran: bool) {
        let graph = self.graph;
        for &dep in graph.dependents(id) {
            if !self.want[dep] {
                continue;
            }
            self.upstream_ran[dep] |= ran;
            self.pending[dep] -= 1;
            if self.pending[dep] == 0 && self.status[dep] == Status::Pending {
                self.status[dep] = Status::Ready;
                self.ready.push_back(dep);
            }
        }
    }

    /// Failure propagates downstream only.
    fn skip_dependents(&mut self, id: NodeId) {
        let graph = self.graph;
        let mut stack = vec![id];
        while let Some(id) = stack.pop() {
            for &dep in graph.dependents(id) {
                if !self.want[dep] || self.status[dep] != Status::Pending {
                    continue;
                }
                self.status[dep] = Status::Skipped;
                self.report.counts.skipped += 1;
                let node = graph.node(dep);
                self.report.skipped.push(node.name.clone());
                self.progress.task_skipped(node);
                stack.push(dep);
            }
        }
    }

    /// Status of a node after (or during) a run.
    pub fn status(&self, name: &str) -> Option<Status> {
        self.graph.lookup(name).map(|id| self.status[id])
    }
}
