//! Task declarations, and their expansion into concrete build nodes.
//!
//! A task either describes one node directly, or carries a [Generator] that
//! lazily yields sub-tasks.  A generating task expands to one node per
//! sub-task (named "task:sub") followed by a group node, named after the
//! task itself, that waits on all of them.

use crate::canon::canon_path;
use crate::error::ConfigError;
use crate::graph::{BuildNode, NodeKind};
use crate::task::Action;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::Arc;

/// Lazily produces the sub-tasks of a task.  Called once per expansion, so
/// each call must start the sequence over.
pub trait Generator: Send + Sync {
    fn generate(&self) -> Box<dyn Iterator<Item = anyhow::Result<TaskDef>> + '_>;
}

impl<F, I> Generator for F
where
    F: Fn() -> I + Send + Sync,
    I: Iterator<Item = anyhow::Result<TaskDef>> + 'static,
{
    fn generate(&self) -> Box<dyn Iterator<Item = anyhow::Result<TaskDef>> + '_> {
        Box::new(self())
    }
}

/// A declared unit of work.  For sub-tasks, `name` is the suffix appended
/// to the parent's name.
#[derive(Clone, Default)]
pub struct TaskDef {
    pub name: String,
    pub doc: Option<String>,
    pub actions: Vec<Action>,
    pub targets: Vec<String>,
    pub file_deps: Vec<String>,
    pub task_deps: Vec<String>,
    /// Arbitrary values that, when changed, make the task out of date.
    pub values: Vec<String>,
    pub generator: Option<Arc<dyn Generator>>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>) -> Self {
        TaskDef {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn target(mut self, path: impl Into<String>) -> Self {
        self.targets.push(path.into());
        self
    }

    pub fn file_dep(mut self, path: impl Into<String>) -> Self {
        self.file_deps.push(path.into());
        self
    }

    pub fn task_dep(mut self, name: impl Into<String>) -> Self {
        self.task_deps.push(name.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn generator(mut self, generator: impl Generator + 'static) -> Self {
        self.generator = Some(Arc::new(generator));
        self
    }
}

fn canon_all(paths: &[String]) -> Vec<String> {
    paths.iter().map(|p| canon_path(p)).collect()
}

fn plain_node(task: &TaskDef) -> BuildNode {
    BuildNode::new(task.name.clone(), NodeKind::Task)
        .with_doc(task.doc.clone())
        .with_actions(task.actions.clone())
        .with_targets(canon_all(&task.targets))
        .with_file_deps(canon_all(&task.file_deps))
        .with_task_deps(task.task_deps.clone())
        .with_values(task.values.clone())
}

/// Sub-tasks inherit the parent's declared dependencies and values.
fn subtask_node(parent: &TaskDef, sub: TaskDef) -> Result<BuildNode, String> {
    let name = format!("{}:{}", parent.name, sub.name);
    if sub.generator.is_some() {
        return Err(format!("sub-task {:?} declares its own generator", name));
    }
    let inherit = |from: &[String], own: Vec<String>| -> Vec<String> {
        from.iter().cloned().chain(own).collect()
    };
    Ok(BuildNode::new(
        name,
        NodeKind::SubTask {
            parent: parent.name.clone(),
        },
    )
    .with_doc(sub.doc)
    .with_actions(sub.actions)
    .with_targets(canon_all(&sub.targets))
    .with_file_deps(canon_all(&inherit(&parent.file_deps, sub.file_deps)))
    .with_task_deps(inherit(&parent.task_deps, sub.task_deps))
    .with_values(inherit(&parent.values, sub.values)))
}

#[derive(Default)]
pub struct Registry {
    tasks: Vec<TaskDef>,
    by_name: FxHashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn register(&mut self, task: TaskDef) -> Result<(), ConfigError> {
        if self.by_name.contains_key(&task.name) {
            return Err(ConfigError::DuplicateTask(task.name));
        }
        self.by_name.insert(task.name.clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TaskDef> {
        self.by_name.get(name).map(|&i| &self.tasks[i])
    }

    /// Registered tasks, in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDef> {
        self.tasks.iter()
    }

    /// Expands the named tasks, and every task they transitively depend on,
    /// into build nodes.  Nodes are produced lazily as the returned iterator
    /// is consumed; a dependency is only looked at once a node naming it has
    /// been produced.  Nothing in the registry changes.
    pub fn expand<'a>(&'a self, names: &[String]) -> Result<Expand<'a>, ConfigError> {
        let mut follow = Follow::default();
        let mut queue = VecDeque::with_capacity(names.len());
        for name in names {
            let idx = *self
                .by_name
                .get(name)
                .ok_or_else(|| ConfigError::unknown_task(name.as_str()))?;
            if follow.seen.insert(idx) {
                queue.push_back(idx);
            }
        }
        for (idx, task) in self.tasks.iter().enumerate() {
            for target in &task.targets {
                follow.producers.insert(canon_path(target), idx);
            }
        }
        Ok(Expand {
            registry: self,
            queue,
            follow: Some(follow),
            current: None,
        })
    }

    /// Expands every registered task.
    pub fn expand_all(&self) -> Expand<'_> {
        Expand {
            registry: self,
            queue: (0..self.tasks.len()).collect(),
            follow: None,
            current: None,
        }
    }

    /// The registered task a dependency name refers to.  A sub-task name
    /// ("task:sub") refers to its generating task.
    fn task_index(&self, name: &str) -> Option<usize> {
        if let Some(&idx) = self.by_name.get(name) {
            return Some(idx);
        }
        let (parent, _) = name.split_once(':')?;
        self.by_name.get(parent).copied()
    }
}

/// A generating task partway through its sub-task sequence.
struct Generating<'a> {
    task: &'a TaskDef,
    subtasks: Box<dyn Iterator<Item = anyhow::Result<TaskDef>> + 'a>,
    children: Vec<String>,
    error: Option<String>,
}

impl<'a> Generating<'a> {
    /// The next sub-task node, or None once the generator is exhausted or
    /// has failed.
    fn next_subtask(&mut self) -> Option<BuildNode> {
        if self.error.is_some() {
            return None;
        }
        let result = match self.subtasks.next()? {
            Ok(sub) => subtask_node(self.task, sub),
            Err(err) => Err(format!("{:#}", err)),
        };
        match result {
            Ok(node) => {
                self.children.push(node.name.clone());
                Some(node)
            }
            Err(msg) => {
                tracing::debug!("expanding {}: {}", self.task.name, msg);
                self.error = Some(msg);
                None
            }
        }
    }

    fn into_group(self) -> BuildNode {
        let mut task_deps = self.task.task_deps.clone();
        task_deps.extend(self.children);
        let node = BuildNode::new(self.task.name.clone(), NodeKind::Group)
            .with_doc(self.task.doc.clone())
            .with_actions(self.task.actions.clone())
            .with_targets(canon_all(&self.task.targets))
            .with_file_deps(canon_all(&self.task.file_deps))
            .with_task_deps(task_deps)
            .with_values(self.task.values.clone());
        match self.error {
            Some(msg) => node.with_error(format!("generator failed: {}", msg)),
            None => node,
        }
    }
}

/// Dependency tracking for [Registry::expand].
#[derive(Default)]
struct Follow {
    seen: FxHashSet<usize>,
    /// Declared target path to the task declaring it.  Targets of generated
    /// sub-tasks are not known up front, so a file dependency on one only
    /// resolves when its generating task is expanded for another reason.
    producers: FxHashMap<String, usize>,
}

/// Iterator returned by [Registry::expand].
pub struct Expand<'a> {
    registry: &'a Registry,
    queue: VecDeque<usize>,
    /// None when every task is expanded anyway.
    follow: Option<Follow>,
    current: Option<Generating<'a>>,
}

impl<'a> Expand<'a> {
    fn next_node(&mut self) -> Option<BuildNode> {
        loop {
            if let Some(mut generating) = self.current.take() {
                return match generating.next_subtask() {
                    Some(node) => {
                        self.current = Some(generating);
                        Some(node)
                    }
                    None => Some(generating.into_group()),
                };
            }

            let task = &self.registry.tasks[self.queue.pop_front()?];
            match &task.generator {
                None => return Some(plain_node(task)),
                Some(generator) => {
                    self.current = Some(Generating {
                        task,
                        subtasks: generator.generate(),
                        children: Vec::new(),
                        error: None,
                    })
                }
            }
        }
    }

    /// Queues the tasks a node depends on that have not been queued yet.
    fn follow_deps(&mut self, node: &BuildNode) {
        let Some(follow) = &mut self.follow else {
            return;
        };
        let by_task = node
            .task_deps
            .iter()
            .filter_map(|name| self.registry.task_index(name));
        let by_file = node
            .file_deps
            .iter()
            .filter_map(|path| follow.producers.get(path).copied());
        let deps: Vec<usize> = by_task.chain(by_file).collect();
        for idx in deps {
            if follow.seen.insert(idx) {
                self.queue.push_back(idx);
            }
        }
    }
}

impl<'a> Iterator for Expand<'a> {
    type Item = BuildNode;

    fn next(&mut self) -> Option<BuildNode> {
        let node = self.next_node()?;
        self.follow_deps(&node);
        Some(node)
    }
}
