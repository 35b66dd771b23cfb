//! Task loading: reads the JSON task file and constructs the registry and
//! build graph from it.

use crate::canon::canon_path;
use crate::config::Config;
use crate::db::Db;
use crate::graph::Graph;
use crate::registry::{Generator, Registry, TaskDef};
use crate::task::Action;
use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// In-process steps, written as `{"copy": [src, dst]}` and so on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Copy(String, String),
    Mkdir(String),
    Remove(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ActionDecl {
    /// Run through the shell.
    Shell(String),
    Step(Step),
}

/// Expands a task into one sub-task per file matching `glob`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForEach {
    pub glob: String,
    /// Directory `{rel}` and `{stem}` are relative to.
    #[serde(default)]
    pub base: Option<String>,
    /// Target path pattern, e.g. "build/{stem}.css".
    pub target: String,
    /// Files whose name starts with this are left out.
    #[serde(default)]
    pub exclude_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDecl {
    pub name: String,
    #[serde(default)]
    pub doc: Option<String>,
    #[serde(default)]
    pub actions: Vec<ActionDecl>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub file_dep: Vec<String>,
    #[serde(default)]
    pub task_dep: Vec<String>,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub foreach: Option<ForEach>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    /// Tasks built when none are named.
    #[serde(default)]
    pub default: Vec<String>,
    pub tasks: Vec<TaskDecl>,
}

/// Replaces each `{key}` in `template`.
fn substitute(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, val) in vars {
        out = out.replace(&format!("{{{}}}", key), val);
    }
    out
}

fn copy_file(src: &str, dst: &str) -> anyhow::Result<Vec<u8>> {
    if let Some(parent) = Path::new(dst).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
        }
    }
    std::fs::copy(src, dst).with_context(|| format!("copy {} to {}", src, dst))?;
    Ok(Vec::new())
}

/// Removes a file or a whole directory; a missing path is not an error.
fn remove_path(path: &str) -> anyhow::Result<Vec<u8>> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => Err(err),
    };
    result.with_context(|| format!("remove {}", path))?;
    Ok(Vec::new())
}

fn to_action(decl: &ActionDecl, vars: &[(&str, &str)]) -> Action {
    match decl {
        ActionDecl::Shell(cmdline) => Action::command(substitute(cmdline, vars)),
        ActionDecl::Step(Step::Copy(src, dst)) => {
            let (src, dst) = (substitute(src, vars), substitute(dst, vars));
            Action::func(format!("copy {} {}", src, dst), move || copy_file(&src, &dst))
        }
        ActionDecl::Step(Step::Mkdir(path)) => {
            let path = substitute(path, vars);
            Action::func(format!("mkdir {}", path), move || {
                std::fs::create_dir_all(&path).with_context(|| format!("mkdir {}", path))?;
                Ok(Vec::new())
            })
        }
        ActionDecl::Step(Step::Remove(path)) => {
            let path = substitute(path, vars);
            Action::func(format!("remove {}", path), move || remove_path(&path))
        }
    }
}

fn path_str(path: &Path) -> anyhow::Result<String> {
    let s = path
        .to_str()
        .ok_or_else(|| anyhow!("non-UTF-8 path {:?}", path))?;
    Ok(s.replace('\\', "/"))
}

/// Lazily walks a glob pattern, yielding one sub-task per matching file.
struct GlobGenerator {
    pattern: String,
    base: Option<PathBuf>,
    target: String,
    exclude_prefix: Option<String>,
    actions: Vec<ActionDecl>,
}

impl GlobGenerator {
    fn subtask(&self, entry: glob::GlobResult) -> anyhow::Result<Option<TaskDef>> {
        let path = entry?;
        if !path.is_file() {
            return Ok(None);
        }
        if let (Some(prefix), Some(name)) = (&self.exclude_prefix, path.file_name()) {
            if name.to_string_lossy().starts_with(prefix.as_str()) {
                return Ok(None);
            }
        }

        let src = path_str(&path)?;
        let rel_path = match &self.base {
            Some(base) => path
                .strip_prefix(base)
                .with_context(|| format!("{} is not under {}", src, base.display()))?,
            None => path.as_path(),
        };
        let rel = path_str(rel_path)?;
        let stem = path_str(&rel_path.with_extension(""))?;
        let target = canon_path(&substitute(
            &self.target,
            &[("src", src.as_str()), ("rel", rel.as_str()), ("stem", stem.as_str())],
        ));
        let target_dir = match Path::new(&target).parent() {
            Some(dir) if !dir.as_os_str().is_empty() => path_str(dir)?,
            _ => ".".to_string(),
        };

        let vars = [
            ("src", src.as_str()),
            ("target", target.as_str()),
            ("target_dir", target_dir.as_str()),
            ("rel", rel.as_str()),
            ("stem", stem.as_str()),
        ];
        let mut task = TaskDef::new(target.clone())
            .target(target.clone())
            .file_dep(src.clone());
        task.actions = self.actions.iter().map(|a| to_action(a, &vars)).collect();
        Ok(Some(task))
    }
}

impl Generator for GlobGenerator {
    fn generate(&self) -> Box<dyn Iterator<Item = anyhow::Result<TaskDef>> + '_> {
        match glob::glob(&self.pattern) {
            Ok(paths) => Box::new(paths.filter_map(move |entry| self.subtask(entry).transpose())),
            Err(err) => Box::new(std::iter::once(Err(anyhow!(
                "bad glob {:?}: {}",
                self.pattern,
                err
            )))),
        }
    }
}

impl TaskDecl {
    fn into_task(self) -> anyhow::Result<TaskDef> {
        let mut task = TaskDef {
            name: self.name,
            doc: self.doc,
            targets: self.targets,
            file_deps: self.file_dep,
            task_deps: self.task_dep,
            values: self.values,
            ..Default::default()
        };
        match self.foreach {
            None => {
                task.actions = self.actions.iter().map(|a| to_action(a, &[])).collect();
            }
            Some(foreach) => {
                if !task.targets.is_empty() {
                    bail!("task {:?}: foreach targets come from its target pattern", task.name);
                }
                task = task.generator(GlobGenerator {
                    pattern: foreach.glob,
                    base: foreach.base.map(PathBuf::from),
                    target: foreach.target,
                    exclude_prefix: foreach.exclude_prefix,
                    actions: self.actions,
                });
            }
        }
        Ok(task)
    }
}

impl TaskFile {
    /// Registers every declared task, returning the registry and the default
    /// task list.
    pub fn into_registry(self) -> anyhow::Result<(Registry, Vec<String>)> {
        let mut registry = Registry::new();
        for decl in self.tasks {
            registry.register(decl.into_task()?)?;
        }
        for name in &self.default {
            if registry.get(name).is_none() {
                bail!("unknown default task {:?}", name);
            }
        }
        Ok((registry, self.default))
    }
}

pub fn parse(content: &str) -> anyhow::Result<TaskFile> {
    Ok(serde_json::from_str(content)?)
}

/// State loaded by read().
pub struct State {
    pub registry: Registry,
    pub graph: Graph,
    pub db: Db,
    pub default: Vec<String>,
}

/// Load the task file and build state, and return the expanded build graph.
pub fn read(config: &Config) -> anyhow::Result<State> {
    let path = &config.task_file;
    let content =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let file = parse(&content).with_context(|| format!("parse {}", path.display()))?;
    let (registry, default) = file.into_registry()?;
    let graph = Graph::build(registry.expand_all())?;
    tracing::debug!("loaded {} tasks, {} nodes", registry.tasks().count(), graph.len());
    let db = Db::open(config.db_path.clone())
        .with_context(|| format!("load {}", config.db_path.display()))?;
    Ok(State {
        registry,
        graph,
        db,
        default,
    })
}
