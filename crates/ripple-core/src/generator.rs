use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;

use crate::events::Event;
use crate::executor::shell_command;
use crate::project::Project;
use crate::workspace::Workspace;

/// A `sources` declaration as written in a manifest: either a bare shell
/// string (shorthand) or a full object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SourceEntry {
    /// Shorthand: just the command, no declared deps
    Command(String),
    /// Full configuration
    Spec(SourceSpec),
}

/// Full generator configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    pub command: String,

    /// Project identifiers whose change triggers this generator
    #[serde(default)]
    pub deps: Vec<String>,

    /// Project whose build consumes this generator's output
    #[serde(default)]
    pub target: Option<String>,

    /// Working directory, relative to the declaring manifest's directory
    #[serde(default)]
    pub cwd: Option<String>,
}

/// A normalized generator: declaration defaults resolved against the
/// declaring manifest's location.
#[derive(Debug, Clone)]
pub struct GeneratorSpec {
    /// Unique key; doubles as the generator's output path, relative to the
    /// declaring manifest's directory
    pub key: String,

    /// Shell command to run
    pub command: String,

    /// Project identifiers whose change triggers this generator
    pub deps: Vec<String>,

    /// Absolute working directory
    pub cwd: PathBuf,

    /// Consuming project name, if any
    pub target: Option<String>,

    /// Absolute output path (the key resolved against the declaring
    /// manifest's directory). Used for trigger path containment, watcher
    /// ignores, and scanner filtering.
    pub output: PathBuf,
}

/// All generators declared across the workspace, normalized, merged, and
/// topologically ordered.
///
/// Merge policy: a per-project declaration overrides a root declaration with
/// the same key. Declaration order is made deterministic by sorting keys
/// within each manifest (root first, then projects in name order).
pub struct GeneratorRegistry {
    pub generators: Vec<GeneratorSpec>,
}

impl GeneratorRegistry {
    /// Load and normalize every declaration in the workspace.
    pub fn load(workspace: &Workspace) -> Self {
        let mut generators: Vec<GeneratorSpec> = Vec::new();

        let mut root_keys: Vec<&String> = workspace.manifest.sources.keys().collect();
        root_keys.sort();
        for key in root_keys {
            let entry = &workspace.manifest.sources[key];
            generators.push(normalize(key, entry, &workspace.root_path, None));
        }

        for project in &workspace.projects {
            let mut keys: Vec<&String> = project.manifest.sources.keys().collect();
            keys.sort();
            for key in keys {
                let entry = &project.manifest.sources[key];
                let spec = normalize(key, entry, &project.absolute_path, Some(project));

                match generators.iter_mut().find(|g| g.key == spec.key) {
                    Some(existing) => *existing = spec,
                    None => generators.push(spec),
                }
            }
        }

        let generators = topological_order(generators, workspace);
        GeneratorRegistry { generators }
    }

    /// Generators triggered by the given affected set.
    ///
    /// A generator with declared deps runs iff any dep resolves to an
    /// affected project. A generator without deps falls back to path
    /// containment: it runs iff its key, resolved as a path (under the
    /// workspace root for root declarations, under the project for
    /// per-project ones), lies inside an affected project.
    pub fn triggered<'a>(
        &'a self,
        affected: &BTreeSet<String>,
        workspace: &Workspace,
    ) -> Vec<&'a GeneratorSpec> {
        self.generators
            .iter()
            .filter(|g| {
                if g.deps.is_empty() {
                    affected.iter().any(|name| {
                        workspace
                            .project(name)
                            .is_some_and(|p| g.output.starts_with(&p.absolute_path))
                    })
                } else {
                    g.deps.iter().any(|dep| {
                        resolve_project_id(dep, &workspace.projects)
                            .is_some_and(|name| affected.contains(&name))
                    })
                }
            })
            .collect()
    }

    /// Every generator's output path as watcher ignore globs.
    ///
    /// Registered before the watch loop starts so a generator writing into
    /// a watched tree cannot schedule the build that just ran it.
    pub fn ignore_globs(&self) -> Vec<String> {
        let mut globs = Vec::new();
        for g in &self.generators {
            // Escaped so path characters can never act as glob syntax
            let literal = glob::Pattern::escape(&g.output.display().to_string());
            globs.push(literal.clone());
            globs.push(format!("{}/**", literal));
        }
        globs
    }

    /// Every generator's resolved output path.
    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.generators.iter().map(|g| g.output.clone()).collect()
    }
}

/// Normalize one declaration against its declaring manifest's location.
fn normalize(
    key: &str,
    entry: &SourceEntry,
    base_dir: &Path,
    project: Option<&Project>,
) -> GeneratorSpec {
    let output = base_dir.join(key.trim_matches('/'));
    match entry {
        SourceEntry::Command(command) => GeneratorSpec {
            key: key.to_string(),
            command: command.clone(),
            deps: Vec::new(),
            cwd: base_dir.to_path_buf(),
            target: project.map(|p| p.name.clone()),
            output,
        },
        SourceEntry::Spec(spec) => GeneratorSpec {
            key: key.to_string(),
            command: spec.command.clone(),
            deps: spec.deps.clone(),
            cwd: match spec.cwd {
                Some(ref cwd) => base_dir.join(cwd),
                None => base_dir.to_path_buf(),
            },
            target: spec
                .target
                .clone()
                .or_else(|| project.map(|p| p.name.clone())),
            output,
        },
    }
}

/// Resolve a generator dep identifier to a project name.
///
/// Tries exact name, then a `/<id>` suffix match on any project name, then
/// a path-suffix match on the workspace-relative path.
pub fn resolve_project_id(id: &str, projects: &[Project]) -> Option<String> {
    if let Some(p) = projects.iter().find(|p| p.name == id) {
        return Some(p.name.clone());
    }

    let name_suffix = format!("/{}", id);
    if let Some(p) = projects.iter().find(|p| p.name.ends_with(&name_suffix)) {
        return Some(p.name.clone());
    }

    let normalized = id.trim_matches('/');
    projects
        .iter()
        .find(|p| {
            let rel = p.relative_path();
            rel == normalized || rel.ends_with(&format!("/{}", normalized))
        })
        .map(|p| p.name.clone())
}

/// Order generators so that one whose declared deps include another's
/// target runs after that generator. Remaining ties keep declaration order.
///
/// Cycles among generator declarations fall back to declaration order for
/// the nodes involved rather than failing the run.
fn topological_order(generators: Vec<GeneratorSpec>, workspace: &Workspace) -> Vec<GeneratorSpec> {
    let n = generators.len();
    if n < 2 {
        return generators;
    }

    // before[i] contains j  =>  generators[i] runs before generators[j]
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut in_degree: Vec<usize> = vec![0; n];

    for (i, provider) in generators.iter().enumerate() {
        let Some(ref target) = provider.target else {
            continue;
        };
        for (j, consumer) in generators.iter().enumerate() {
            if i == j {
                continue;
            }
            let consumes = consumer.deps.iter().any(|dep| {
                dep == target
                    || resolve_project_id(dep, &workspace.projects).as_deref() == Some(target)
            });
            if consumes {
                dependents[i].push(j);
                in_degree[j] += 1;
            }
        }
    }

    let mut order: Vec<usize> = Vec::with_capacity(n);
    let mut placed = vec![false; n];

    while order.len() < n {
        // Lowest declaration index with no unplaced prerequisite
        let next = (0..n).find(|&i| !placed[i] && in_degree[i] == 0);

        let Some(i) = next else {
            // Declaration cycle: emit the rest in declaration order
            for i in 0..n {
                if !placed[i] {
                    order.push(i);
                    placed[i] = true;
                }
            }
            break;
        };

        placed[i] = true;
        order.push(i);
        for &j in &dependents[i] {
            in_degree[j] = in_degree[j].saturating_sub(1);
        }
    }

    let mut indexed: Vec<(usize, GeneratorSpec)> = generators.into_iter().enumerate().collect();
    indexed.sort_by_key(|(i, _)| order.iter().position(|o| o == i).unwrap_or(usize::MAX));
    indexed.into_iter().map(|(_, g)| g).collect()
}

/// Run the given generators sequentially, streaming output as events.
///
/// A failing generator short-circuits: later generators do not run and the
/// error carries the failing key and exit code.
pub async fn run_generators(
    generators: &[&GeneratorSpec],
    env: &std::collections::HashMap<String, String>,
    events: Option<&UnboundedSender<Event>>,
) -> Result<()> {
    for generator in generators {
        crate::events::emit(
            events,
            Event::GeneratorStarted {
                key: generator.key.clone(),
            },
        );

        let start = Instant::now();
        let (shell, shell_flag) = shell_command();
        let mut child = tokio::process::Command::new(shell)
            .arg(shell_flag)
            .arg(&generator.command)
            .current_dir(&generator.cwd)
            .envs(env)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn generator '{}'", generator.key))?;

        // safety: both pipes were requested above
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stdout_task = stream_lines(generator.key.clone(), stdout, false, events.cloned());
        let stderr_task = stream_lines(generator.key.clone(), stderr, true, events.cloned());

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for generator '{}'", generator.key))?;

        let _ = stdout_task.await;
        let _ = stderr_task.await;

        crate::events::emit(
            events,
            Event::GeneratorFinished {
                key: generator.key.clone(),
                success: status.success(),
                duration: start.elapsed(),
            },
        );

        if !status.success() {
            anyhow::bail!(
                "Generator '{}' failed with exit code: {}",
                generator.key,
                status.code().unwrap_or(-1)
            );
        }
    }

    Ok(())
}

fn stream_lines<R>(
    key: String,
    reader: R,
    is_stderr: bool,
    events: Option<UnboundedSender<Event>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let reader = BufReader::new(reader);
        let mut lines = reader.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            crate::events::emit(
                events.as_ref(),
                Event::GeneratorOutput {
                    key: key.clone(),
                    line,
                    is_stderr,
                },
            );
        }
    })
}
