use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::project::{self, Project, ProjectManifest};

/// A loaded workspace: the root manifest plus every discovered project.
#[derive(Debug)]
pub struct Workspace {
    /// Absolute path to the workspace root (where the root manifest lives)
    pub root_path: PathBuf,

    /// Parsed root `package.json`
    pub manifest: ProjectManifest,

    /// All projects discovered via the root `workspaces` globs, sorted by name
    pub projects: Vec<Project>,

    /// Warnings collected during loading. The caller is responsible for
    /// presenting these to the user.
    pub warnings: Vec<String>,
}

impl Workspace {
    /// Find the workspace root by walking up from the current directory,
    /// then load it.
    ///
    /// The root is the nearest ancestor directory whose `package.json`
    /// declares a non-empty `workspaces` array.
    pub fn find_and_load() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        let root = find_root(&cwd)?;
        Self::load(&root)
    }

    /// Load the workspace rooted at `root`.
    ///
    /// Fails if the root manifest is absent or malformed, or if two projects
    /// declare the same name.
    pub fn load(root: &Path) -> Result<Self> {
        let manifest_path = root.join("package.json");
        if !manifest_path.exists() {
            anyhow::bail!(
                "No package.json found at workspace root '{}'",
                root.display()
            );
        }

        let manifest = ProjectManifest::from_file(&manifest_path)?;

        let mut warnings = Vec::new();
        if manifest.workspaces.is_empty() {
            warnings.push(
                "Root package.json has no `workspaces` patterns; no projects will be discovered."
                    .to_string(),
            );
        }

        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to canonicalize '{}'", root.display()))?;

        let projects = project::discover_projects(&root, &manifest.workspaces)?;

        // Duplicate names are fatal: every downstream map is keyed by name.
        let mut seen: HashMap<&str, &Project> = HashMap::new();
        for project in &projects {
            if let Some(previous) = seen.insert(project.name.as_str(), project) {
                anyhow::bail!(
                    "Duplicate project name '{}' declared by both '{}' and '{}'",
                    project.name,
                    previous.relative_path(),
                    project.relative_path(),
                );
            }
        }

        Ok(Workspace {
            root_path: root,
            manifest,
            projects,
            warnings,
        })
    }

    /// Look up a project by name.
    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// All project names, in sorted order.
    pub fn project_names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.name.clone()).collect()
    }

    /// Resolve user-supplied identifiers (from `--changed` or watch targets)
    /// to project names.
    ///
    /// Resolution order per identifier: exact project name, then the
    /// project's workspace-relative path, then a `/<id>` suffix match on any
    /// project name. Unresolvable identifiers are returned separately; the
    /// caller decides whether dropping them is fatal.
    pub fn resolve_ids(&self, ids: &[String]) -> (Vec<String>, Vec<String>) {
        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();

        for id in ids {
            match self.resolve_id(id) {
                Some(name) => {
                    if !resolved.contains(&name) {
                        resolved.push(name);
                    }
                }
                None => unresolved.push(id.clone()),
            }
        }

        (resolved, unresolved)
    }

    /// Resolve one identifier to a project name, or `None`.
    pub fn resolve_id(&self, id: &str) -> Option<String> {
        if let Some(p) = self.projects.iter().find(|p| p.name == id) {
            return Some(p.name.clone());
        }

        let normalized = id.trim_matches('/');
        if let Some(p) = self
            .projects
            .iter()
            .find(|p| p.relative_path() == normalized)
        {
            return Some(p.name.clone());
        }

        let suffix = format!("/{}", id);
        self.projects
            .iter()
            .find(|p| p.name.ends_with(&suffix))
            .map(|p| p.name.clone())
    }

    /// Environment variables available to every child process spawned for
    /// this workspace. Per-project variables are layered on top by the
    /// executor and supervisor.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert(
            "RIPPLE_ROOT_PATH".to_string(),
            self.root_path.display().to_string(),
        );
        env
    }
}

/// Walk up from `start` looking for a `package.json` with a non-empty
/// `workspaces` array.
fn find_root(start: &Path) -> Result<PathBuf> {
    let mut dir: &Path = start;

    loop {
        let manifest_path = dir.join("package.json");
        if manifest_path.exists() && manifest_declares_workspaces(&manifest_path) {
            return Ok(dir.to_path_buf());
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    anyhow::bail!(
        "Could not find a package.json with a `workspaces` field in '{}' or any parent directory.\n\
         \n\
         Hint: run ripple from inside a monorepo whose root package.json lists workspace globs.",
        start.display()
    )
}

/// Quick check whether a manifest declares workspaces, without failing on
/// malformed JSON (malformed roots are rejected later with a proper error
/// naming the file).
fn manifest_declares_workspaces(path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };

    let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else {
        return false;
    };

    value
        .get("workspaces")
        .and_then(|w| w.as_array())
        .is_some_and(|a| !a.is_empty())
}
