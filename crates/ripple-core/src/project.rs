pub mod filter;

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Deserialize;

use crate::generator::SourceEntry;

/// A project discovered in the workspace: a directory with a `package.json`
/// declaring a non-empty name.
#[derive(Debug, Clone)]
pub struct Project {
    /// Declared project name, unique across the workspace
    pub name: String,

    /// Path relative to the workspace root (e.g. `packages/api`)
    pub path: PathBuf,

    /// Absolute path to the project directory
    pub absolute_path: PathBuf,

    /// Parsed manifest
    pub manifest: ProjectManifest,
}

/// The subset of `package.json` this tool cares about.
///
/// All dependency maps and `scripts` default to empty; absent fields never
/// fail the parse. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectManifest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    /// Workspace glob patterns. Only meaningful on the root manifest.
    #[serde(default)]
    pub workspaces: Vec<String>,

    #[serde(default)]
    pub dependencies: HashMap<String, String>,

    #[serde(default)]
    pub dev_dependencies: HashMap<String, String>,

    #[serde(default)]
    pub peer_dependencies: HashMap<String, String>,

    #[serde(default)]
    pub optional_dependencies: HashMap<String, String>,

    #[serde(default)]
    pub scripts: HashMap<String, String>,

    /// The `packageManager` field (e.g. `pnpm@9.1.0`). Overrides the
    /// lockfile heuristic for package-manager detection.
    #[serde(default)]
    pub package_manager: Option<String>,

    /// Source generator declarations (reserved `sources` key).
    #[serde(default)]
    pub sources: HashMap<String, SourceEntry>,
}

impl ProjectManifest {
    /// Parse a manifest from a `package.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Union of the keys of all four dependency maps.
    ///
    /// Graph construction treats runtime, dev, peer, and optional
    /// dependencies identically; only names that resolve to workspace
    /// projects become edges.
    pub fn all_dependency_names(&self) -> BTreeSet<String> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .chain(self.peer_dependencies.keys())
            .chain(self.optional_dependencies.keys())
            .cloned()
            .collect()
    }
}

impl Project {
    /// Construct a project from a directory containing `package.json`.
    ///
    /// Returns `Ok(None)` if the manifest has no (or an empty) name — such
    /// directories are not workspace projects.
    pub fn from_dir(root: &Path, dir: &Path) -> Result<Option<Self>> {
        let manifest = ProjectManifest::from_file(&dir.join("package.json"))?;

        let Some(name) = manifest.name.clone().filter(|n| !n.trim().is_empty()) else {
            return Ok(None);
        };

        let path = dir.strip_prefix(root).unwrap_or(dir).to_path_buf();

        Ok(Some(Project {
            name,
            path,
            absolute_path: dir.to_path_buf(),
            manifest,
        }))
    }

    /// Workspace-relative path as a forward-slash string, for display and
    /// filter matching.
    pub fn relative_path(&self) -> String {
        self.path
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Look up a script by name.
    pub fn script(&self, name: &str) -> Option<&str> {
        self.manifest.scripts.get(name).map(|s| s.as_str())
    }
}

/// Directories excluded during project discovery.
///
/// These contain installed dependencies, build outputs, or VCS/cache state
/// whose `package.json` files must never be treated as workspace projects.
const EXCLUDED_PROJECT_DIRS: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    "coverage",
    ".git",
    ".cache",
    ".angular",
    ".nx",
    "tmp",
];

/// Returns `true` if any component of `path` (relative to `root`) is in
/// [`EXCLUDED_PROJECT_DIRS`].
fn is_in_excluded_dir(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(
        |c| matches!(c, std::path::Component::Normal(s) if EXCLUDED_PROJECT_DIRS.contains(&s.to_str().unwrap_or(""))),
    )
}

/// Discover all projects in the workspace matching the given glob patterns.
///
/// Glob iteration is sequential (cheap directory matching), but manifest
/// parsing is parallelized across cores via rayon. Directories listed in
/// [`EXCLUDED_PROJECT_DIRS`] are skipped; manifests without a name are
/// skipped (they are not workspace projects). A manifest that fails to
/// parse is fatal — the error names the file.
///
/// The result is sorted by name; discovery order is not part of the
/// contract.
pub fn discover_projects(root: &Path, patterns: &[String]) -> Result<Vec<Project>> {
    let mut candidate_dirs: Vec<PathBuf> = Vec::new();

    for pattern in patterns {
        let full_pattern = root.join(pattern).display().to_string();

        for entry in glob::glob(&full_pattern)
            .with_context(|| format!("Invalid workspace pattern: {}", pattern))?
        {
            let entry_path = entry.with_context(|| "Failed to read glob entry")?;

            if is_in_excluded_dir(&entry_path, root) {
                continue;
            }

            if entry_path.is_dir() && entry_path.join("package.json").exists() {
                candidate_dirs.push(entry_path);
            }
        }
    }

    let parsed: Vec<Option<Project>> = candidate_dirs
        .par_iter()
        .map(|dir| Project::from_dir(root, dir))
        .collect::<Result<_>>()?;

    let mut projects: Vec<Project> = parsed.into_iter().flatten().collect();
    projects.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(projects)
}
