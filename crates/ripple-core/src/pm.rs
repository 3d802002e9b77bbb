use std::path::Path;

use crate::workspace::Workspace;

/// The package manager driving project builds.
///
/// Detection order: the root manifest's `packageManager` field wins, then a
/// lockfile heuristic, then npm. Commands are rendered as structured
/// `(program, args)` pairs — never a shell string — so project names with
/// shell metacharacters cannot break quoting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Yarn,
    Pnpm,
    Bun,
}

impl PackageManager {
    /// Detect the workspace's package manager.
    pub fn detect(workspace: &Workspace) -> Self {
        if let Some(ref field) = workspace.manifest.package_manager
            && let Some(pm) = Self::from_field(field)
        {
            return pm;
        }
        Self::from_lockfiles(&workspace.root_path)
    }

    /// Parse a `packageManager` manifest field like `pnpm@9.1.0`.
    fn from_field(field: &str) -> Option<Self> {
        let name = field.split('@').next().unwrap_or("").trim();
        match name {
            "npm" => Some(PackageManager::Npm),
            "yarn" => Some(PackageManager::Yarn),
            "pnpm" => Some(PackageManager::Pnpm),
            "bun" => Some(PackageManager::Bun),
            _ => None,
        }
    }

    /// Lockfile heuristic, checked in a fixed order.
    fn from_lockfiles(root: &Path) -> Self {
        if root.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if root.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else if root.join("bun.lockb").exists() || root.join("bun.lock").exists() {
            PackageManager::Bun
        } else {
            PackageManager::Npm
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Npm => "npm",
            PackageManager::Yarn => "yarn",
            PackageManager::Pnpm => "pnpm",
            PackageManager::Bun => "bun",
        }
    }

    /// Render the build invocation for one workspace project, executed at
    /// the workspace root.
    pub fn render_build(&self, project_name: &str) -> (String, Vec<String>) {
        self.render_script(project_name, "build")
    }

    /// Render an arbitrary script invocation for one workspace project.
    pub fn render_script(&self, project_name: &str, script: &str) -> (String, Vec<String>) {
        let args: Vec<String> = match self {
            PackageManager::Npm => vec![
                "run".into(),
                script.into(),
                "-w".into(),
                project_name.into(),
            ],
            PackageManager::Yarn => vec![
                "workspace".into(),
                project_name.into(),
                "run".into(),
                script.into(),
            ],
            PackageManager::Pnpm => vec![
                "--filter".into(),
                project_name.into(),
                "run".into(),
                script.into(),
            ],
            PackageManager::Bun => vec![
                "run".into(),
                "--filter".into(),
                project_name.into(),
                script.into(),
            ],
        };
        (self.as_str().to_string(), args)
    }
}

impl std::fmt::Display for PackageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    use crate::workspace::Workspace;

    fn workspace_with(root_manifest: &str, lockfile: Option<&str>) -> (TempDir, Workspace) {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("package.json"), root_manifest).unwrap();
        if let Some(name) = lockfile {
            fs::write(tmp.path().join(name), "").unwrap();
        }
        let ws = Workspace::load(tmp.path()).unwrap();
        (tmp, ws)
    }

    #[test]
    fn test_detect_from_manifest_field() {
        let (_tmp, ws) = workspace_with(
            r#"{"name": "x", "workspaces": ["packages/*"], "packageManager": "pnpm@9.1.0"}"#,
            Some("yarn.lock"),
        );
        // The manifest field overrides the lockfile heuristic
        assert_eq!(PackageManager::detect(&ws), PackageManager::Pnpm);
    }

    #[test]
    fn test_detect_from_lockfile() {
        let (_tmp, ws) = workspace_with(
            r#"{"name": "x", "workspaces": ["packages/*"]}"#,
            Some("yarn.lock"),
        );
        assert_eq!(PackageManager::detect(&ws), PackageManager::Yarn);
    }

    #[test]
    fn test_detect_defaults_to_npm() {
        let (_tmp, ws) = workspace_with(r#"{"name": "x", "workspaces": ["packages/*"]}"#, None);
        assert_eq!(PackageManager::detect(&ws), PackageManager::Npm);
    }

    #[test]
    fn test_detect_unknown_field_falls_back() {
        let (_tmp, ws) = workspace_with(
            r#"{"name": "x", "workspaces": ["p/*"], "packageManager": "volta@1.0.0"}"#,
            Some("bun.lockb"),
        );
        assert_eq!(PackageManager::detect(&ws), PackageManager::Bun);
    }

    #[test]
    fn test_render_build_templates() {
        let (program, args) = PackageManager::Npm.render_build("api");
        assert_eq!(program, "npm");
        assert_eq!(args, vec!["run", "build", "-w", "api"]);

        let (program, args) = PackageManager::Yarn.render_build("api");
        assert_eq!(program, "yarn");
        assert_eq!(args, vec!["workspace", "api", "run", "build"]);

        let (program, args) = PackageManager::Pnpm.render_build("api");
        assert_eq!(program, "pnpm");
        assert_eq!(args, vec!["--filter", "api", "run", "build"]);

        let (program, args) = PackageManager::Bun.render_build("api");
        assert_eq!(program, "bun");
        assert_eq!(args, vec!["run", "--filter", "api", "build"]);
    }

    #[test]
    fn test_render_script_dev() {
        let (program, args) = PackageManager::Pnpm.render_script("web", "dev");
        assert_eq!(program, "pnpm");
        assert_eq!(args, vec!["--filter", "web", "run", "dev"]);
    }
}
