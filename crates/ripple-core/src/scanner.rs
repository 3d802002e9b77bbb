use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use regex::Regex;
use walkdir::WalkDir;

use crate::project::Project;
use crate::workspace::Workspace;

/// Extensions treated as source files during the scan.
const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];

/// Extensions probed when resolving an extensionless relative specifier.
const PROBE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "cjs", "json"];

/// Directories never walked.
const SKIP_DIRS: &[&str] = &[
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

/// A relative import whose resolved target does not exist on disk.
#[derive(Debug, Clone)]
pub struct UnknownDependency {
    /// Owning project of the importing files
    pub project: String,
    /// The literal specifier as written
    pub specifier: String,
    /// The path the specifier resolved to
    pub resolved: PathBuf,
    /// Every file importing this target
    pub importers: Vec<PathBuf>,
}

/// Walk every project's sources, extract `import`/`export … from`/
/// `require()` string literals, and report relative specifiers whose
/// resolved target is missing from disk.
///
/// Configured generator output paths are filtered out — they are expected
/// to be missing on a clean checkout. Results are aggregated by resolved
/// path and sorted by project, then path.
pub fn scan_workspace(
    workspace: &Workspace,
    generator_outputs: &[PathBuf],
) -> Result<Vec<UnknownDependency>> {
    // Keyed by (project, resolved path) so repeated imports aggregate.
    let mut findings: BTreeMap<(String, PathBuf), UnknownDependency> = BTreeMap::new();

    for project in &workspace.projects {
        for file in project_source_files(project, &workspace.projects) {
            let Ok(content) = std::fs::read_to_string(&file) else {
                continue;
            };

            let base = file.parent().unwrap_or(&project.absolute_path);

            for specifier in extract_specifiers(&content) {
                if !specifier.starts_with("./") && !specifier.starts_with("../") {
                    // Bare specifiers are external packages
                    continue;
                }

                let resolved = normalize_path(&base.join(&specifier));

                if probe_exists(&resolved) {
                    continue;
                }

                if generator_outputs.iter().any(|out| resolved.starts_with(out)) {
                    continue;
                }

                let entry = findings
                    .entry((project.name.clone(), resolved.clone()))
                    .or_insert_with(|| UnknownDependency {
                        project: project.name.clone(),
                        specifier: specifier.clone(),
                        resolved,
                        importers: Vec::new(),
                    });
                if !entry.importers.contains(&file) {
                    entry.importers.push(file.clone());
                }
            }
        }
    }

    Ok(findings.into_values().collect())
}

/// Source files owned by this project: walked from its directory, skipping
/// vendored/output trees, declaration files, and files that belong to a
/// nested project.
fn project_source_files(project: &Project, all_projects: &[Project]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let walker = WalkDir::new(&project.absolute_path)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && SKIP_DIRS.contains(&e.file_name().to_str().unwrap_or("")))
        });

    for entry in walker.flatten() {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();

        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if !SOURCE_EXTENSIONS.contains(&ext) {
            continue;
        }
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".d.ts"))
        {
            continue;
        }

        // A file under a nested project's directory belongs to that project
        let owner = all_projects
            .iter()
            .filter(|p| path.starts_with(&p.absolute_path))
            .max_by_key(|p| p.absolute_path.as_os_str().len());
        if owner.is_some_and(|p| p.name != project.name) {
            continue;
        }

        files.push(path.to_path_buf());
    }

    files.sort();
    files
}

/// Extract every string literal used as an import/require specifier.
pub fn extract_specifiers(content: &str) -> Vec<String> {
    static PATTERNS: std::sync::LazyLock<Vec<Regex>> = std::sync::LazyLock::new(|| {
        vec![
            // import defaultExport, { named } from '...'; import * as ns from '...'
            Regex::new(r#"import\s+[^'";]*?from\s+['"]([^'"]+)['"]"#).expect("valid regex"),
            // export { x } from '...'; export * from '...'
            Regex::new(r#"export\s+[^'";]*?from\s+['"]([^'"]+)['"]"#).expect("valid regex"),
            // side-effect import '...'
            Regex::new(r#"import\s+['"]([^'"]+)['"]"#).expect("valid regex"),
            // dynamic import('...')
            Regex::new(r#"import\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid regex"),
            // require('...')
            Regex::new(r#"require\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("valid regex"),
        ]
    });

    let mut specifiers = Vec::new();
    for pattern in PATTERNS.iter() {
        for caps in pattern.captures_iter(content) {
            let spec = caps[1].to_string();
            if !specifiers.contains(&spec) {
                specifiers.push(spec);
            }
        }
    }
    specifiers
}

/// Probe the conventional resolution variants for a specifier target:
/// the exact path, `<path>.<ext>`, and `<path>/index.<ext>`.
fn probe_exists(resolved: &Path) -> bool {
    if resolved.is_file() {
        return true;
    }

    let as_str = resolved.to_string_lossy();
    for ext in PROBE_EXTENSIONS {
        if PathBuf::from(format!("{}.{}", as_str, ext)).is_file() {
            return true;
        }
    }

    if resolved.is_dir() {
        for ext in PROBE_EXTENSIONS {
            if resolved.join(format!("index.{}", ext)).is_file() {
                return true;
            }
        }
    }

    false
}

/// Collapse `.` and `..` components without touching the filesystem (the
/// target may not exist — that is the point).
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(projects: &[(&str, &str)]) -> (TempDir, Workspace) {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("package.json"),
            r#"{"name": "x", "workspaces": ["packages/*"]}"#,
        )
        .unwrap();
        for (rel, manifest) in projects {
            let dir = tmp.path().join(rel);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("package.json"), manifest).unwrap();
        }
        let ws = Workspace::load(tmp.path()).unwrap();
        (tmp, ws)
    }

    #[test]
    fn test_extract_specifiers_variants() {
        let content = r#"
            import React from 'react';
            import { thing } from "./lib/thing";
            import * as helpers from '../helpers';
            import './styles.css';
            export { a } from './exports';
            export * from "./all";
            const lazy = import('./lazy');
            const legacy = require('./legacy');
        "#;

        let specs = extract_specifiers(content);
        for expected in [
            "react",
            "./lib/thing",
            "../helpers",
            "./styles.css",
            "./exports",
            "./all",
            "./lazy",
            "./legacy",
        ] {
            assert!(specs.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/ws/packages/api/src/../lib/util")),
            PathBuf::from("/ws/packages/api/lib/util")
        );
        assert_eq!(
            normalize_path(Path::new("/ws/./a/./b")),
            PathBuf::from("/ws/a/b")
        );
    }

    #[test]
    fn test_scan_reports_missing_relative_import() {
        let (tmp, ws) = fixture(&[("packages/api", r#"{"name": "api"}"#)]);
        let src = tmp.path().join("packages/api/src");
        fs::create_dir_all(&src).unwrap();
        fs::write(
            src.join("main.ts"),
            "import { gone } from './missing';\nimport { here } from './present';\n",
        )
        .unwrap();
        fs::write(src.join("present.ts"), "export const here = 1;").unwrap();

        let findings = scan_workspace(&ws, &[]).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].project, "api");
        assert_eq!(findings[0].specifier, "./missing");
        assert_eq!(findings[0].importers.len(), 1);
    }

    #[test]
    fn test_scan_resolves_index_files() {
        let (tmp, ws) = fixture(&[("packages/api", r#"{"name": "api"}"#)]);
        let src = tmp.path().join("packages/api/src");
        fs::create_dir_all(src.join("util")).unwrap();
        fs::write(src.join("main.ts"), "import { u } from './util';\n").unwrap();
        fs::write(src.join("util").join("index.ts"), "export const u = 1;").unwrap();

        let findings = scan_workspace(&ws, &[]).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_scan_skips_external_and_declaration_files() {
        let (tmp, ws) = fixture(&[("packages/api", r#"{"name": "api"}"#)]);
        let dir = tmp.path().join("packages/api");
        fs::write(dir.join("main.ts"), "import React from 'react';\n").unwrap();
        // Declaration file imports are never scanned
        fs::write(dir.join("types.d.ts"), "import { x } from './phantom';\n").unwrap();

        let findings = scan_workspace(&ws, &[]).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_scan_filters_generator_outputs() {
        let (tmp, ws) = fixture(&[("packages/api", r#"{"name": "api"}"#)]);
        let dir = tmp.path().join("packages/api");
        fs::write(dir.join("main.ts"), "import { m } from './generated/models';\n").unwrap();

        let outputs = vec![ws.project("api").unwrap().absolute_path.join("generated")];
        let findings = scan_workspace(&ws, &outputs).unwrap();
        assert!(findings.is_empty(), "generator outputs are expected to be missing");

        // Without the filter the same import is a finding
        let findings = scan_workspace(&ws, &[]).unwrap();
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_scan_aggregates_importers_by_resolved_path() {
        let (tmp, ws) = fixture(&[("packages/api", r#"{"name": "api"}"#)]);
        let dir = tmp.path().join("packages/api");
        fs::write(dir.join("a.ts"), "import { x } from './shared/gone';\n").unwrap();
        fs::write(dir.join("b.ts"), "import { y } from './shared/gone';\n").unwrap();

        let findings = scan_workspace(&ws, &[]).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].importers.len(), 2);
    }

    #[test]
    fn test_scan_ignores_vendored_sources() {
        let (tmp, ws) = fixture(&[("packages/api", r#"{"name": "api"}"#)]);
        let vendored = tmp.path().join("packages/api/node_modules/dep");
        fs::create_dir_all(&vendored).unwrap();
        fs::write(vendored.join("index.js"), "require('./nope');\n").unwrap();

        let findings = scan_workspace(&ws, &[]).unwrap();
        assert!(findings.is_empty());
    }

    #[test]
    fn test_nested_project_files_attribute_to_inner_project() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("package.json"),
            r#"{"name": "x", "workspaces": ["packages/*", "packages/app/plugin"]}"#,
        )
        .unwrap();
        for (rel, manifest) in [
            ("packages/app", r#"{"name": "app"}"#),
            ("packages/app/plugin", r#"{"name": "plugin"}"#),
        ] {
            let dir = tmp.path().join(rel);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("package.json"), manifest).unwrap();
        }
        let ws = Workspace::load(tmp.path()).unwrap();
        let inner = tmp.path().join("packages/app/plugin");
        fs::write(inner.join("main.ts"), "import { z } from './zap';\n").unwrap();

        let findings = scan_workspace(&ws, &[]).unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].project, "plugin");
    }
}
