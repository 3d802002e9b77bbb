use crate::project::Project;

/// A glob-like filter pattern restricted to `*` as the only wildcard,
/// matched against a project's workspace-relative path.
///
/// `*` matches any run of characters, including `/`. A pattern without
/// wildcards must match the whole path exactly.
#[derive(Debug, Clone)]
pub struct FilterPattern {
    segments: Vec<String>,
}

impl FilterPattern {
    pub fn new(pattern: &str) -> Self {
        FilterPattern {
            segments: pattern.split('*').map(|s| s.to_string()).collect(),
        }
    }

    /// Match the pattern against a workspace-relative path.
    pub fn matches(&self, rel_path: &str) -> bool {
        // No wildcard: exact match only
        if self.segments.len() == 1 {
            return self.segments[0] == rel_path;
        }

        let mut rest = rel_path;

        // Leading literal must anchor at the start
        let first = &self.segments[0];
        if !rest.starts_with(first.as_str()) {
            return false;
        }
        rest = &rest[first.len()..];

        // Middle literals must appear in order
        for segment in &self.segments[1..self.segments.len() - 1] {
            if segment.is_empty() {
                continue;
            }
            match rest.find(segment.as_str()) {
                Some(idx) => rest = &rest[idx + segment.len()..],
                None => return false,
            }
        }

        // Trailing literal must anchor at the end
        let last = &self.segments[self.segments.len() - 1];
        last.is_empty() || rest.ends_with(last.as_str())
    }

    /// Filter a project list down to those whose relative path matches.
    pub fn apply<'a>(&self, projects: impl IntoIterator<Item = &'a Project>) -> Vec<&'a Project> {
        projects
            .into_iter()
            .filter(|p| self.matches(&p.relative_path()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_without_wildcard() {
        let f = FilterPattern::new("packages/api");
        assert!(f.matches("packages/api"));
        assert!(!f.matches("packages/api-client"));
        assert!(!f.matches("apps/packages/api"));
    }

    #[test]
    fn test_trailing_wildcard() {
        let f = FilterPattern::new("packages/*");
        assert!(f.matches("packages/api"));
        assert!(f.matches("packages/nested/lib"));
        assert!(!f.matches("apps/web"));
    }

    #[test]
    fn test_leading_wildcard() {
        let f = FilterPattern::new("*-e2e");
        assert!(f.matches("apps/web-e2e"));
        assert!(!f.matches("apps/web"));
    }

    #[test]
    fn test_middle_wildcard() {
        let f = FilterPattern::new("apps/*/src");
        assert!(f.matches("apps/web/src"));
        assert!(!f.matches("apps/web/lib"));
    }

    #[test]
    fn test_multiple_wildcards() {
        let f = FilterPattern::new("*feature*");
        assert!(f.matches("libs/feature-auth"));
        assert!(f.matches("apps/featureful"));
        assert!(!f.matches("libs/core"));
    }

    #[test]
    fn test_bare_star_matches_everything() {
        let f = FilterPattern::new("*");
        assert!(f.matches("anything/at/all"));
        assert!(f.matches(""));
    }

    #[test]
    fn test_apply_filters_by_relative_path() {
        use std::path::PathBuf;

        use crate::project::ProjectManifest;

        let project = |name: &str, rel: &str| Project {
            name: name.to_string(),
            path: PathBuf::from(rel),
            absolute_path: PathBuf::from(format!("/ws/{}", rel)),
            manifest: ProjectManifest {
                name: Some(name.to_string()),
                ..Default::default()
            },
        };

        let projects = vec![
            project("web", "apps/web"),
            project("core", "packages/core"),
            project("api", "packages/api"),
        ];

        let f = FilterPattern::new("packages/*");
        let kept = f.apply(&projects);
        let names: Vec<&str> = kept.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["core", "api"]);
    }
}
