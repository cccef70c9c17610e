//! Exclusion rules for the tree walker
//!
//! Combines several sources of patterns, highest priority first:
//! 1. Built-in patterns (`.git/`, `.constellation/`, `.jj/` - always active)
//! 2. `.cstignore` patterns (project-specific, optional)
//! 3. `.gitignore` patterns (optional, enabled by default)
//! 4. Config-based patterns (gitignore syntax)
//!
//! An optional extension allow-list further restricts which files are tracked.

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory names that are never walked
const BUILTIN_DIRS: &[&str] = &[".git", ".constellation", ".jj"];

/// Exclusion configuration (`[walk]` in config.toml)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcludeConfig {
    /// Honor the project's `.gitignore`
    pub use_gitignore: bool,

    /// Honor the project's `.cstignore`
    pub use_cstignore: bool,

    /// Additional gitignore-style patterns
    pub exclude: Vec<String>,

    /// Only track files with these extensions (empty = every file)
    pub extensions: Vec<String>,
}

impl Default for ExcludeConfig {
    fn default() -> Self {
        Self {
            use_gitignore: true,
            use_cstignore: true,
            exclude: vec![],
            extensions: vec![],
        }
    }
}

/// Compiled exclusion rules for one project root
pub struct ExcludeRules {
    root: PathBuf,
    cstignore: Option<Gitignore>,
    gitignore: Option<Gitignore>,
    configured: Option<Gitignore>,
    extensions: Vec<String>,
}

impl ExcludeRules {
    /// Load rules for the tree rooted at `root`
    pub fn load(root: &Path, config: &ExcludeConfig) -> Result<Self> {
        let cstignore = if config.use_cstignore {
            load_ignore_file(root, ".cstignore")?
        } else {
            None
        };
        let gitignore = if config.use_gitignore {
            load_ignore_file(root, ".gitignore")?
        } else {
            None
        };

        let configured = if config.exclude.is_empty() {
            None
        } else {
            let mut builder = GitignoreBuilder::new(root);
            for pattern in &config.exclude {
                builder
                    .add_line(None, pattern)
                    .with_context(|| format!("Invalid exclude pattern '{pattern}'"))?;
            }
            Some(builder.build().context("Failed to compile exclude patterns")?)
        };

        let extensions = config
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        Ok(Self {
            root: root.to_path_buf(),
            cstignore,
            gitignore,
            configured,
            extensions,
        })
    }

    /// Rules that only apply the built-in patterns
    pub fn builtin(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            cstignore: None,
            gitignore: None,
            configured: None,
            extensions: vec![],
        }
    }

    /// Check a single relative path whose parents are known to be included
    pub fn should_ignore(&self, rel_path: &Path, is_dir: bool) -> bool {
        if is_builtin_ignored(rel_path) {
            return true;
        }

        // .cstignore overrides .gitignore, including whitelists
        if let Some(ref cstignore) = self.cstignore {
            let matched = cstignore.matched(rel_path, is_dir);
            if matched.is_ignore() {
                return true;
            }
            if matched.is_whitelist() {
                return !is_dir && !self.extension_allowed(rel_path);
            }
        }

        if let Some(ref gitignore) = self.gitignore {
            if gitignore.matched(rel_path, is_dir).is_ignore() {
                return true;
            }
        }

        if let Some(ref configured) = self.configured {
            if configured.matched(rel_path, is_dir).is_ignore() {
                return true;
            }
        }

        !is_dir && !self.extension_allowed(rel_path)
    }

    /// Check a file path whose parents have not been checked
    ///
    /// Used for change lists that did not come from a walk.
    pub fn should_ignore_file(&self, rel_path: &Path) -> bool {
        let mut ancestors: Vec<&Path> = rel_path
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        ancestors.reverse();
        ancestors.into_iter().any(|dir| self.should_ignore(dir, true)) || self.should_ignore(rel_path, false)
    }

    fn extension_allowed(&self, rel_path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        rel_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Number of active pattern sources (built-ins included)
    pub fn active_sources(&self) -> usize {
        1 + usize::from(self.cstignore.is_some())
            + usize::from(self.gitignore.is_some())
            + usize::from(self.configured.is_some())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn load_ignore_file(root: &Path, name: &str) -> Result<Option<Gitignore>> {
    let path = root.join(name);
    if !path.exists() {
        return Ok(None);
    }
    let mut builder = GitignoreBuilder::new(root);
    if let Some(err) = builder.add(&path) {
        return Err(err).with_context(|| format!("Failed to parse {}", path.display()));
    }
    Ok(Some(builder.build().with_context(|| format!("Failed to compile {}", path.display()))?))
}

fn is_builtin_ignored(rel_path: &Path) -> bool {
    rel_path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .is_some_and(|name| BUILTIN_DIRS.contains(&name))
    })
}
