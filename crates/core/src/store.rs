//! On-disk layout of the `.constellation/` state directory and file helpers

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use ulid::Ulid;

/// Name of the state directory created at the project root
pub const STATE_DIR: &str = ".constellation";

/// Layout of a project's state directory
///
/// ```text
/// .constellation/
///   config.toml
///   state.db/       sled: snapshots, analysis, diagrams
///   locks/
///     sync.lock
///   logs/
///     cst.log
///   tmp/
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    state_dir: PathBuf,
}

impl Workspace {
    /// Create the state directory structure under `root`
    ///
    /// Idempotent: existing directories are left in place.
    pub fn init(root: &Path) -> Result<Self> {
        let workspace = Self::at(root)?;
        for dir in [
            workspace.state_dir.clone(),
            workspace.locks_dir(),
            workspace.logs_dir(),
            workspace.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(workspace)
    }

    /// Open an initialized workspace
    pub fn open(root: &Path) -> Result<Self> {
        let workspace = Self::at(root)?;
        if !workspace.state_dir.is_dir() {
            anyhow::bail!(
                "Not a Constellation project (no {} directory in {})",
                STATE_DIR,
                root.display()
            );
        }
        fs::create_dir_all(workspace.tmp_dir())?;
        Ok(workspace)
    }

    /// Walk up from `start` to the nearest directory holding a state directory
    pub fn discover(start: &Path) -> Result<Self> {
        let mut current = start.to_path_buf();
        loop {
            if current.join(STATE_DIR).is_dir() {
                return Self::open(&current);
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => anyhow::bail!(
                    "Not a Constellation project (no {} directory found above {})",
                    STATE_DIR,
                    start.display()
                ),
            }
        }
    }

    fn at(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve project root {}", root.display()))?;
        let state_dir = root.join(STATE_DIR);
        Ok(Self { root, state_dir })
    }

    /// Project root (the tree being walked)
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Project name, taken from the root directory name
    pub fn project_name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string())
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join("config.toml")
    }

    pub fn db_path(&self) -> PathBuf {
        self.state_dir.join("state.db")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }
}

/// Atomic write helper
///
/// Writes data to a temporary file in `tmp_dir`, fsyncs it, then renames it
/// over `target`. `tmp_dir` must be on the same filesystem as `target`.
pub fn atomic_write(tmp_dir: &Path, target: &Path, data: &[u8]) -> Result<()> {
    fs::create_dir_all(tmp_dir)
        .with_context(|| format!("Failed to create {}", tmp_dir.display()))?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let tmp_path = tmp_dir.join(format!("{}.tmp", Ulid::new()));
    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, target)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result.with_context(|| format!("Failed to write {}", target.display()))?;

    #[cfg(unix)]
    if let Some(parent) = target.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

/// Normalize a relative path for storage
///
/// - Converts to a `/`-separated string
/// - Rejects `..` and absolute paths
/// - Drops `.` components; the root itself becomes `""`
pub fn normalize_path(path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(s) => parts.push(s),
                None => anyhow::bail!("Path is not valid UTF-8: {}", path.display()),
            },
            Component::CurDir => {}
            Component::ParentDir => anyhow::bail!("Path escapes the project root: {}", path.display()),
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("Expected a relative path: {}", path.display())
            }
        }
    }
    Ok(parts.join("/"))
}

/// Parent directory of a normalized path (`""` for top-level entries)
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Final component of a normalized path
pub fn file_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Current time in Unix milliseconds
pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
