//! Scratch project trees for integration tests

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// A project directory named `demo` inside a temporary directory
///
/// The fixed name keeps discovered scope ids stable: the root scope is
/// always `demo`.
pub struct TestProject {
    temp: TempDir,
    root: PathBuf,
}

impl TestProject {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new()?;
        let root = temp.path().join("demo");
        fs::create_dir_all(&root)?;
        Ok(Self { temp, root })
    }

    /// A small project with one subdirectory
    pub fn with_sources() -> Result<Self> {
        let project = Self::new()?;
        project.write("README.md", "# Demo\n")?;
        project.write("src/main.rs", "fn main() {\n    println!(\"hello\");\n}\n")?;
        project.write("src/lib.rs", "pub fn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n")?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch space outside the project tree
    pub fn outside(&self) -> PathBuf {
        self.temp.path().join("outside")
    }

    pub fn write(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn remove(&self, rel: &str) -> Result<()> {
        let path = self.root.join(rel);
        if path.is_dir() {
            fs::remove_dir_all(path)?;
        } else {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Replace `.constellation/config.toml`
    pub fn configure(&self, toml: &str) -> Result<()> {
        fs::write(self.root.join(".constellation/config.toml"), toml)?;
        Ok(())
    }
}
