//! Project configuration (`.constellation/config.toml`)
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. Values are range-checked by [`Config::validate`] after
//! loading and before saving.

use anyhow::{Context, Result};
use constellation_core::store::atomic_write;
use constellation_core::CATCH_ALL_SCOPE;
use constellation_journal::RetentionPolicy;
use constellation_walker::ExcludeConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Complete project configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub walk: ExcludeConfig,
    pub sync: SyncConfig,
    pub retention: RetentionPolicy,
    pub backend: BackendConfig,
    pub scopes: Vec<ScopeConfig>,
    pub export: ExportConfig,
}

/// Update scheduling settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of scopes refreshed at once (1-64)
    pub concurrency: usize,
    /// Attempts per backend call, the first one included (1-10)
    pub max_attempts: u32,
    /// Delay before the first retry, doubled on every further retry
    pub base_delay_ms: u64,
    /// Cap on the delay between retries
    pub max_delay_ms: u64,
    /// Timeout applied to each backend call (1-600)
    pub timeout_secs: u64,
    /// Bytes of a file sent to the backend; the rest is cut off
    pub max_content_bytes: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            timeout_secs: 60,
            max_content_bytes: 256 * 1024,
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Which generation backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Deterministic offline output
    #[default]
    Mock,
    /// Google Generative Language API
    Gemini,
}

/// Generation backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub endpoint: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Characters of prompt content before truncation
    pub max_content_chars: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Mock,
            model: "gemini-1.5-flash-latest".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            max_content_chars: 50_000,
        }
    }
}

/// One `[[scopes]]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub id: String,
    /// Path prefixes (`src/api`) or globs (`src/**/*.rs`)
    pub paths: Vec<String>,
    /// Directories whose direct file children belong to the scope
    pub directories: Vec<String>,
    /// Scopes whose changes also refresh this one
    pub depends_on: Vec<String>,
}

/// Export of Clean diagrams to a mirrored tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Output root, relative to the project root unless absolute
    pub output_dir: Option<PathBuf>,
    /// Export after every scan
    pub auto: bool,
}

impl Config {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Validate, then write atomically
    pub fn save(&self, path: &Path, tmp_dir: &Path) -> Result<()> {
        self.validate().context("Refusing to save invalid configuration")?;
        let content = self.to_toml()?;
        atomic_write(tmp_dir, path, content.as_bytes())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Check value ranges and scope references
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if !(1..=64).contains(&sync.concurrency) {
            anyhow::bail!("sync.concurrency must be between 1 and 64, got {}", sync.concurrency);
        }
        if !(1..=10).contains(&sync.max_attempts) {
            anyhow::bail!("sync.max_attempts must be between 1 and 10, got {}", sync.max_attempts);
        }
        if sync.base_delay_ms > sync.max_delay_ms {
            anyhow::bail!(
                "sync.base_delay_ms ({}) must not exceed sync.max_delay_ms ({})",
                sync.base_delay_ms,
                sync.max_delay_ms
            );
        }
        if !(1..=600).contains(&sync.timeout_secs) {
            anyhow::bail!("sync.timeout_secs must be between 1 and 600, got {}", sync.timeout_secs);
        }
        if sync.max_content_bytes == 0 {
            anyhow::bail!("sync.max_content_bytes must be positive");
        }

        if self.retention.keep_snapshots < 2 {
            anyhow::bail!(
                "retention.keep_snapshots must be at least 2, got {}",
                self.retention.keep_snapshots
            );
        }

        let backend = &self.backend;
        if !(0.0..=2.0).contains(&backend.temperature) {
            anyhow::bail!("backend.temperature must be between 0.0 and 2.0, got {}", backend.temperature);
        }
        if backend.max_tokens == 0 {
            anyhow::bail!("backend.max_tokens must be positive");
        }
        if backend.max_content_chars == 0 {
            anyhow::bail!("backend.max_content_chars must be positive");
        }
        if backend.kind == BackendKind::Gemini && backend.model.trim().is_empty() {
            anyhow::bail!("backend.model is required for the gemini backend");
        }

        let mut ids = BTreeSet::new();
        for scope in &self.scopes {
            if scope.id.trim().is_empty() {
                anyhow::bail!("Every [[scopes]] entry needs an id");
            }
            if scope.id == CATCH_ALL_SCOPE {
                anyhow::bail!("Scope id '{CATCH_ALL_SCOPE}' is reserved for unmapped paths");
            }
            if !ids.insert(scope.id.as_str()) {
                anyhow::bail!("Duplicate scope id '{}'", scope.id);
            }
            if scope.paths.is_empty() && scope.directories.is_empty() {
                anyhow::bail!("Scope '{}' has no paths or directories", scope.id);
            }
        }
        for scope in &self.scopes {
            for dep in &scope.depends_on {
                if dep != CATCH_ALL_SCOPE && !ids.contains(dep.as_str()) {
                    anyhow::bail!("Scope '{}' depends on unknown scope '{}'", scope.id, dep);
                }
            }
        }

        Ok(())
    }
}

/// Annotated example configuration
pub fn example_config() -> &'static str {
    r#"# Constellation configuration (.constellation/config.toml)

[walk]
# Honor the project's .gitignore and .cstignore files
use_gitignore = true
use_cstignore = true
# Extra gitignore-style exclusions
exclude = ["*.lock", "dist/"]
# Only track these extensions (empty = every file)
extensions = ["rs", "toml", "md"]

[sync]
concurrency = 4          # 1-64 scopes refreshed at once
max_attempts = 3         # 1-10 attempts per backend call
base_delay_ms = 500      # first retry delay, doubled each retry
max_delay_ms = 8000      # retry delay cap
timeout_secs = 60        # 1-600 per backend call
max_content_bytes = 262144

[retention]
keep_snapshots = 2       # at least 2

[backend]
kind = "gemini"          # "mock" or "gemini"
model = "gemini-1.5-flash-latest"
api_key_env = "GEMINI_API_KEY"
endpoint = "https://generativelanguage.googleapis.com/v1beta"
temperature = 0.7
max_tokens = 2048
max_content_chars = 50000

# Without [[scopes]], one diagram per directory is maintained.
[[scopes]]
id = "api"
paths = ["src/api"]

[[scopes]]
id = "storage"
paths = ["src/db/**/*.rs"]
directories = ["migrations"]

[[scopes]]
id = "overview"
directories = ["src"]
depends_on = ["api", "storage"]

[export]
output_dir = "docs/diagrams"
auto = false
"#
}
