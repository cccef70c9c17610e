//! Generation backend port
//!
//! The engine talks to diagram generation through [`DiagramBackend`]. A
//! backend summarizes single files, then turns a scope's file summaries into
//! a markdown overview and mermaid markup. Timeouts and retries are imposed by the caller, so
//! adapters make exactly one attempt per call.

pub mod gemini;
pub mod mock;

pub use gemini::GeminiBackend;
pub use mock::MockBackend;

use async_trait::async_trait;
use constellation_core::{AnalysisSummary, Error, Fingerprint};
use std::fmt::Write;
use std::sync::Arc;

use crate::config::{BackendConfig, BackendKind};

/// One file handed to [`DiagramBackend::summarize`]
#[derive(Debug, Clone)]
pub struct FileInput {
    pub path: String,
    pub fingerprint: Fingerprint,
    /// File content, lossily decoded and possibly cut short
    pub content: String,
}

/// A file of the scope being generated, with its summary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFile {
    pub path: String,
    pub fingerprint: Fingerprint,
    pub summary: String,
}

/// A scope linked from the diagram being generated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeLink {
    pub scope_id: String,
    /// Link to the linked scope's exported diagram, relative to this one
    pub href: String,
    /// Overview from the linked scope's latest Clean version
    pub summary: Option<String>,
    /// Files the linked scope's latest Clean version was built from
    pub files: usize,
}

/// Everything needed to (re)generate one scope's diagram
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub scope_id: String,
    /// Owned files, ordered by path
    pub files: Vec<ScopeFile>,
    /// Markup of the last Clean version, if any
    pub prior_markup: Option<String>,
    pub linked_scopes: Vec<ScopeLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedDiagram {
    pub markup: String,
}

#[async_trait]
pub trait DiagramBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn summarize(&self, input: &FileInput) -> Result<AnalysisSummary, Error>;

    /// Markdown overview of a scope; `prior_markup` is not consulted
    async fn describe(&self, request: &GenerationRequest) -> Result<String, Error>;

    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedDiagram, Error>;
}

/// Build the backend selected by `config`
pub fn create_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn DiagramBackend>> {
    Ok(match config.kind {
        BackendKind::Mock => Arc::new(MockBackend::new()),
        BackendKind::Gemini => Arc::new(GeminiBackend::new(config)?),
    })
}

/// Validate raw backend output and make sure it is one mermaid code block
///
/// Empty output is rejected; a missing opening or closing fence is added.
pub fn normalize_markup(raw: &str) -> Result<String, Error> {
    let body = raw.trim();
    if body.is_empty() || body == "```mermaid" || body == "```" {
        return Err(Error::MalformedResponse("backend returned no diagram".into()));
    }

    let mut markup = String::with_capacity(body.len() + 16);
    if !body.starts_with("```mermaid") {
        markup.push_str("```mermaid\n");
    }
    markup.push_str(body);
    if !body.ends_with("```") {
        markup.push_str("\n```");
    }
    markup.push('\n');
    Ok(markup)
}

/// Reject an empty overview; otherwise return it trimmed with a final newline
pub fn normalize_summary(raw: &str) -> Result<String, Error> {
    let body = raw.trim();
    if body.is_empty() {
        return Err(Error::MalformedResponse("backend returned no summary".into()));
    }
    Ok(format!("{body}\n"))
}

/// Files of a request framed the way prompts frame them
pub fn concatenate(request: &GenerationRequest) -> String {
    let mut out = String::new();
    for file in &request.files {
        let _ = write!(
            out,
            "--- START FILE: {path} ---\n{body}\n--- END FILE: {path} ---\n\n",
            path = file.path,
            body = file.summary
        );
    }
    out
}

/// Mermaid node id for a path: separators and punctuation become `_`
pub fn node_id(path: &str) -> String {
    path.chars()
        .map(|c| match c {
            '/' | '.' | '-' | ' ' => '_',
            c => c,
        })
        .collect()
}
