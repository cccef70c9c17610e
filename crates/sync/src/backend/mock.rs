//! Offline backend with deterministic output

use async_trait::async_trait;
use constellation_core::store::current_timestamp_ms;
use constellation_core::{AnalysisSummary, Error};
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{concatenate, node_id, DiagramBackend, FileInput, GeneratedDiagram, GenerationRequest};

/// Produces a placeholder flowchart per scope without any network access
///
/// The output depends only on the request, so repeated runs over the same
/// tree produce identical diagrams.
#[derive(Debug, Default)]
pub struct MockBackend {
    summarize_calls: AtomicU64,
    describe_calls: AtomicU64,
    generate_calls: AtomicU64,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summarize_calls(&self) -> u64 {
        self.summarize_calls.load(Ordering::Relaxed)
    }

    pub fn describe_calls(&self) -> u64 {
        self.describe_calls.load(Ordering::Relaxed)
    }

    pub fn generate_calls(&self) -> u64 {
        self.generate_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DiagramBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn summarize(&self, input: &FileInput) -> Result<AnalysisSummary, Error> {
        self.summarize_calls.fetch_add(1, Ordering::Relaxed);
        let text = format!(
            "# Summary for {}\n\nThis is a mock summary.\nIt processes content of length: {} characters in {} lines.\n",
            input.path,
            input.content.chars().count(),
            input.content.lines().count()
        );
        Ok(AnalysisSummary {
            fingerprint: input.fingerprint,
            first_seen_path: input.path.clone(),
            text,
            created_at_ms: current_timestamp_ms(),
        })
    }

    async fn describe(&self, request: &GenerationRequest) -> Result<String, Error> {
        self.describe_calls.fetch_add(1, Ordering::Relaxed);
        let mut text = format!(
            "# Summary for {}\n\nThis is a mock summary.\nIt processes content of length: {} characters.\n",
            request.scope_id,
            concatenate(request).chars().count()
        );
        if request.linked_scopes.is_empty() {
            text.push_str("No child directories were processed.\n");
        } else {
            text.push_str("\nIt has the following child directories processed:\n");
            for link in &request.linked_scopes {
                let _ = writeln!(text, "- {} (Files: {})", link.scope_id, link.files);
            }
        }
        Ok(text)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedDiagram, Error> {
        self.generate_calls.fetch_add(1, Ordering::Relaxed);
        let scope = &request.scope_id;
        let content_len = concatenate(request).chars().count();

        let mut markup = format!(
            "```mermaid\n---\ntitle: Mock Flowchart for {scope}\n---\nflowchart TD\n    A[Start {scope}] --> B{{Contains {content_len} chars of content}};\n"
        );
        if request.linked_scopes.is_empty() {
            markup.push_str("    B --> C[No sub-directories]\n");
        }
        for (i, link) in request.linked_scopes.iter().enumerate() {
            let child = format!("Child{i}_{}", node_id(&link.scope_id));
            let _ = writeln!(markup, "    B --> {child}[{}]", link.scope_id);
            let _ = writeln!(
                markup,
                "    click {child} \"{}\" \"Go to {} diagram\" _self",
                link.href, link.scope_id
            );
        }
        markup.push_str("```\n");

        Ok(GeneratedDiagram { markup })
    }
}
