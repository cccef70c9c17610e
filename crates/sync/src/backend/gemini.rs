//! Google Generative Language API backend

use anyhow::Context;
use async_trait::async_trait;
use constellation_core::store::current_timestamp_ms;
use constellation_core::{AnalysisSummary, Error};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt::Write;
use tracing::{debug, warn};

use super::{
    concatenate, node_id, normalize_markup, normalize_summary, DiagramBackend, FileInput, GeneratedDiagram,
    GenerationRequest,
};
use crate::config::BackendConfig;

const TRUNCATION_MARKER: &str = "\n... (content truncated)";

pub struct GeminiBackend {
    client: Client,
    endpoint: String,
    model: String,
    api_key_env: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    max_content_chars: usize,
}

/// Request body for `models/{model}:generateContent`
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'a str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl GeminiBackend {
    /// Build the client; the API key is read from `config.api_key_env` now
    /// but only required when a call is made
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("constellation/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        let model = config
            .model
            .strip_prefix("models/")
            .unwrap_or(&config.model)
            .to_string();
        let api_key = env::var(&config.api_key_env).ok().filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(var = %config.api_key_env, "Gemini API key not set; backend calls will fail");
        }

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model,
            api_key_env: config.api_key_env.clone(),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_content_chars: config.max_content_chars,
        })
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }

    /// Cut `content` to the configured number of characters
    fn truncate(&self, content: &str) -> String {
        match content.char_indices().nth(self.max_content_chars) {
            Some((cut, _)) => {
                debug!(
                    chars = content.chars().count(),
                    limit = self.max_content_chars,
                    "prompt content truncated"
                );
                format!("{}{TRUNCATION_MARKER}", &content[..cut])
            }
            None => content.to_string(),
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String, Error> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| Error::Backend(format!("{} environment variable not set", self.api_key_env)))?;

        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_tokens,
            },
        };

        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("Gemini API request failed: {e}")))?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .map_err(|e| Error::Backend(format!("Failed to read Gemini API response: {e}")))?;

        if !status.is_success() {
            let msg = serde_json::from_str::<ApiError>(&response_text)
                .map(|e| e.error.message)
                .unwrap_or(response_text);
            return Err(Error::Backend(format!("Gemini API error ({}): {msg}", status.as_u16())));
        }

        let parsed: GenerateContentResponse = serde_json::from_str(&response_text)
            .map_err(|e| Error::MalformedResponse(format!("Failed to parse Gemini API response: {e}")))?;
        extract_text(parsed)
    }
}

fn extract_text(response: GenerateContentResponse) -> Result<String, Error> {
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| Error::MalformedResponse("no candidates returned".into()))?;
    let text: String = candidate
        .content
        .map(|content| content.parts.into_iter().map(|part| part.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
        return Err(Error::MalformedResponse(format!("empty candidate (finish reason: {reason})")));
    }
    Ok(text)
}

fn summary_prompt(path: &str, content: &str) -> String {
    format!(
        r#"
You are an expert software engineering assistant. Your task is to analyze the provided content of a file to generate a concise, markdown-formatted summary.

File under analysis: '{path}'

The content of '{path}' is as follows:
---
{content}
---

Based on the content of '{path}':
1.  Write a brief overview of the primary purpose and responsibility of the file.
2.  Identify and list the key functions, types or components it defines and briefly describe their role.
3.  If there are notable interactions or dependencies revealed by the content (e.g., imports, exported functions), mention them.

Format the entire output as a single Markdown block. Do not include any preamble or explanation outside the markdown.
Start with a heading like: # Summary for {path}
"#
    )
}

fn scope_summary_prompt(request: &GenerationRequest, content: &str) -> String {
    let scope = &request.scope_id;
    let mut prompt = format!(
        r#"
You are an expert software engineering assistant. Your task is to analyze the summaries of the files in a part of a codebase, together with the summaries of its related parts, to generate a concise, markdown-formatted summary.

Part under analysis: '{scope}'

The summaries of the files in '{scope}' are as follows:
---
{content}
---

This part has the following related parts that have already been processed.
Their summaries are (if any):
"#
    );

    if request.linked_scopes.is_empty() {
        prompt.push_str("No related parts were processed or their summaries are not available.\n");
    }
    for link in &request.linked_scopes {
        let _ = write!(
            prompt,
            "\n- Related part: '{}'\n  - Files Aggregated: {}\n  - Summary: {}\n",
            link.scope_id,
            link.files,
            link.summary.as_deref().unwrap_or("Not available")
        );
    }

    let _ = write!(
        prompt,
        r#"
Based on the file summaries of '{scope}' and the information about its related parts:
1.  Write a brief overview of the primary purpose and responsibility of '{scope}'.
2.  Identify and list the key files or components within '{scope}' and briefly describe their role.
3.  If there are notable interactions or dependencies revealed by the summaries (e.g., one file uses another, a module exports key functions), mention them.
4.  Conclude with a high-level statement about how '{scope}' fits into the larger project structure, considering its related parts if applicable.

Format the entire output as a single Markdown block. Do not include any preamble or explanation outside the markdown.
Start with a heading like: # Summary for {scope}
"#
    );
    prompt
}

fn mermaid_prompt(request: &GenerationRequest, content: &str) -> String {
    let scope = &request.scope_id;
    let mut prompt = format!(
        r#"
You are an expert software engineering assistant specializing in creating Mermaid.js diagrams.
Your task is to generate a Mermaid.js 'flowchart TD' (Top-Down) diagram based on the summaries of the files in a part of a codebase and information about the related parts.

Part under analysis: '{scope}'

The summaries of the files in '{scope}' are as follows:
---
{content}
---

This part links to the following related parts, which have their own diagrams:
"#
    );

    if request.linked_scopes.is_empty() {
        prompt.push_str("No related parts.\n");
    }
    for (i, link) in request.linked_scopes.iter().enumerate() {
        let _ = write!(
            prompt,
            "\n- Related part {}:\n  - Path: '{}'\n  - Node ID suggestion: '{}_node'\n  - Link to its diagram: '{}'\n",
            i + 1,
            link.scope_id,
            node_id(&link.scope_id),
            link.href
        );
    }

    if let Some(prior) = &request.prior_markup {
        let _ = write!(
            prompt,
            "\nThe current diagram for '{scope}' is shown below. Update it to match the summaries above, keeping node ids and layout where they still apply:\n{prior}\n"
        );
    }

    let _ = write!(
        prompt,
        r#"
Instructions for the Mermaid Diagram:
1.  The diagram MUST be a 'flowchart TD'.
2.  Create a title for the diagram using '--- title: Flowchart for {scope} ---'.
3.  Represent the main components, files, or logical blocks within '{scope}' as nodes in the flowchart.
4.  Show the primary interactions or data flow between these components/files within '{scope}'.
5.  If '{scope}' has related parts (listed above), represent each one as a distinct node.
    - The text for each related node should be its path (e.g., 'src/utils').
    - Make these nodes clickable to link to their respective diagrams.
      Example: click YOUR_NODE_ID_HERE "./child_relative_path/mermaid.md" "Go to child_relative_path diagram" _self
6.  Connect the representation of '{scope}'s internal logic to the related nodes where appropriate. If the relationship is not clear, connect them from a general node representing '{scope}' itself.
7.  Keep the diagram relatively high-level. Focus on the most important aspects and relationships.
8.  Ensure the output is ONLY the Mermaid code block, starting with ```mermaid and ending with ```. No other text or explanation.

Generate the Mermaid.js 'flowchart TD' code block now.
"#
    );
    prompt
}

#[async_trait]
impl DiagramBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn summarize(&self, input: &FileInput) -> Result<AnalysisSummary, Error> {
        let prompt = summary_prompt(&input.path, &self.truncate(&input.content));
        let text = self.complete(&prompt).await?;
        Ok(AnalysisSummary {
            fingerprint: input.fingerprint,
            first_seen_path: input.path.clone(),
            text,
            created_at_ms: current_timestamp_ms(),
        })
    }

    async fn describe(&self, request: &GenerationRequest) -> Result<String, Error> {
        let content = self.truncate(&concatenate(request));
        let raw = self.complete(&scope_summary_prompt(request, &content)).await?;
        normalize_summary(&raw)
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedDiagram, Error> {
        let content = self.truncate(&concatenate(request));
        let prompt = mermaid_prompt(request, &content);
        let raw = self.complete(&prompt).await?;
        Ok(GeneratedDiagram {
            markup: normalize_markup(&raw)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScopeFile, ScopeLink};
    use crate::config::BackendKind;
    use constellation_core::hash::hash_bytes;

    fn backend(max_content_chars: usize) -> GeminiBackend {
        let config = BackendConfig {
            kind: BackendKind::Gemini,
            model: "models/gemini-test".into(),
            api_key_env: "CST_TEST_KEY_THAT_IS_NEVER_SET".into(),
            endpoint: "http://127.0.0.1:9/v1beta/".into(),
            max_content_chars,
            ..BackendConfig::default()
        };
        GeminiBackend::new(&config).unwrap()
    }

    #[test]
    fn test_url_strips_model_prefix() {
        assert_eq!(
            backend(10).url(),
            "http://127.0.0.1:9/v1beta/models/gemini-test:generateContent"
        );
    }

    #[test]
    fn test_truncate_marks_cut_content() {
        let b = backend(5);
        assert_eq!(b.truncate("abc"), "abc");
        assert_eq!(b.truncate("abcdef"), "abcde\n... (content truncated)");
        assert_eq!(b.truncate("ééééééé"), "ééééé\n... (content truncated)");
    }

    #[test]
    fn test_request_body_shape() {
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part { text: "hi" }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.5,
                max_output_tokens: 100,
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn test_extract_text() {
        let ok: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"flow"},{"text":"chart"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(extract_text(ok).unwrap(), "flowchart");

        let none: GenerateContentResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(matches!(extract_text(none), Err(Error::MalformedResponse(_))));

        let blocked: GenerateContentResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"SAFETY"}]}"#).unwrap();
        let err = extract_text(blocked).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn test_prompts_list_linked_scopes() {
        let request = GenerationRequest {
            scope_id: "src".into(),
            files: vec![ScopeFile {
                path: "src/lib.rs".into(),
                fingerprint: hash_bytes(b"x"),
                summary: "lib".into(),
            }],
            prior_markup: Some("```mermaid\nflowchart TD\n```".into()),
            linked_scopes: vec![ScopeLink {
                scope_id: "src/api".into(),
                href: "./api/mermaid.md".into(),
                summary: Some("Request handlers.".into()),
                files: 3,
            }],
        };
        let prompt = mermaid_prompt(&request, &concatenate(&request));
        assert!(prompt.contains("--- START FILE: src/lib.rs ---"));
        assert!(prompt.contains("Node ID suggestion: 'src_api_node'"));
        assert!(prompt.contains("Link to its diagram: './api/mermaid.md'"));
        assert!(prompt.contains("The current diagram for 'src'"));
        assert!(prompt.contains("--- title: Flowchart for src ---"));

        let summary = scope_summary_prompt(&request, &concatenate(&request));
        assert!(summary.contains("Part under analysis: 'src'"));
        assert!(summary.contains("- Related part: 'src/api'\n  - Files Aggregated: 3\n  - Summary: Request handlers.\n"));
        assert!(summary.contains("Start with a heading like: # Summary for src"));
        assert!(!summary.contains("```mermaid"));
    }

    #[tokio::test]
    async fn test_missing_key_is_a_backend_error() {
        let b = backend(100);
        let input = FileInput {
            path: "a.rs".into(),
            fingerprint: hash_bytes(b"a"),
            content: "a".into(),
        };
        let err = b.summarize(&input).await.unwrap_err();
        assert!(err.is_backend());
        assert!(err.to_string().contains("CST_TEST_KEY_THAT_IS_NEVER_SET"));
    }
}
