//! One-shot architecture analysis: a single blocking call to an
//! OpenAI-compatible chat-completions endpoint, fed the rendered file tree
//! and a handful of important documents from the code context. The result
//! is stored alongside the session and injected into the initial prompt.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AnalysisConfig;
use crate::models::context::CodeContext;
use crate::utils::error::ApiError;

/// Documents worth showing the analyst regardless of extension.
const IMPORTANT_FILENAMES: [&str; 9] = [
    "README.md",
    "README",
    "README.txt",
    "go.mod",
    "package.json",
    "requirements.txt",
    "Cargo.toml",
    "Dockerfile",
    "LICENSE",
];

const DOC_EXTENSIONS: [&str; 7] = [".md", ".markdown", ".txt", ".rst", ".org", ".wiki", ".adoc"];

const MAX_DOCUMENTS: usize = 5;
const MAX_DOCUMENTS_PER_TYPE: usize = 1;
const MAX_DOCUMENT_CHARS: usize = 10 * 1024;
const MAX_TREE_LINES: usize = 50;

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a software architect. Analyze the project \
structure and documentation and produce a concise project analysis covering: \
1. the project's main purpose and features; \
2. the architectural patterns in use; \
3. key components and their responsibilities; \
4. the technology stack and dependencies; \
5. main interfaces and notable design choices. \
Keep it professional and clear, so another developer can understand the project quickly.";

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Clone)]
pub struct AnalysisService {
    client: Client,
    config: AnalysisConfig,
}

impl AnalysisService {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config: config.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.api_key.is_empty()
    }

    /// Generate the architecture analysis for a code context.
    pub async fn generate(&self, context: &CodeContext) -> Result<String, ApiError> {
        if !self.is_configured() {
            return Err(ApiError::UpstreamUnavailable(
                "analysis API key is not configured".to_string(),
            ));
        }

        let tree = truncate_lines(&context.file_tree.render(), MAX_TREE_LINES);
        let documents = collect_important_documents(context);
        debug!(
            document_count = documents.len(),
            tree_length = tree.len(),
            "requesting project analysis"
        );

        let mut docs_section = String::new();
        for (path, content) in &documents {
            docs_section.push_str(&format!("--- {path} ---\n{content}\n\n"));
        }

        let user_prompt = format!(
            "Analyze this project and provide a concise architecture overview.\n\n\
             1. Project directory structure:\n{tree}\n\n2. Project documentation:\n{docs_section}"
        );

        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: ANALYSIS_SYSTEM_PROMPT.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: user_prompt,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                ApiError::UpstreamUnavailable(format!("analysis request failed: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "analysis endpoint returned an error");
            if status.is_client_error() {
                return Err(ApiError::UpstreamRejected(format!(
                    "analysis endpoint rejected the request ({status}): {body}"
                )));
            }
            return Err(ApiError::UpstreamUnavailable(format!(
                "analysis endpoint error ({status}): {body}"
            )));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(|err| {
            ApiError::UpstreamUnavailable(format!("failed to decode analysis response: {err}"))
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                ApiError::UpstreamUnavailable("analysis endpoint returned no choices".to_string())
            })
    }
}

/// Pick up to five representative documents (one per type) from the
/// context: README-class files, manifests and plain documentation.
fn collect_important_documents(context: &CodeContext) -> Vec<(String, String)> {
    let mut documents = Vec::new();
    let mut per_type: HashMap<String, usize> = HashMap::new();

    for (path, content) in &context.file_contents {
        if documents.len() >= MAX_DOCUMENTS {
            break;
        }
        if content.is_base64 {
            continue;
        }

        let filename = path.rsplit('/').next().unwrap_or(path);
        let extension = filename
            .rfind('.')
            .map(|dot| filename[dot..].to_lowercase())
            .unwrap_or_default();

        let is_important = IMPORTANT_FILENAMES.contains(&filename);
        let is_doc = DOC_EXTENSIONS.contains(&extension.as_str());
        if !is_important && !is_doc {
            continue;
        }

        let type_key = if extension.is_empty() {
            filename.to_string()
        } else {
            extension.clone()
        };
        let seen = per_type.entry(type_key).or_insert(0);
        if *seen >= MAX_DOCUMENTS_PER_TYPE {
            continue;
        }
        *seen += 1;

        let mut body: String = content.content.chars().take(MAX_DOCUMENT_CHARS).collect();
        if body.len() < content.content.len() {
            body.push_str("\n... (content truncated) ...");
        }

        documents.push((path.clone(), body));
    }

    documents
}

fn truncate_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    let mut out = lines[..max_lines].join("\n");
    out.push_str("\n... (structure truncated) ...\n");
    out
}
