use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::filter::ExtractionRules;
use crate::config::GithubConfig;
use crate::models::context::CodeContext;
use crate::utils::error::ApiError;

/// Accepts https://github.com/owner/repo, with or without .git, and the
/// git@github.com:owner/repo.git form.
static REPO_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:github\.com[:/])([\w-]+)/([\w.-]+?)(?:\.git)?/?$").unwrap());

const DEFAULT_BRANCHES: [&str; 2] = ["main", "master"];

pub fn parse_repo_url(url: &str) -> Result<(String, String), ApiError> {
    let captures = REPO_URL_RE
        .captures(url)
        .ok_or_else(|| ApiError::BadRequest(format!("unable to parse GitHub URL: {url}")))?;
    Ok((captures[1].to_string(), captures[2].to_string()))
}

#[derive(Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
}

#[derive(Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Deserialize)]
struct ContentsResponse {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct GithubErrorBody {
    message: String,
}

/// Builds a Code Context from a GitHub repository snapshot: the recursive
/// tree listing for structure, then file blobs for everything passing the
/// extraction rules.
pub struct GithubClient {
    client: Client,
    api_base: String,
    token: Option<String>,
    rules: Arc<ExtractionRules>,
}

impl GithubClient {
    pub fn new(config: &GithubConfig, rules: Arc<ExtractionRules>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent(concat!("codechat-api-server/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: Some(config.token.clone()).filter(|t| !t.is_empty()),
            rules,
        }
    }

    pub async fn fetch_repo(
        &self,
        owner: &str,
        repo: &str,
        token_override: Option<&str>,
        use_base64: bool,
    ) -> Result<CodeContext, ApiError> {
        let token = token_override
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| self.token.clone());

        let items = self.fetch_tree(owner, repo, token.as_deref()).await?;
        let mut context = CodeContext::new();
        let mut fetched = 0usize;

        // The tree shows everything, including files whose content is
        // skipped by the rules; content keys stay a subset of leaves.
        for item in &items {
            match item.kind.as_str() {
                "tree" => context.file_tree.add_dir(&item.path),
                "blob" => context.file_tree.add_path(&item.path),
                _ => {}
            }
        }

        for item in &items {
            if item.kind != "blob" {
                continue;
            }
            let size = item.size.unwrap_or(0);
            if self.rules.is_excluded(&item.path, size)
                || !self.rules.is_likely_text_file(&item.path)
            {
                continue;
            }
            if fetched >= self.rules.max_files() {
                return Err(ApiError::PayloadTooLarge(format!(
                    "repository exceeds the {} file limit",
                    self.rules.max_files()
                )));
            }

            match self
                .fetch_file(owner, repo, &item.path, token.as_deref())
                .await
            {
                Ok(raw) => {
                    if raw.len() as u64 > self.rules.max_file_size()
                        || ExtractionRules::looks_binary(&raw)
                    {
                        debug!(path = %item.path, "skipping oversized or binary blob");
                        continue;
                    }
                    context.insert_file(&item.path, raw, use_base64);
                    fetched += 1;
                    debug!(path = %item.path, "processed");
                }
                Err(err) => {
                    warn!(path = %item.path, error = %err, "failed to fetch file, skipping");
                }
            }
        }

        Ok(context)
    }

    /// Recursive tree listing, trying `main` then `master`.
    async fn fetch_tree(
        &self,
        owner: &str,
        repo: &str,
        token: Option<&str>,
    ) -> Result<Vec<TreeItem>, ApiError> {
        let mut last_error = String::new();

        for branch in DEFAULT_BRANCHES {
            let url = format!(
                "{}/repos/{owner}/{repo}/git/trees/{branch}?recursive=1",
                self.api_base
            );

            let mut request = self.client.get(&url);
            if let Some(token) = token {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                last_error = format!("branch {branch} not found");
                continue;
            }
            if !status.is_success() {
                last_error = match response.json::<GithubErrorBody>().await {
                    Ok(body) => format!("GitHub API error: {}", body.message),
                    Err(_) => format!("GitHub API error: {status}"),
                };
                continue;
            }

            match response.json::<TreeResponse>().await {
                Ok(parsed) => return Ok(parsed.tree),
                Err(err) => {
                    last_error = err.to_string();
                    continue;
                }
            }
        }

        Err(ApiError::UpstreamUnavailable(format!(
            "unable to fetch repository tree: {last_error}"
        )))
    }

    /// Single file blob via the contents API; GitHub returns base64 with
    /// embedded newlines.
    async fn fetch_file(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
        token: Option<&str>,
    ) -> Result<Vec<u8>, ApiError> {
        let url = format!("{}/repos/{owner}/{repo}/contents/{path}", self.api_base);

        let mut request = self.client.get(&url);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|err| {
            ApiError::UpstreamUnavailable(format!("GitHub request failed: {err}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<GithubErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => status.to_string(),
            };
            return Err(ApiError::UpstreamUnavailable(format!(
                "GitHub API error: {message}"
            )));
        }

        let contents: ContentsResponse = response.json().await.map_err(|err| {
            ApiError::UpstreamUnavailable(format!("failed to decode GitHub response: {err}"))
        })?;

        let compact: String = contents
            .content
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        BASE64.decode(compact).map_err(|err| {
            ApiError::UpstreamUnavailable(format!("failed to decode file content: {err}"))
        })
    }
}
