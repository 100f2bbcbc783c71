//! Gemini gateway: the outbound `generateContent` call, blocking and
//! streamed, with bounded retries and exponential backoff. Retries cover
//! transport errors, 5xx responses, decode failures and empty candidate
//! sets; 4xx responses and a model-signaled block are terminal. A stream
//! is only retried before the first fragment has been forwarded.

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::GeminiConfig;

/// Channel capacity for streamed chunks.
const STREAM_CHANNEL_CAPACITY: usize = 100;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gemini API key is not configured")]
    MissingApiKey,

    #[error("upstream rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("prompt blocked by the model: {0}")]
    Blocked(String),

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("upstream request failed after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

/// One fragment of a streamed answer. Terminal variants close the stream.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Delta(String),
    Done { finish_reason: Option<String> },
    Error(String),
}

// ===== WIRE SHAPES =====

#[derive(Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GenerateContentResponse {
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Candidate {
    content: CandidateContent,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CandidateContent {
    parts: Vec<TextPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TextPart {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PromptFeedback {
    block_reason: Option<String>,
}

fn request_body(prompt: &str, stream: bool) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            parts: vec![Part {
                text: prompt.to_string(),
            }],
        }],
        stream,
    }
}

fn first_candidate_text(response: &GenerateContentResponse) -> Option<String> {
    response
        .candidates
        .first()
        .and_then(|candidate| candidate.content.parts.first())
        .map(|part| part.text.clone())
}

fn block_reason(response: &GenerateContentResponse) -> Option<String> {
    response
        .prompt_feedback
        .as_ref()
        .and_then(|feedback| feedback.block_reason.clone())
        .filter(|reason| !reason.is_empty())
}

// ===== CLIENT =====

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    api_url: String,
    max_retries: u32,
    retry_base_delay: Duration,
    stream_max_retries: u32,
}

impl GeminiClient {
    pub fn new(config: &GeminiConfig) -> Self {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds));

        // An explicit proxy wins over ambient HTTP(S)_PROXY settings, which
        // reqwest picks up on its own. An invalid URL falls back to ambient.
        if let Some(proxy_url) = config.proxy_url.as_deref().filter(|u| !u.is_empty()) {
            match reqwest::Proxy::all(proxy_url) {
                Ok(proxy) => {
                    info!(proxy_url, "using configured Gemini API proxy");
                    builder = builder.proxy(proxy);
                }
                Err(err) => {
                    warn!(proxy_url, error = %err, "invalid proxy URL, falling back to system proxy");
                }
            }
        }

        Self {
            client: builder.build().unwrap_or_else(|_| Client::new()),
            api_key: config.api_key.clone(),
            api_url: format!("{}/{}:generateContent", config.api_endpoint, config.model),
            max_retries: config.max_retries.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            stream_max_retries: config.stream_max_retries.max(1),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Blocking call: send the prompt, return the full answer text.
    pub async fn generate(&self, prompt: &str) -> Result<String, GatewayError> {
        if self.api_key.is_empty() {
            return Err(GatewayError::MissingApiKey);
        }

        debug!(prompt_length = prompt.len(), "sending prompt to Gemini");
        let body = request_body(prompt, false);
        let mut delay = self.retry_base_delay;

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                info!(attempt, max_retries = self.max_retries, "retrying Gemini request");
                sleep(delay).await;
                delay *= 2;
            }

            let sent = self
                .client
                .post(&self.api_url)
                .query(&[("key", self.api_key.as_str())])
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, attempt, "Gemini request failed");
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                if status.is_server_error() {
                    warn!(status = %status, attempt, "Gemini server error");
                    continue;
                }
                return Err(GatewayError::Rejected {
                    status: status.as_u16(),
                    body: text,
                });
            }

            let parsed: GenerateContentResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(error = %err, attempt, "failed to decode Gemini response");
                    continue;
                }
            };

            if let Some(reason) = block_reason(&parsed) {
                return Err(GatewayError::Blocked(reason));
            }

            match first_candidate_text(&parsed) {
                Some(text) if !text.is_empty() => {
                    debug!(
                        response_length = text.len(),
                        finish_reason = ?parsed.candidates.first().and_then(|c| c.finish_reason.as_deref()),
                        "received Gemini response"
                    );
                    return Ok(text);
                }
                _ => {
                    warn!(attempt, "Gemini returned an empty candidate set");
                    continue;
                }
            }
        }

        Err(GatewayError::Exhausted {
            attempts: self.max_retries,
        })
    }

    /// Streaming call: returns a channel immediately; a background task
    /// parses the SSE body into chunks. Once a fragment has been forwarded
    /// the stream is committed and failures become a terminal error chunk.
    pub async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<mpsc::Receiver<StreamChunk>, GatewayError> {
        if self.api_key.is_empty() {
            return Err(GatewayError::MissingApiKey);
        }

        debug!(prompt_length = prompt.len(), "opening Gemini stream");
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let client = self.client.clone();
        let api_url = self.api_url.clone();
        let api_key = self.api_key.clone();
        let max_retries = self.stream_max_retries;
        let base_delay = self.retry_base_delay;
        let body = request_body(prompt, true);

        tokio::spawn(async move {
            let mut delay = base_delay;
            let mut committed = false;

            for attempt in 1..=max_retries {
                if attempt > 1 {
                    info!(attempt, max_retries, "retrying Gemini stream request");
                    sleep(delay).await;
                    delay *= 2;
                }

                let sent = client
                    .post(&api_url)
                    .query(&[("key", api_key.as_str()), ("alt", "sse")])
                    .header(ACCEPT, "text/event-stream")
                    .json(&body)
                    .send()
                    .await;

                let response = match sent {
                    Ok(response) => response,
                    Err(err) => {
                        if attempt < max_retries {
                            warn!(error = %err, attempt, "Gemini stream request failed");
                            continue;
                        }
                        let _ = tx
                            .send(StreamChunk::Error(format!("request failed: {err}")))
                            .await;
                        return;
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    if status.is_server_error() && attempt < max_retries {
                        warn!(status = %status, attempt, "Gemini stream server error");
                        continue;
                    }
                    let _ = tx
                        .send(StreamChunk::Error(upstream_error_message(status, &text)))
                        .await;
                    return;
                }

                match relay_sse_body(response, &tx, &mut committed).await {
                    Ok(()) => return,
                    Err(err) => {
                        if !committed && attempt < max_retries {
                            warn!(error = %err, attempt, "stream failed before first chunk, retrying");
                            continue;
                        }
                        let _ = tx.send(StreamChunk::Error(err)).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn upstream_error_message(status: StatusCode, body: &str) -> String {
    format!("upstream error ({status}): {body}")
}

enum LineOutcome {
    Continue,
    Finished,
}

/// Relay one SSE response body: line-buffer the byte stream, decode
/// `data: ` frames and push the corresponding chunks. The response body is
/// dropped (connection released) on every exit path.
async fn relay_sse_body(
    response: Response,
    tx: &mpsc::Sender<StreamChunk>,
    committed: &mut bool,
) -> Result<(), String> {
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(next) = stream.next().await {
        let bytes = next.map_err(|err| format!("stream read failed: {err}"))?;
        buffer.push_str(&String::from_utf8_lossy(&bytes));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);
            if let LineOutcome::Finished = handle_sse_line(&line, tx, committed).await {
                return Ok(());
            }
        }
    }

    // Flush a trailing line without a newline, then treat EOF as end of
    // stream even without an explicit terminator.
    if !buffer.is_empty() {
        let line = buffer.trim_end_matches('\r').to_string();
        if let LineOutcome::Finished = handle_sse_line(&line, tx, committed).await {
            return Ok(());
        }
    }

    let _ = tx
        .send(StreamChunk::Done {
            finish_reason: None,
        })
        .await;
    Ok(())
}

async fn handle_sse_line(
    line: &str,
    tx: &mpsc::Sender<StreamChunk>,
    committed: &mut bool,
) -> LineOutcome {
    // Blank lines and non-data fields are frame separators and metadata.
    let Some(data) = line.strip_prefix("data: ") else {
        return LineOutcome::Continue;
    };

    if data == "[DONE]" {
        let _ = tx
            .send(StreamChunk::Done {
                finish_reason: None,
            })
            .await;
        return LineOutcome::Finished;
    }

    let parsed: GenerateContentResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(error = %err, "skipping malformed stream event");
            return LineOutcome::Continue;
        }
    };

    if let Some(reason) = block_reason(&parsed) {
        let _ = tx
            .send(StreamChunk::Error(format!("prompt blocked: {reason}")))
            .await;
        return LineOutcome::Finished;
    }

    let finish_reason = parsed
        .candidates
        .first()
        .and_then(|candidate| candidate.finish_reason.clone())
        .filter(|reason| !reason.is_empty());

    if let Some(text) = first_candidate_text(&parsed) {
        *committed = true;
        if !text.is_empty() && tx.send(StreamChunk::Delta(text)).await.is_err() {
            // Receiver gone; nothing left to forward.
            return LineOutcome::Finished;
        }
    }

    if let Some(reason) = finish_reason {
        let _ = tx
            .send(StreamChunk::Done {
                finish_reason: Some(reason),
            })
            .await;
        return LineOutcome::Finished;
    }

    LineOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server_uri: &str) -> GeminiConfig {
        GeminiConfig {
            api_key: "test-key".to_string(),
            api_endpoint: format!("{server_uri}/models"),
            model: "gemini-pro".to_string(),
            proxy_url: None,
            timeout_seconds: 5,
            connect_timeout_seconds: 5,
            max_retries: 3,
            retry_base_delay_ms: 5,
            stream_max_retries: 2,
        }
    }

    fn success_body(text: &str) -> serde_json::Value {
        json!({
            "candidates": [{
                "content": { "parts": [{ "text": text }] },
                "finishReason": "STOP"
            }]
        })
    }

    async fn collect_chunks(mut rx: mpsc::Receiver<StreamChunk>) -> Vec<StreamChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn test_generate_retries_transient_errors_then_succeeds() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body("recovered")))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        let answer = client.generate("hello").await.expect("should recover");
        assert_eq!(answer, "recovered");
    }

    #[tokio::test]
    async fn test_generate_does_not_retry_client_errors() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad prompt"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        match client.generate("hello").await {
            Err(GatewayError::Rejected { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad prompt");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_blocked_prompt_is_terminal() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [],
                "promptFeedback": { "blockReason": "SAFETY" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        match client.generate("hello").await {
            Err(GatewayError::Blocked(reason)) => assert_eq!(reason, "SAFETY"),
            other => panic!("expected Blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_exhausts_retries_on_empty_candidates() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "candidates": [] })))
            .expect(3)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        match client.generate("hello").await {
            Err(GatewayError::Exhausted { attempts }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_generate_without_api_key() {
        let mut config = test_config("http://localhost:0");
        config.api_key = String::new();
        let client = GeminiClient::new(&config);
        assert!(matches!(
            client.generate("hello").await,
            Err(GatewayError::MissingApiKey)
        ));
    }

    #[tokio::test]
    async fn test_stream_delivers_chunks_then_done() {
        let server = MockServer::start().await;

        let frame_one = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hel" }] } }]
        });
        let frame_two = json!({
            "candidates": [{ "content": { "parts": [{ "text": "lo" }] } }]
        });
        let body = format!("data: {frame_one}\n\ndata: {frame_two}\n\ndata: [DONE]\n\n");

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .and(query_param("alt", "sse"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        let rx = client.generate_stream("hello").await.expect("stream opens");
        let chunks = collect_chunks(rx).await;

        assert_eq!(chunks.len(), 3);
        assert!(matches!(&chunks[0], StreamChunk::Delta(t) if t == "Hel"));
        assert!(matches!(&chunks[1], StreamChunk::Delta(t) if t == "lo"));
        assert!(matches!(&chunks[2], StreamChunk::Done { .. }));
    }

    #[tokio::test]
    async fn test_stream_finish_reason_terminates() {
        let server = MockServer::start().await;

        let frame = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "full answer" }] },
                "finishReason": "STOP"
            }]
        });
        let body = format!("data: {frame}\n\n");

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        let rx = client.generate_stream("hello").await.expect("stream opens");
        let chunks = collect_chunks(rx).await;

        assert_eq!(chunks.len(), 2);
        assert!(matches!(&chunks[0], StreamChunk::Delta(t) if t == "full answer"));
        assert!(
            matches!(&chunks[1], StreamChunk::Done { finish_reason: Some(r) } if r == "STOP")
        );
    }

    #[tokio::test]
    async fn test_stream_retries_before_commit() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        let frame = json!({
            "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }]
        });
        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(format!("data: {frame}\n\ndata: [DONE]\n\n"), "text/event-stream"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        let rx = client.generate_stream("hello").await.expect("stream opens");
        let chunks = collect_chunks(rx).await;

        assert!(matches!(&chunks[0], StreamChunk::Delta(t) if t == "ok"));
        assert!(matches!(chunks.last(), Some(StreamChunk::Done { .. })));
    }

    #[tokio::test]
    async fn test_stream_error_after_retries_is_terminal_chunk() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/models/gemini-pro:generateContent"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let client = GeminiClient::new(&test_config(&server.uri()));
        let rx = client.generate_stream("hello").await.expect("stream opens");
        let chunks = collect_chunks(rx).await;

        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], StreamChunk::Error(_)));
    }

    #[test]
    fn test_response_parsing_helpers() {
        let parsed: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(first_candidate_text(&parsed).as_deref(), Some("hi"));
        assert!(block_reason(&parsed).is_none());

        let blocked: GenerateContentResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        assert_eq!(block_reason(&blocked).as_deref(), Some("SAFETY"));
        assert!(first_candidate_text(&blocked).is_none());
    }
}
