use axum::extract::{Extension, Query};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

use crate::models::chat::{
    AnswerResponse, AskRequest, CompletionInfo, ErrorInfo, MessageChunk, SessionInfo,
};
use crate::services::{ConversationRelay, StreamChunk};
use crate::utils::error::ApiError;

/// POST /api/ask — JSON body.
pub async fn ask_handler(
    Extension(relay): Extension<Arc<ConversationRelay>>,
    Json(request): Json<AskRequest>,
) -> Result<Response, ApiError> {
    answer_request(relay, request).await
}

/// GET /api/ask — query parameters, mainly for EventSource clients.
pub async fn ask_query_handler(
    Extension(relay): Extension<Arc<ConversationRelay>>,
    Query(request): Query<AskRequest>,
) -> Result<Response, ApiError> {
    answer_request(relay, request).await
}

async fn answer_request(
    relay: Arc<ConversationRelay>,
    request: AskRequest,
) -> Result<Response, ApiError> {
    if request.question.trim().is_empty() {
        return Err(ApiError::BadRequest("provide a question".to_string()));
    }

    info!(
        session_id = %request.session_id,
        question_length = request.question.len(),
        stream = request.stream,
        "code question received"
    );

    if request.stream {
        let chunks = relay
            .ask_stream(&request.session_id, &request.question)
            .await?;
        Ok(stream_response(request.session_id, chunks))
    } else {
        let answer = relay.ask(&request.session_id, &request.question).await?;
        info!(answer_length = answer.len(), "code question answered");
        Ok(Json(AnswerResponse {
            success: true,
            question: request.question,
            answer,
        })
        .into_response())
    }
}

/// Bridge relay chunks onto an SSE response. Dropping the response (client
/// disconnect) drops the receiver; the relay keeps draining upstream so the
/// answer is still persisted.
fn stream_response(session_id: String, mut chunks: mpsc::Receiver<StreamChunk>) -> Response {
    let start_time = Instant::now();

    let stream = async_stream::stream! {
        yield Ok::<Event, Infallible>(sse_event("session", &SessionInfo {
            session_id: session_id.clone(),
            timestamp: chrono::Utc::now(),
        }));

        while let Some(chunk) = chunks.recv().await {
            match chunk {
                StreamChunk::Delta(delta) => {
                    if !delta.is_empty() {
                        yield Ok::<Event, Infallible>(sse_event("message", &MessageChunk { delta }));
                    }
                }
                StreamChunk::Done { .. } => {
                    yield Ok(sse_event("done", &CompletionInfo {
                        session_id: session_id.clone(),
                        message_id: uuid::Uuid::new_v4().to_string(),
                        processing_time_ms: start_time.elapsed().as_millis() as u64,
                    }));
                    break;
                }
                StreamChunk::Error(message) => {
                    yield Ok(sse_event("error", &ErrorInfo {
                        code: "LLM_STREAM_ERROR".to_string(),
                        message,
                    }));
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn sse_event<T: serde::Serialize>(event_type: &str, data: &T) -> Event {
    Event::default()
        .event(event_type)
        .data(serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string()))
}
