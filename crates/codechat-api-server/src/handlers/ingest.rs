use axum::extract::{Extension, Multipart, Query};
use axum::Json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::extract::{github, GithubClient, ZipExtractor};
use crate::models::chat::{GithubIngestParams, IngestFlags, IngestResponse};
use crate::models::context::CodeContext;
use crate::services::{AnalysisService, SessionStore};
use crate::utils::error::ApiError;

/// POST /api/context/upload — multipart ZIP upload. Creates a session
/// holding the extracted code context and returns its handle.
pub async fn upload_handler(
    Extension(extractor): Extension<Arc<ZipExtractor>>,
    Extension(analysis_service): Extension<Arc<AnalysisService>>,
    Extension(sessions): Extension<SessionStore>,
    Query(query_flags): Query<IngestFlags>,
    mut multipart: Multipart,
) -> Result<Json<IngestResponse>, ApiError> {
    let mut flags = query_flags;
    let mut archive: Option<Vec<u8>> = None;
    let mut filename = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(format!("failed to read field: {err}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "code_zip" => {
                filename = field.file_name().unwrap_or("upload.zip").to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::BadRequest(format!("failed to read file: {err}")))?;
                archive = Some(data.to_vec());
            }
            // Form fields override the query parameters, like the GET form.
            "generate_analysis" => {
                flags.generate_analysis = read_bool_field(field).await?;
            }
            "base64" => {
                flags.base64 = read_bool_field(field).await?;
            }
            "include_content" => {
                flags.include_content = read_bool_field(field).await?;
            }
            _ => {}
        }
    }

    let archive = archive.ok_or_else(|| {
        ApiError::BadRequest("upload a ZIP file in the 'code_zip' field".to_string())
    })?;
    if archive.is_empty() {
        return Err(ApiError::BadRequest("uploaded file is empty".to_string()));
    }

    info!(
        filename,
        size = archive.len(),
        generate_analysis = flags.generate_analysis,
        "processing uploaded archive"
    );

    let context = extractor.extract(&archive, flags.base64)?;
    finish_ingest(context, flags, &analysis_service, &sessions).await
}

/// GET /api/context/github — builds a session from a repository snapshot.
pub async fn github_handler(
    Extension(client): Extension<Arc<GithubClient>>,
    Extension(analysis_service): Extension<Arc<AnalysisService>>,
    Extension(sessions): Extension<SessionStore>,
    Query(params): Query<GithubIngestParams>,
) -> Result<Json<IngestResponse>, ApiError> {
    let (owner, repo) = github::parse_repo_url(&params.url)?;
    info!(owner, repo, "processing GitHub repository");

    let context = client
        .fetch_repo(&owner, &repo, params.token.as_deref(), params.base64)
        .await?;

    let flags = IngestFlags {
        generate_analysis: params.generate_analysis,
        base64: params.base64,
        include_content: params.include_content,
    };
    finish_ingest(context, flags, &analysis_service, &sessions).await
}

async fn finish_ingest(
    context: CodeContext,
    flags: IngestFlags,
    analysis_service: &AnalysisService,
    sessions: &SessionStore,
) -> Result<Json<IngestResponse>, ApiError> {
    if context.is_empty() {
        return Err(ApiError::BadRequest(
            "no usable text file content found".to_string(),
        ));
    }

    let analysis = if flags.generate_analysis && analysis_service.is_configured() {
        match analysis_service.generate(&context).await {
            Ok(analysis) => Some(analysis),
            Err(err) => {
                // Analysis is additive; ingestion still succeeds without it.
                warn!(error = %err, "project analysis generation failed");
                None
            }
        }
    } else {
        None
    };

    let file_tree = context.file_tree.render();
    let file_count = context.file_count();
    let result = flags.include_content.then(|| context.clone());
    let session_id = sessions.put(context, analysis.clone());

    info!(session_id = %session_id, file_count, "session created");

    Ok(Json(IngestResponse {
        success: true,
        session_id,
        file_count,
        file_tree,
        analysis,
        result,
    }))
}

async fn read_bool_field(field: axum::extract::multipart::Field<'_>) -> Result<bool, ApiError> {
    let text = field
        .text()
        .await
        .map_err(|err| ApiError::BadRequest(format!("invalid form field: {err}")))?;
    Ok(text == "true")
}
