use std::io::{Cursor, Read};
use std::sync::Arc;
use tracing::{debug, warn};
use zip::ZipArchive;

use super::filter::ExtractionRules;
use crate::models::context::CodeContext;
use crate::utils::error::ApiError;

/// Builds a Code Context from an uploaded ZIP archive held in memory.
pub struct ZipExtractor {
    rules: Arc<ExtractionRules>,
}

impl ZipExtractor {
    pub fn new(rules: Arc<ExtractionRules>) -> Self {
        Self { rules }
    }

    pub fn extract(&self, data: &[u8], use_base64: bool) -> Result<CodeContext, ApiError> {
        let mut archive = ZipArchive::new(Cursor::new(data))
            .map_err(|err| ApiError::BadRequest(format!("unable to read ZIP archive: {err}")))?;

        let mut context = CodeContext::new();

        for index in 0..archive.len() {
            let mut entry = archive.by_index(index).map_err(|err| {
                ApiError::BadRequest(format!("unable to read ZIP entry: {err}"))
            })?;

            if entry.is_dir() {
                continue;
            }

            // Guards against traversal names; also normalizes separators.
            let Some(path) = entry
                .enclosed_name()
                .map(|p| p.to_string_lossy().replace('\\', "/"))
            else {
                warn!(name = entry.name(), "skipping entry with unsafe path");
                continue;
            };

            if self.rules.is_excluded(&path, entry.size()) {
                debug!(path, "excluded by rules");
                continue;
            }
            if !self.rules.is_likely_text_file(&path) {
                debug!(path, "excluded, not a text file");
                continue;
            }
            if context.file_count() >= self.rules.max_files() {
                return Err(ApiError::PayloadTooLarge(format!(
                    "archive exceeds the {} file limit",
                    self.rules.max_files()
                )));
            }

            let mut raw = Vec::new();
            let limit = self.rules.max_file_size() + 1;
            if let Err(err) = (&mut entry).take(limit).read_to_end(&mut raw) {
                warn!(path, error = %err, "failed to read entry, skipping");
                continue;
            }
            if raw.len() as u64 > self.rules.max_file_size() {
                debug!(path, "excluded, content over size limit");
                continue;
            }
            if ExtractionRules::looks_binary(&raw) {
                debug!(path, "excluded, binary content detected");
                continue;
            }

            context.insert_file(&path, raw, use_base64);
            debug!(path, "processed");
        }

        Ok(context)
    }
}
