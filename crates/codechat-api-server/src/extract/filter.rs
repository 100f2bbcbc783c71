use std::collections::HashSet;

use crate::config::UploadConfig;

/// Shared inclusion/exclusion rules for extraction: directory and extension
/// exclusions, text-file detection, per-file size ceiling and a total file
/// count ceiling.
pub struct ExtractionRules {
    excluded_dirs: HashSet<String>,
    excluded_extensions: HashSet<String>,
    text_extensions: HashSet<String>,
    text_filenames: HashSet<String>,
    max_file_size: u64,
    max_files: usize,
}

impl ExtractionRules {
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            excluded_dirs: config
                .excluded_dir_prefixes
                .iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect(),
            excluded_extensions: config
                .excluded_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            text_extensions: config
                .text_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            text_filenames: config.text_filenames.iter().cloned().collect(),
            max_file_size: config.max_file_bytes(),
            max_files: config.max_files,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// True when a path must be skipped: oversized, under an excluded
    /// directory (at any depth, archives often wrap a root folder), or
    /// carrying an excluded extension.
    pub fn is_excluded(&self, path: &str, size: u64) -> bool {
        if size > self.max_file_size {
            return true;
        }

        let normalized = path.replace('\\', "/");
        let components: Vec<&str> = normalized.split('/').collect();
        if components
            .iter()
            .take(components.len().saturating_sub(1))
            .any(|dir| self.excluded_dirs.contains(*dir))
        {
            return true;
        }

        self.excluded_extensions.contains(&extension_of(&normalized))
    }

    /// Extension or well-known filename check, with a mime guess as the
    /// fallback for anything not listed.
    pub fn is_likely_text_file(&self, path: &str) -> bool {
        let extension = extension_of(path);
        if self.text_extensions.contains(&extension) {
            return true;
        }

        let filename = path.rsplit('/').next().unwrap_or(path);
        if self.text_filenames.contains(filename) {
            return true;
        }

        mime_guess::from_path(path)
            .first()
            .map(|mime| mime.type_() == mime_guess::mime::TEXT)
            .unwrap_or(false)
    }

    /// NUL-byte sniff over the head of the content, the same heuristic git
    /// uses to classify binaries.
    pub fn looks_binary(content: &[u8]) -> bool {
        content.iter().take(8000).any(|byte| *byte == 0)
    }
}

fn extension_of(path: &str) -> String {
    let filename = path.rsplit('/').next().unwrap_or(path);
    filename
        .rfind('.')
        .map(|dot| filename[dot..].to_lowercase())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ExtractionRules {
        ExtractionRules::new(&UploadConfig {
            max_upload_size_mb: 50,
            max_file_size_mb: 1,
            max_files: 100,
            excluded_dir_prefixes: vec![".git".to_string(), "node_modules".to_string()],
            excluded_extensions: vec![".png".to_string(), ".exe".to_string()],
            text_extensions: vec![".rs".to_string(), ".md".to_string(), ".go".to_string()],
            text_filenames: vec!["Makefile".to_string(), "LICENSE".to_string()],
        })
    }

    #[test]
    fn test_excluded_directories_at_any_depth() {
        let rules = rules();
        assert!(rules.is_excluded(".git/config", 10));
        assert!(rules.is_excluded("project/node_modules/pkg/index.js", 10));
        assert!(!rules.is_excluded("src/git_helpers.rs", 10));
    }

    #[test]
    fn test_excluded_extensions_and_size() {
        let rules = rules();
        assert!(rules.is_excluded("assets/logo.png", 10));
        assert!(rules.is_excluded("tool.EXE", 10));
        assert!(rules.is_excluded("src/main.rs", 2 * 1024 * 1024));
        assert!(!rules.is_excluded("src/main.rs", 10));
    }

    #[test]
    fn test_text_detection() {
        let rules = rules();
        assert!(rules.is_likely_text_file("src/main.rs"));
        assert!(rules.is_likely_text_file("docs/README.md"));
        assert!(rules.is_likely_text_file("Makefile"));
        // Falls through to the mime guess.
        assert!(rules.is_likely_text_file("data.csv"));
        assert!(!rules.is_likely_text_file("binary.wasm"));
    }

    #[test]
    fn test_binary_sniff() {
        assert!(ExtractionRules::looks_binary(&[0x7f, b'E', b'L', b'F', 0, 0]));
        assert!(!ExtractionRules::looks_binary(b"plain text content"));
    }
}
