//! Code Context producers: ZIP archive extraction and GitHub repository
//! traversal, sharing one set of exclusion and text-detection rules.

pub mod archive;
pub mod filter;
pub mod github;

pub use archive::ZipExtractor;
pub use filter::ExtractionRules;
pub use github::GithubClient;
