pub mod settings;

pub use settings::{
    AnalysisConfig, GeminiConfig, GithubConfig, LoggingConfig, ServerConfig, SessionConfig,
    Settings, UploadConfig,
};
