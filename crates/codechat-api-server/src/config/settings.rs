use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub gemini: GeminiConfig,
    pub analysis: AnalysisConfig,
    pub github: GithubConfig,
    pub session: SessionConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Tracing filter used when RUST_LOG is not set.
    pub level: String,
    /// Daily-rolling file output directory; stdout only when absent.
    #[serde(default)]
    pub directory: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub api_endpoint: String,
    pub model: String,
    /// Explicit proxy URL; wins over HTTP(S)_PROXY from the environment.
    #[serde(default)]
    pub proxy_url: Option<String>,
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub stream_max_retries: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AnalysisConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GithubConfig {
    pub api_base: String,
    pub token: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    pub session_ttl_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub conversation_ttl_secs: u64,
    pub conversation_sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct UploadConfig {
    pub max_upload_size_mb: u64,
    pub max_file_size_mb: u64,
    pub max_files: usize,
    pub excluded_dir_prefixes: Vec<String>,
    pub excluded_extensions: Vec<String>,
    pub text_extensions: Vec<String>,
    pub text_filenames: Vec<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

impl UploadConfig {
    pub fn max_upload_bytes(&self) -> usize {
        (self.max_upload_size_mb * 1024 * 1024) as usize
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}
