use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL_ID: &str = "5CD-AI/Vietnamese-Sentiment-visobert";

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "8001")]
    pub port: u16,

    /// Model ID from Hugging Face Hub
    #[arg(long, env = "MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Local path to model directory, takes precedence over --model-id
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Model revision/branch on Hugging Face
    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub model_revision: String,

    /// Tokenizer file name inside the model directory or repo
    #[arg(long, env = "TOKENIZER_FILE", default_value = "tokenizer.json")]
    pub tokenizer_file: String,

    /// Use PyTorch weights instead of safetensors
    #[arg(long, env = "USE_PTH")]
    pub use_pth: bool,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Maximum sequence length allowed
    #[arg(long, env = "MAX_SEQUENCE_LENGTH", default_value = "512")]
    pub max_sequence_length: usize,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,
}

/// Where the model files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub { model_id: String, revision: String },
}

impl Config {
    pub fn model_source(&self) -> ModelSource {
        match &self.model_path {
            Some(path) => ModelSource::Local(path.clone()),
            None => ModelSource::Hub {
                model_id: self.model_id.clone(),
                revision: self.model_revision.clone(),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["vi-sentiment"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn hub_source_by_default() {
        let config = parse(&["--model-id", DEFAULT_MODEL_ID, "--model-revision", "main"]);
        assert_eq!(
            config.model_source(),
            ModelSource::Hub {
                model_id: DEFAULT_MODEL_ID.to_string(),
                revision: "main".to_string(),
            }
        );
    }

    #[test]
    fn model_path_takes_precedence() {
        let config = parse(&["--model-path", "/models/visobert", "--model-id", "other/model"]);
        assert_eq!(
            config.model_source(),
            ModelSource::Local(PathBuf::from("/models/visobert"))
        );
    }

    #[test]
    fn server_address_and_timeout() {
        let config = parse(&[
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--request-timeout-secs",
            "5",
        ]);
        assert_eq!(config.server_address(), "0.0.0.0:9000");
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(Config::try_parse_from(["vi-sentiment", "--port", "http"]).is_err());
    }
}
