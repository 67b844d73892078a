//! Application configuration loaded from `config.yaml`.
//!
//! Every field has a default so a missing file, or a file that only sets a
//! couple of keys, still yields a usable configuration.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_path: Option<PathBuf>,
    pub upload_dir: Option<PathBuf>,
    /// Upper bound on pipelines running at the same time. Tasks beyond it
    /// wait in the "queued" stage.
    pub max_concurrent_tasks: usize,
    pub ollama: OllamaConfig,
    pub media: MediaConfig,
    pub janitor: JanitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub embedding_model: Option<String>,
    /// Ask the model for topics instead of clustering paragraphs locally.
    pub llm_topics: bool,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub whisper_cli_path: PathBuf,
    pub whisper_model_path: PathBuf,
    pub pdftotext_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JanitorConfig {
    pub orphan_max_age_hours: u64,
    pub task_retention_days: i64,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("study-analyzer")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: None,
            upload_dir: None,
            max_concurrent_tasks: 2,
            ollama: OllamaConfig::default(),
            media: MediaConfig::default(),
            janitor: JanitorConfig::default(),
        }
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2:3b".to_string(),
            embedding_model: None,
            llm_topics: false,
            timeout_secs: 120,
        }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        let whisper_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bin")
            .join("whisper-cpp")
            .join("whisper.cpp");
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            whisper_cli_path: whisper_root.join("build").join("bin").join("whisper-cli"),
            whisper_model_path: whisper_root.join("models").join("ggml-medium.bin"),
            pdftotext_path: PathBuf::from("pdftotext"),
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            orphan_max_age_hours: 24,
            task_retention_days: 7,
        }
    }
}

impl AppConfig {
    /// Load from `path`. A missing file is not an error: defaults are used.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrent_tasks == 0 {
            return Err(AppError::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.ollama.enabled && self.ollama.base_url.trim().is_empty() {
            return Err(AppError::Config("ollama.base_url is empty".to_string()));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("study_analyzer.db"))
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("uploads"))
    }
}

impl OllamaConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = AppConfig::load(&temp.path().join("nope.yaml")).unwrap();
        assert_eq!(config.max_concurrent_tasks, 2);
        assert!(!config.ollama.enabled);
        assert_eq!(config.janitor.task_retention_days, 7);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "data_dir: /tmp/analyzer\nmax_concurrent_tasks: 4\nollama:\n  enabled: true\n  model: qwen2.5:7b\n",
        )
        .unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_tasks, 4);
        assert!(config.ollama.enabled);
        assert_eq!(config.ollama.model, "qwen2.5:7b");
        assert_eq!(config.ollama.base_url, "http://localhost:11434");
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/analyzer/study_analyzer.db")
        );
        assert_eq!(config.upload_dir(), PathBuf::from("/tmp/analyzer/uploads"));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "max_concurrent_tasks: 0\n").unwrap();
        assert!(matches!(AppConfig::load(&path), Err(AppError::Config(_))));
    }
}
