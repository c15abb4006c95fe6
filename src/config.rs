use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

use crate::summary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // HTTP server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Generation API (Gemini-style generateContent endpoint)
    #[serde(default = "default_gemini_api_url")]
    pub gemini_api_url: String,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_summary_model")]
    pub summary_model: String,

    // Context assembly
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_summarized_history_window")]
    pub summarized_history_window: usize,

    // Summarization policy
    #[serde(default = "default_min_messages_for_summary")]
    pub min_messages_for_summary: usize,
    #[serde(default = "default_summary_char_budget")]
    pub summary_char_budget: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8686".to_string()
}

fn default_database_path() -> String {
    "stagedoor.db".to_string()
}

fn default_gemini_api_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_chat_model() -> String {
    "gemini-2.5-pro".to_string()
}

fn default_summary_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_history_window() -> usize {
    40
}

fn default_summarized_history_window() -> usize {
    20
}

fn default_min_messages_for_summary() -> usize {
    summary::MIN_MESSAGES_FOR_SUMMARY
}

fn default_summary_char_budget() -> usize {
    summary::SUMMARY_CHAR_BUDGET
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_path: default_database_path(),
            gemini_api_url: default_gemini_api_url(),
            gemini_api_key: None,
            chat_model: default_chat_model(),
            summary_model: default_summary_model(),
            history_window: default_history_window(),
            summarized_history_window: default_summarized_history_window(),
            min_messages_for_summary: default_min_messages_for_summary(),
            summary_char_budget: default_summary_char_budget(),
        }
    }
}

impl AppConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("stagedoor_config.toml")
    }

    /// Load config from stagedoor_config.toml, falling back to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AppConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config.with_env_overrides();
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::default().with_env_overrides()
    }

    /// Environment variables win over the file so a credential never has to
    /// be written to disk.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = env::var("GEMINI_API_KEY") {
            let key = key.trim().to_string();
            if !key.is_empty() {
                self.gemini_api_key = Some(key);
            }
        }
        if let Ok(bind) = env::var("STAGEDOOR_BIND") {
            if !bind.trim().is_empty() {
                self.bind_addr = bind.trim().to_string();
            }
        }
        if let Ok(db) = env::var("STAGEDOOR_DB") {
            if !db.trim().is_empty() {
                self.database_path = db.trim().to_string();
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.history_window, 40);
        assert_eq!(config.summarized_history_window, 20);
        assert_eq!(config.min_messages_for_summary, 5);
        assert_eq!(config.summary_char_budget, 1000);
        // The policy constants are the single source of these defaults.
        assert_eq!(
            config.min_messages_for_summary,
            summary::MIN_MESSAGES_FOR_SUMMARY
        );
        assert_eq!(config.summary_char_budget, summary::SUMMARY_CHAR_BUDGET);
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn empty_toml_fills_every_field() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8686");
        assert_eq!(config.chat_model, "gemini-2.5-pro");
        assert_eq!(config.summary_model, "gemini-1.5-flash");
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let config: AppConfig = toml::from_str("history_window = 60").unwrap();
        assert_eq!(config.history_window, 60);
        assert_eq!(config.summarized_history_window, 20);
    }
}
