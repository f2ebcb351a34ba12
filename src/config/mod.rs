//! Configuration module for the Exotel bridge
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//! - `utils`: Utility functions for configuration parsing
//!
//! # Example
//! ```rust,no_run
//! use exotel_bridge::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config_path = PathBuf::from("config.yaml");
//! let config = ServerConfig::from_file(&config_path)?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

mod env;
mod merge;
mod utils;
mod validation;
mod yaml;

pub use crate::core::session::{BargeInPolicy, TrailingAudioPolicy};
pub use utils::parse_bool;

use crate::core::vad::SegmenterConfig;

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Server configuration
///
/// Groups:
/// - Server settings (host, port, TLS)
/// - Pipeline endpoints, credentials and deadlines
/// - Audio segmentation and outbound framing
/// - Per-session policies
/// - Security settings (CORS, rate limiting, connection limits)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Pipeline endpoints
    pub transcribe_url: String,
    pub transcribe_api_key: Option<String>,
    pub generate_url: String,
    pub generate_api_key: Option<String>,
    pub synthesize_url: String,
    pub synthesize_api_key: Option<String>,
    /// Voice requested from the synthesis service
    pub voice: Option<String>,
    /// Sent with every generate request
    pub system_prompt: Option<String>,
    /// Passed to the transcription service as `language`
    pub language_hint: Option<String>,
    /// Spoken when reply generation fails. `None` fails the turn instead
    pub fallback_reply: Option<String>,

    // Pipeline timing
    pub transcribe_timeout_ms: u64,
    pub generate_timeout_ms: u64,
    pub synthesize_timeout_ms: u64,
    /// Extra attempts per stage for transient failures
    pub pipeline_max_retries: u32,
    pub pipeline_retry_backoff_ms: u64,
    pub max_history_turns: usize,

    // Audio
    /// Channel sample rate assumed when the start event omits one
    pub default_sample_rate: u32,
    /// Normalized RMS (0.0 - 1.0) above which a packet counts as speech
    pub silence_threshold: f32,
    pub silence_timeout_ms: u64,
    pub min_utterance_ms: u64,
    pub max_utterance_ms: u64,
    /// Audio kept ahead of the first voiced packet
    pub pre_roll_ms: u64,
    pub outbound_chunk_ms: u64,
    /// Send reply frames at real-time pace instead of all at once
    pub pace_playback: bool,

    // Session policies
    pub barge_in: BargeInPolicy,
    pub trailing_audio: TrailingAudioPolicy,
    /// How long to wait for the provider to echo a reply mark
    pub mark_ack_timeout_ms: u64,
    /// Sessions with no inbound traffic for this long are closed
    pub idle_timeout_secs: u64,
    pub pre_start_buffer_frames: usize,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,

    // Rate limiting configuration
    /// Maximum requests per second per IP address
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    /// Default: 10
    pub rate_limit_burst_size: u32,

    // Connection limits
    /// Maximum concurrent WebSocket connections
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    /// Default: 100
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            tls: None,
            transcribe_url: "http://localhost:8000/transcribe".to_string(),
            transcribe_api_key: None,
            generate_url: "http://localhost:8000/generate".to_string(),
            generate_api_key: None,
            synthesize_url: "http://localhost:8000/synthesize".to_string(),
            synthesize_api_key: None,
            voice: None,
            system_prompt: None,
            language_hint: None,
            fallback_reply: Some(
                "Sorry, I'm having trouble right now. Could you please repeat that?".to_string(),
            ),
            transcribe_timeout_ms: 12_000,
            generate_timeout_ms: 12_000,
            synthesize_timeout_ms: 8_000,
            pipeline_max_retries: 1,
            pipeline_retry_backoff_ms: 200,
            max_history_turns: 10,
            default_sample_rate: 8000,
            silence_threshold: 0.01,
            silence_timeout_ms: 750,
            min_utterance_ms: 250,
            max_utterance_ms: 15_000,
            pre_roll_ms: 300,
            outbound_chunk_ms: 100,
            pace_playback: true,
            barge_in: BargeInPolicy::Queue,
            trailing_audio: TrailingAudioPolicy::Discard,
            mark_ack_timeout_ms: 5_000,
            idle_timeout_secs: 300,
            pre_start_buffer_frames: 50,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: 60,
            rate_limit_burst_size: 10,
            max_websocket_connections: None,
            max_connections_per_ip: 100,
        }
    }
}

/// Implement Drop to zeroize all secret fields when ServerConfig is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.transcribe_api_key {
            key.zeroize();
        }
        if let Some(ref mut key) = self.generate_api_key {
            key.zeroize();
        }
        if let Some(ref mut key) = self.synthesize_api_key {
            key.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file with environment variable base
    ///
    /// Environment variables (and a .env file loaded in main.rs) provide base
    /// configuration; YAML values override them.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// # Errors
    /// Returns an error if:
    /// - The YAML file cannot be read or is malformed
    /// - Environment variables have invalid formats
    /// - Configuration validation fails
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate_config(&config)?;
        Ok(config)
    }

    /// Get the server address as a string
    ///
    /// Returns the address in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// Segmenter tunables at the default channel rate.
    pub fn segmenter_config(&self) -> SegmenterConfig {
        SegmenterConfig {
            sample_rate: self.default_sample_rate,
            silence_threshold: self.silence_threshold,
            silence_timeout_ms: self.silence_timeout_ms,
            min_utterance_ms: self.min_utterance_ms,
            max_utterance_ms: self.max_utterance_ms,
            pre_roll_ms: self.pre_roll_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::TempDir;

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        unsafe {
            env::remove_var("HOST");
            env::remove_var("PORT");
            env::remove_var("TRANSCRIBE_URL");
            env::remove_var("GENERATE_URL");
            env::remove_var("SYNTHESIZE_API_KEY");
            env::remove_var("SILENCE_THRESHOLD");
            env::remove_var("BARGE_IN");
            env::remove_var("TLS_ENABLED");
        }
    }

    #[test]
    fn test_address() {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 8080;
        assert_eq!(config.address(), "127.0.0.1:8080");
        assert!(!config.is_tls_enabled());
    }

    #[test]
    fn test_segmenter_config_mirrors_audio_settings() {
        let mut config = ServerConfig::default();
        config.silence_timeout_ms = 500;
        config.default_sample_rate = 16000;

        let segmenter = config.segmenter_config();
        assert_eq!(segmenter.silence_timeout_ms, 500);
        assert_eq!(segmenter.sample_rate, 16000);
        assert_eq!(segmenter.min_utterance_ms, 250);
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_only() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080

pipeline:
  transcribe_url: "https://stt.example.com/v1/transcribe"
  synthesize_api_key: "yaml-tts-key"
  generate_timeout_ms: 4000

audio:
  silence_threshold: 0.05

session:
  barge_in: "interrupt"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        let config = ServerConfig::from_file(&config_path).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.transcribe_url, "https://stt.example.com/v1/transcribe");
        assert_eq!(config.synthesize_api_key, Some("yaml-tts-key".to_string()));
        assert_eq!(config.generate_timeout_ms, 4000);
        assert_eq!(config.silence_threshold, 0.05);
        assert_eq!(config.barge_in, BargeInPolicy::Interrupt);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let yaml_content = r#"
server:
  host: "127.0.0.1"

pipeline:
  generate_url: "https://llm.example.com/yaml"
"#;

        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            env::set_var("HOST", "0.0.0.0");
            env::set_var("PORT", "9100");
            env::set_var("GENERATE_URL", "https://llm.example.com/env");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.generate_url, "https://llm.example.com/yaml");
        // ENV value
        assert_eq!(config.port, 9100);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let config_path = PathBuf::from("/nonexistent/config.yaml");
        let result = ServerConfig::from_file(&config_path);

        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_rejects_invalid_values() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        fs::write(
            &config_path,
            "audio:\n  min_utterance_ms: 5000\n  max_utterance_ms: 1000\n",
        )
        .unwrap();

        let result = ServerConfig::from_file(&config_path);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("MIN_UTTERANCE_MS"));
    }
}
