use serde::Deserialize;
use std::path::PathBuf;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override environment variables.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 3001
///   tls:
///     enabled: true
///     cert_path: "/etc/bridge/cert.pem"
///     key_path: "/etc/bridge/key.pem"
///
/// pipeline:
///   transcribe_url: "https://stt.example.com/v1/transcribe"
///   generate_url: "https://llm.example.com/v1/reply"
///   synthesize_url: "https://tts.example.com/v1/speak"
///   synthesize_api_key: "your-tts-key"
///   voice: "alloy"
///   system_prompt: "You are a helpful phone agent."
///   fallback_reply: "Sorry, could you say that again?"
///   transcribe_timeout_ms: 12000
///   max_retries: 1
///
/// audio:
///   default_sample_rate: 8000
///   silence_threshold: 0.01
///   silence_timeout_ms: 750
///   outbound_chunk_ms: 100
///
/// session:
///   barge_in: "queue"
///   trailing_audio: "discard"
///   mark_ack_timeout_ms: 5000
///
/// security:
///   cors_allowed_origins: "*"
///   max_websocket_connections: 200
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub pipeline: Option<PipelineYaml>,
    pub audio: Option<AudioYaml>,
    pub session: Option<SessionYaml>,
    pub security: Option<SecurityYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Pipeline endpoints and timing from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PipelineYaml {
    pub transcribe_url: Option<String>,
    pub transcribe_api_key: Option<String>,
    pub generate_url: Option<String>,
    pub generate_api_key: Option<String>,
    pub synthesize_url: Option<String>,
    pub synthesize_api_key: Option<String>,
    pub voice: Option<String>,
    pub system_prompt: Option<String>,
    pub language_hint: Option<String>,
    pub fallback_reply: Option<String>,
    pub transcribe_timeout_ms: Option<u64>,
    pub generate_timeout_ms: Option<u64>,
    pub synthesize_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub max_history_turns: Option<usize>,
}

/// Segmentation and outbound framing from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub default_sample_rate: Option<u32>,
    /// Normalized RMS threshold (0.0 - 1.0)
    pub silence_threshold: Option<f32>,
    pub silence_timeout_ms: Option<u64>,
    pub min_utterance_ms: Option<u64>,
    pub max_utterance_ms: Option<u64>,
    pub pre_roll_ms: Option<u64>,
    pub outbound_chunk_ms: Option<u64>,
    pub pace_playback: Option<bool>,
}

/// Per-session policies from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    /// "queue" or "interrupt"
    pub barge_in: Option<String>,
    /// "discard" or "process"
    pub trailing_audio: Option<String>,
    pub mark_ack_timeout_ms: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
    pub pre_start_buffer_frames: Option<usize>,
}

/// Security configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated or "*")
    pub cors_allowed_origins: Option<String>,
    /// Rate limit requests per second per IP
    pub rate_limit_requests_per_second: Option<u32>,
    /// Rate limit burst size
    pub rate_limit_burst_size: Option<u32>,
    /// Maximum concurrent WebSocket connections
    pub max_websocket_connections: Option<usize>,
    /// Maximum connections per IP address
    pub max_connections_per_ip: Option<u32>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Required fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;

        let config: YamlConfig = serde_yaml::from_str(&contents)
            .map_err(|e| format!("Failed to parse YAML config: {e}"))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_yaml_config_full() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 8443
  tls:
    enabled: true
    cert_path: "/certs/cert.pem"
    key_path: "/certs/key.pem"

pipeline:
  transcribe_url: "https://stt.example.com"
  generate_url: "https://llm.example.com"
  synthesize_url: "https://tts.example.com"
  generate_api_key: "llm-key"
  voice: "nova"
  max_retries: 2

audio:
  silence_threshold: 0.02
  pace_playback: false

session:
  barge_in: "interrupt"
  trailing_audio: "process"
  idle_timeout_secs: 60

security:
  rate_limit_requests_per_second: 100
  max_websocket_connections: 20
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        let server = config.server.unwrap();
        assert_eq!(server.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(server.port, Some(8443));
        let tls = server.tls.unwrap();
        assert_eq!(tls.enabled, Some(true));
        assert_eq!(tls.cert_path.as_deref(), Some("/certs/cert.pem"));

        let pipeline = config.pipeline.unwrap();
        assert_eq!(pipeline.generate_api_key.as_deref(), Some("llm-key"));
        assert_eq!(pipeline.voice.as_deref(), Some("nova"));
        assert_eq!(pipeline.max_retries, Some(2));
        assert!(pipeline.transcribe_api_key.is_none());

        let audio = config.audio.unwrap();
        assert_eq!(audio.silence_threshold, Some(0.02));
        assert_eq!(audio.pace_playback, Some(false));

        let session = config.session.unwrap();
        assert_eq!(session.barge_in.as_deref(), Some("interrupt"));
        assert_eq!(session.trailing_audio.as_deref(), Some("process"));
        assert_eq!(session.idle_timeout_secs, Some(60));

        let security = config.security.unwrap();
        assert_eq!(security.rate_limit_requests_per_second, Some(100));
        assert_eq!(security.max_websocket_connections, Some(20));
    }

    #[test]
    fn test_yaml_config_partial() {
        let yaml = r#"
audio:
  silence_timeout_ms: 900
"#;

        let config: YamlConfig = serde_yaml::from_str(yaml).unwrap();

        assert!(config.server.is_none());
        assert!(config.pipeline.is_none());
        assert_eq!(config.audio.unwrap().silence_timeout_ms, Some(900));
    }

    #[test]
    fn test_yaml_config_empty() {
        let config: YamlConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.server.is_none());
        assert!(config.session.is_none());
        assert!(config.security.is_none());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(&config_path, "server:\n  port: 4000\n").unwrap();

        let config = YamlConfig::from_file(&config_path).unwrap();
        assert_eq!(config.server.unwrap().port, Some(4000));
    }

    #[test]
    fn test_from_file_invalid_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("invalid.yaml");
        fs::write(&config_path, "invalid: yaml: [content").unwrap();

        let result = YamlConfig::from_file(&config_path);
        assert!(result.is_err());
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to parse YAML")
        );
    }
}
