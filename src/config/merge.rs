use std::env;
use std::path::PathBuf;

use super::utils::{non_empty, parse_bool};
use super::yaml::YamlConfig;
use super::{BargeInPolicy, ServerConfig, TlsConfig, TrailingAudioPolicy};

/// Merge YAML configuration with environment variables
///
/// Priority order (highest to lowest):
/// 1. YAML configuration values
/// 2. Environment variables
/// 3. Default values
///
/// # Arguments
/// * `yaml_config` - Optional YAML configuration to use as overrides
///
/// # Errors
/// Returns an error when an environment variable or YAML value cannot be
/// parsed into the field's type.
pub fn merge_config(
    yaml_config: Option<YamlConfig>,
) -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let yaml = yaml_config.unwrap_or_default();
    let defaults = ServerConfig::default();

    // Helper macro to get value with priority: YAML > ENV > Default
    macro_rules! get_value {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            $yaml_value
                .or_else(|| non_empty(env::var($env_var).ok()))
                .unwrap_or_else(|| $default.to_string())
        };
    }

    // Helper macro for optional values: YAML > ENV
    macro_rules! get_optional {
        ($env_var:expr, $yaml_value:expr) => {
            non_empty($yaml_value.or_else(|| env::var($env_var).ok()))
        };
    }

    // Helper macro for typed values: YAML > ENV (must parse) > Default
    macro_rules! get_parsed {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            match $yaml_value {
                Some(value) => value,
                None => match non_empty(env::var($env_var).ok()) {
                    Some(raw) => raw
                        .trim()
                        .parse()
                        .map_err(|e| format!("Invalid {} environment variable: {e}", $env_var))?,
                    None => $default,
                },
            }
        };
    }

    // Helper macro for booleans: YAML > ENV (must parse) > Default
    macro_rules! get_bool {
        ($env_var:expr, $yaml_value:expr, $default:expr) => {
            match $yaml_value {
                Some(value) => value,
                None => match non_empty(env::var($env_var).ok()) {
                    Some(raw) => parse_bool(&raw).ok_or_else(|| {
                        format!("Invalid {} environment variable: {raw}", $env_var)
                    })?,
                    None => $default,
                },
            }
        };
    }

    let server = yaml.server.as_ref();
    let pipeline = yaml.pipeline.as_ref();
    let audio = yaml.audio.as_ref();
    let session = yaml.session.as_ref();
    let security = yaml.security.as_ref();

    // Server configuration
    let host = get_value!("HOST", server.and_then(|s| s.host.clone()), defaults.host);
    let port: u16 = get_parsed!("PORT", server.and_then(|s| s.port), defaults.port);

    // TLS configuration
    let tls_yaml = server.and_then(|s| s.tls.as_ref());
    let tls_enabled = get_bool!("TLS_ENABLED", tls_yaml.and_then(|t| t.enabled), false);
    let tls = if tls_enabled {
        let cert_path = get_optional!("TLS_CERT_PATH", tls_yaml.and_then(|t| t.cert_path.clone()))
            .ok_or("TLS_CERT_PATH is required when TLS is enabled")?;
        let key_path = get_optional!("TLS_KEY_PATH", tls_yaml.and_then(|t| t.key_path.clone()))
            .ok_or("TLS_KEY_PATH is required when TLS is enabled")?;
        Some(TlsConfig {
            cert_path: PathBuf::from(cert_path),
            key_path: PathBuf::from(key_path),
        })
    } else {
        None
    };

    // Pipeline endpoints
    let transcribe_url = get_value!(
        "TRANSCRIBE_URL",
        pipeline.and_then(|p| p.transcribe_url.clone()),
        defaults.transcribe_url
    );
    let transcribe_api_key = get_optional!(
        "TRANSCRIBE_API_KEY",
        pipeline.and_then(|p| p.transcribe_api_key.clone())
    );
    let generate_url = get_value!(
        "GENERATE_URL",
        pipeline.and_then(|p| p.generate_url.clone()),
        defaults.generate_url
    );
    let generate_api_key = get_optional!(
        "GENERATE_API_KEY",
        pipeline.and_then(|p| p.generate_api_key.clone())
    );
    let synthesize_url = get_value!(
        "SYNTHESIZE_URL",
        pipeline.and_then(|p| p.synthesize_url.clone()),
        defaults.synthesize_url
    );
    let synthesize_api_key = get_optional!(
        "SYNTHESIZE_API_KEY",
        pipeline.and_then(|p| p.synthesize_api_key.clone())
    );
    let voice = get_optional!("VOICE", pipeline.and_then(|p| p.voice.clone()));
    let system_prompt = get_optional!(
        "SYSTEM_PROMPT",
        pipeline.and_then(|p| p.system_prompt.clone())
    );
    let language_hint = get_optional!(
        "LANGUAGE_HINT",
        pipeline.and_then(|p| p.language_hint.clone())
    );

    // An explicitly empty fallback disables it
    let fallback_reply = match pipeline
        .and_then(|p| p.fallback_reply.clone())
        .or_else(|| env::var("FALLBACK_REPLY").ok())
    {
        Some(text) => non_empty(Some(text)),
        None => defaults.fallback_reply.clone(),
    };

    // Pipeline timing
    let transcribe_timeout_ms: u64 = get_parsed!(
        "TRANSCRIBE_TIMEOUT_MS",
        pipeline.and_then(|p| p.transcribe_timeout_ms),
        defaults.transcribe_timeout_ms
    );
    let generate_timeout_ms: u64 = get_parsed!(
        "GENERATE_TIMEOUT_MS",
        pipeline.and_then(|p| p.generate_timeout_ms),
        defaults.generate_timeout_ms
    );
    let synthesize_timeout_ms: u64 = get_parsed!(
        "SYNTHESIZE_TIMEOUT_MS",
        pipeline.and_then(|p| p.synthesize_timeout_ms),
        defaults.synthesize_timeout_ms
    );
    let pipeline_max_retries: u32 = get_parsed!(
        "PIPELINE_MAX_RETRIES",
        pipeline.and_then(|p| p.max_retries),
        defaults.pipeline_max_retries
    );
    let pipeline_retry_backoff_ms: u64 = get_parsed!(
        "PIPELINE_RETRY_BACKOFF_MS",
        pipeline.and_then(|p| p.retry_backoff_ms),
        defaults.pipeline_retry_backoff_ms
    );
    let max_history_turns: usize = get_parsed!(
        "MAX_HISTORY_TURNS",
        pipeline.and_then(|p| p.max_history_turns),
        defaults.max_history_turns
    );

    // Audio
    let default_sample_rate: u32 = get_parsed!(
        "DEFAULT_SAMPLE_RATE",
        audio.and_then(|a| a.default_sample_rate),
        defaults.default_sample_rate
    );
    let silence_threshold: f32 = get_parsed!(
        "SILENCE_THRESHOLD",
        audio.and_then(|a| a.silence_threshold),
        defaults.silence_threshold
    );
    let silence_timeout_ms: u64 = get_parsed!(
        "SILENCE_TIMEOUT_MS",
        audio.and_then(|a| a.silence_timeout_ms),
        defaults.silence_timeout_ms
    );
    let min_utterance_ms: u64 = get_parsed!(
        "MIN_UTTERANCE_MS",
        audio.and_then(|a| a.min_utterance_ms),
        defaults.min_utterance_ms
    );
    let max_utterance_ms: u64 = get_parsed!(
        "MAX_UTTERANCE_MS",
        audio.and_then(|a| a.max_utterance_ms),
        defaults.max_utterance_ms
    );
    let pre_roll_ms: u64 = get_parsed!(
        "PRE_ROLL_MS",
        audio.and_then(|a| a.pre_roll_ms),
        defaults.pre_roll_ms
    );
    let outbound_chunk_ms: u64 = get_parsed!(
        "OUTBOUND_CHUNK_MS",
        audio.and_then(|a| a.outbound_chunk_ms),
        defaults.outbound_chunk_ms
    );
    let pace_playback = get_bool!(
        "PACE_PLAYBACK",
        audio.and_then(|a| a.pace_playback),
        defaults.pace_playback
    );

    // Session policies
    let barge_in: BargeInPolicy = get_value!(
        "BARGE_IN",
        session.and_then(|s| s.barge_in.clone()),
        "queue"
    )
    .parse()?;
    let trailing_audio: TrailingAudioPolicy = get_value!(
        "TRAILING_AUDIO",
        session.and_then(|s| s.trailing_audio.clone()),
        "discard"
    )
    .parse()?;
    let mark_ack_timeout_ms: u64 = get_parsed!(
        "MARK_ACK_TIMEOUT_MS",
        session.and_then(|s| s.mark_ack_timeout_ms),
        defaults.mark_ack_timeout_ms
    );
    let idle_timeout_secs: u64 = get_parsed!(
        "IDLE_TIMEOUT_SECS",
        session.and_then(|s| s.idle_timeout_secs),
        defaults.idle_timeout_secs
    );
    let pre_start_buffer_frames: usize = get_parsed!(
        "PRE_START_BUFFER_FRAMES",
        session.and_then(|s| s.pre_start_buffer_frames),
        defaults.pre_start_buffer_frames
    );

    // Security configuration
    let cors_allowed_origins = get_optional!(
        "CORS_ALLOWED_ORIGINS",
        security.and_then(|s| s.cors_allowed_origins.clone())
    );
    let rate_limit_requests_per_second: u32 = get_parsed!(
        "RATE_LIMIT_REQUESTS_PER_SECOND",
        security.and_then(|s| s.rate_limit_requests_per_second),
        defaults.rate_limit_requests_per_second
    );
    let rate_limit_burst_size: u32 = get_parsed!(
        "RATE_LIMIT_BURST_SIZE",
        security.and_then(|s| s.rate_limit_burst_size),
        defaults.rate_limit_burst_size
    );
    let max_websocket_connections = match security.and_then(|s| s.max_websocket_connections) {
        Some(limit) => Some(limit),
        None => non_empty(env::var("MAX_WEBSOCKET_CONNECTIONS").ok())
            .map(|raw| {
                raw.trim().parse::<usize>().map_err(|e| {
                    format!("Invalid MAX_WEBSOCKET_CONNECTIONS environment variable: {e}")
                })
            })
            .transpose()?,
    };
    let max_connections_per_ip: u32 = get_parsed!(
        "MAX_CONNECTIONS_PER_IP",
        security.and_then(|s| s.max_connections_per_ip),
        defaults.max_connections_per_ip
    );

    Ok(ServerConfig {
        host,
        port,
        tls,
        transcribe_url,
        transcribe_api_key,
        generate_url,
        generate_api_key,
        synthesize_url,
        synthesize_api_key,
        voice,
        system_prompt,
        language_hint,
        fallback_reply,
        transcribe_timeout_ms,
        generate_timeout_ms,
        synthesize_timeout_ms,
        pipeline_max_retries,
        pipeline_retry_backoff_ms,
        max_history_turns,
        default_sample_rate,
        silence_threshold,
        silence_timeout_ms,
        min_utterance_ms,
        max_utterance_ms,
        pre_roll_ms,
        outbound_chunk_ms,
        pace_playback,
        barge_in,
        trailing_audio,
        mark_ack_timeout_ms,
        idle_timeout_secs,
        pre_start_buffer_frames,
        cors_allowed_origins,
        rate_limit_requests_per_second,
        rate_limit_burst_size,
        max_websocket_connections,
        max_connections_per_ip,
    })
}
