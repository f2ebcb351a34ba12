use url::Url;

use super::{ServerConfig, TlsConfig};
use crate::core::codec::SUPPORTED_SAMPLE_RATES;

/// Validate a fully merged configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    validate_endpoint("TRANSCRIBE_URL", &config.transcribe_url)?;
    validate_endpoint("GENERATE_URL", &config.generate_url)?;
    validate_endpoint("SYNTHESIZE_URL", &config.synthesize_url)?;

    validate_non_zero("TRANSCRIBE_TIMEOUT_MS", config.transcribe_timeout_ms)?;
    validate_non_zero("GENERATE_TIMEOUT_MS", config.generate_timeout_ms)?;
    validate_non_zero("SYNTHESIZE_TIMEOUT_MS", config.synthesize_timeout_ms)?;
    validate_non_zero("SILENCE_TIMEOUT_MS", config.silence_timeout_ms)?;
    validate_non_zero("MAX_UTTERANCE_MS", config.max_utterance_ms)?;
    validate_non_zero("OUTBOUND_CHUNK_MS", config.outbound_chunk_ms)?;
    validate_non_zero("MARK_ACK_TIMEOUT_MS", config.mark_ack_timeout_ms)?;
    validate_non_zero("IDLE_TIMEOUT_SECS", config.idle_timeout_secs)?;
    if !SUPPORTED_SAMPLE_RATES.contains(&config.default_sample_rate) {
        return Err(format!(
            "DEFAULT_SAMPLE_RATE must be within {}..={} Hz, got {}",
            SUPPORTED_SAMPLE_RATES.start(),
            SUPPORTED_SAMPLE_RATES.end(),
            config.default_sample_rate
        )
        .into());
    }
    validate_non_zero(
        "RATE_LIMIT_REQUESTS_PER_SECOND",
        u64::from(config.rate_limit_requests_per_second),
    )?;
    validate_non_zero("RATE_LIMIT_BURST_SIZE", u64::from(config.rate_limit_burst_size))?;

    validate_threshold(config.silence_threshold)?;

    if config.min_utterance_ms >= config.max_utterance_ms {
        return Err(format!(
            "MIN_UTTERANCE_MS ({}) must be less than MAX_UTTERANCE_MS ({})",
            config.min_utterance_ms, config.max_utterance_ms
        )
        .into());
    }

    validate_tls(&config.tls)?;

    Ok(())
}

/// Ensure a pipeline endpoint is an absolute http(s) URL.
pub fn validate_endpoint(name: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = Url::parse(value).map_err(|e| format!("{name} is not a valid URL ({value}): {e}"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("{name} must use http or https, got '{other}'").into()),
    }
}

fn validate_non_zero(name: &str, value: u64) -> Result<(), Box<dyn std::error::Error>> {
    if value == 0 {
        return Err(format!("{name} must be greater than zero").into());
    }
    Ok(())
}

/// The silence threshold is a normalized RMS value in (0, 1].
pub fn validate_threshold(threshold: f32) -> Result<(), Box<dyn std::error::Error>> {
    if !(threshold > 0.0 && threshold <= 1.0) {
        return Err(format!("SILENCE_THRESHOLD must be in (0, 1], got {threshold}").into());
    }
    Ok(())
}

/// TLS certificate and key files must exist when TLS is enabled.
pub fn validate_tls(tls: &Option<TlsConfig>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(tls) = tls else {
        return Ok(());
    };

    if !tls.cert_path.exists() {
        return Err(format!(
            "TLS certificate file does not exist: {}",
            tls.cert_path.display()
        )
        .into());
    }
    if !tls.key_path.exists() {
        return Err(format!("TLS key file does not exist: {}", tls.key_path.display()).into());
    }

    Ok(())
}
