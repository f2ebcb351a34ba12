use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::error::{PipelineError, Stage};
use super::http::{Endpoint, HttpReplyGenerator, HttpSynthesizer, HttpTranscriber};
use super::retry::RetryPolicy;
use super::{
    PipelineResult, ReplyGenerator, SynthesizedAudio, Synthesizer, Transcriber, Transcript,
    TurnInput, TurnOutcome, VoicePipeline,
};
use crate::config::ServerConfig;
use crate::core::codec::{
    AudioEncoding, AudioFormat, CodecError, WavFormat, convert_audio, downmix_to_mono, parse_wav,
    to_pcm16, wrap_wav,
};
use crate::core::vad::Utterance;

/// Deadlines, retry policy and fallback text for a [`PipelineClient`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub transcribe_timeout: Duration,
    pub generate_timeout: Duration,
    pub synthesize_timeout: Duration,
    pub retry: RetryPolicy,
    /// Spoken when generation fails; `None` fails the turn instead
    pub fallback_reply: Option<String>,
    pub language_hint: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            transcribe_timeout: Duration::from_secs(12),
            generate_timeout: Duration::from_secs(12),
            synthesize_timeout: Duration::from_secs(8),
            retry: RetryPolicy::default(),
            fallback_reply: Some(
                "Sorry, I'm having trouble right now. Could you please repeat that?".to_string(),
            ),
            language_hint: None,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            transcribe_timeout: Duration::from_millis(config.transcribe_timeout_ms),
            generate_timeout: Duration::from_millis(config.generate_timeout_ms),
            synthesize_timeout: Duration::from_millis(config.synthesize_timeout_ms),
            retry: RetryPolicy {
                max_retries: config.pipeline_max_retries,
                initial_delay_ms: config.pipeline_retry_backoff_ms,
                ..RetryPolicy::default()
            },
            fallback_reply: config.fallback_reply.clone(),
            language_hint: config.language_hint.clone(),
        }
    }
}

/// Runs turns through a transcriber, a reply generator and a synthesizer.
pub struct PipelineClient {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ReplyGenerator>,
    synthesizer: Arc<dyn Synthesizer>,
    settings: PipelineSettings,
}

impl PipelineClient {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ReplyGenerator>,
        synthesizer: Arc<dyn Synthesizer>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
            settings,
        }
    }

    /// Build the HTTP-backed client described by the server configuration.
    pub fn from_config(config: &ServerConfig) -> Result<Self, PipelineError> {
        let http_client = Client::builder()
            .pool_max_idle_per_host(16)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("Failed to create HTTP client: {e}")))?;

        let transcriber = HttpTranscriber::new(
            http_client.clone(),
            Endpoint::new(&config.transcribe_url, config.transcribe_api_key.clone()),
        );
        let generator = HttpReplyGenerator::new(
            http_client.clone(),
            Endpoint::new(&config.generate_url, config.generate_api_key.clone()),
        );
        let synthesizer = HttpSynthesizer::new(
            http_client,
            Endpoint::new(&config.synthesize_url, config.synthesize_api_key.clone()),
            config.voice.clone(),
        );

        Ok(Self::new(
            Arc::new(transcriber),
            Arc::new(generator),
            Arc::new(synthesizer),
            PipelineSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run one stage under its deadline, retrying transient failures inside it.
    async fn stage<T, F, Fut>(
        &self,
        stage: Stage,
        deadline: Duration,
        op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(deadline, self.settings.retry.run(stage, op)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                stage,
                timeout_ms: deadline.as_millis() as u64,
            }),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => debug!(%stage, elapsed_ms, "Pipeline stage completed"),
            Err(e) => warn!(%stage, elapsed_ms, error = %e, "Pipeline stage failed"),
        }
        result
    }

    async fn transcribe_utterance(&self, utterance: &Utterance) -> Result<Transcript, PipelineError> {
        let wav = Bytes::from(wrap_wav(&utterance.pcm, utterance.sample_rate, 1, 16));
        let hint = self.settings.language_hint.as_deref();

        self.stage(Stage::Transcribe, self.settings.transcribe_timeout, || {
            self.transcriber.transcribe(wav.clone(), hint)
        })
        .await
    }
}

#[async_trait]
impl VoicePipeline for PipelineClient {
    async fn run_turn(&self, input: TurnInput) -> Result<TurnOutcome, PipelineError> {
        let TurnInput {
            utterance,
            context,
            target,
        } = input;

        let transcript = self.transcribe_utterance(&utterance).await?;
        if transcript.is_empty() {
            info!(
                session_id = %context.session_id,
                duration_ms = utterance.duration_ms(),
                "Empty transcript, skipping reply"
            );
            return Ok(TurnOutcome::NoSpeech);
        }
        let user_text = transcript.text.trim();

        let generated = self
            .stage(Stage::Generate, self.settings.generate_timeout, || {
                self.generator.generate_reply(user_text, &context)
            })
            .await;

        let (reply_text, used_fallback) = match generated {
            Ok(reply) if !reply.trim().is_empty() => (reply, false),
            other => {
                let err = match other {
                    Err(e) => e,
                    Ok(_) => PipelineError::InvalidResponse {
                        stage: Stage::Generate,
                        reason: "empty reply text".to_string(),
                    },
                };
                match &self.settings.fallback_reply {
                    Some(fallback) => {
                        warn!(
                            session_id = %context.session_id,
                            error = %err,
                            "Reply generation failed, speaking fallback"
                        );
                        (fallback.clone(), true)
                    }
                    None => return Err(err),
                }
            }
        };

        let synthesized = self
            .stage(Stage::Synthesize, self.settings.synthesize_timeout, || {
                self.synthesizer.synthesize(&reply_text, target)
            })
            .await?;
        let audio = normalize_synthesized(synthesized, target)?;

        Ok(TurnOutcome::Reply(PipelineResult {
            transcript,
            reply_text,
            audio,
            format: target,
            used_fallback,
        }))
    }

    async fn transcribe_only(&self, utterance: Utterance) -> Result<Transcript, PipelineError> {
        self.transcribe_utterance(&utterance).await
    }
}

/// Convert vendor audio to the channel format.
///
/// The returned bytes are inspected rather than trusted: a RIFF header wins
/// over whatever encoding the vendor claimed, and unknown claims are rejected.
pub fn normalize_synthesized(
    synthesized: SynthesizedAudio,
    target: AudioFormat,
) -> Result<Vec<u8>, PipelineError> {
    let audio_error = |source: CodecError| PipelineError::Audio {
        stage: Stage::Synthesize,
        source,
    };

    if synthesized.audio.starts_with(b"RIFF") {
        let wav = parse_wav(&synthesized.audio).map_err(audio_error)?;
        if wav.format == WavFormat::Pcm && wav.bits_per_sample != 16 {
            return Err(audio_error(CodecError::UnsupportedAudioFormat(format!(
                "{}-bit PCM",
                wav.bits_per_sample
            ))));
        }

        let pcm = to_pcm16(&wav.data, wav.format.encoding()).map_err(audio_error)?;
        let mono = downmix_to_mono(&pcm, wav.channels);
        debug!(
            sample_rate = wav.sample_rate,
            channels = wav.channels,
            format = ?wav.format,
            "Synthesized audio arrived as WAV"
        );
        return convert_audio(
            &mono,
            AudioFormat::new(AudioEncoding::Pcm16, wav.sample_rate),
            target,
        )
        .map_err(audio_error);
    }

    let encoding = match synthesized.encoding.as_deref() {
        Some(name) => AudioEncoding::parse(name).ok_or_else(|| {
            audio_error(CodecError::UnsupportedAudioFormat(format!(
                "encoding '{name}'"
            )))
        })?,
        None => target.encoding,
    };
    let sample_rate = synthesized.sample_rate.unwrap_or(target.sample_rate);

    convert_audio(
        &synthesized.audio,
        AudioFormat::new(encoding, sample_rate),
        target,
    )
    .map_err(audio_error)
}
