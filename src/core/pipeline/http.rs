//! HTTP adapters for the three pipeline services.
//!
//! All adapters share one `reqwest::Client` so connection pools are reused
//! across sessions. Deadlines are applied by the caller, not here.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::{PipelineError, Stage};
use super::messages::{
    GenerateRequest, GenerateResponse, SynthesizeRequest, SynthesizeResponse, TranscribeResponse,
};
use super::{ReplyContext, ReplyGenerator, SynthesizedAudio, Synthesizer, Transcriber, Transcript};
use crate::core::codec::{AudioEncoding, AudioFormat, decode_base64};

/// Longest error body kept in a [`PipelineError::Status`].
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Location and credentials of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub api_key: Option<String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
        }
    }

    fn post(&self, client: &Client) -> RequestBuilder {
        let request = client.post(&self.url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

/// Check the status and decode a JSON body.
async fn read_json<T: DeserializeOwned>(stage: Stage, response: Response) -> Result<T, PipelineError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| PipelineError::from_reqwest(stage, e))?;

    if !status.is_success() {
        return Err(PipelineError::Status {
            stage,
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        });
    }

    serde_json::from_str(&body).map_err(|e| PipelineError::InvalidResponse {
        stage,
        reason: e.to_string(),
    })
}

/// Posts the utterance as a multipart WAV upload.
pub struct HttpTranscriber {
    client: Client,
    endpoint: Endpoint,
}

impl HttpTranscriber {
    pub fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(
        &self,
        wav: Bytes,
        language_hint: Option<&str>,
    ) -> Result<Transcript, PipelineError> {
        let size = wav.len();
        let file_part = Part::bytes(wav.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Configuration(format!("Invalid MIME type: {e}")))?;

        let mut form = Form::new().part("file", file_part);
        if let Some(language) = language_hint {
            form = form.text("language", language.to_string());
        }

        debug!(bytes = size, url = %self.endpoint.url, "Sending utterance for transcription");
        let response = self
            .endpoint
            .post(&self.client)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest(Stage::Transcribe, e))?;

        let body: TranscribeResponse = read_json(Stage::Transcribe, response).await?;
        Ok(Transcript {
            text: body.text,
            confidence: body.confidence,
            language: body.language,
        })
    }
}

pub struct HttpReplyGenerator {
    client: Client,
    endpoint: Endpoint,
}

impl HttpReplyGenerator {
    pub fn new(client: Client, endpoint: Endpoint) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl ReplyGenerator for HttpReplyGenerator {
    async fn generate_reply(
        &self,
        user_text: &str,
        context: &ReplyContext,
    ) -> Result<String, PipelineError> {
        let request = GenerateRequest {
            user_text,
            session_id: &context.session_id,
            system_prompt: context.system_prompt.as_deref(),
            history: &context.history,
        };

        let response = self
            .endpoint
            .post(&self.client)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest(Stage::Generate, e))?;

        let body: GenerateResponse = read_json(Stage::Generate, response).await?;
        Ok(body.reply_text)
    }
}

/// Requests speech and returns it exactly as the vendor sent it.
pub struct HttpSynthesizer {
    client: Client,
    endpoint: Endpoint,
    voice: Option<String>,
}

impl HttpSynthesizer {
    pub fn new(client: Client, endpoint: Endpoint, voice: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            voice,
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
        target: AudioFormat,
    ) -> Result<SynthesizedAudio, PipelineError> {
        let request = SynthesizeRequest {
            text,
            voice: self.voice.as_deref(),
            encoding: target.encoding.as_str(),
            sample_rate: target.sample_rate,
        };

        let response = self
            .endpoint
            .post(&self.client)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::from_reqwest(Stage::Synthesize, e))?;

        // Some vendors answer with the audio itself instead of a JSON envelope
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase())
            .unwrap_or_default();

        if response.status().is_success() && content_type.starts_with("audio/") {
            let audio = response
                .bytes()
                .await
                .map_err(|e| PipelineError::from_reqwest(Stage::Synthesize, e))?;
            let mime = content_type.split(';').next().unwrap_or_default().trim();
            return Ok(SynthesizedAudio {
                audio: audio.to_vec(),
                encoding: AudioEncoding::parse(mime).map(|e| e.as_str().to_string()),
                sample_rate: None,
            });
        }

        let body: SynthesizeResponse = read_json(Stage::Synthesize, response).await?;
        let audio = decode_base64(&body.audio_bytes).map_err(|source| PipelineError::Audio {
            stage: Stage::Synthesize,
            source,
        })?;

        Ok(SynthesizedAudio {
            audio,
            encoding: body.encoding,
            sample_rate: body.sample_rate,
        })
    }
}
