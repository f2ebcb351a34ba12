//! Wire types for the transcribe, generate and synthesize services.

use serde::{Deserialize, Serialize};

use super::HistoryEntry;

#[derive(Debug, Deserialize)]
pub struct TranscribeResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest<'a> {
    pub user_text: &'a str,
    pub session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub history: &'a [HistoryEntry],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(alias = "reply_text", alias = "reply")]
    pub reply_text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeRequest<'a> {
    pub text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<&'a str>,
    pub encoding: &'a str,
    pub sample_rate: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeResponse {
    /// Base64 audio
    #[serde(alias = "audio_bytes", alias = "audio")]
    pub audio_bytes: String,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default, alias = "sample_rate")]
    pub sample_rate: Option<u32>,
}
