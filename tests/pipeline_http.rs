//! HTTP pipeline tests against mock transcribe / generate / synthesize services.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use std::time::Duration;

use exotel_bridge::ServerConfig;
use exotel_bridge::core::codec::{AudioEncoding, AudioFormat};
use exotel_bridge::core::pipeline::{
    PipelineClient, PipelineError, ReplyContext, Stage, TurnInput, TurnOutcome, VoicePipeline,
};
use exotel_bridge::core::vad::Utterance;

const MULAW_8K: AudioFormat = AudioFormat::new(AudioEncoding::Mulaw, 8000);

fn config_for(server: &MockServer) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.transcribe_url = format!("{}/transcribe", server.uri());
    config.generate_url = format!("{}/generate", server.uri());
    config.synthesize_url = format!("{}/synthesize", server.uri());
    config.transcribe_api_key = Some("stt-key".to_string());
    config.pipeline_max_retries = 2;
    config.pipeline_retry_backoff_ms = 10;
    config.transcribe_timeout_ms = 2_000;
    config.generate_timeout_ms = 2_000;
    config.synthesize_timeout_ms = 2_000;
    config
}

fn turn_input() -> TurnInput {
    TurnInput {
        utterance: Utterance {
            pcm: vec![0x10; 8000],
            sample_rate: 8000,
            start_sample: 0,
            end_sample: 4000,
        },
        context: ReplyContext {
            session_id: "stream-1".to_string(),
            system_prompt: Some("Be brief.".to_string()),
            history: Vec::new(),
        },
        target: MULAW_8K,
    }
}

/// 100 ms of PCM16 at 8 kHz, base64 encoded.
fn synthesized_body() -> serde_json::Value {
    json!({
        "audioBytes": STANDARD.encode(vec![0u8; 1600]),
        "encoding": "pcm16",
        "sampleRate": 8000
    })
}

async fn mount_transcript(server: &MockServer, text: &str) {
    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": text })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_full_turn_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .and(header("authorization", "Bearer stt-key"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "text": "what time is it", "confidence": 0.93 })),
        )
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_partial_json(json!({
            "userText": "what time is it",
            "sessionId": "stream-1",
            "systemPrompt": "Be brief."
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "replyText": "It is noon." })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/synthesize"))
        .and(body_partial_json(json!({
            "text": "It is noon.",
            "encoding": "mulaw",
            "sampleRate": 8000
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(synthesized_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = PipelineClient::from_config(&config_for(&server)).unwrap();
    let outcome = client.run_turn(turn_input()).await.unwrap();

    let TurnOutcome::Reply(result) = outcome else {
        panic!("expected a reply, got {outcome:?}");
    };
    assert_eq!(result.transcript.text, "what time is it");
    assert_eq!(result.reply_text, "It is noon.");
    assert!(!result.used_fallback);
    assert_eq!(result.format, MULAW_8K);
    // 800 PCM16 samples become 800 µ-law bytes
    assert_eq!(result.audio.len(), 800);
}

#[tokio::test]
async fn test_empty_transcript_skips_generate_and_synthesize() {
    let server = MockServer::start().await;
    mount_transcript(&server, "   ").await;

    Mock::given(path("/generate"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = PipelineClient::from_config(&config_for(&server)).unwrap();
    let outcome = client.run_turn(turn_input()).await.unwrap();
    assert_eq!(outcome, TurnOutcome::NoSpeech);
}

#[tokio::test]
async fn test_transient_server_error_is_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/transcribe"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_transcript(&server, "hello").await;

    Mock::given(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "reply": "hi" })))
        .mount(&server)
        .await;
    Mock::given(path("/synthesize"))
        .respond_with(ResponseTemplate::new(200).set_body_json(synthesized_body()))
        .mount(&server)
        .await;

    let client = PipelineClient::from_config(&config_for(&server)).unwrap();
    let outcome = client.run_turn(turn_input()).await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Reply(ref r) if r.reply_text == "hi"));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;

    Mock::given(path("/transcribe"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad audio"))
        .expect(1)
        .mount(&server)
        .await;

    let client = PipelineClient::from_config(&config_for(&server)).unwrap();
    let err = client.run_turn(turn_input()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Status {
            stage: Stage::Transcribe,
            status: 400,
            ..
        }
    ));
}

#[tokio::test]
async fn test_slow_synthesis_times_out() {
    let server = MockServer::start().await;
    mount_transcript(&server, "hello").await;

    Mock::given(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "replyText": "hi" })))
        .mount(&server)
        .await;
    Mock::given(path("/synthesize"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(synthesized_body())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let mut config = config_for(&server);
    config.synthesize_timeout_ms = 200;
    let client = PipelineClient::from_config(&config).unwrap();

    let started = std::time::Instant::now();
    let err = client.run_turn(turn_input()).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Timeout {
            stage: Stage::Synthesize,
            timeout_ms: 200
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_generate_failure_speaks_fallback() {
    let server = MockServer::start().await;
    mount_transcript(&server, "hello").await;

    Mock::given(path("/generate"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let config = config_for(&server);
    let fallback = config.fallback_reply.clone().unwrap();
    Mock::given(path("/synthesize"))
        .and(body_partial_json(json!({ "text": fallback })))
        .respond_with(ResponseTemplate::new(200).set_body_json(synthesized_body()))
        .expect(1)
        .mount(&server)
        .await;

    let client = PipelineClient::from_config(&config).unwrap();
    let outcome = client.run_turn(turn_input()).await.unwrap();

    let TurnOutcome::Reply(result) = outcome else {
        panic!("expected the fallback reply");
    };
    assert!(result.used_fallback);
    assert_eq!(result.reply_text, fallback);
}

#[tokio::test]
async fn test_raw_audio_response_is_accepted() {
    let server = MockServer::start().await;
    mount_transcript(&server, "hello").await;

    Mock::given(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "replyText": "hi" })))
        .mount(&server)
        .await;
    Mock::given(path("/synthesize"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/x-mulaw")
                .set_body_bytes(vec![0x7F; 400]),
        )
        .mount(&server)
        .await;

    let client = PipelineClient::from_config(&config_for(&server)).unwrap();
    let TurnOutcome::Reply(result) = client.run_turn(turn_input()).await.unwrap() else {
        panic!("expected a reply");
    };
    assert_eq!(result.audio, vec![0x7F; 400]);
}

#[tokio::test]
async fn test_transcribe_only_for_trailing_audio() {
    let server = MockServer::start().await;
    mount_transcript(&server, "bye").await;

    let client = PipelineClient::from_config(&config_for(&server)).unwrap();
    let transcript = client
        .transcribe_only(turn_input().utterance)
        .await
        .unwrap();
    assert_eq!(transcript.text, "bye");
}
