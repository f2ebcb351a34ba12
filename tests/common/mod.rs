//! Shared helpers for the integration tests: a scripted in-process pipeline,
//! a server on an ephemeral port and a small provider-side WebSocket client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

use exotel_bridge::core::pipeline::{
    PipelineError, PipelineResult, Stage, Transcript, TurnInput, TurnOutcome, VoicePipeline,
};
use exotel_bridge::core::vad::Utterance;
use exotel_bridge::{ServerConfig, routes, state::AppState};

pub type ProviderSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Samples per 20 ms packet at 8 kHz
pub const PACKET_SAMPLES: usize = 160;

/// What the scripted pipeline answers with.
#[derive(Debug, Clone, Copy)]
pub enum Script {
    /// Reply with this many milliseconds of audio
    Reply { audio_ms: u64 },
    NoSpeech,
    Fail,
    /// The turn panics mid-flight
    Panic,
}

/// In-process pipeline with a fixed answer and recorded inputs.
pub struct ScriptedPipeline {
    script: Script,
    /// Only the first call waits this long
    first_call_delay: Duration,
    calls: AtomicUsize,
    inputs: Mutex<Vec<TurnInput>>,
    trailing: Mutex<Vec<Utterance>>,
}

impl ScriptedPipeline {
    pub fn new(script: Script) -> Arc<Self> {
        Self::with_first_call_delay(script, Duration::ZERO)
    }

    pub fn with_first_call_delay(script: Script, first_call_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script,
            first_call_delay,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            trailing: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<TurnInput> {
        self.inputs.lock().clone()
    }

    pub fn trailing_calls(&self) -> usize {
        self.trailing.lock().len()
    }
}

#[async_trait]
impl VoicePipeline for ScriptedPipeline {
    async fn run_turn(&self, input: TurnInput) -> Result<TurnOutcome, PipelineError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.clone());
        if call == 0 && !self.first_call_delay.is_zero() {
            tokio::time::sleep(self.first_call_delay).await;
        }

        match self.script {
            Script::Reply { audio_ms } => Ok(TurnOutcome::Reply(PipelineResult {
                transcript: Transcript {
                    text: "hello".to_string(),
                    confidence: Some(0.9),
                    language: None,
                },
                reply_text: format!("reply {}", call + 1),
                audio: vec![0xFF; input.target.bytes_for_ms(audio_ms)],
                format: input.target,
                used_fallback: false,
            })),
            Script::NoSpeech => Ok(TurnOutcome::NoSpeech),
            Script::Fail => Err(PipelineError::Status {
                stage: Stage::Generate,
                status: 500,
                body: "scripted failure".to_string(),
            }),
            Script::Panic => panic!("scripted pipeline bug"),
        }
    }

    async fn transcribe_only(&self, utterance: Utterance) -> Result<Transcript, PipelineError> {
        self.trailing.lock().push(utterance);
        Ok(Transcript {
            text: "goodbye".to_string(),
            confidence: None,
            language: None,
        })
    }
}

/// Configuration tuned for fast, deterministic tests.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.host = "127.0.0.1".to_string();
    config.port = 0;
    config.silence_timeout_ms = 200;
    config.min_utterance_ms = 100;
    config.pre_roll_ms = 0;
    config.outbound_chunk_ms = 100;
    config.pace_playback = false;
    config.mark_ack_timeout_ms = 5_000;
    config
}

/// Serve the full application on an ephemeral port.
pub async fn spawn_server(config: ServerConfig, pipeline: Arc<dyn VoicePipeline>) -> (SocketAddr, Arc<AppState>) {
    let state = AppState::with_pipeline(config, pipeline);
    let app = routes::create_app_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, state)
}

/// Connect as the telephony provider and consume the `connected` greeting.
pub async fn connect(addr: SocketAddr) -> ProviderSocket {
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/media"))
        .await
        .unwrap();
    let greeting = next_event(&mut socket).await.unwrap();
    assert_eq!(greeting["event"], "connected");
    socket
}

pub async fn send_json(socket: &mut ProviderSocket, value: Value) {
    send_text(socket, value.to_string()).await;
}

pub async fn send_text(socket: &mut ProviderSocket, text: String) {
    socket.send(Message::Text(text.into())).await.unwrap();
}

/// Next JSON event, or `None` once the socket closes or nothing arrives
/// within `wait`.
pub async fn next_event_within(socket: &mut ProviderSocket, wait: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let message = tokio::time::timeout_at(deadline, socket.next()).await.ok()??;
        match message.ok()? {
            Message::Text(text) => return Some(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

pub async fn next_event(socket: &mut ProviderSocket) -> Option<Value> {
    next_event_within(socket, Duration::from_secs(5)).await
}

/// Collect events up to and including the next mark.
pub async fn collect_reply(socket: &mut ProviderSocket) -> Vec<Value> {
    let mut events = Vec::new();
    while let Some(event) = next_event(socket).await {
        let is_mark = event["event"] == "mark";
        events.push(event);
        if is_mark {
            return events;
        }
    }
    panic!("socket closed before the reply mark, got {events:?}");
}

pub fn start_event(stream_sid: &str) -> Value {
    json!({
        "event": "start",
        "sequence_number": "1",
        "stream_sid": stream_sid,
        "start": {
            "stream_sid": stream_sid,
            "call_sid": format!("call-{stream_sid}"),
            "account_sid": "acct",
            "from": "+15550001",
            "to": "+15550002",
            "media_format": { "encoding": "base64", "sample_rate": "8000", "bit_rate": "128kbps" }
        }
    })
}

pub fn media_event(stream_sid: &str, sequence_number: u64, payload: String) -> Value {
    json!({
        "event": "media",
        "stream_sid": stream_sid,
        "sequence_number": sequence_number.to_string(),
        "media": {
            "chunk": sequence_number.to_string(),
            "timestamp": (sequence_number * 20).to_string(),
            "payload": payload
        }
    })
}

pub fn mark_event(stream_sid: &str, name: &str) -> Value {
    json!({ "event": "mark", "stream_sid": stream_sid, "mark": { "name": name } })
}

/// One 20 ms PCM16 packet of a loud square wave.
pub fn speech_packet() -> String {
    let mut pcm = Vec::with_capacity(PACKET_SAMPLES * 2);
    for i in 0..PACKET_SAMPLES {
        let sample: i16 = if (i / 8) % 2 == 0 { 8000 } else { -8000 };
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    STANDARD.encode(pcm)
}

pub fn silence_packet() -> String {
    STANDARD.encode(vec![0u8; PACKET_SAMPLES * 2])
}

/// Packets carrying `speech_ms` of speech followed by enough silence to end
/// the utterance under [`test_config`].
pub async fn speak(socket: &mut ProviderSocket, stream_sid: &str, seq: &mut u64, speech_ms: u64) {
    send_speech(socket, stream_sid, seq, speech_ms).await;
    send_silence(socket, stream_sid, seq, 300).await;
}

pub async fn send_speech(socket: &mut ProviderSocket, stream_sid: &str, seq: &mut u64, ms: u64) {
    for _ in 0..ms / 20 {
        *seq += 1;
        send_json(socket, media_event(stream_sid, *seq, speech_packet())).await;
    }
}

pub async fn send_silence(socket: &mut ProviderSocket, stream_sid: &str, seq: &mut u64, ms: u64) {
    for _ in 0..ms / 20 {
        *seq += 1;
        send_json(socket, media_event(stream_sid, *seq, silence_packet())).await;
    }
}

/// Poll until `check` passes or a few seconds elapse.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

pub fn sequence_numbers(events: &[Value]) -> Vec<u64> {
    events
        .iter()
        .map(|e| e["sequence_number"].as_u64().unwrap())
        .collect()
}
