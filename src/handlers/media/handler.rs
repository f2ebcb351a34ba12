//! Media stream WebSocket handler
//!
//! One task per connection owns the [`Session`] and runs a single select
//! loop over provider frames, pipeline results, playback pacing, the mark
//! acknowledgement deadline and the idle timeout. A separate writer task
//! serializes outgoing events onto the socket.

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{FutureExt, SinkExt, StreamExt};
use std::any::Any;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};
use tokio::{select, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::pipeline::{PipelineError, TurnInput, TurnOutcome};
use crate::core::session::{OutboundFrame, Session, SessionAction};
use crate::errors::BridgeError;
use crate::middleware::ClientIp;
use crate::state::AppState;

use super::messages::{MessageRoute, OutgoingEvent, parse_event};
use super::processor::process_event;

/// Outgoing queue depth; a few seconds of 100 ms frames plus control events
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (1 MB)
const MAX_WS_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum WebSocket message size (1 MB)
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// How long queued frames may take to flush once the session ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type TurnResult = (u64, Result<TurnOutcome, PipelineError>);

/// Media stream WebSocket handler
///
/// Upgrades the provider's HTTP request to a WebSocket carrying one call's
/// audio in both directions.
pub async fn media_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
) -> Response {
    debug!(%client_ip, "Media WebSocket upgrade requested");

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_media_socket(socket, state, client_ip))
}

/// Per-connection state that outlives a single select iteration.
struct MediaConnection {
    state: Arc<AppState>,
    session: Session,
    message_tx: mpsc::Sender<MessageRoute>,
    outcome_tx: mpsc::Sender<TurnResult>,
    /// Parent of every turn's token; cancelled on teardown
    turns_cancel: CancellationToken,
    active_turn: Option<(u64, CancellationToken)>,
    next_frame_at: Option<Instant>,
    mark_deadline: Option<(u64, Instant)>,
    chunk_interval: Duration,
    mark_ack_timeout: Duration,
    pace_playback: bool,
}

impl MediaConnection {
    fn connection_id(&self) -> &str {
        self.session.connection_id()
    }

    fn publish(&self) {
        self.state.sessions.publish(self.session.snapshot());
    }

    /// Handle one text frame. Returns false when the provider stopped the stream.
    async fn handle_text(&mut self, text: &str) -> bool {
        let event = match parse_event(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(connection_id = %self.connection_id(), error = %e, "Ignoring malformed message");
                return true;
            }
        };

        let outcome = process_event(event, &mut self.session);
        self.apply(outcome.actions).await;
        self.publish();
        !outcome.stop
    }

    async fn handle_turn_result(&mut self, turn_id: u64, result: Result<TurnOutcome, PipelineError>) {
        if matches!(self.active_turn, Some((id, _)) if id == turn_id) {
            self.active_turn = None;
        }
        let actions = self.session.on_pipeline_outcome(turn_id, result);
        self.apply(actions).await;
        self.publish();
    }

    async fn handle_mark_deadline(&mut self) {
        if let Some((turn_id, _)) = self.mark_deadline.take() {
            let actions = self.session.on_mark_timeout(turn_id);
            self.apply(actions).await;
            self.publish();
        }
    }

    async fn apply(&mut self, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::StartTurn { turn_id, input } => self.spawn_turn(turn_id, input),
                SessionAction::CancelTurn { turn_id } => self.cancel_turn(turn_id),
                SessionAction::Send(frame) => self.send_frame(frame).await,
                SessionAction::PlaybackQueued { turn_id, frames } => {
                    debug!(stream_sid = %self.session.stream_sid(), turn_id, frames, "Reply queued");
                }
            }
        }
        self.sync_timers();
    }

    fn spawn_turn(&mut self, turn_id: u64, input: TurnInput) {
        let token = self.turns_cancel.child_token();
        let cancelled = token.clone();
        let pipeline = self.state.pipeline.clone();
        let outcome_tx = self.outcome_tx.clone();
        let stream_sid = self.session.stream_sid().to_string();

        info!(%stream_sid, turn_id, audio_ms = input.utterance.duration_ms(), "Starting turn");

        tokio::spawn(async move {
            let turn = AssertUnwindSafe(pipeline.run_turn(input)).catch_unwind();
            select! {
                _ = cancelled.cancelled() => {
                    debug!(%stream_sid, turn_id, "Turn cancelled");
                }
                result = turn => {
                    let result = result.unwrap_or_else(|payload| {
                        let reason = panic_reason(payload.as_ref());
                        error!(%stream_sid, turn_id, %reason, "Turn panicked");
                        Err(PipelineError::Aborted(reason))
                    });
                    // The connection may already be gone
                    let _ = outcome_tx.send((turn_id, result)).await;
                }
            }
        });

        if let Some((_, previous)) = self.active_turn.replace((turn_id, token)) {
            previous.cancel();
        }
    }

    fn cancel_turn(&mut self, turn_id: u64) {
        match self.active_turn.take() {
            Some((id, token)) if id == turn_id => {
                debug!(stream_sid = %self.session.stream_sid(), turn_id, "Cancelling turn");
                token.cancel();
            }
            other => self.active_turn = other,
        }
    }

    async fn send_frame(&self, frame: OutboundFrame) {
        let event = OutgoingEvent::from_frame(self.session.stream_sid(), frame);
        if self
            .message_tx
            .send(MessageRoute::Outgoing(event))
            .await
            .is_err()
        {
            debug!(connection_id = %self.connection_id(), "Writer closed, dropping frame");
        }
    }

    /// Send queued playback up to and including the next media frame, or
    /// everything when playback is not paced.
    async fn pump_playback(&mut self) {
        let scheduled = self.next_frame_at.unwrap_or_else(Instant::now);
        while let Some(frame) = self.session.next_outbound() {
            let is_media = matches!(frame, OutboundFrame::Media { .. });
            self.send_frame(frame).await;
            if is_media && self.pace_playback {
                break;
            }
        }

        self.next_frame_at = self
            .session
            .has_outbound()
            .then(|| (scheduled + self.chunk_interval).max(Instant::now()));
        self.sync_timers();
    }

    /// Bring the playback and mark timers in line with the session.
    fn sync_timers(&mut self) {
        if !self.session.has_outbound() {
            self.next_frame_at = None;
        } else if self.next_frame_at.is_none() {
            self.next_frame_at = Some(Instant::now());
        }

        self.mark_deadline = match (self.session.awaiting_mark(), self.mark_deadline) {
            (Some(turn_id), Some((armed, at))) if armed == turn_id => Some((armed, at)),
            (Some(turn_id), _) => Some((turn_id, Instant::now() + self.mark_ack_timeout)),
            (None, _) => None,
        };
    }

    /// Cancel in-flight work and close the session.
    fn shutdown(mut self) {
        self.turns_cancel.cancel();

        if let Some(trailing) = self.session.close() {
            let pipeline = self.state.pipeline.clone();
            let stream_sid = self.session.stream_sid().to_string();
            tokio::spawn(async move {
                match pipeline.transcribe_only(trailing).await {
                    Ok(transcript) => {
                        info!(%stream_sid, transcript = %transcript.text, "Trailing audio transcribed");
                    }
                    Err(e) => warn!(%stream_sid, error = %e, "Trailing audio transcription failed"),
                }
            });
        }

        self.state.sessions.remove(self.session.connection_id());
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn spawn_writer(
    mut sender: futures::stream::SplitSink<WebSocket, Message>,
    mut message_rx: mpsc::Receiver<MessageRoute>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            let should_close = matches!(route, MessageRoute::Close);

            let result = match route {
                MessageRoute::Outgoing(event) => match serde_json::to_string(&event) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing event: {}", e);
                        continue;
                    }
                },
                MessageRoute::Close => sender.send(Message::Close(None)).await,
            };

            if let Err(e) = result {
                debug!("Failed to send WebSocket message: {}", e);
                break;
            }

            if should_close {
                break;
            }
        }
    })
}

/// Handle the media WebSocket connection
async fn handle_media_socket(socket: WebSocket, state: Arc<AppState>, client_ip: IpAddr) {
    let connection_id = Uuid::new_v4().to_string();
    info!(%connection_id, %client_ip, "Media WebSocket connection established");

    let (sender, mut receiver) = socket.split();
    let (message_tx, message_rx) = mpsc::channel::<MessageRoute>(CHANNEL_BUFFER_SIZE);
    let mut sender_task = spawn_writer(sender, message_rx);
    let (outcome_tx, mut outcome_rx) = mpsc::channel::<TurnResult>(8);

    let config = &state.config;
    let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
    let mut conn = MediaConnection {
        session: Session::new(connection_id.clone(), state.session_settings().clone()),
        message_tx,
        outcome_tx,
        turns_cancel: CancellationToken::new(),
        active_turn: None,
        next_frame_at: None,
        mark_deadline: None,
        chunk_interval: Duration::from_millis(config.outbound_chunk_ms),
        mark_ack_timeout: Duration::from_millis(config.mark_ack_timeout_ms),
        pace_playback: config.pace_playback,
        state: state.clone(),
    };
    conn.publish();

    let _ = conn
        .message_tx
        .send(MessageRoute::Outgoing(OutgoingEvent::connected()))
        .await;

    let mut last_activity = Instant::now();
    let mut close_socket = false;

    loop {
        let idle_at = last_activity + idle_timeout;
        let frame_due = conn.next_frame_at;
        let mark_due = conn.mark_deadline.map(|(_, at)| at);

        select! {
            msg_result = receiver.next() => {
                last_activity = Instant::now();

                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        if !conn.handle_text(text.as_str()).await {
                            close_socket = true;
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!(%connection_id, len = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(%connection_id, ?frame, "Media WebSocket closed by provider");
                        break;
                    }
                    // Ping and pong are answered by axum
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let e = BridgeError::from(e);
                        warn!(%connection_id, error = %e, "Media WebSocket error");
                        break;
                    }
                    None => {
                        info!(%connection_id, "Media WebSocket connection closed");
                        break;
                    }
                }
            }
            Some((turn_id, result)) = outcome_rx.recv() => {
                conn.handle_turn_result(turn_id, result).await;
            }
            _ = sleep_until(frame_due.unwrap_or(idle_at)), if frame_due.is_some() => {
                conn.pump_playback().await;
            }
            _ = sleep_until(mark_due.unwrap_or(idle_at)), if mark_due.is_some() => {
                conn.handle_mark_deadline().await;
            }
            _ = sleep_until(idle_at) => {
                warn!(
                    %connection_id,
                    idle_secs = idle_timeout.as_secs(),
                    "Media WebSocket idle, closing stale connection"
                );
                close_socket = true;
                break;
            }
        }
    }

    // No frame may follow the close, so it is queued before anything else can be
    if close_socket {
        let _ = conn.message_tx.send(MessageRoute::Close).await;
    }
    conn.shutdown();

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }

    // Slot taken by the connection limit middleware before the upgrade
    state.release_connection(client_ip);

    info!(%connection_id, "Media WebSocket connection terminated");
}
