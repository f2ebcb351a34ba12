use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::{
    BargeInPolicy, CallMetadata, OutboundFrame, PipelineState, SequenceCounters, SessionAction,
    SessionSettings, SessionSnapshot, TrailingAudioPolicy, reply_mark_name,
};
use crate::core::codec::{AudioFormat, decode_base64, decode_frame, to_pcm16};
use crate::core::pipeline::{
    HistoryEntry, PipelineError, ReplyContext, Role, TurnInput, TurnOutcome,
};
use crate::core::vad::{Segmenter, SegmenterEvent, Utterance};
use crate::errors::BridgeError;

#[derive(Debug)]
enum Queued {
    Media(Vec<u8>),
    Mark(String),
}

/// State machine for one telephony stream.
///
/// ```text
/// Idle ──start──► Listening ──utterance──► Processing ──reply──► Speaking
///                    ▲  ▲                      │                    │
///                    │  └── no speech / error ─┘                    │
///                    └──────────── mark ack / mark timeout ─────────┘
/// any ──stop──► Closed
/// ```
///
/// At most one turn is in flight. Utterances completed while a turn owns the
/// pipeline are merged into a single pending utterance that starts as soon as
/// the session returns to listening.
#[derive(Debug)]
pub struct Session {
    connection_id: String,
    settings: SessionSettings,
    metadata: Option<CallMetadata>,
    format: AudioFormat,
    state: PipelineState,
    segmenter: Segmenter,
    /// Raw frames received before the start event
    pre_start: VecDeque<Vec<u8>>,
    pending: Option<Utterance>,
    outbound: VecDeque<Queued>,
    counters: SequenceCounters,
    /// Outbound audio already handed out, in samples
    samples_sent: u64,
    last_turn_id: u64,
    history: VecDeque<HistoryEntry>,
    turns_completed: u64,
    turns_failed: u64,
    frames_received: u64,
    frames_dropped: u64,
    started_at_secs: u64,
}

impl Session {
    pub fn new(connection_id: impl Into<String>, settings: SessionSettings) -> Self {
        let format = settings.default_format;
        let segmenter = Segmenter::new(settings.segmenter.with_sample_rate(format.sample_rate));
        let started_at_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            connection_id: connection_id.into(),
            settings,
            metadata: None,
            format,
            state: PipelineState::Idle,
            segmenter,
            pre_start: VecDeque::new(),
            pending: None,
            outbound: VecDeque::new(),
            counters: SequenceCounters::default(),
            samples_sent: 0,
            last_turn_id: 0,
            history: VecDeque::new(),
            turns_completed: 0,
            turns_failed: 0,
            frames_received: 0,
            frames_dropped: 0,
            started_at_secs,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn metadata(&self) -> Option<&CallMetadata> {
        self.metadata.as_ref()
    }

    /// Provider stream id, falling back to the connection id before start.
    pub fn stream_sid(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.stream_sid.as_str())
            .unwrap_or(&self.connection_id)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn counters(&self) -> SequenceCounters {
        self.counters
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn is_closed(&self) -> bool {
        self.state == PipelineState::Closed
    }

    /// Handle the provider's start event.
    ///
    /// Frames buffered while idle are replayed through the segmenter in
    /// arrival order.
    pub fn start(
        &mut self,
        metadata: CallMetadata,
        format: Option<AudioFormat>,
    ) -> Result<Vec<SessionAction>, BridgeError> {
        match self.state {
            PipelineState::Idle => {}
            PipelineState::Closed => {
                return Err(BridgeError::ProtocolError(
                    "start event after stream was stopped".to_string(),
                ));
            }
            _ => {
                return Err(BridgeError::ProtocolError(format!(
                    "duplicate start event for stream {}",
                    self.stream_sid()
                )));
            }
        }

        if let Some(format) = format {
            self.format = format;
        }
        self.segmenter = Segmenter::new(
            self.settings
                .segmenter
                .with_sample_rate(self.format.sample_rate),
        );
        info!(
            stream_sid = %metadata.stream_sid,
            call_sid = ?metadata.call_sid,
            encoding = %self.format.encoding,
            sample_rate = self.format.sample_rate,
            buffered_frames = self.pre_start.len(),
            "Stream started"
        );
        self.metadata = Some(metadata);
        self.state = PipelineState::Listening;

        let mut actions = Vec::new();
        let buffered: Vec<Vec<u8>> = self.pre_start.drain(..).collect();
        for frame in buffered {
            match self.ingest(&frame) {
                Ok(more) => actions.extend(more),
                Err(e) => {
                    self.frames_dropped += 1;
                    warn!(error = %e, "Dropping buffered frame");
                }
            }
        }
        Ok(actions)
    }

    /// Handle one inbound media payload (base64 text).
    pub fn on_media(&mut self, payload: &str) -> Result<Vec<SessionAction>, BridgeError> {
        self.frames_received += 1;
        match self.state {
            PipelineState::Closed => Ok(Vec::new()),
            PipelineState::Idle => {
                let frame = decode_base64(payload).inspect_err(|_| self.frames_dropped += 1)?;
                if self.pre_start.len() >= self.settings.pre_start_buffer_frames {
                    self.pre_start.pop_front();
                    self.frames_dropped += 1;
                }
                if self.settings.pre_start_buffer_frames > 0 {
                    self.pre_start.push_back(frame);
                }
                Ok(Vec::new())
            }
            _ => {
                let frame = decode_frame(payload, self.format.encoding)
                    .inspect_err(|_| self.frames_dropped += 1)?;
                self.ingest(&frame)
            }
        }
    }

    fn ingest(&mut self, frame: &[u8]) -> Result<Vec<SessionAction>, BridgeError> {
        let pcm = to_pcm16(frame, self.format.encoding)?;
        let events = self.segmenter.push(&pcm);

        let mut actions = Vec::new();
        for event in events {
            match event {
                SegmenterEvent::SpeechStarted => {
                    if self.settings.barge_in == BargeInPolicy::Interrupt {
                        actions.extend(self.interrupt());
                    }
                }
                SegmenterEvent::UtteranceReady(utterance) => {
                    self.accept_utterance(utterance, &mut actions);
                }
                SegmenterEvent::NoiseDiscarded { speech_ms } => {
                    debug!(speech_ms, "Ignoring short noise burst");
                    // A barge-in that turned out to be noise leaves queued speech behind
                    self.start_pending(&mut actions);
                }
            }
        }
        Ok(actions)
    }

    fn accept_utterance(&mut self, utterance: Utterance, actions: &mut Vec<SessionAction>) {
        match self.state {
            PipelineState::Listening => {
                let utterance = match self.pending.take() {
                    Some(mut earlier) => {
                        earlier.append(utterance);
                        earlier
                    }
                    None => utterance,
                };
                actions.push(self.begin_turn(utterance));
            }
            PipelineState::Processing { .. } | PipelineState::Speaking { .. } => {
                debug!(
                    duration_ms = utterance.duration_ms(),
                    state = %self.state,
                    "Queueing utterance until the current turn completes"
                );
                match &mut self.pending {
                    Some(earlier) => earlier.append(utterance),
                    None => self.pending = Some(utterance),
                }
            }
            PipelineState::Idle | PipelineState::Closed => {}
        }
    }

    fn begin_turn(&mut self, utterance: Utterance) -> SessionAction {
        self.last_turn_id += 1;
        let turn_id = self.last_turn_id;
        self.state = PipelineState::Processing { turn_id };

        info!(
            stream_sid = %self.stream_sid(),
            turn_id,
            duration_ms = utterance.duration_ms(),
            "Starting turn"
        );

        SessionAction::StartTurn {
            turn_id,
            input: TurnInput {
                utterance,
                context: self.reply_context(),
                target: self.format,
            },
        }
    }

    fn start_pending(&mut self, actions: &mut Vec<SessionAction>) {
        if self.state != PipelineState::Listening {
            return;
        }
        if let Some(utterance) = self.pending.take() {
            actions.push(self.begin_turn(utterance));
        }
    }

    fn reply_context(&self) -> ReplyContext {
        ReplyContext {
            session_id: self.stream_sid().to_string(),
            system_prompt: self.settings.system_prompt.clone(),
            history: self.history.iter().cloned().collect(),
        }
    }

    fn record_exchange(&mut self, user_text: &str, reply_text: &str) {
        let max_entries = self.settings.max_history_turns * 2;
        if max_entries == 0 {
            return;
        }
        self.history.push_back(HistoryEntry {
            role: Role::User,
            text: user_text.to_string(),
        });
        self.history.push_back(HistoryEntry {
            role: Role::Assistant,
            text: reply_text.to_string(),
        });
        while self.history.len() > max_entries {
            self.history.pop_front();
        }
    }

    /// Caller speech during a pending or playing reply under the interrupt policy.
    ///
    /// Queued speech stays pending: it is joined to the utterance that just
    /// started, or runs on its own if that turns out to be noise.
    fn interrupt(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match self.state {
            PipelineState::Processing { turn_id } => {
                actions.push(SessionAction::CancelTurn { turn_id });
            }
            PipelineState::Speaking { .. } => {}
            _ => return actions,
        }

        info!(
            stream_sid = %self.stream_sid(),
            state = %self.state,
            "Caller barged in, abandoning reply"
        );
        self.outbound.clear();
        actions.push(SessionAction::Send(self.numbered_clear()));
        self.state = PipelineState::Listening;
        actions
    }

    /// Apply the result of a turn.
    ///
    /// Results for any turn other than the one in flight are ignored.
    pub fn on_pipeline_outcome(
        &mut self,
        turn_id: u64,
        result: Result<TurnOutcome, PipelineError>,
    ) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match self.state {
            PipelineState::Processing { turn_id: active } if active == turn_id => {}
            _ => {
                debug!(turn_id, state = %self.state, "Ignoring stale pipeline result");
                return actions;
            }
        }

        match result {
            Ok(TurnOutcome::NoSpeech) => {
                debug!(turn_id, "Turn produced no speech");
                self.state = PipelineState::Listening;
            }
            Ok(TurnOutcome::Reply(result)) => {
                self.record_exchange(&result.transcript.text, &result.reply_text);
                self.turns_completed += 1;
                info!(
                    turn_id,
                    transcript = %result.transcript.text,
                    reply = %result.reply_text,
                    used_fallback = result.used_fallback,
                    "Turn completed"
                );

                if result.audio.is_empty() {
                    self.state = PipelineState::Listening;
                } else {
                    let frames = self.enqueue_reply(turn_id, &result.audio, result.format);
                    self.state = PipelineState::Speaking { turn_id };
                    actions.push(SessionAction::PlaybackQueued { turn_id, frames });
                    return actions;
                }
            }
            Err(e) => {
                self.turns_failed += 1;
                let err = BridgeError::from(e);
                warn!(turn_id, error = %err, "Turn failed");
                self.outbound.clear();
                actions.push(SessionAction::Send(self.numbered_clear()));
                self.state = PipelineState::Listening;
            }
        }

        self.start_pending(&mut actions);
        actions
    }

    fn enqueue_reply(&mut self, turn_id: u64, audio: &[u8], format: AudioFormat) -> usize {
        let chunk_bytes = format.bytes_for_ms(self.settings.outbound_chunk_ms);
        let mut frames = 0;
        for chunk in audio.chunks(chunk_bytes) {
            self.outbound.push_back(Queued::Media(chunk.to_vec()));
            frames += 1;
        }
        self.outbound.push_back(Queued::Mark(reply_mark_name(turn_id)));
        frames
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Next queued frame with its counters assigned.
    ///
    /// This is the only place media and mark counters advance, so frames
    /// leave in exactly the order they were numbered.
    pub fn next_outbound(&mut self) -> Option<OutboundFrame> {
        let frame = match self.outbound.pop_front()? {
            Queued::Media(payload) => {
                let sequence_number = self.counters.next_sequence();
                let chunk = self.counters.next_chunk();
                let timestamp_ms = self.samples_to_ms(self.samples_sent);
                self.samples_sent += (payload.len() / self.format.encoding.sample_width()) as u64;
                OutboundFrame::Media {
                    sequence_number,
                    chunk,
                    timestamp_ms,
                    payload,
                }
            }
            Queued::Mark(name) => {
                self.counters.marks += 1;
                OutboundFrame::Mark {
                    sequence_number: self.counters.next_sequence(),
                    name,
                }
            }
        };
        Some(frame)
    }

    fn numbered_clear(&mut self) -> OutboundFrame {
        OutboundFrame::Clear {
            sequence_number: self.counters.next_sequence(),
        }
    }

    fn samples_to_ms(&self, samples: u64) -> u64 {
        if self.format.sample_rate == 0 {
            return 0;
        }
        samples * 1000 / u64::from(self.format.sample_rate)
    }

    /// Turn whose playback is fully sent and waits for the provider's mark echo.
    pub fn awaiting_mark(&self) -> Option<u64> {
        match self.state {
            PipelineState::Speaking { turn_id } if self.outbound.is_empty() => Some(turn_id),
            _ => None,
        }
    }

    /// Handle a mark echoed back by the provider.
    pub fn on_mark(&mut self, name: &str) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match self.awaiting_mark() {
            Some(turn_id) if name == reply_mark_name(turn_id) => {
                debug!(turn_id, "Playback acknowledged");
                self.finish_speaking(&mut actions);
            }
            _ => debug!(mark = name, state = %self.state, "Ignoring mark"),
        }
        actions
    }

    /// The provider never acknowledged playback of `turn_id`.
    pub fn on_mark_timeout(&mut self, turn_id: u64) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.awaiting_mark() == Some(turn_id) {
            warn!(turn_id, "No playback acknowledgement, resuming listening");
            self.finish_speaking(&mut actions);
        }
        actions
    }

    /// The provider flushed its playback buffer.
    pub fn on_clear(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        let dropped = self.outbound.len();
        self.outbound.clear();
        if let PipelineState::Speaking { turn_id } = self.state {
            debug!(turn_id, dropped, "Provider cleared playback");
            self.finish_speaking(&mut actions);
        }
        actions
    }

    fn finish_speaking(&mut self, actions: &mut Vec<SessionAction>) {
        self.state = PipelineState::Listening;
        self.start_pending(actions);
    }

    /// Close the session. Returns leftover speech when the trailing audio
    /// policy asks for it to be processed.
    pub fn close(&mut self) -> Option<Utterance> {
        if self.is_closed() {
            return None;
        }
        let previous = self.state;
        self.state = PipelineState::Closed;
        self.outbound.clear();
        self.pre_start.clear();

        let trailing = match (self.pending.take(), self.segmenter.flush()) {
            (Some(mut pending), Some(last)) => {
                pending.append(last);
                Some(pending)
            }
            (pending, last) => pending.or(last),
        };

        info!(
            stream_sid = %self.stream_sid(),
            previous_state = %previous,
            turns_completed = self.turns_completed,
            has_trailing_audio = trailing.is_some(),
            "Session closed"
        );

        match self.settings.trailing_audio {
            TrailingAudioPolicy::Process => trailing,
            TrailingAudioPolicy::Discard => None,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let metadata = self.metadata.as_ref();
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            stream_sid: metadata.map(|m| m.stream_sid.clone()),
            call_sid: metadata.and_then(|m| m.call_sid.clone()),
            from: metadata.and_then(|m| m.from.clone()),
            to: metadata.and_then(|m| m.to.clone()),
            state: self.state.name(),
            encoding: self.format.encoding,
            sample_rate: self.format.sample_rate,
            turns_completed: self.turns_completed,
            turns_failed: self.turns_failed,
            frames_received: self.frames_received,
            frames_dropped: self.frames_dropped,
            sequence_number: self.counters.sequence_number,
            started_at_secs: self.started_at_secs,
        }
    }
}
