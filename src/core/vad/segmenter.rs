//! RMS silence segmenter.
//!
//! # State Transitions
//!
//! ```text
//! [Quiet] ─── rms > threshold ──► [Voiced]            (SpeechStarted)
//!    ▲                               │   ▲
//!    │                  rms <= threshold │ rms > threshold (timer cancelled)
//!    │                               ▼   │
//!    └── silence >= timeout ──── [Trailing silence]   (UtteranceReady / NoiseDiscarded)
//! ```
//!
//! While quiet, only the most recent `pre_roll_ms` of audio is retained so the
//! first syllable is not clipped. Continuous speech longer than
//! `max_utterance_ms` is cut without waiting for silence.

use tracing::{debug, trace};

use super::rms_energy;

/// Tunables for the segmenter. Every value is exposed through configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmenterConfig {
    /// Sample rate of the PCM16 stream being segmented
    pub sample_rate: u32,
    /// Normalized RMS above which a packet counts as speech
    pub silence_threshold: f32,
    /// Sustained silence that ends an utterance
    pub silence_timeout_ms: u64,
    /// Voiced audio shorter than this is discarded as noise
    pub min_utterance_ms: u64,
    /// Continuous speech is cut into an utterance at this length
    pub max_utterance_ms: u64,
    /// Leading audio kept ahead of the first voiced packet
    pub pre_roll_ms: u64,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            silence_threshold: 0.01,
            silence_timeout_ms: 750,
            min_utterance_ms: 250,
            max_utterance_ms: 15_000,
            pre_roll_ms: 300,
        }
    }
}

impl SegmenterConfig {
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }
}

/// A contiguous span of caller audio judged to be one spoken turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// PCM16 little-endian mono samples
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    /// Offset of the first sample in the session's audio timeline
    pub start_sample: u64,
    /// Offset one past the last sample
    pub end_sample: u64,
}

impl Utterance {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.pcm.len() as u64 / 2) * 1000 / u64::from(self.sample_rate)
    }

    /// Extend this utterance with audio that followed it.
    pub fn append(&mut self, later: Utterance) {
        self.pcm.extend_from_slice(&later.pcm);
        self.end_sample = later.end_sample;
    }
}

/// Output of [`Segmenter::push`].
#[derive(Debug, Clone, PartialEq)]
pub enum SegmenterEvent {
    /// First voiced packet after quiet
    SpeechStarted,
    /// A complete utterance, trailing silence excluded
    UtteranceReady(Utterance),
    /// Voiced audio that ended before reaching the minimum duration
    NoiseDiscarded { speech_ms: u64 },
}

#[derive(Debug)]
pub struct Segmenter {
    config: SegmenterConfig,
    buffer: Vec<u8>,
    /// Timeline offset of `buffer[0]`, in samples
    buffer_start: u64,
    /// Samples consumed since creation
    position: u64,
    in_speech: bool,
    voiced_samples: u64,
    /// Byte index in `buffer` where the current silence run began
    silence_start: Option<usize>,
    silence_samples: u64,
    /// Current speech run continues an utterance that was cut at max length
    continued: bool,
    last_rms: f32,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            buffer_start: 0,
            position: 0,
            in_speech: false,
            voiced_samples: 0,
            silence_start: None,
            silence_samples: 0,
            continued: false,
            last_rms: 0.0,
        }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    pub fn is_speaking(&self) -> bool {
        self.in_speech
    }

    pub fn last_rms(&self) -> f32 {
        self.last_rms
    }

    /// Milliseconds of audio currently held.
    pub fn buffered_ms(&self) -> u64 {
        self.samples_to_ms(self.buffer.len() as u64 / 2)
    }

    fn samples_to_ms(&self, samples: u64) -> u64 {
        if self.config.sample_rate == 0 {
            return 0;
        }
        samples * 1000 / u64::from(self.config.sample_rate)
    }

    /// Feed one analysis window (normally one provider packet) of PCM16.
    pub fn push(&mut self, pcm: &[u8]) -> Vec<SegmenterEvent> {
        let mut events = Vec::new();
        let pcm = &pcm[..pcm.len() - pcm.len() % 2];
        let samples = (pcm.len() / 2) as u64;
        if samples == 0 {
            return events;
        }

        let rms = rms_energy(pcm);
        self.last_rms = rms;
        let voiced = rms > self.config.silence_threshold;

        if !self.in_speech {
            if !voiced {
                self.append(pcm, samples);
                self.trim_pre_roll();
                return events;
            }
            trace!(rms, "speech started");
            self.in_speech = true;
            self.voiced_samples = 0;
            self.silence_start = None;
            self.silence_samples = 0;
            events.push(SegmenterEvent::SpeechStarted);
        }

        if voiced {
            self.silence_start = None;
            self.silence_samples = 0;
            self.append(pcm, samples);
            self.voiced_samples += samples;

            if self.buffered_ms() >= self.config.max_utterance_ms {
                debug!(
                    max_utterance_ms = self.config.max_utterance_ms,
                    "utterance reached maximum length, cutting"
                );
                let end = self.buffer.len();
                events.push(self.take(end));
                self.continued = true;
            }
        } else {
            let silence_start = *self.silence_start.get_or_insert(self.buffer.len());
            self.append(pcm, samples);
            self.silence_samples += samples;

            if self.samples_to_ms(self.silence_samples) >= self.config.silence_timeout_ms {
                events.push(self.take(silence_start));
                self.in_speech = false;
            }
        }

        events
    }

    /// Close out whatever is buffered.
    ///
    /// Returns the pending utterance when speech was in progress and long
    /// enough to keep. The segmenter is empty afterwards.
    pub fn flush(&mut self) -> Option<Utterance> {
        if !self.in_speech {
            self.reset();
            return None;
        }

        let end = self.silence_start.unwrap_or(self.buffer.len());
        let event = self.take(end);
        self.in_speech = false;

        match event {
            SegmenterEvent::UtteranceReady(utterance) => Some(utterance),
            _ => None,
        }
    }

    /// Drop all buffered audio and return to quiet.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.buffer_start = self.position;
        self.in_speech = false;
        self.voiced_samples = 0;
        self.silence_start = None;
        self.silence_samples = 0;
        self.continued = false;
    }

    fn append(&mut self, pcm: &[u8], samples: u64) {
        self.buffer.extend_from_slice(pcm);
        self.position += samples;
    }

    fn trim_pre_roll(&mut self) {
        let keep_samples = u64::from(self.config.sample_rate) * self.config.pre_roll_ms / 1000;
        let keep_bytes = (keep_samples * 2) as usize;
        if self.buffer.len() > keep_bytes {
            let excess = self.buffer.len() - keep_bytes;
            self.buffer.drain(..excess);
            self.buffer_start += (excess / 2) as u64;
        }
    }

    /// Cut `buffer[..end]` out as an utterance and restart accumulation.
    ///
    /// The minimum-length floor only applies to a fresh burst; the tail of a
    /// force-cut utterance is kept however short it is.
    fn take(&mut self, end: usize) -> SegmenterEvent {
        let speech_ms = self.samples_to_ms(self.voiced_samples);
        let continued = std::mem::take(&mut self.continued);
        let end = end.min(self.buffer.len());

        let pcm: Vec<u8> = self.buffer[..end].to_vec();
        let start_sample = self.buffer_start;
        let end_sample = start_sample + (end / 2) as u64;

        self.buffer.clear();
        self.buffer_start = self.position;
        self.voiced_samples = 0;
        self.silence_start = None;
        self.silence_samples = 0;

        if end == 0
            || speech_ms == 0
            || (!continued && speech_ms < self.config.min_utterance_ms)
        {
            debug!(speech_ms, continued, "discarding short burst of audio");
            return SegmenterEvent::NoiseDiscarded { speech_ms };
        }

        debug!(
            start_sample,
            end_sample,
            speech_ms,
            "utterance ready"
        );
        SegmenterEvent::UtteranceReady(Utterance {
            pcm,
            sample_rate: self.config.sample_rate,
            start_sample,
            end_sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PACKET_MS: u64 = 20;
    const SAMPLES_PER_PACKET: usize = 160; // 20ms at 8kHz

    fn voiced_packet() -> Vec<u8> {
        (0..SAMPLES_PER_PACKET)
            .map(|i| if i % 2 == 0 { 8000i16 } else { -8000 })
            .flat_map(|s| s.to_le_bytes())
            .collect()
    }

    fn silent_packet() -> Vec<u8> {
        vec![0u8; SAMPLES_PER_PACKET * 2]
    }

    fn feed(segmenter: &mut Segmenter, packet: &[u8], duration_ms: u64) -> Vec<SegmenterEvent> {
        (0..duration_ms / PACKET_MS)
            .flat_map(|_| segmenter.push(packet))
            .collect()
    }

    fn utterances(events: &[SegmenterEvent]) -> Vec<&Utterance> {
        events
            .iter()
            .filter_map(|e| match e {
                SegmenterEvent::UtteranceReady(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_speech_then_silence_emits_one_utterance() {
        let config = SegmenterConfig::default();
        let mut segmenter = Segmenter::new(config);

        let mut events = feed(&mut segmenter, &voiced_packet(), 500);
        events.extend(feed(
            &mut segmenter,
            &silent_packet(),
            config.silence_timeout_ms + 100,
        ));

        let ready = utterances(&events);
        assert_eq!(ready.len(), 1);
        assert_eq!(events[0], SegmenterEvent::SpeechStarted);

        // Exactly the voiced bytes, no trailing silence
        let expected: Vec<u8> = (0..25).flat_map(|_| voiced_packet()).collect();
        assert_eq!(ready[0].pcm, expected);
        assert_eq!(ready[0].start_sample, 0);
        assert_eq!(ready[0].end_sample, 4000);
        assert_eq!(ready[0].duration_ms(), 500);
        assert!(!segmenter.is_speaking());
    }

    #[test]
    fn test_silence_below_timeout_does_not_split() {
        let mut segmenter = Segmenter::new(SegmenterConfig::default());

        let mut events = feed(&mut segmenter, &voiced_packet(), 300);
        events.extend(feed(&mut segmenter, &silent_packet(), 400));
        events.extend(feed(&mut segmenter, &voiced_packet(), 300));
        events.extend(feed(&mut segmenter, &silent_packet(), 800));

        let ready = utterances(&events);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].duration_ms(), 1000);
        let speech_started = events
            .iter()
            .filter(|e| **e == SegmenterEvent::SpeechStarted)
            .count();
        assert_eq!(speech_started, 1);
    }

    #[test]
    fn test_short_noise_is_discarded() {
        let mut segmenter = Segmenter::new(SegmenterConfig::default());

        let mut events = segmenter.push(&voiced_packet());
        events.extend(feed(&mut segmenter, &silent_packet(), 800));

        assert!(utterances(&events).is_empty());
        assert!(events.contains(&SegmenterEvent::NoiseDiscarded { speech_ms: 20 }));
    }

    #[test]
    fn test_leading_silence_limited_to_pre_roll() {
        let config = SegmenterConfig::default();
        let mut segmenter = Segmenter::new(config);

        let mut events = feed(&mut segmenter, &silent_packet(), 2000);
        assert!(events.is_empty());
        assert_eq!(segmenter.buffered_ms(), config.pre_roll_ms);

        events.extend(feed(&mut segmenter, &voiced_packet(), 400));
        events.extend(feed(&mut segmenter, &silent_packet(), 800));

        let ready = utterances(&events);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].duration_ms(), config.pre_roll_ms + 400);
        // Pre-roll starts 300ms (2400 samples) before the speech at 2s
        assert_eq!(ready[0].start_sample, 16000 - 2400);
    }

    #[test]
    fn test_max_utterance_forces_cut() {
        let config = SegmenterConfig {
            max_utterance_ms: 1000,
            ..SegmenterConfig::default()
        };
        let mut segmenter = Segmenter::new(config);

        let events = feed(&mut segmenter, &voiced_packet(), 1500);
        let ready = utterances(&events);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].duration_ms(), 1000);
        assert!(segmenter.is_speaking());
        assert_eq!(segmenter.buffered_ms(), 500);
    }

    #[test]
    fn test_speech_after_force_cut_is_kept() {
        let config = SegmenterConfig {
            max_utterance_ms: 1000,
            ..SegmenterConfig::default()
        };
        let mut segmenter = Segmenter::new(config);

        let mut events = feed(&mut segmenter, &voiced_packet(), 1100);
        events.extend(feed(&mut segmenter, &silent_packet(), 800));

        let ready = utterances(&events);
        assert_eq!(ready.len(), 2, "events: {events:?}");
        assert_eq!(ready[0].duration_ms(), 1000);
        // 100ms tail is below min_utterance_ms but belongs to the same speech
        assert_eq!(ready[1].duration_ms(), 100);
        assert_eq!(ready[1].start_sample, ready[0].end_sample);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, SegmenterEvent::NoiseDiscarded { .. }))
        );

        // The next fresh burst is held to the floor again
        let mut events = segmenter.push(&voiced_packet());
        events.extend(feed(&mut segmenter, &silent_packet(), 800));
        assert!(events.contains(&SegmenterEvent::NoiseDiscarded { speech_ms: 20 }));
    }

    #[test]
    fn test_force_cut_on_exact_boundary_emits_no_empty_tail() {
        let config = SegmenterConfig {
            max_utterance_ms: 1000,
            ..SegmenterConfig::default()
        };
        let mut segmenter = Segmenter::new(config);

        let mut events = feed(&mut segmenter, &voiced_packet(), 1000);
        events.extend(feed(&mut segmenter, &silent_packet(), 800));

        let ready = utterances(&events);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].duration_ms(), 1000);
    }

    #[test]
    fn test_flush_keeps_force_cut_tail() {
        let config = SegmenterConfig {
            max_utterance_ms: 1000,
            ..SegmenterConfig::default()
        };
        let mut segmenter = Segmenter::new(config);
        feed(&mut segmenter, &voiced_packet(), 1060);

        let tail = segmenter.flush().expect("force-cut tail");
        assert_eq!(tail.duration_ms(), 60);
    }

    #[test]
    fn test_flush_returns_partial_utterance() {
        let mut segmenter = Segmenter::new(SegmenterConfig::default());
        feed(&mut segmenter, &voiced_packet(), 600);
        feed(&mut segmenter, &silent_packet(), 200);

        let utterance = segmenter.flush().expect("partial utterance");
        assert_eq!(utterance.duration_ms(), 600);
        assert_eq!(segmenter.buffered_ms(), 0);
        assert!(segmenter.flush().is_none());
    }

    #[test]
    fn test_flush_discards_short_speech() {
        let mut segmenter = Segmenter::new(SegmenterConfig::default());
        segmenter.push(&voiced_packet());
        assert!(segmenter.flush().is_none());
        assert!(!segmenter.is_speaking());
    }

    #[test]
    fn test_threshold_is_respected() {
        let config = SegmenterConfig {
            silence_threshold: 0.5,
            ..SegmenterConfig::default()
        };
        let mut segmenter = Segmenter::new(config);
        // rms of the voiced packet is about 0.24, below this threshold
        let events = feed(&mut segmenter, &voiced_packet(), 1000);
        assert!(events.is_empty());
        assert!(!segmenter.is_speaking());
    }

    #[test]
    fn test_timeline_continues_across_utterances() {
        let mut segmenter = Segmenter::new(SegmenterConfig {
            pre_roll_ms: 0,
            ..SegmenterConfig::default()
        });

        let mut events = feed(&mut segmenter, &voiced_packet(), 400);
        events.extend(feed(&mut segmenter, &silent_packet(), 800));
        events.extend(feed(&mut segmenter, &voiced_packet(), 400));
        events.extend(feed(&mut segmenter, &silent_packet(), 800));

        let ready = utterances(&events);
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].start_sample, 0);
        // 400ms speech + 800ms silence = 9600 samples before the second turn
        assert_eq!(ready[1].start_sample, 9600);
        assert_eq!(ready[1].end_sample, 9600 + 3200);
    }
}
