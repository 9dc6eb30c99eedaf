//! Packet types carried by pipeline queues.

use crate::pipeline::command::CommandPacket;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Monotonic stream time in frame ticks.
pub type StreamTime = u64;

/// The five kinds of packet a queue can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    Wave,
    Observation,
    Phrase,
    Marker,
    Command,
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Wave => "wave",
            PacketKind::Observation => "observation",
            PacketKind::Phrase => "phrase",
            PacketKind::Marker => "marker",
            PacketKind::Command => "command",
        };
        f.write_str(name)
    }
}

/// A block of raw audio samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveBlock {
    /// PCM samples (16-bit signed integers).
    pub samples: Vec<i16>,
}

/// One feature vector produced by the encoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub features: Vec<f32>,
    /// Whether the voice activity detector flagged this frame as speech.
    pub speech: bool,
}

/// Role of a phrase fragment in the recognizer output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhraseKind {
    /// Opens the phrase block of one utterance.
    Open,
    /// A recognized word of the best path.
    Word,
    /// Closes the phrase block of one utterance.
    Close,
    /// A lower-ranked n-best hypothesis, one per rank.
    Alternative,
    /// A snapshot of the current best partial hypothesis.
    Partial,
    /// End of the answer; carries the full best sentence.
    Answer,
}

/// A piece of recognizer output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhraseFragment {
    pub kind: PhraseKind,
    pub word: String,
    pub confidence: f32,
    pub score: f64,
    /// 1 for the best hypothesis, 2.. for alternatives.
    pub rank: usize,
}

impl PhraseFragment {
    /// Creates a fragment of rank 1 with neutral scores.
    pub fn new(kind: PhraseKind, word: impl Into<String>) -> Self {
        Self {
            kind,
            word: word.into(),
            confidence: 1.0,
            score: 0.0,
            rank: 1,
        }
    }

    pub fn with_scores(mut self, confidence: f32, score: f64) -> Self {
        self.confidence = confidence;
        self.score = score;
        self
    }

    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }
}

/// Kind-specific packet contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Wave(WaveBlock),
    Observation(Observation),
    Phrase(PhraseFragment),
    Marker(String),
    Command(CommandPacket),
}

impl Payload {
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::Wave(_) => PacketKind::Wave,
            Payload::Observation(_) => PacketKind::Observation,
            Payload::Phrase(_) => PacketKind::Phrase,
            Payload::Marker(_) => PacketKind::Marker,
            Payload::Command(_) => PacketKind::Command,
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
struct PacketInner {
    start: StreamTime,
    end: StreamTime,
    #[serde(flatten)]
    payload: Payload,
}

/// An immutable, time-stamped unit of pipeline data.
///
/// Cloning is cheap: clones share the payload and nobody can mutate it, so the
/// same packet may sit in several queues at once.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    inner: Arc<PacketInner>,
}

impl Packet {
    /// Creates a packet spanning `start..=end`.
    pub fn new(start: StreamTime, end: StreamTime, payload: Payload) -> Self {
        Self {
            inner: Arc::new(PacketInner {
                start,
                end: end.max(start),
                payload,
            }),
        }
    }

    pub fn wave(start: StreamTime, end: StreamTime, samples: Vec<i16>) -> Self {
        Self::new(start, end, Payload::Wave(WaveBlock { samples }))
    }

    /// A single-frame observation.
    pub fn observation(time: StreamTime, features: Vec<f32>, speech: bool) -> Self {
        Self::new(time, time, Payload::Observation(Observation { features, speech }))
    }

    pub fn phrase(start: StreamTime, end: StreamTime, fragment: PhraseFragment) -> Self {
        Self::new(start, end, Payload::Phrase(fragment))
    }

    pub fn marker(time: StreamTime, text: impl Into<String>) -> Self {
        Self::new(time, time, Payload::Marker(text.into()))
    }

    pub fn command(time: StreamTime, command: CommandPacket) -> Self {
        Self::new(time, time, Payload::Command(command))
    }

    pub fn start(&self) -> StreamTime {
        self.inner.start
    }

    pub fn end(&self) -> StreamTime {
        self.inner.end
    }

    pub fn kind(&self) -> PacketKind {
        self.inner.payload.kind()
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    pub fn as_marker(&self) -> Option<&str> {
        match &self.inner.payload {
            Payload::Marker(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.inner.payload {
            Payload::Observation(obs) => Some(obs),
            _ => None,
        }
    }

    pub fn as_phrase(&self) -> Option<&PhraseFragment> {
        match &self.inner.payload {
            Payload::Phrase(fragment) => Some(fragment),
            _ => None,
        }
    }

    pub fn as_command(&self) -> Option<&CommandPacket> {
        match &self.inner.payload {
            Payload::Command(command) => Some(command),
            _ => None,
        }
    }

    /// True if this is a marker with exactly the given text.
    pub fn is_marker(&self, text: &str) -> bool {
        self.as_marker() == Some(text)
    }

    /// True if both handles share the same payload allocation.
    pub fn ptr_eq(&self, other: &Packet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Serialize for Packet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.serialize(serializer)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>6}..{:<6}] ", self.start(), self.end())?;
        match self.payload() {
            Payload::Wave(block) => write!(f, "wave {} samples", block.samples.len()),
            Payload::Observation(obs) => write!(
                f,
                "obs {} dim={}",
                if obs.speech { "speech" } else { "silence" },
                obs.features.len()
            ),
            Payload::Phrase(fragment) => write!(
                f,
                "phrase {:?} '{}' conf={:.2} rank={}",
                fragment.kind, fragment.word, fragment.confidence, fragment.rank
            ),
            Payload::Marker(text) => write!(f, "marker {}", text),
            Payload::Command(command) => write!(f, "command {}", command),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observation_packet_creation() {
        let packet = Packet::observation(7, vec![0.5, 1.5], true);

        assert_eq!(packet.start(), 7);
        assert_eq!(packet.end(), 7);
        assert_eq!(packet.kind(), PacketKind::Observation);
        let obs = packet.as_observation().unwrap();
        assert_eq!(obs.features, vec![0.5, 1.5]);
        assert!(obs.speech);
        assert!(packet.as_marker().is_none());
    }

    #[test]
    fn test_marker_packet_matches_text() {
        let packet = Packet::marker(3, "START");

        assert_eq!(packet.kind(), PacketKind::Marker);
        assert!(packet.is_marker("START"));
        assert!(!packet.is_marker("STOP"));
    }

    #[test]
    fn test_end_never_precedes_start() {
        let packet = Packet::wave(10, 4, vec![0; 8]);
        assert_eq!(packet.start(), 10);
        assert_eq!(packet.end(), 10);
    }

    #[test]
    fn test_clones_share_payload() {
        let packet = Packet::phrase(1, 4, PhraseFragment::new(PhraseKind::Word, "hello"));
        let copy = packet.clone();

        assert!(packet.ptr_eq(&copy));
        assert_eq!(packet, copy);
    }

    #[test]
    fn test_phrase_fragment_builders() {
        let fragment = PhraseFragment::new(PhraseKind::Alternative, "hallo")
            .with_scores(0.25, -42.0)
            .with_rank(2);

        assert_eq!(fragment.rank, 2);
        assert!((fragment.confidence - 0.25).abs() < f32::EPSILON);
        assert_eq!(fragment.score, -42.0);
    }

    #[test]
    fn test_packet_serializes_flat_json() {
        let packet = Packet::marker(5, "STOP");
        let json = serde_json::to_string(&packet).unwrap();

        assert!(json.contains(r#""start":5"#), "got {}", json);
        assert!(json.contains(r#""kind":"marker""#), "got {}", json);
        assert!(json.contains(r#""data":"STOP""#), "got {}", json);
    }

    #[test]
    fn test_display_formats() {
        let packet = Packet::observation(2, vec![1.0], false);
        let text = packet.to_string();
        assert!(text.contains("obs silence dim=1"), "got {}", text);

        let packet = Packet::marker(2, "START");
        assert!(packet.to_string().ends_with("marker START"));
    }
}
