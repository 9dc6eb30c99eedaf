//! Run-mode flags, run states and the transition table of the recognizer.

use crate::error::PipelineError;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::str::FromStr;

/// Independent flags selecting how the recognizer delimits and reports
/// utterances.
///
/// The integer form is what `setmode(n)` takes. [`RunMode::new`] normalises
/// the flags: an as-soon-as-possible or immediate result mode always turns on
/// end-of-utterance results as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RunMode(u32);

impl RunMode {
    /// Re-enter Prime after each answer instead of going back to Wait.
    pub const CONTINUOUS: RunMode = RunMode(0x01);
    /// Discard observations until a START or ENDOFLIST marker.
    pub const FLUSH_MARKER: RunMode = RunMode(0x02);
    /// Discard observations until the first speech-flagged one.
    pub const FLUSH_SPEECH: RunMode = RunMode(0x04);
    /// End the utterance on a STOP marker.
    pub const STOP_MARKER: RunMode = RunMode(0x08);
    /// End the utterance on a silence-flagged observation.
    pub const STOP_SILENCE: RunMode = RunMode(0x10);
    /// Emit the final result when the utterance ends.
    pub const RESULT_END: RunMode = RunMode(0x20);
    /// Emit words as soon as they are settled.
    pub const RESULT_ASAP: RunMode = RunMode(0x40);
    /// Emit advisory partial snapshots at every traceback.
    pub const RESULT_IMMEDIATE: RunMode = RunMode(0x80);

    const ALL: u32 = 0xff;

    const NAMES: [(RunMode, &'static str); 8] = [
        (RunMode::CONTINUOUS, "continuous"),
        (RunMode::FLUSH_MARKER, "flush-marker"),
        (RunMode::FLUSH_SPEECH, "flush-speech"),
        (RunMode::STOP_MARKER, "stop-marker"),
        (RunMode::STOP_SILENCE, "stop-silence"),
        (RunMode::RESULT_END, "result-end"),
        (RunMode::RESULT_ASAP, "result-asap"),
        (RunMode::RESULT_IMMEDIATE, "result-immediate"),
    ];

    /// Builds a normalised mode from raw bits. Returns `None` for unknown bits.
    pub fn new(bits: u32) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            return None;
        }
        Some(RunMode(bits).normalized())
    }

    pub fn empty() -> Self {
        RunMode(0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: RunMode) -> bool {
        self.0 & other.0 == other.0
    }

    fn normalized(self) -> Self {
        if self.0 & (Self::RESULT_ASAP.0 | Self::RESULT_IMMEDIATE.0) != 0 {
            RunMode(self.0 | Self::RESULT_END.0)
        } else {
            self
        }
    }

    pub fn is_continuous(self) -> bool {
        self.contains(Self::CONTINUOUS)
    }

    /// How Flush decides it may hand over to Run.
    ///
    /// Marker-delimited flushing wins when both flush flags are set.
    pub fn flush_policy(self) -> FlushPolicy {
        if self.contains(Self::FLUSH_MARKER) {
            FlushPolicy::UntilMarker
        } else if self.contains(Self::FLUSH_SPEECH) {
            FlushPolicy::UntilSpeech
        } else {
            FlushPolicy::Immediate
        }
    }
}

impl BitOr for RunMode {
    type Output = RunMode;

    fn bitor(self, rhs: RunMode) -> RunMode {
        RunMode(self.0 | rhs.0).normalized()
    }
}

impl BitOrAssign for RunMode {
    fn bitor_assign(&mut self, rhs: RunMode) {
        *self = *self | rhs;
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", names.join(","))
        }
    }
}

impl FromStr for RunMode {
    type Err = PipelineError;

    /// Accepts a comma-separated list of flag names, `none`, or an integer.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: String| PipelineError::ConfigInvalidValue {
            key: "recognizer.mode".to_string(),
            message,
        };

        let s = s.trim();
        if let Ok(bits) = s.parse::<u32>() {
            return RunMode::new(bits).ok_or_else(|| invalid(format!("unknown mode bits in {}", bits)));
        }
        if s.is_empty() || s == "none" {
            return Ok(RunMode::empty());
        }

        let mut mode = RunMode::empty();
        for token in s.split(',').map(str::trim) {
            let (flag, _) = Self::NAMES
                .iter()
                .find(|(_, name)| *name == token)
                .ok_or_else(|| invalid(format!("unknown mode flag '{}'", token)))?;
            mode |= *flag;
        }
        Ok(mode)
    }
}

/// Flush behaviour derived from a [`RunMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    Immediate,
    UntilMarker,
    UntilSpeech,
}

/// Phase of the recognizer control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunState {
    #[default]
    Wait,
    Prime,
    Flush,
    Run,
    Ans,
}

impl RunState {
    pub const ALL: [RunState; 5] = [
        RunState::Wait,
        RunState::Prime,
        RunState::Flush,
        RunState::Run,
        RunState::Ans,
    ];
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Wait => "wait",
            RunState::Prime => "prime",
            RunState::Flush => "flush",
            RunState::Run => "run",
            RunState::Ans => "ans",
        };
        f.write_str(name)
    }
}

/// Inputs to the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEvent {
    /// `start()` command.
    Start,
    /// `stop()` command.
    Stop,
    /// `timeout()` command.
    Timeout,
    /// Resources selected and counters reset.
    Primed,
    /// Flush condition satisfied.
    FlushDone,
    /// Data-driven end of utterance (STOP marker, silence, termination).
    EndOfUtterance,
    /// `usegrp` while decoding.
    GroupSwitch,
    /// Final result emitted.
    Answered,
}

impl RunEvent {
    pub const ALL: [RunEvent; 8] = [
        RunEvent::Start,
        RunEvent::Stop,
        RunEvent::Timeout,
        RunEvent::Primed,
        RunEvent::FlushDone,
        RunEvent::EndOfUtterance,
        RunEvent::GroupSwitch,
        RunEvent::Answered,
    ];
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunEvent::Start => "start",
            RunEvent::Stop => "stop",
            RunEvent::Timeout => "timeout",
            RunEvent::Primed => "primed",
            RunEvent::FlushDone => "flush-done",
            RunEvent::EndOfUtterance => "end-of-utterance",
            RunEvent::GroupSwitch => "group-switch",
            RunEvent::Answered => "answered",
        };
        f.write_str(name)
    }
}

/// Next state for `event` in `state`, or `None` if the pair is not in the
/// table. Callers leave the state unchanged and post a diagnostic on `None`.
pub fn next_state(state: RunState, event: RunEvent, mode: RunMode) -> Option<RunState> {
    use RunEvent::*;
    use RunState::*;

    match (state, event) {
        (Wait, Start) => Some(Prime),
        (Prime, Primed) => Some(Flush),
        (Flush, FlushDone) => Some(Run),
        (Flush, Stop | Timeout) => Some(Ans),
        (Run, Stop | Timeout | EndOfUtterance | GroupSwitch) => Some(Ans),
        (Ans, Answered) if mode.is_continuous() => Some(Prime),
        (Ans, Answered) => Some(Wait),
        _ => None,
    }
}
