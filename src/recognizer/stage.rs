//! The recognizer stage.
//!
//! Consumes observations and markers from one input queue, drives a
//! [`Decoder`] through the Wait → Prime → Flush → Run → Ans loop, and writes
//! phrase packets plus forwarded markers to one output queue.
//!
//! Output ordering: every packet leaves in non-decreasing start-time order.
//! Non-observation input that arrives while an utterance still owes output is
//! held back and released once nothing earlier can be emitted, or merged into
//! the answer. `Partial` snapshots are stamped no later than the earliest
//! output still owed.

use super::held::HeldPackets;
use super::mode::{FlushPolicy, RunEvent, RunMode, RunState, next_state};
use crate::decoder::{Decoder, PathElement, ResourceContext, ResourceGroup};
use crate::defaults;
use crate::error::{ErrorCode, Result};
use crate::pipeline::command::{CommandPacket, Reply};
use crate::pipeline::error::StageError;
use crate::pipeline::packet::{Observation, Packet, Payload, PhraseFragment, PhraseKind, StreamTime};
use crate::pipeline::queue::PacketQueue;
use crate::pipeline::stage::{CommandSender, StageContext, StageHandler};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type StageResult = std::result::Result<(), StageError>;

/// Recognizer parameters that can be set before the stage starts.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizerSettings {
    pub mode: RunMode,
    /// Number of hypotheses requested at the end of an utterance.
    pub nbest: usize,
    /// Frames between traceback snapshots.
    pub traceback_interval: u64,
    /// Group used for the first utterance; the context default if `None`.
    pub group: Option<String>,
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            mode: RunMode::CONTINUOUS | RunMode::RESULT_END,
            nbest: defaults::NBEST,
            traceback_interval: defaults::TRACEBACK_INTERVAL,
            group: None,
        }
    }
}

/// Commands the recognizer understands besides the universal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecognizerCommand {
    Start,
    Stop,
    SetMode,
    UseGroup,
    SetNBest,
    Timeout,
}

impl RecognizerCommand {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "start" => Some(RecognizerCommand::Start),
            "stop" => Some(RecognizerCommand::Stop),
            "setmode" => Some(RecognizerCommand::SetMode),
            "usegrp" => Some(RecognizerCommand::UseGroup),
            "setnbest" => Some(RecognizerCommand::SetNBest),
            "timeout" => Some(RecognizerCommand::Timeout),
            _ => None,
        }
    }
}

type CommandFn = fn(&mut Recognizer, &CommandPacket, &mut StageContext) -> StageResult;

fn dispatch_table() -> HashMap<RecognizerCommand, CommandFn> {
    let mut table: HashMap<RecognizerCommand, CommandFn> = HashMap::new();
    table.insert(RecognizerCommand::Start, Recognizer::cmd_start);
    table.insert(RecognizerCommand::Stop, Recognizer::cmd_stop);
    table.insert(RecognizerCommand::SetMode, Recognizer::cmd_setmode);
    table.insert(RecognizerCommand::UseGroup, Recognizer::cmd_usegrp);
    table.insert(RecognizerCommand::SetNBest, Recognizer::cmd_setnbest);
    table.insert(RecognizerCommand::Timeout, Recognizer::cmd_timeout);
    table
}

/// Per-utterance bookkeeping, reset at Prime.
#[derive(Debug, Default)]
struct Utterance {
    frames: u64,
    first: Option<StreamTime>,
    last: Option<StreamTime>,
    /// Path element ids already written to the output.
    emitted: HashSet<u64>,
    opened: bool,
}

/// Stage handler running the recognizer control loop.
pub struct Recognizer {
    name: String,
    decoder: Box<dyn Decoder>,
    resources: Arc<ResourceContext>,
    active_group: Arc<ResourceGroup>,
    pending_group: Option<Arc<ResourceGroup>>,
    input: PacketQueue,
    output: PacketQueue,
    controller: Option<CommandSender>,
    handlers: HashMap<RecognizerCommand, CommandFn>,
    state: RunState,
    mode: RunMode,
    nbest: usize,
    traceback_interval: u64,
    held: HeldPackets,
    utterance: Utterance,
    utterances: u64,
    /// Latest start time consumed from the input.
    clock: StreamTime,
    /// Latest start time written to the output.
    high_water: StreamTime,
    /// Time of an upstream termination marker seen mid-utterance.
    terminating: Option<StreamTime>,
}

impl Recognizer {
    /// Creates a recognizer reading `input` and writing `output`.
    ///
    /// Fails if the default (or configured) resource group is missing or any
    /// group disagrees with the decoder about the feature dimension.
    pub fn new(
        name: &str,
        decoder: Box<dyn Decoder>,
        resources: Arc<ResourceContext>,
        input: PacketQueue,
        output: PacketQueue,
        settings: RecognizerSettings,
    ) -> Result<Self> {
        let default_group = resources.default_group()?;
        let active_group = match &settings.group {
            Some(group) => resources.group(group)?,
            None => default_group,
        };
        resources.check_feature_dim(decoder.feature_dim())?;

        log::debug!(
            "{}: decoder '{}', group '{}', mode {}",
            name,
            decoder.name(),
            active_group.name,
            settings.mode
        );

        Ok(Self {
            name: name.to_string(),
            decoder,
            resources,
            active_group,
            pending_group: None,
            input,
            output,
            controller: None,
            handlers: dispatch_table(),
            state: RunState::Wait,
            mode: settings.mode,
            nbest: settings.nbest.clamp(1, defaults::MAX_NBEST as usize),
            traceback_interval: settings.traceback_interval.max(1),
            held: HeldPackets::new(),
            utterance: Utterance::default(),
            utterances: 0,
            clock: 0,
            high_water: 0,
            terminating: None,
        })
    }

    /// Sends `finished(seq)` to `controller` after every answer.
    pub fn with_controller(mut self, controller: CommandSender) -> Self {
        self.controller = Some(controller);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn nbest(&self) -> usize {
        self.nbest
    }

    pub fn active_group(&self) -> &str {
        &self.active_group.name
    }

    /// Number of packets currently held back.
    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn fire(&mut self, event: RunEvent, ctx: &StageContext) -> bool {
        match next_state(self.state, event, self.mode) {
            Some(next) => {
                log::debug!("{}: {} --{}--> {}", self.name, self.state, event, next);
                self.state = next;
                true
            }
            None => {
                ctx.diagnostic(format!("{} ignored in state {}", event, self.state));
                false
            }
        }
    }

    fn unexpected(&self, packet: &Packet) -> StageError {
        StageError::fatal(
            ErrorCode::UnexpectedPacket,
            format!(
                "{} packet at t={} on recognizer input",
                packet.kind(),
                packet.start()
            ),
        )
    }

    fn forward(&mut self, packet: Packet) {
        self.high_water = self.high_water.max(packet.start());
        self.output.put(packet);
    }

    /// Writes held packets starting at or before `packet`, then `packet`.
    fn emit(&mut self, packet: Packet) {
        for held in self.held.release_through(packet.start()) {
            self.forward(held);
        }
        self.forward(packet);
    }

    /// Writes every held packet.
    fn release_all(&mut self) {
        for packet in self.held.release_all() {
            self.forward(packet);
        }
    }

    fn emit_phrase(&mut self, start: StreamTime, end: StreamTime, fragment: PhraseFragment) {
        self.emit(Packet::phrase(start, end, fragment));
    }

    fn emit_word(&mut self, element: &PathElement) {
        if !self.utterance.emitted.insert(element.id) {
            return;
        }
        let fragment = PhraseFragment::new(PhraseKind::Word, element.word.clone())
            .with_scores(element.confidence, element.score);
        self.emit_phrase(element.start, element.end, fragment);
    }

    fn open(&mut self) {
        if self.utterance.opened {
            return;
        }
        self.utterance.opened = true;
        let time = self.utterance.first.unwrap_or(self.clock);
        self.emit_phrase(time, time, PhraseFragment::new(PhraseKind::Open, ""));
    }

    /// Releases held packets that no future output can precede.
    fn release_safe(&mut self) {
        let bound = if self.utterance.opened {
            let traceback = self.decoder.traceback();
            let pending = traceback
                .elements()
                .filter(|e| !self.utterance.emitted.contains(&e.id))
                .map(|e| e.start)
                .min()
                .unwrap_or(StreamTime::MAX);
            let next_frame = self.utterance.last.map_or(StreamTime::MAX, |t| t + 1);
            pending.min(next_frame)
        } else {
            self.utterance.first.unwrap_or(StreamTime::MAX)
        };

        for packet in self.held.release_before(bound) {
            self.forward(packet);
        }
    }

    fn prime(&mut self, ctx: &StageContext) -> StageResult {
        if let Some(group) = self.pending_group.take() {
            self.active_group = group;
        }
        self.decoder.begin(&self.active_group)?;
        self.utterance = Utterance::default();
        self.utterances += 1;
        log::debug!(
            "{}: utterance {} primed with group '{}'",
            self.name,
            self.utterances,
            self.active_group.name
        );
        self.fire(RunEvent::Primed, ctx);
        Ok(())
    }

    /// One Flush step. Returns false when the input is exhausted.
    fn flush_step(&mut self, ctx: &StageContext) -> std::result::Result<bool, StageError> {
        let policy = self.mode.flush_policy();
        if policy == FlushPolicy::Immediate {
            self.fire(RunEvent::FlushDone, ctx);
            return Ok(true);
        }
        let Some(packet) = self.input.peek() else {
            return Ok(false);
        };

        match packet.payload() {
            Payload::Observation(obs) => {
                if policy == FlushPolicy::UntilSpeech && obs.speech {
                    // Left on the queue; Run feeds it.
                    self.fire(RunEvent::FlushDone, ctx);
                    return Ok(true);
                }
                log::trace!("{}: flushed observation t={}", self.name, packet.start());
            }
            Payload::Phrase(_) => return Err(self.unexpected(&packet)),
            Payload::Marker(text) if text == defaults::MARKER_TERMINATED => {
                self.input.pop();
                self.clock = self.clock.max(packet.start());
                self.terminate_now(packet.start(), ctx);
                return Ok(true);
            }
            Payload::Marker(text) => {
                let delimits = policy == FlushPolicy::UntilMarker
                    && (text == defaults::MARKER_START || text == defaults::MARKER_END_OF_LIST);
                self.emit(packet.clone());
                if delimits {
                    self.fire(RunEvent::FlushDone, ctx);
                }
            }
            Payload::Wave(_) | Payload::Command(_) => self.emit(packet.clone()),
        }

        self.input.pop();
        self.clock = self.clock.max(packet.start());
        Ok(true)
    }

    /// One Run step. Returns false when the input is exhausted.
    fn run_step(&mut self, ctx: &StageContext) -> std::result::Result<bool, StageError> {
        let Some(packet) = self.input.pop() else {
            return Ok(false);
        };
        self.clock = self.clock.max(packet.start());

        match packet.payload() {
            Payload::Observation(obs) => {
                let expected = self.active_group.feature_dim();
                if obs.features.len() != expected {
                    return Err(StageError::fatal(
                        ErrorCode::FeatureDimension,
                        format!(
                            "observation at t={} has {} features, group '{}' expects {}",
                            packet.start(),
                            obs.features.len(),
                            self.active_group.name,
                            expected
                        ),
                    ));
                }
                if !obs.speech && self.mode.contains(RunMode::STOP_SILENCE) {
                    self.fire(RunEvent::EndOfUtterance, ctx);
                } else {
                    self.feed(packet.start(), obs)?;
                }
            }
            Payload::Phrase(_) => return Err(self.unexpected(&packet)),
            Payload::Marker(text) if text == defaults::MARKER_TERMINATED => {
                self.terminating = Some(packet.start());
                self.fire(RunEvent::EndOfUtterance, ctx);
            }
            Payload::Marker(text)
                if text == defaults::MARKER_STOP && self.mode.contains(RunMode::STOP_MARKER) =>
            {
                self.held.hold(packet.clone());
                self.fire(RunEvent::EndOfUtterance, ctx);
            }
            Payload::Marker(_) | Payload::Wave(_) | Payload::Command(_) => {
                self.held.hold(packet.clone());
                self.release_safe();
            }
        }
        Ok(true)
    }

    fn feed(&mut self, time: StreamTime, obs: &Observation) -> StageResult {
        self.decoder.feed(time, obs)?;
        self.utterance.frames += 1;
        self.utterance.first.get_or_insert(time);
        self.utterance.last = Some(time);

        if self.utterance.frames % self.traceback_interval == 0 {
            self.traceback();
        }
        self.release_safe();
        Ok(())
    }

    fn traceback(&mut self) {
        let traceback = self.decoder.traceback();

        if self.mode.contains(RunMode::RESULT_ASAP) {
            for element in &traceback.settled {
                if !self.utterance.emitted.contains(&element.id) {
                    self.open();
                    self.emit_word(element);
                }
            }
        }

        if self.mode.contains(RunMode::RESULT_IMMEDIATE) && !traceback.is_empty() {
            let sentence = traceback
                .elements()
                .map(|e| e.word.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            // Words not yet written may still start as early as the oldest one.
            let last = self.utterance.last.unwrap_or(self.clock);
            let owed = traceback
                .elements()
                .filter(|e| !self.utterance.emitted.contains(&e.id))
                .map(|e| e.start)
                .min()
                .unwrap_or(last);
            let time = owed.min(last).max(self.high_water);

            self.open();
            self.emit_phrase(time, time, PhraseFragment::new(PhraseKind::Partial, sentence));
        }
    }

    /// Emits the final result and leaves Ans.
    fn answer(&mut self, ctx: &StageContext) -> StageResult {
        let hypotheses = if self.utterance.frames > 0 {
            self.decoder.finish(self.nbest)?
        } else {
            Vec::new()
        };
        let end = self.utterance.last.unwrap_or(self.clock);
        let best = hypotheses.first().cloned().unwrap_or_default();

        // Without RESULT_END only the answer packet is written, unless
        // earlier results already opened the utterance.
        if self.mode.contains(RunMode::RESULT_END) || self.utterance.opened {
            self.open();
            for element in &best.elements {
                self.emit_word(element);
            }
            self.emit_phrase(end, end, PhraseFragment::new(PhraseKind::Close, ""));
            for (index, alternative) in hypotheses.iter().enumerate().skip(1) {
                let fragment = PhraseFragment::new(PhraseKind::Alternative, alternative.sentence())
                    .with_scores(alternative.confidence(), alternative.score)
                    .with_rank(index + 1);
                self.emit_phrase(end, end, fragment);
            }
        }
        let sentence = best.sentence();
        let fragment = PhraseFragment::new(PhraseKind::Answer, sentence.clone())
            .with_scores(best.confidence(), best.score);
        self.emit_phrase(end, end, fragment);
        self.release_all();

        log::info!(
            "{}: utterance {} answered: \"{}\"",
            self.name,
            self.utterances,
            sentence
        );
        if let Some(controller) = &self.controller {
            controller.send_command(
                Reply::Finished {
                    seq: self.utterances as i64,
                }
                .to_command(),
            );
        }

        self.fire(RunEvent::Answered, ctx);
        if let Some(time) = self.terminating.take() {
            self.terminate_now(time, ctx);
        }
        Ok(())
    }

    /// Forwards held packets, emits our own termination marker and stops.
    fn terminate_now(&mut self, time: StreamTime, ctx: &StageContext) {
        self.release_all();
        self.forward(Packet::marker(time, defaults::MARKER_TERMINATED));
        log::info!("{}: termination marker at t={}, exiting", self.name, time);
        ctx.terminate();
    }

    fn cmd_start(&mut self, _command: &CommandPacket, ctx: &mut StageContext) -> StageResult {
        if self.fire(RunEvent::Start, ctx) {
            log::info!("{}: started in mode {}", self.name, self.mode);
        }
        Ok(())
    }

    fn cmd_stop(&mut self, _command: &CommandPacket, ctx: &mut StageContext) -> StageResult {
        if self.fire(RunEvent::Stop, ctx) {
            self.answer(ctx)?;
        }
        Ok(())
    }

    fn cmd_timeout(&mut self, _command: &CommandPacket, ctx: &mut StageContext) -> StageResult {
        if self.fire(RunEvent::Timeout, ctx) {
            self.answer(ctx)?;
        }
        Ok(())
    }

    fn cmd_setmode(&mut self, command: &CommandPacket, _ctx: &mut StageContext) -> StageResult {
        if self.state != RunState::Wait {
            return Err(StageError::Diagnostic(format!(
                "setmode ignored in state {}",
                self.state
            )));
        }
        let bits = command
            .cursor()
            .int(0, 0xff)
            .map_err(|e| StageError::Diagnostic(format!("setmode: {}", e)))?;
        let mode = RunMode::new(bits as u32)
            .ok_or_else(|| StageError::Diagnostic(format!("setmode: bad mode {}", bits)))?;
        log::info!("{}: mode {} -> {}", self.name, self.mode, mode);
        self.mode = mode;
        Ok(())
    }

    fn cmd_usegrp(&mut self, command: &CommandPacket, ctx: &mut StageContext) -> StageResult {
        let mut args = command.cursor();
        let name = args
            .string()
            .map_err(|e| StageError::Diagnostic(format!("usegrp: {}", e)))?;
        let group = self
            .resources
            .group(name)
            .map_err(|e| StageError::Diagnostic(format!("usegrp: {}", e)))?;

        log::info!("{}: switching to group '{}'", self.name, group.name);
        self.pending_group = Some(group);
        if self.state == RunState::Run && self.fire(RunEvent::GroupSwitch, ctx) {
            self.answer(ctx)?;
        }
        Ok(())
    }

    fn cmd_setnbest(&mut self, command: &CommandPacket, _ctx: &mut StageContext) -> StageResult {
        let n = command
            .cursor()
            .int(1, defaults::MAX_NBEST)
            .map_err(|e| StageError::Diagnostic(format!("setnbest: {}", e)))?;
        self.nbest = n as usize;
        Ok(())
    }
}

impl StageHandler for Recognizer {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self, ctx: &mut StageContext) -> StageResult {
        self.input.request_notify(ctx.listener());
        Ok(())
    }

    fn handle_command(&mut self, command: &CommandPacket, ctx: &mut StageContext) -> StageResult {
        let handler = RecognizerCommand::from_name(&command.name)
            .and_then(|c| self.handlers.get(&c).copied());
        match handler {
            Some(handler) => handler(self, command, ctx),
            None => Err(StageError::Diagnostic(format!(
                "unknown command '{}'",
                command.name
            ))),
        }
    }

    fn process(&mut self, ctx: &mut StageContext) -> StageResult {
        while !ctx.is_terminated() {
            match self.state {
                RunState::Wait => break,
                RunState::Prime => self.prime(ctx)?,
                RunState::Flush => {
                    if !self.flush_step(ctx)? {
                        break;
                    }
                }
                RunState::Run => {
                    if !self.run_step(ctx)? {
                        break;
                    }
                }
                RunState::Ans => self.answer(ctx)?,
            }
        }
        Ok(())
    }

    fn shutdown(&mut self, _ctx: &mut StageContext) {
        let held = self.held.release_all();
        if !held.is_empty() {
            log::debug!("{}: releasing {} held packets on exit", self.name, held.len());
        }
        for packet in held {
            self.forward(packet);
        }
    }
}
