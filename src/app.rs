//! Simulation entry point.
//!
//! Wires the complete pipeline used by the command-line simulator:
//! script → source stage → queue → recognizer stage → output queue

use crate::config::Config;
use crate::decoder::MockDecoder;
use crate::defaults;
use crate::error::Result;
use crate::pipeline::error::{ErrorReporter, LogReporter};
use crate::pipeline::packet::Packet;
use crate::pipeline::queue::PacketQueue;
use crate::pipeline::source::{Script, ScriptedSource};
use crate::pipeline::stage::Stage;
use crate::pipeline::timer::Timer;
use crate::recognizer::Recognizer;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationOptions {
    /// After this long the recognizer receives `timeout()`.
    pub timeout: Duration,
    /// How long to wait for further output once the deadline has passed.
    pub idle: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            idle: Duration::from_millis(500),
        }
    }
}

/// What a simulation produced.
#[derive(Debug)]
pub struct SimulationReport {
    /// Recognizer output in arrival order.
    pub output: Vec<Packet>,
    /// True if the recognizer forwarded a termination marker.
    pub terminated: bool,
    pub source_status: i32,
    pub recognizer_status: i32,
    /// Diagnostics posted by either stage.
    pub diagnostics: Vec<String>,
}

impl SimulationReport {
    pub fn is_success(&self) -> bool {
        self.source_status == 0 && self.recognizer_status == 0
    }
}

/// Plays `script` through a recognizer driven by the mock decoder.
///
/// Both stages are terminated and joined before this returns.
pub fn run_simulation(
    config: &Config,
    script: Script,
    options: &SimulationOptions,
) -> Result<SimulationReport> {
    let settings = config.recognizer.settings()?;
    let resources = Arc::new(config.resources.build()?);
    let group = match &settings.group {
        Some(name) => resources.group(name)?,
        None => resources.default_group()?,
    };

    let input = PacketQueue::with_capacity(config.queue.max_len);
    let output = PacketQueue::new();
    let reporter: Arc<dyn ErrorReporter> = Arc::new(LogReporter);
    let capacity = config.diagnostics.capacity;

    let recognizer = Recognizer::new(
        "recognizer",
        Box::new(MockDecoder::new(group.feature_dim())),
        resources,
        input.clone(),
        output.clone(),
        settings,
    )?;
    let mut recognizer = Stage::with_options(recognizer, capacity, reporter.clone());
    let mut source = Stage::with_options(
        ScriptedSource::new("source", script, input),
        capacity,
        reporter,
    );

    recognizer.start()?;
    source.start()?;
    recognizer.send("start()");
    source.send("play()");
    let timer = Timer::start(recognizer.commands(), options.timeout);

    let deadline = Instant::now() + options.timeout;
    let mut packets = Vec::new();
    let mut terminated = false;
    loop {
        let wait = deadline.saturating_duration_since(Instant::now()) + options.idle;
        let Some(packet) = output.get_timeout(wait) else {
            log::debug!("simulation: no output for {:?}, stopping", wait);
            break;
        };
        let last = packet.is_marker(defaults::MARKER_TERMINATED);
        packets.push(packet);
        if last {
            terminated = true;
            break;
        }
    }
    timer.cancel();

    // The flag reaches a source that is blocked on a full input queue.
    source.terminate();
    source.send("terminate()");
    recognizer.send("terminate()");
    let source_status = source.join()?;
    let recognizer_status = recognizer.join()?;

    let mut diagnostics = source.diagnostics().drain();
    diagnostics.extend(recognizer.diagnostics().drain());

    Ok(SimulationReport {
        output: packets,
        terminated,
        source_status,
        recognizer_status,
        diagnostics,
    })
}
