//! Stage base: one thread, one command inbox, a uniform lifecycle.
//!
//! A [`Stage`] wraps a [`StageHandler`] and runs it on a dedicated thread. The
//! thread sleeps in its event wait until a command or registered input data
//! arrives, handles every pending command, then lets the handler consume its
//! input. Other threads talk to a stage only through its inbox.

use crate::defaults;
use crate::error::{PipelineError, Result};
use crate::pipeline::command::{CommandPacket, UniversalCommand};
use crate::pipeline::error::{DiagnosticLog, ErrorReporter, LogReporter, StageError};
use crate::pipeline::event::{EventWaiter, Listener, StageFlags, event_channel};
use crate::pipeline::packet::Packet;
use crate::pipeline::queue::PacketQueue;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Stage-specific behavior run by a [`Stage`] thread.
pub trait StageHandler: Send + 'static {
    /// Returns the name of this stage for logging and error reporting.
    fn name(&self) -> &str;

    /// Called once on the stage thread before the loop starts.
    ///
    /// This is where a handler registers its input queues with
    /// [`StageContext::listener`].
    fn on_start(&mut self, _ctx: &mut StageContext) -> std::result::Result<(), StageError> {
        Ok(())
    }

    /// Handles a command that is not one of the universal ones.
    fn handle_command(
        &mut self,
        command: &CommandPacket,
        ctx: &mut StageContext,
    ) -> std::result::Result<(), StageError>;

    /// Consumes available input until no further progress is possible.
    ///
    /// Called after every wake-up while the stage is not suspended.
    fn process(&mut self, ctx: &mut StageContext) -> std::result::Result<(), StageError>;

    /// Called on the stage thread when the loop has exited.
    fn shutdown(&mut self, _ctx: &mut StageContext) {}
}

/// Cloneable handle for sending commands to a stage.
#[derive(Clone, Debug)]
pub struct CommandSender {
    stage: String,
    inbox: PacketQueue,
    diagnostics: DiagnosticLog,
}

impl CommandSender {
    /// Parses `text` and enqueues it. Returns false on malformed syntax.
    pub fn send(&self, text: &str) -> bool {
        match CommandPacket::parse(text) {
            Ok(command) => self.send_command(command),
            Err(e) => {
                log::warn!("{}: {}", self.stage, e);
                self.diagnostics.post(e.to_string());
                false
            }
        }
    }

    pub fn send_command(&self, command: CommandPacket) -> bool {
        self.inbox.put(Packet::command(0, command))
    }

    /// Name of the stage this sender delivers to.
    pub fn stage(&self) -> &str {
        &self.stage
    }
}

/// What a handler sees of its stage while running.
pub struct StageContext {
    name: String,
    flags: Arc<StageFlags>,
    inbox: PacketQueue,
    diagnostics: DiagnosticLog,
    listener: Listener,
    reporter: Arc<dyn ErrorReporter>,
    active: Option<CommandPacket>,
}

impl StageContext {
    /// Creates a context that is not attached to a thread.
    ///
    /// The caller drives the handler with [`check_message`] and
    /// [`StageHandler::process`]; useful for deterministic tests.
    pub fn standalone(name: &str) -> (Self, EventWaiter) {
        Self::build(
            name,
            defaults::DIAGNOSTIC_CAPACITY,
            Arc::new(LogReporter),
        )
    }

    fn build(
        name: &str,
        capacity: usize,
        reporter: Arc<dyn ErrorReporter>,
    ) -> (Self, EventWaiter) {
        let (listener, waiter) = event_channel();
        let inbox = PacketQueue::command_inbox();
        inbox.request_notify(listener.clone());
        let ctx = Self {
            name: name.to_string(),
            flags: Arc::new(StageFlags::default()),
            inbox,
            diagnostics: DiagnosticLog::new(capacity),
            listener,
            reporter,
            active: None,
        };
        (ctx, waiter)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn inbox(&self) -> &PacketQueue {
        &self.inbox
    }

    /// Listener delivering into this stage's event wait.
    pub fn listener(&self) -> Listener {
        self.listener.clone()
    }

    /// Sender for this stage's own inbox (timers, self-injected commands).
    pub fn commands(&self) -> CommandSender {
        CommandSender {
            stage: self.name.clone(),
            inbox: self.inbox.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Posts a non-fatal diagnostic.
    pub fn diagnostic(&self, message: impl Into<String>) {
        self.absorb(StageError::Diagnostic(message.into())).ok();
    }

    /// The command currently being executed, if any.
    pub fn active_command(&self) -> Option<&CommandPacket> {
        self.active.as_ref()
    }

    /// Asks the loop to exit after the current iteration.
    pub fn terminate(&self) {
        self.flags.terminate();
    }

    pub fn is_terminated(&self) -> bool {
        self.flags.is_terminated()
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.is_suspended()
    }

    /// Reports an error: diagnostics are logged and swallowed, fatal errors returned.
    fn absorb(&self, error: StageError) -> std::result::Result<(), StageError> {
        self.reporter.report(&self.name, &error);
        match error {
            StageError::Diagnostic(message) => {
                self.diagnostics.post(message);
                Ok(())
            }
            fatal => Err(fatal),
        }
    }

    fn absorb_result(
        &self,
        result: std::result::Result<(), StageError>,
    ) -> std::result::Result<(), StageError> {
        match result {
            Ok(()) => Ok(()),
            Err(error) => self.absorb(error),
        }
    }
}

/// Dequeues and dispatches one command.
///
/// With `blocking` set, waits for a command; otherwise returns `Ok(false)` if
/// the inbox is empty. `suspend`, `resume` and `terminate` are handled here and
/// never reach the handler; both suspend and resume are idempotent.
pub fn check_message(
    handler: &mut dyn StageHandler,
    ctx: &mut StageContext,
    blocking: bool,
) -> std::result::Result<bool, StageError> {
    let packet = if blocking {
        Some(ctx.inbox.get())
    } else {
        ctx.inbox.pop()
    };
    let Some(packet) = packet else {
        return Ok(false);
    };
    let Some(command) = packet.as_command() else {
        ctx.diagnostic(format!("ignoring {} packet in command inbox", packet.kind()));
        return Ok(true);
    };

    log::debug!("{}: command {}", ctx.name, command);
    match UniversalCommand::from_name(&command.name) {
        Some(UniversalCommand::Suspend) => {
            if ctx.flags.set_suspended(true) {
                log::info!("{}: suspended", ctx.name);
            }
        }
        Some(UniversalCommand::Resume) => {
            if ctx.flags.set_suspended(false) {
                log::info!("{}: resumed", ctx.name);
            }
        }
        Some(UniversalCommand::Terminate) => {
            log::info!("{}: terminate requested", ctx.name);
            ctx.flags.terminate();
        }
        None => {
            ctx.active = Some(command.clone());
            let result = handler.handle_command(command, ctx);
            ctx.active = None;
            ctx.absorb_result(result)?;
        }
    }
    Ok(true)
}

struct Pending {
    handler: Box<dyn StageHandler>,
    ctx: StageContext,
    waiter: EventWaiter,
}

/// A named unit of concurrent execution.
pub struct Stage {
    name: String,
    flags: Arc<StageFlags>,
    inbox: PacketQueue,
    diagnostics: DiagnosticLog,
    pending: Option<Pending>,
    handle: Option<JoinHandle<i32>>,
    exit_status: Option<i32>,
}

impl Stage {
    /// Creates a stage in the Created state; no thread yet.
    pub fn new<H: StageHandler>(handler: H) -> Self {
        Self::with_options(handler, defaults::DIAGNOSTIC_CAPACITY, Arc::new(LogReporter))
    }

    /// Creates a stage with a diagnostic log capacity and an error reporter.
    pub fn with_options<H: StageHandler>(
        handler: H,
        diagnostic_capacity: usize,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let (ctx, waiter) = StageContext::build(handler.name(), diagnostic_capacity, reporter);
        Self {
            name: ctx.name.clone(),
            flags: ctx.flags.clone(),
            inbox: ctx.inbox.clone(),
            diagnostics: ctx.diagnostics.clone(),
            pending: Some(Pending {
                handler: Box::new(handler),
                ctx,
                waiter,
            }),
            handle: None,
            exit_status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the stage thread. Returns false if it was already started.
    pub fn start(&mut self) -> Result<bool> {
        let Some(pending) = self.pending.take() else {
            return Ok(false);
        };
        self.flags.mark_started();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let Pending {
                    mut handler,
                    mut ctx,
                    waiter,
                } = pending;
                run_stage(handler.as_mut(), &mut ctx, &waiter)
            })?;
        log::debug!("{}: started", self.name);
        self.handle = Some(handle);
        Ok(true)
    }

    /// Parses `text` and enqueues it on this stage's inbox.
    pub fn send(&self, text: &str) -> bool {
        self.commands().send(text)
    }

    pub fn commands(&self) -> CommandSender {
        CommandSender {
            stage: self.name.clone(),
            inbox: self.inbox.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }

    /// The command inbox; a monitor may attach an observer for a command echo.
    pub fn inbox(&self) -> &PacketQueue {
        &self.inbox
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// Sets the cooperative termination flag.
    ///
    /// A stage blocked in its event wait only notices this on its next
    /// wake-up; send `terminate()` instead to wake it.
    pub fn terminate(&self) {
        self.flags.terminate();
    }

    pub fn is_started(&self) -> bool {
        self.flags.is_started()
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.is_suspended()
    }

    pub fn is_terminated(&self) -> bool {
        self.flags.is_terminated()
    }

    /// True once the stage thread has exited.
    pub fn is_finished(&self) -> bool {
        self.exit_status.is_some() || self.handle.as_ref().is_some_and(|h| h.is_finished())
    }

    /// Waits for the stage thread and returns its exit status.
    ///
    /// 0 means a clean exit, anything else is the code of the fatal error.
    /// A stage that was never started reports 0.
    pub fn join(&mut self) -> Result<i32> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        let status = handle.join().map_err(|panic_info| {
            let msg = panic_info
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("unknown panic");
            PipelineError::Other(format!("stage '{}' thread panicked: {}", self.name, msg))
        })?;
        self.exit_status = Some(status);
        Ok(status)
    }
}

/// Top-level handler of a stage thread.
fn run_stage(handler: &mut dyn StageHandler, ctx: &mut StageContext, waiter: &EventWaiter) -> i32 {
    let status = match event_loop(handler, ctx, waiter) {
        Ok(()) => 0,
        Err(StageError::Fatal { code, message }) => {
            log::error!("{}: fatal error {}: {}", ctx.name, code, message);
            for message in ctx.diagnostics.snapshot() {
                log::error!("{}:   {}", ctx.name, message);
            }
            ctx.flags.terminate();
            code.number()
        }
        Err(StageError::Diagnostic(message)) => {
            log::error!("{}: loop aborted: {}", ctx.name, message);
            ctx.flags.terminate();
            1
        }
    };
    handler.shutdown(ctx);
    log::debug!("{}: exited with status {}", ctx.name, status);
    status
}

fn event_loop(
    handler: &mut dyn StageHandler,
    ctx: &mut StageContext,
    waiter: &EventWaiter,
) -> std::result::Result<(), StageError> {
    let started = handler.on_start(ctx);
    ctx.absorb_result(started)?;

    while !ctx.flags.is_terminated() {
        if ctx.flags.is_suspended() {
            check_message(handler, ctx, true)?;
            continue;
        }

        while check_message(handler, ctx, false)? {
            if ctx.flags.is_terminated() || ctx.flags.is_suspended() {
                break;
            }
        }
        if ctx.flags.is_terminated() {
            break;
        }
        if ctx.flags.is_suspended() {
            continue;
        }

        let processed = handler.process(ctx);
        ctx.absorb_result(processed)?;
        if ctx.flags.is_terminated() {
            break;
        }

        match waiter.wait() {
            Some(event) => log::trace!("{}: woke on {:?}", ctx.name, event),
            None => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::pipeline::event::StageEvent;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Copies input packets to output, doubling observation features.
    struct Doubler {
        input: PacketQueue,
        output: PacketQueue,
        commands: Arc<Mutex<Vec<String>>>,
        shutdown_called: Arc<AtomicBool>,
    }

    impl Doubler {
        fn new(input: PacketQueue, output: PacketQueue) -> Self {
            Self {
                input,
                output,
                commands: Arc::new(Mutex::new(Vec::new())),
                shutdown_called: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl StageHandler for Doubler {
        fn name(&self) -> &str {
            "doubler"
        }

        fn on_start(&mut self, ctx: &mut StageContext) -> std::result::Result<(), StageError> {
            self.input.request_notify(ctx.listener());
            Ok(())
        }

        fn handle_command(
            &mut self,
            command: &CommandPacket,
            ctx: &mut StageContext,
        ) -> std::result::Result<(), StageError> {
            assert_eq!(ctx.active_command(), Some(command));
            match command.name.as_str() {
                "note" => {
                    self.commands.lock().unwrap().push(command.to_string());
                    Ok(())
                }
                "explode" => Err(StageError::fatal(ErrorCode::UnexpectedPacket, "boom")),
                other => Err(StageError::Diagnostic(format!("unknown command '{}'", other))),
            }
        }

        fn process(&mut self, _ctx: &mut StageContext) -> std::result::Result<(), StageError> {
            while let Some(packet) = self.input.pop() {
                let doubled = match packet.as_observation() {
                    Some(obs) => Packet::observation(
                        packet.start(),
                        obs.features.iter().map(|f| f * 2.0).collect(),
                        obs.speech,
                    ),
                    None => packet,
                };
                self.output.put(doubled);
            }
            Ok(())
        }

        fn shutdown(&mut self, _ctx: &mut StageContext) {
            self.shutdown_called.store(true, Ordering::SeqCst);
        }
    }

    fn recv(queue: &PacketQueue) -> Packet {
        queue
            .get_timeout(Duration::from_secs(5))
            .expect("timed out waiting for packet")
    }

    #[test]
    fn test_stage_processes_input() {
        let input = PacketQueue::new();
        let output = PacketQueue::new();
        let handler = Doubler::new(input.clone(), output.clone());
        let shutdown = handler.shutdown_called.clone();
        let mut stage = Stage::new(handler);

        assert_eq!(stage.name(), "doubler");
        assert!(!stage.is_started());
        assert!(stage.start().unwrap());
        assert!(!stage.start().unwrap(), "start is idempotent");

        input.put(Packet::observation(1, vec![1.5], true));
        input.put(Packet::observation(2, vec![2.0], true));

        assert_eq!(recv(&output).as_observation().unwrap().features, vec![3.0]);
        assert_eq!(recv(&output).as_observation().unwrap().features, vec![4.0]);

        assert!(stage.send("terminate()"));
        assert_eq!(stage.join().unwrap(), 0);
        assert!(stage.is_terminated());
        assert!(shutdown.load(Ordering::SeqCst));
    }

    #[test]
    fn test_input_queued_before_start_is_processed() {
        let input = PacketQueue::new();
        let output = PacketQueue::new();
        input.put(Packet::marker(1, "START"));

        let mut stage = Stage::new(Doubler::new(input.clone(), output.clone()));
        stage.start().unwrap();

        assert!(recv(&output).is_marker("START"));
        stage.send("terminate()");
        stage.join().unwrap();
    }

    #[test]
    fn test_custom_commands_reach_handler() {
        let handler = Doubler::new(PacketQueue::new(), PacketQueue::new());
        let commands = handler.commands.clone();
        let mut stage = Stage::new(handler);
        stage.start().unwrap();

        assert!(stage.send(r#"note(1, "two")"#));
        stage.send("terminate()");
        stage.join().unwrap();

        assert_eq!(*commands.lock().unwrap(), vec![r#"note(1,"two")"#.to_string()]);
    }

    #[test]
    fn test_malformed_send_is_rejected_with_diagnostic() {
        let stage = Stage::new(Doubler::new(PacketQueue::new(), PacketQueue::new()));

        assert!(!stage.send("note(1"));
        assert_eq!(stage.inbox().count(), 0);
        assert_eq!(stage.diagnostics().len(), 1);
    }

    #[test]
    fn test_unknown_command_is_diagnostic_and_loop_continues() {
        let input = PacketQueue::new();
        let output = PacketQueue::new();
        let mut stage = Stage::new(Doubler::new(input.clone(), output.clone()));
        stage.start().unwrap();

        stage.send("frobnicate()");
        input.put(Packet::marker(1, "STILL_ALIVE"));
        assert!(recv(&output).is_marker("STILL_ALIVE"));

        stage.send("terminate()");
        assert_eq!(stage.join().unwrap(), 0);
        let messages = stage.diagnostics().drain();
        assert!(
            messages.iter().any(|m| m.contains("frobnicate")),
            "got {:?}",
            messages
        );
    }

    #[test]
    fn test_fatal_error_exits_with_code() {
        let mut stage = Stage::new(Doubler::new(PacketQueue::new(), PacketQueue::new()));
        stage.start().unwrap();

        stage.send("explode()");
        assert_eq!(
            stage.join().unwrap(),
            ErrorCode::UnexpectedPacket.number()
        );
        assert!(stage.is_terminated());
        assert!(stage.is_finished());
    }

    #[test]
    fn test_suspended_stage_ignores_data_until_resume() {
        let input = PacketQueue::new();
        let output = PacketQueue::new();
        let mut stage = Stage::new(Doubler::new(input.clone(), output.clone()));
        stage.start().unwrap();

        stage.send("suspend()");
        stage.send("suspend()");
        // Wait until the stage has seen both commands.
        while !stage.inbox().is_empty() || !stage.is_suspended() {
            thread::sleep(Duration::from_millis(5));
        }
        input.put(Packet::marker(1, "HELD"));
        assert!(output.get_timeout(Duration::from_millis(100)).is_none());

        stage.send("resume()");
        assert!(recv(&output).is_marker("HELD"));
        assert!(!stage.is_suspended());

        stage.send("resume()");
        stage.send("terminate()");
        assert_eq!(stage.join().unwrap(), 0);
    }

    #[test]
    fn test_check_message_drives_standalone_context() {
        let (mut ctx, _waiter) = StageContext::standalone("doubler");
        let mut handler = Doubler::new(PacketQueue::new(), PacketQueue::new());
        let commands = handler.commands.clone();

        assert!(!check_message(&mut handler, &mut ctx, false).unwrap());

        ctx.commands().send("note()");
        ctx.commands().send("suspend()");
        assert!(check_message(&mut handler, &mut ctx, false).unwrap());
        assert!(check_message(&mut handler, &mut ctx, false).unwrap());

        assert_eq!(commands.lock().unwrap().len(), 1);
        assert!(ctx.is_suspended());
    }

    #[test]
    fn test_commands_wake_with_command_arrived() {
        let (ctx, waiter) = StageContext::standalone("doubler");
        assert!(ctx.commands().send("note()"));
        assert_eq!(waiter.try_next(), Some(StageEvent::CommandArrived));
    }

    #[test]
    fn test_command_echo_observer() {
        let stage = Stage::new(Doubler::new(PacketQueue::new(), PacketQueue::new()));
        let echo = Arc::new(Mutex::new(Vec::new()));
        let sink = echo.clone();
        stage.inbox().add_observer(move |packet| {
            if let Some(command) = packet.as_command() {
                sink.lock().unwrap().push(command.to_string());
            }
        });

        stage.send("note(7)");
        assert_eq!(*echo.lock().unwrap(), vec!["note(7)".to_string()]);
    }

    #[derive(Default)]
    struct CollectingReporter {
        seen: Mutex<Vec<(String, StageError)>>,
    }

    impl ErrorReporter for CollectingReporter {
        fn report(&self, stage: &str, error: &StageError) {
            self.seen
                .lock()
                .unwrap()
                .push((stage.to_string(), error.clone()));
        }
    }

    #[test]
    fn test_reporter_sees_diagnostics_and_fatal_errors() {
        let reporter = Arc::new(CollectingReporter::default());
        let mut stage = Stage::with_options(
            Doubler::new(PacketQueue::new(), PacketQueue::new()),
            4,
            reporter.clone(),
        );
        stage.start().unwrap();

        stage.send("frobnicate()");
        stage.send("explode()");
        assert_eq!(stage.join().unwrap(), ErrorCode::UnexpectedPacket.number());

        let seen = reporter.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|(name, _)| name == "doubler"));
        assert!(!seen[0].1.is_fatal());
        assert!(seen[1].1.is_fatal());
    }

    #[test]
    fn test_join_without_start() {
        let mut stage = Stage::new(Doubler::new(PacketQueue::new(), PacketQueue::new()));
        assert_eq!(stage.join().unwrap(), 0);
    }
}
