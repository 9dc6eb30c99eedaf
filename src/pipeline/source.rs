//! Scripted producer stage.
//!
//! Replays a fixed list of packets onto its output queue when it receives
//! `play()`. Scripts are plain text, one packet per line:
//!
//! ```text
//! # comment
//! marker START
//! obs speech 1.0 0.5
//! obs silence 0.0 0.0
//! wave 160
//! command setnbest(2)
//! marker STOP
//! ```
//!
//! Timestamps are assigned consecutively from 1.

use crate::defaults;
use crate::error::{PipelineError, Result};
use crate::pipeline::command::{CommandPacket, Reply};
use crate::pipeline::error::StageError;
use crate::pipeline::packet::{Packet, StreamTime};
use crate::pipeline::queue::PacketQueue;
use crate::pipeline::stage::{CommandSender, StageContext, StageHandler};
use std::path::Path;

/// Parsed packet script.
#[derive(Debug, Clone, Default)]
pub struct Script {
    packets: Vec<Packet>,
}

impl Script {
    /// Parses script text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut packets = Vec::new();
        let mut time: StreamTime = 1;

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_no = index + 1;
            let (keyword, rest) = line
                .split_once(char::is_whitespace)
                .map(|(k, r)| (k, r.trim()))
                .unwrap_or((line, ""));

            let packet = match keyword {
                "obs" => parse_observation(time, rest, line_no)?,
                "marker" => {
                    if rest.is_empty() {
                        return Err(script_error(line_no, "marker needs text"));
                    }
                    Packet::marker(time, rest)
                }
                "wave" => {
                    let count: usize = rest
                        .parse()
                        .map_err(|_| script_error(line_no, format!("bad sample count '{}'", rest)))?;
                    Packet::wave(time, time, vec![0; count])
                }
                "command" => {
                    let command = CommandPacket::parse(rest)
                        .map_err(|e| script_error(line_no, e.to_string()))?;
                    Packet::command(time, command)
                }
                other => {
                    return Err(script_error(line_no, format!("unknown keyword '{}'", other)));
                }
            };
            packets.push(packet);
            time += 1;
        }

        Ok(Self { packets })
    }

    /// Reads and parses a script file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn from_packets(packets: Vec<Packet>) -> Self {
        Self { packets }
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

fn parse_observation(time: StreamTime, rest: &str, line: usize) -> Result<Packet> {
    let mut fields = rest.split_whitespace();
    let speech = match fields.next() {
        Some("speech") => true,
        Some("silence") => false,
        Some(other) => {
            return Err(script_error(
                line,
                format!("expected 'speech' or 'silence', got '{}'", other),
            ));
        }
        None => return Err(script_error(line, "obs needs a speech flag")),
    };
    let features = fields
        .map(|f| {
            f.parse::<f32>()
                .map_err(|_| script_error(line, format!("bad feature value '{}'", f)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Packet::observation(time, features, speech))
}

fn script_error(line: usize, message: impl Into<String>) -> PipelineError {
    PipelineError::Script {
        line,
        message: message.into(),
    }
}

/// Stage that pushes a [`Script`] onto its output on `play()`.
///
/// Also understands `rewind()`. When a reply target is set, each `play()` is
/// bracketed by `started(seq,total)` and `finished(seq)`.
pub struct ScriptedSource {
    name: String,
    script: Script,
    output: PacketQueue,
    reply_to: Option<CommandSender>,
    position: usize,
    seq: i64,
}

impl ScriptedSource {
    pub fn new(name: &str, script: Script, output: PacketQueue) -> Self {
        Self {
            name: name.to_string(),
            script,
            output,
            reply_to: None,
            position: 0,
            seq: 0,
        }
    }

    /// Sends progress replies to `target`.
    pub fn with_replies(mut self, target: CommandSender) -> Self {
        self.reply_to = Some(target);
        self
    }

    fn reply(&self, reply: Reply) {
        if let Some(target) = &self.reply_to {
            target.send_command(reply.to_command());
        }
    }

    fn play(&mut self, limit: Option<usize>, ctx: &StageContext) {
        self.seq += 1;
        let total = self.script.len() as i64;
        self.reply(Reply::Started {
            seq: self.seq,
            total,
        });

        let end = limit
            .map(|n| (self.position + n).min(self.script.len()))
            .unwrap_or(self.script.len());
        let first = self.position;
        while self.position < end {
            let mut packet = self.script.packets[self.position].clone();
            // A full bounded queue must not hide a termination request.
            loop {
                match self.output.put_timeout(packet, defaults::PRODUCER_POLL) {
                    Ok(_) => break,
                    Err(rejected) if ctx.is_terminated() => {
                        log::info!(
                            "{}: terminated while blocked at packet t={}",
                            self.name,
                            rejected.start()
                        );
                        return;
                    }
                    Err(rejected) => packet = rejected,
                }
            }
            self.position += 1;
        }
        log::debug!(
            "{}: played packets {}..{} of {}",
            self.name,
            first,
            end,
            total
        );

        self.reply(Reply::Finished { seq: self.seq });
    }
}

impl StageHandler for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn handle_command(
        &mut self,
        command: &CommandPacket,
        ctx: &mut StageContext,
    ) -> std::result::Result<(), StageError> {
        match command.name.as_str() {
            "play" => {
                let mut args = command.cursor();
                let limit = if args.remaining() > 0 {
                    let n = args
                        .int(1, i64::MAX)
                        .map_err(|e| StageError::Diagnostic(format!("play: {}", e)))?;
                    Some(n as usize)
                } else {
                    None
                };
                self.play(limit, ctx);
                Ok(())
            }
            "rewind" => {
                self.position = 0;
                Ok(())
            }
            other => Err(StageError::Diagnostic(format!("unknown command '{}'", other))),
        }
    }

    fn process(&mut self, _ctx: &mut StageContext) -> std::result::Result<(), StageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::packet::PacketKind;
    use crate::pipeline::stage::check_message;

    const SCRIPT: &str = "\
# two frames of speech
marker START
obs speech 1 0.5
obs silence 0 0

wave 4
command usegrp(digits)
marker STOP
";

    #[test]
    fn test_parse_assigns_consecutive_times() {
        let script = Script::parse(SCRIPT).unwrap();
        let kinds: Vec<_> = script.packets().iter().map(|p| p.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                PacketKind::Marker,
                PacketKind::Observation,
                PacketKind::Observation,
                PacketKind::Wave,
                PacketKind::Command,
                PacketKind::Marker,
            ]
        );
        let times: Vec<_> = script.packets().iter().map(|p| p.start()).collect();
        assert_eq!(times, vec![1, 2, 3, 4, 5, 6]);

        let obs = script.packets()[1].as_observation().unwrap();
        assert!(obs.speech);
        assert_eq!(obs.features, vec![1.0, 0.5]);
        assert!(!script.packets()[2].as_observation().unwrap().speech);
    }

    #[test]
    fn test_parse_errors_carry_line_numbers() {
        let err = Script::parse("marker START\nobs loud 1").unwrap_err();
        match err {
            PipelineError::Script { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("loud"));
            }
            other => panic!("expected script error, got {:?}", other),
        }

        assert!(Script::parse("obs speech x").is_err());
        assert!(Script::parse("marker").is_err());
        assert!(Script::parse("wave many").is_err());
        assert!(Script::parse("command nope").is_err());
        assert!(Script::parse("beep").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("utterance.script");
        std::fs::write(&path, SCRIPT).unwrap();

        let script = Script::load(&path).unwrap();
        assert_eq!(script.len(), 6);
        assert!(Script::load(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_play_pushes_script_and_replies() {
        let output = PacketQueue::new();
        let (controller, _controller_waiter) = StageContext::standalone("controller");
        let (mut ctx, _waiter) = StageContext::standalone("source");
        let mut source = ScriptedSource::new("source", Script::parse(SCRIPT).unwrap(), output.clone())
            .with_replies(controller.commands());

        ctx.commands().send("play(2)");
        ctx.commands().send("play()");
        assert!(check_message(&mut source, &mut ctx, false).unwrap());
        assert_eq!(output.count(), 2);
        assert!(check_message(&mut source, &mut ctx, false).unwrap());
        assert_eq!(output.count(), 6);
        assert!(output.pop().unwrap().is_marker("START"));

        let replies: Vec<_> = std::iter::from_fn(|| controller.inbox().pop())
            .filter_map(|p| p.as_command().and_then(Reply::from_command))
            .collect();
        assert_eq!(
            replies,
            vec![
                Reply::Started { seq: 1, total: 6 },
                Reply::Finished { seq: 1 },
                Reply::Started { seq: 2, total: 6 },
                Reply::Finished { seq: 2 },
            ]
        );
    }

    #[test]
    fn test_terminated_source_stops_waiting_on_full_queue() {
        let output = PacketQueue::bounded(1);
        let (controller, _controller_waiter) = StageContext::standalone("controller");
        let (mut ctx, _waiter) = StageContext::standalone("source");
        let mut source = ScriptedSource::new("source", Script::parse(SCRIPT).unwrap(), output.clone())
            .with_replies(controller.commands());

        ctx.terminate();
        ctx.commands().send("play()");
        assert!(check_message(&mut source, &mut ctx, false).unwrap());

        assert_eq!(output.count(), 1);
        assert_eq!(source.position, 1);
        let replies: Vec<_> = std::iter::from_fn(|| controller.inbox().pop())
            .filter_map(|p| p.as_command().and_then(Reply::from_command))
            .collect();
        assert_eq!(replies, vec![Reply::Started { seq: 1, total: 6 }]);
    }

    #[test]
    fn test_rewind_and_bad_arguments() {
        let output = PacketQueue::new();
        let (mut ctx, _waiter) = StageContext::standalone("source");
        let mut source = ScriptedSource::new("source", Script::parse(SCRIPT).unwrap(), output.clone());

        ctx.commands().send("play()");
        ctx.commands().send("rewind()");
        ctx.commands().send("play(0)");
        ctx.commands().send("play(1)");
        for _ in 0..4 {
            check_message(&mut source, &mut ctx, false).unwrap();
        }

        assert_eq!(output.count(), 7);
        let diagnostics = ctx.diagnostics().drain();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].starts_with("play:"));
    }
}
