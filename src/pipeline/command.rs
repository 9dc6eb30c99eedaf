//! Textual command protocol shared by every stage.
//!
//! Commands look like `name(arg1,arg2,...)`. Arguments are quoted strings,
//! octal integers (leading `0`), decimal integers, floats, or bare tokens which
//! are taken as strings.

use crate::error::{PipelineError, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A single command argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CommandArg {
    Int(i64),
    Float(f64),
    Str(String),
}

impl CommandArg {
    fn type_name(&self) -> &'static str {
        match self {
            CommandArg::Int(_) => "int",
            CommandArg::Float(_) => "float",
            CommandArg::Str(_) => "string",
        }
    }

    /// Classifies an unquoted token.
    fn from_bare(token: &str) -> Self {
        if let Some(value) = parse_integer(token) {
            return CommandArg::Int(value);
        }
        if looks_like_float(token)
            && let Ok(value) = token.parse::<f64>()
        {
            return CommandArg::Float(value);
        }
        CommandArg::Str(token.to_string())
    }
}

impl From<i64> for CommandArg {
    fn from(value: i64) -> Self {
        CommandArg::Int(value)
    }
}

impl From<f64> for CommandArg {
    fn from(value: f64) -> Self {
        CommandArg::Float(value)
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        CommandArg::Str(value.to_string())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        CommandArg::Str(value)
    }
}

impl fmt::Display for CommandArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandArg::Int(value) => write!(f, "{}", value),
            // Debug keeps a '.' or an exponent, so the text parses back as a float.
            CommandArg::Float(value) => write!(f, "{:?}", value),
            CommandArg::Str(value) => {
                f.write_str("\"")?;
                for ch in value.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        _ => write!(f, "{}", ch)?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}

fn parse_integer(token: &str) -> Option<i64> {
    let (negative, digits) = match token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let magnitude = if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn looks_like_float(token: &str) -> bool {
    let body = token.trim_start_matches(['-', '+']);
    body.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        && body.contains(|c: char| c.is_ascii_digit())
        && body.contains(['.', 'e', 'E'])
}

/// A structured command: a name plus an ordered argument list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandPacket {
    pub name: String,
    pub args: Vec<CommandArg>,
}

impl CommandPacket {
    pub fn new(name: impl Into<String>, args: Vec<CommandArg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Parses `name(arg1,arg2,...)`.
    pub fn parse(text: &str) -> Result<Self> {
        let malformed = |reason: &str| PipelineError::MalformedCommand {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = text.trim();
        let open = trimmed.find('(').ok_or_else(|| malformed("missing '('"))?;
        let name = trimmed[..open].trim();
        if name.is_empty() {
            return Err(malformed("empty command name"));
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(malformed("invalid character in command name"));
        }

        let body: Vec<char> = trimmed[open + 1..].chars().collect();
        let mut pos = 0;
        let mut args = Vec::new();

        let skip_ws = |pos: &mut usize| {
            while *pos < body.len() && body[*pos].is_whitespace() {
                *pos += 1;
            }
        };

        skip_ws(&mut pos);
        if body.get(pos) == Some(&')') {
            pos += 1;
        } else {
            loop {
                skip_ws(&mut pos);
                match body.get(pos) {
                    None => return Err(malformed("missing ')'")),
                    Some('"') => {
                        pos += 1;
                        let mut value = String::new();
                        loop {
                            match body.get(pos) {
                                None => return Err(malformed("unterminated string")),
                                Some('\\') => {
                                    let escaped = body
                                        .get(pos + 1)
                                        .ok_or_else(|| malformed("unterminated string"))?;
                                    value.push(*escaped);
                                    pos += 2;
                                }
                                Some('"') => {
                                    pos += 1;
                                    break;
                                }
                                Some(c) => {
                                    value.push(*c);
                                    pos += 1;
                                }
                            }
                        }
                        args.push(CommandArg::Str(value));
                        skip_ws(&mut pos);
                    }
                    Some(_) => {
                        let start = pos;
                        while pos < body.len() && body[pos] != ',' && body[pos] != ')' {
                            pos += 1;
                        }
                        let token: String = body[start..pos].iter().collect();
                        let token = token.trim();
                        if token.is_empty() {
                            return Err(malformed("empty argument"));
                        }
                        args.push(CommandArg::from_bare(token));
                    }
                }

                match body.get(pos) {
                    Some(',') => pos += 1,
                    Some(')') => {
                        pos += 1;
                        break;
                    }
                    None => return Err(malformed("missing ')'")),
                    Some(_) => return Err(malformed("expected ',' or ')' after argument")),
                }
            }
        }

        if body[pos..].iter().any(|c| !c.is_whitespace()) {
            return Err(malformed("trailing characters after ')'"));
        }

        Ok(Self::new(name, args))
    }

    /// Returns a typed reader over the arguments.
    pub fn cursor(&self) -> ArgCursor<'_> {
        ArgCursor {
            command: self,
            index: 0,
        }
    }
}

impl FromStr for CommandPacket {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CommandPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

/// Failure reading a typed argument.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArgError {
    #[error("argument {index} is missing")]
    Missing { index: usize },

    #[error("argument {index} is a {found}, expected {expected}")]
    TypeMismatch {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("argument {index} = {value} is outside {min}..={max}")]
    OutOfRange {
        index: usize,
        value: String,
        min: String,
        max: String,
    },
}

/// Reads arguments in order. The cursor only advances on success.
pub struct ArgCursor<'a> {
    command: &'a CommandPacket,
    index: usize,
}

impl<'a> ArgCursor<'a> {
    fn current(&self) -> std::result::Result<&'a CommandArg, ArgError> {
        self.command
            .args
            .get(self.index)
            .ok_or(ArgError::Missing { index: self.index })
    }

    pub fn string(&mut self) -> std::result::Result<&'a str, ArgError> {
        match self.current()? {
            CommandArg::Str(value) => {
                self.index += 1;
                Ok(value)
            }
            other => Err(ArgError::TypeMismatch {
                index: self.index,
                expected: "string",
                found: other.type_name(),
            }),
        }
    }

    pub fn int(&mut self, min: i64, max: i64) -> std::result::Result<i64, ArgError> {
        let value = match self.current()? {
            CommandArg::Int(value) => *value,
            other => {
                return Err(ArgError::TypeMismatch {
                    index: self.index,
                    expected: "int",
                    found: other.type_name(),
                });
            }
        };
        if !(min..=max).contains(&value) {
            return Err(ArgError::OutOfRange {
                index: self.index,
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        self.index += 1;
        Ok(value)
    }

    /// Reads a float; integers are widened.
    pub fn float(&mut self, min: f64, max: f64) -> std::result::Result<f64, ArgError> {
        let value = match self.current()? {
            CommandArg::Float(value) => *value,
            CommandArg::Int(value) => *value as f64,
            other => {
                return Err(ArgError::TypeMismatch {
                    index: self.index,
                    expected: "float",
                    found: other.type_name(),
                });
            }
        };
        if !(min..=max).contains(&value) {
            return Err(ArgError::OutOfRange {
                index: self.index,
                value: value.to_string(),
                min: min.to_string(),
                max: max.to_string(),
            });
        }
        self.index += 1;
        Ok(value)
    }

    /// Number of arguments not read yet.
    pub fn remaining(&self) -> usize {
        self.command.args.len().saturating_sub(self.index)
    }
}

/// Commands every stage understands. They never reach a stage handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniversalCommand {
    Suspend,
    Resume,
    Terminate,
}

impl UniversalCommand {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "suspend" => Some(UniversalCommand::Suspend),
            "resume" => Some(UniversalCommand::Resume),
            "terminate" => Some(UniversalCommand::Terminate),
            _ => None,
        }
    }
}

/// Replies and events a stage reports back to its controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Started { seq: i64, total: i64 },
    Finished { seq: i64 },
    Aborted {
        seq: i64,
        index: i64,
        word: String,
        percent: f64,
    },
    Muted(Vec<CommandArg>),
    Unmuted(Vec<CommandArg>),
    Error { seq: i64 },
    Timeout,
}

impl Reply {
    pub fn to_command(&self) -> CommandPacket {
        match self {
            Reply::Started { seq, total } => {
                CommandPacket::new("started", vec![(*seq).into(), (*total).into()])
            }
            Reply::Finished { seq } => CommandPacket::new("finished", vec![(*seq).into()]),
            Reply::Aborted {
                seq,
                index,
                word,
                percent,
            } => CommandPacket::new(
                "aborted",
                vec![
                    (*seq).into(),
                    (*index).into(),
                    word.clone().into(),
                    (*percent).into(),
                ],
            ),
            Reply::Muted(args) => CommandPacket::new("muted", args.clone()),
            Reply::Unmuted(args) => CommandPacket::new("unmuted", args.clone()),
            Reply::Error { seq } => CommandPacket::new("error", vec![(*seq).into()]),
            Reply::Timeout => CommandPacket::new("timeout", Vec::new()),
        }
    }

    /// Recognizes a reply; `None` for any other command or a bad argument list.
    pub fn from_command(command: &CommandPacket) -> Option<Self> {
        let mut args = command.cursor();
        let reply = match command.name.as_str() {
            "started" => Reply::Started {
                seq: args.int(i64::MIN, i64::MAX).ok()?,
                total: args.int(i64::MIN, i64::MAX).ok()?,
            },
            "finished" => Reply::Finished {
                seq: args.int(i64::MIN, i64::MAX).ok()?,
            },
            "aborted" => Reply::Aborted {
                seq: args.int(i64::MIN, i64::MAX).ok()?,
                index: args.int(i64::MIN, i64::MAX).ok()?,
                word: args.string().ok()?.to_string(),
                percent: args.float(0.0, 100.0).ok()?,
            },
            "muted" => return Some(Reply::Muted(command.args.clone())),
            "unmuted" => return Some(Reply::Unmuted(command.args.clone())),
            "error" => Reply::Error {
                seq: args.int(i64::MIN, i64::MAX).ok()?,
            },
            "timeout" => Reply::Timeout,
            _ => return None,
        };
        if args.remaining() > 0 {
            return None;
        }
        Some(reply)
    }
}
