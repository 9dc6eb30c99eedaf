//! Error types, reporting and the diagnostic log for pipeline stages.

use crate::error::{ErrorCode, PipelineError};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Errors that can occur while a stage handles a command or input.
#[derive(Debug, Clone, PartialEq)]
pub enum StageError {
    /// Non-fatal; posted to the diagnostic log and the loop continues.
    Diagnostic(String),
    /// Fatal; the stage thread exits with the code as its status.
    Fatal { code: ErrorCode, message: String },
}

impl StageError {
    pub fn fatal(code: ErrorCode, message: impl Into<String>) -> Self {
        StageError::Fatal {
            code,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, StageError::Fatal { .. })
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::Diagnostic(msg) => write!(f, "Diagnostic: {}", msg),
            StageError::Fatal { code, message } => write!(f, "Fatal error {}: {}", code, message),
        }
    }
}

impl std::error::Error for StageError {}

impl From<PipelineError> for StageError {
    fn from(error: PipelineError) -> Self {
        match error.code() {
            Some(code) => StageError::Fatal {
                code,
                message: error.to_string(),
            },
            None => StageError::Diagnostic(error.to_string()),
        }
    }
}

/// Trait for reporting stage errors.
pub trait ErrorReporter: Send + Sync {
    /// Reports an error from a stage.
    fn report(&self, stage: &str, error: &StageError);
}

/// Error reporter that forwards to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, stage: &str, error: &StageError) {
        match error {
            StageError::Diagnostic(_) => log::warn!("{}: {}", stage, error),
            StageError::Fatal { .. } => log::error!("{}: {}", stage, error),
        }
    }
}

/// Bounded per-stage message log read by an external monitor.
///
/// When full, the oldest message is dropped.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    capacity: usize,
    messages: Arc<Mutex<VecDeque<String>>>,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn post(&self, message: impl Into<String>) {
        let mut messages = self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if messages.len() == self.capacity {
            messages.pop_front();
        }
        messages.push_back(message.into());
    }

    /// Removes and returns every message, oldest first.
    pub fn drain(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Copies the messages without removing them.
    pub fn snapshot(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
