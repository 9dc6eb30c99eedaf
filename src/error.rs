//! Error types for speechflow.

use std::fmt;
use thiserror::Error;

/// Stable numeric codes for fatal stage errors.
///
/// The number doubles as the exit status of a stage thread that died from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A packet of the wrong kind showed up where a specific kind was required.
    UnexpectedPacket,
    /// An observation whose dimension does not match the active resource group.
    FeatureDimension,
    /// The decoding engine reported a failure.
    DecoderFailure,
    /// A named resource group does not exist.
    MissingResourceGroup,
    /// Decoder and resource group disagree on the feature dimension.
    IncompatibleResources,
}

impl ErrorCode {
    /// The numeric form of the code. Never zero.
    pub fn number(self) -> i32 {
        match self {
            ErrorCode::UnexpectedPacket => 101,
            ErrorCode::FeatureDimension => 102,
            ErrorCode::DecoderFailure => 103,
            ErrorCode::MissingResourceGroup => 201,
            ErrorCode::IncompatibleResources => 202,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.number())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Command protocol errors
    #[error("Malformed command '{text}': {reason}")]
    MalformedCommand { text: String, reason: String },

    // Stage protocol errors
    #[error("Protocol violation {code} in {stage}: {message}")]
    ProtocolViolation {
        code: ErrorCode,
        stage: String,
        message: String,
    },

    // Resource errors
    #[error("Resource error {code}: {message}")]
    Resource { code: ErrorCode, message: String },

    // Decoder errors
    #[error("Decoder error: {message}")]
    Decoder { message: String },

    // Script errors
    #[error("Script line {line}: {message}")]
    Script { line: usize, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Numbered code for errors that are fatal to a stage, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            PipelineError::ProtocolViolation { code, .. } | PipelineError::Resource { code, .. } => {
                Some(*code)
            }
            PipelineError::Decoder { .. } => Some(ErrorCode::DecoderFailure),
            _ => None,
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, PipelineError>;
