//! Command-line interface for speechflow
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Speech pipeline simulator
#[derive(Parser, Debug)]
#[command(name = "speechflow", version, about = "Speech pipeline simulator")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Play a packet script through a recognizer and print its output
    Simulate {
        /// Script file (one packet per line)
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        /// Recognizer mode flags, e.g. "continuous,flush-speech,stop-silence,result-end"
        #[arg(long, value_name = "FLAGS")]
        mode: Option<String>,

        /// Number of hypotheses per answer
        #[arg(long, value_name = "N")]
        nbest: Option<usize>,

        /// Resource group for the first utterance
        #[arg(long, value_name = "NAME")]
        group: Option<String>,

        /// Print packets as JSON lines
        #[arg(long)]
        json: bool,

        /// Send timeout() to the recognizer after this long. Examples: 500ms, 10s, 1m
        #[arg(long, value_name = "DURATION", default_value = "10s", value_parser = parse_duration)]
        timeout: Duration,
    },

    /// Parse a command string and print its canonical form
    Parse {
        /// Command text, e.g. 'setmode(025)'
        #[arg(value_name = "COMMAND")]
        command: String,

        /// Print the parsed command as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`, plus bare numbers
/// (seconds).
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}
