//! Default configuration constants for speechflow.
//!
//! Shared by the config layer, the stage base and the recognizer so the
//! numbers only live in one place.

use std::time::Duration;

/// Number of diagnostic messages a stage keeps before dropping the oldest.
pub const DIAGNOSTIC_CAPACITY: usize = 64;

/// Frames between two traceback snapshots while the recognizer is running.
pub const TRACEBACK_INTERVAL: u64 = 10;

/// Number of hypotheses computed for the final answer.
pub const NBEST: usize = 1;

/// Upper bound accepted by `setnbest(n)`.
pub const MAX_NBEST: i64 = 32;

/// Name of the resource group used when nothing else is selected.
pub const DEFAULT_GROUP: &str = "default";

/// How often a producer blocked on a full queue checks for termination.
pub const PRODUCER_POLL: Duration = Duration::from_millis(50);

/// Default recognizer mode in its textual form.
pub const RUN_MODE: &str = "continuous,result-end";

/// Default log level for the binary.
pub const LOG_LEVEL: &str = "info";

/// Marker that opens an utterance on the recognizer input.
pub const MARKER_START: &str = "START";

/// Marker that closes an utterance on the recognizer input.
pub const MARKER_STOP: &str = "STOP";

/// Marker that ends a list of utterances; flushes like `START`.
pub const MARKER_END_OF_LIST: &str = "ENDOFLIST";

/// Marker that shuts the pipeline down stage by stage.
pub const MARKER_TERMINATED: &str = "TERMINATED";

/// Feature dimension of the built-in resource group.
pub const FEATURE_DIM: usize = 1;

/// Vocabulary of the built-in resource group.
pub const VOCABULARY: &[&str] = &[
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine",
];
