//! Recognizer stage: drives a decoder through a five-state control loop.

pub mod held;
pub mod mode;
pub mod stage;

pub use held::HeldPackets;
pub use mode::{FlushPolicy, RunEvent, RunMode, RunState, next_state};
pub use stage::{Recognizer, RecognizerCommand, RecognizerSettings};
