//! Pipeline substrate: packets, queues, the command protocol and stages.
//!
//! Every stage runs on its own thread and talks to other stages only through
//! [`PacketQueue`]s and textual commands sent to its inbox.

pub mod command;
pub mod error;
pub mod event;
pub mod packet;
pub mod queue;
pub mod source;
pub mod stage;
pub mod timer;

pub use command::{ArgCursor, ArgError, CommandArg, CommandPacket, Reply, UniversalCommand};
pub use error::{DiagnosticLog, ErrorReporter, LogReporter, StageError};
pub use event::{EventWaiter, Listener, QueueId, StageEvent, StageFlags, event_channel};
pub use packet::{
    Observation, Packet, PacketKind, Payload, PhraseFragment, PhraseKind, StreamTime, WaveBlock,
};
pub use queue::{NotifyPolicy, PacketQueue};
pub use source::{Script, ScriptedSource};
pub use stage::{CommandSender, Stage, StageContext, StageHandler, check_message};
pub use timer::Timer;
