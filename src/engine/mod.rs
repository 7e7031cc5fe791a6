//! Command engine
//!
//! Checkpoints, commands and the cooperative scheduler that runs them.

pub mod checkpoint;
pub mod command;
pub mod scheduler;
pub mod stats;

pub use checkpoint::Checkpoint;
pub use command::{Command, CommandId, CommandStatus, Cuid, SocketWatch, Wait};
pub use scheduler::{EngineContext, Scheduler, SessionFailure};
pub use stats::{SpeedMeter, TransferStats};
