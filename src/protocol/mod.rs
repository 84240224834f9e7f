//! Controller protocol: wire grammar, command records and the engine that
//! owns the link.

pub mod command;
pub mod engine;
pub mod grbl;

pub use command::{Ack, Command, CommandClass, CommandId};
pub use engine::{MotionTicket, ProtocolEngine, StatusSnapshot};
