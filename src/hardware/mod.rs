//! Links to the motion controller and stand-ins for the rig's other hardware.
//!
//! - [`transport`]: line-oriented link traits and the tokio stream adapter
//! - [`serial`]: real serial port (feature `serial`)
//! - [`sim`]: in-process GRBL-dialect controller
//! - [`mock`]: recording camera and lighting subsystems

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;
pub mod transport;

pub use transport::{LineReader, LineWriter, LinkHalves, SerialTransport, StreamLink};
