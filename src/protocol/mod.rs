//! Controller command protocol: ASCII grammar, binary framing, reply correlation.

pub mod binary;
pub mod command;
pub mod grammar;

pub use binary::{BinaryBlock, ProtocolMode};
pub use command::{CommandProtocol, ProtocolSettings, Reply};
pub use grammar::{classify, CommandClass, ParsedCommand};
