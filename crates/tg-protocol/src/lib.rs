//! tg-protocol: Instruction framing for tunnelgate
//!
//! Clients and backend daemons exchange text instructions of the form
//! `<len>.<opcode>,<len>.<arg>,...;`. This crate provides the instruction
//! model, a tokio codec for framing them over a byte stream, and the
//! numeric status codes carried by `error` instructions.

pub mod codec;
pub mod error;
pub mod instruction;
pub mod status;

pub use codec::{InstructionCodec, MAX_INSTRUCTION_SIZE};
pub use error::ProtocolError;
pub use instruction::Instruction;
pub use status::Status;
