//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing instructions
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Element length prefix is missing or not a decimal number
    #[error("Invalid element length: {0:?}")]
    InvalidLength(String),

    /// Element was not followed by `,` or `;`
    #[error("Unexpected terminator byte: 0x{0:02x}")]
    UnexpectedTerminator(u8),

    /// Element content is not valid UTF-8
    #[error("Instruction element is not valid UTF-8")]
    InvalidUtf8,

    /// Instruction exceeds maximum size
    #[error("Instruction too large: {size} bytes exceeds maximum of {max} bytes")]
    InstructionTooLarge { size: usize, max: usize },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
