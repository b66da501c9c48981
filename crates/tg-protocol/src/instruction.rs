//! Instruction model
//!
//! An instruction is an opcode followed by zero or more string arguments.
//! Every element is prefixed with its length in Unicode scalar values and
//! a `.`, elements are separated by `,` and the instruction ends with `;`:
//!
//! ```text
//! 5.error,23.Token validation failed,13.INVALID_TOKEN;
//! ```

use std::fmt;

use bytes::{BufMut, BytesMut};

/// A single protocol instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Instruction opcode (may be empty for tunnel-internal instructions)
    pub opcode: String,
    /// Positional arguments
    pub args: Vec<String>,
}

impl Instruction {
    /// Create a new instruction
    pub fn new<I, S>(opcode: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            opcode: opcode.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the `error` instruction sent to a client before it is closed.
    ///
    /// Element lengths count characters, not bytes, so a non-ASCII message
    /// carries a smaller prefix than its UTF-8 size. The two agree for ASCII
    /// messages such as `Token validation failed`.
    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new("error", [message.into(), code.into()])
    }

    /// Get an argument by position
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Check the opcode
    pub fn is(&self, opcode: &str) -> bool {
        self.opcode == opcode
    }

    /// Encode into a byte buffer
    pub fn encode_into(&self, dst: &mut BytesMut) {
        put_element(dst, &self.opcode);
        for arg in &self.args {
            dst.put_u8(b',');
            put_element(dst, arg);
        }
        dst.put_u8(b';');
    }

    /// Encode into an owned string
    pub fn encode(&self) -> String {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        // Only ASCII digits and punctuation are added around UTF-8 elements
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn put_element(dst: &mut BytesMut, value: &str) {
    let len = value.chars().count().to_string();
    dst.reserve(len.len() + 1 + value.len() + 1);
    dst.put_slice(len.as_bytes());
    dst.put_u8(b'.');
    dst.put_slice(value.as_bytes());
}
