//! Tokio codec for framed protocol instructions

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::instruction::Instruction;

/// Maximum encoded size of a single instruction
pub const MAX_INSTRUCTION_SIZE: usize = 8192 * 16;

/// Longest accepted length prefix (in digits)
const MAX_LENGTH_DIGITS: usize = 10;

/// Codec for encoding/decoding protocol instructions
#[derive(Debug, Default)]
pub struct InstructionCodec {
    /// Bytes of the buffer already known to hold no complete instruction
    scanned: usize,
}

impl InstructionCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { scanned: 0 }
    }
}

/// Outcome of scanning the buffer for one instruction
enum Scan {
    /// Instruction ends at the given byte offset (exclusive)
    Complete(Instruction, usize),
    /// More bytes are required
    Incomplete,
}

fn utf8_width(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC0..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF7 => Some(4),
        _ => None,
    }
}

fn scan(src: &[u8]) -> Result<Scan, ProtocolError> {
    let mut pos = 0;
    let mut elements = Vec::new();

    loop {
        // Length prefix
        let Some(dot) = src[pos..].iter().position(|&b| b == b'.') else {
            let pending = &src[pos..];
            if pending.len() > MAX_LENGTH_DIGITS || !pending.iter().all(u8::is_ascii_digit) {
                return Err(ProtocolError::InvalidLength(
                    String::from_utf8_lossy(pending).into_owned(),
                ));
            }
            return Ok(Scan::Incomplete);
        };
        let digits = &src[pos..pos + dot];
        if digits.is_empty()
            || digits.len() > MAX_LENGTH_DIGITS
            || !digits.iter().all(u8::is_ascii_digit)
        {
            return Err(ProtocolError::InvalidLength(
                String::from_utf8_lossy(digits).into_owned(),
            ));
        }
        let length: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ProtocolError::InvalidLength(String::from_utf8_lossy(digits).into_owned()))?;

        // Element body, measured in characters
        let start = pos + dot + 1;
        let mut end = start;
        for _ in 0..length {
            if end >= src.len() {
                return Ok(Scan::Incomplete);
            }
            end += utf8_width(src[end]).ok_or(ProtocolError::InvalidUtf8)?;
        }
        if end >= src.len() {
            return Ok(Scan::Incomplete);
        }

        let element = std::str::from_utf8(&src[start..end]).map_err(|_| ProtocolError::InvalidUtf8)?;
        elements.push(element.to_string());

        match src[end] {
            b',' => pos = end + 1,
            b';' => {
                let mut elements = elements.into_iter();
                let opcode = elements.next().unwrap_or_default();
                return Ok(Scan::Complete(
                    Instruction {
                        opcode,
                        args: elements.collect(),
                    },
                    end + 1,
                ));
            }
            other => return Err(ProtocolError::UnexpectedTerminator(other)),
        }
    }
}

impl Decoder for InstructionCodec {
    type Item = Instruction;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() || src.len() == self.scanned {
            return Ok(None);
        }

        match scan(src)? {
            Scan::Complete(instruction, consumed) => {
                src.advance(consumed);
                self.scanned = 0;
                Ok(Some(instruction))
            }
            Scan::Incomplete => {
                if src.len() > MAX_INSTRUCTION_SIZE {
                    return Err(ProtocolError::InstructionTooLarge {
                        size: src.len(),
                        max: MAX_INSTRUCTION_SIZE,
                    });
                }
                self.scanned = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<Instruction> for InstructionCodec {
    type Error = ProtocolError;

    fn encode(&mut self, instruction: Instruction, dst: &mut BytesMut) -> Result<(), Self::Error> {
        instruction.encode_into(dst);
        Ok(())
    }
}

/// Already-encoded instruction text, passed through unchanged
impl Encoder<String> for InstructionCodec {
    type Error = ProtocolError;

    fn encode(&mut self, raw: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(raw.as_bytes());
        Ok(())
    }
}
